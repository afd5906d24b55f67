//! Admin API.
//!
//! Bearer-token protected endpoints for operators and `shield-cli`:
//!
//! | Method | Path                               | Action                          |
//! |--------|------------------------------------|---------------------------------|
//! | GET    | `/admin/status`                    | version, active bans, counts    |
//! | GET    | `/admin/bans`                      | active bans                     |
//! | POST   | `/admin/bans/{ip}`                 | ban for the configured duration |
//! | DELETE | `/admin/bans/{ip}`                 | lift a ban                      |
//! | GET    | `/admin/middleware?phase=&route=`  | registrations or one chain      |
//! | PUT    | `/admin/middleware/{name}/{state}` | activate / disable              |

pub mod auth;
pub mod handlers;

use std::net::SocketAddr;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::lifecycle::Worker;

#[derive(Clone)]
pub struct AdminState {
    pub worker: Worker,
}

pub fn setup_admin_router(worker: Worker) -> Router {
    let state = AdminState { worker };
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/bans", get(list_bans))
        .route("/admin/bans/{ip}", post(ban_ip).delete(unban_ip))
        .route("/admin/middleware", get(list_middleware))
        .route("/admin/middleware/{name}/{state}", put(set_middleware_state))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}

/// Serve the admin router until `shutdown` fires.
pub async fn serve(
    router: Router,
    listener: TcpListener,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), std::io::Error> {
    let addr: SocketAddr = listener.local_addr()?;
    tracing::info!(address = %addr, "Admin API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
}
