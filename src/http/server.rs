//! HTTP server setup and the gateway handler.
//!
//! # Responsibilities
//! - Create the Axum router with tower / tower-http layers
//! - Run each request through the pipeline phases
//! - Forward surviving requests to the matched upstream
//! - Assemble the final response
//!
//! # Request lifecycle
//! ```text
//! resolve route ─▶ access ─▶ content ─▶ forward upstream
//!                    │          │             │
//!                    └─ Stop ───┴─────────────┤
//!                                             ▼
//!                          header_filter ─▶ body_filter ─▶ respond ─▶ log
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, Uri},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::http::request::{self, UuidRequestId, X_REQUEST_ID};
use crate::http::response;
use crate::lifecycle::Worker;
use crate::observability::logging::RequestStart;
use crate::pipeline::{PhaseDispatcher, PhaseSignal, RequestContext, TerminalResponse};
use crate::routing::{Route, RouteTable, RouteTarget};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: PhaseDispatcher,
    pub routes: Arc<RouteTable>,
    pub client: Client<HttpConnector, Body>,
}

/// HTTP server for the gateway listener.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(worker: &Worker) -> Self {
        let timeouts = &worker.config.timeouts;
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(timeouts.connect_secs)));
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(timeouts.idle_secs))
            .build(connector);

        let state = AppState {
            dispatcher: worker.dispatcher.clone(),
            routes: worker.routes.clone(),
            client,
        };

        Self {
            router: Self::build_router(worker, state),
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(worker: &Worker, state: AppState) -> Router {
        let config = &worker.config;
        Router::new()
            .route("/", any(gateway_handler))
            .route("/{*path}", any(gateway_handler))
            .with_state(state)
            .layer(GlobalConcurrencyLimitLayer::new(config.listener.max_connections))
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(PropagateRequestIdLayer::new(X_REQUEST_ID))
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::new(X_REQUEST_ID, UuidRequestId))
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve until `shutdown` fires, then drain in-flight requests.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "Gateway listener starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        tracing::info!("Gateway listener stopped");
        Ok(())
    }
}

async fn gateway_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let (parts, body) = request.into_parts();
    let mut ctx = request::context_from_parts(&parts, addr);
    ctx.extensions.insert(RequestStart(Instant::now()));

    let route = state.routes.resolve(&RouteTarget {
        host: ctx.host.as_deref(),
        path: &ctx.path,
    });
    ctx.route = route.map(|r| r.name.clone());

    let dispatcher = &state.dispatcher;
    let mut upstream = None;
    if dispatcher.access(&mut ctx) == PhaseSignal::Continue
        && dispatcher.content(&mut ctx) == PhaseSignal::Continue
    {
        match route {
            Some(route) => {
                let query = parts.uri.query().map(|q| format!("?{q}")).unwrap_or_default();
                upstream = forward(&state.client, route, &mut ctx, &query, body).await;
            }
            None => {
                tracing::debug!(request_id = %ctx.request_id, path = %ctx.path, "No route matched");
                ctx.terminate(TerminalResponse::not_found());
            }
        }
    }

    dispatcher.header_filter(&mut ctx);
    dispatcher.body_filter(&mut ctx);

    let mut response = match (ctx.terminal().cloned(), upstream) {
        (Some(terminal), _) => terminal.into_response(),
        (None, Some(upstream)) => upstream,
        (None, None) => {
            // Content handlers continued without producing a response.
            ctx.terminate(TerminalResponse::internal_error());
            TerminalResponse::internal_error().into_response()
        }
    };
    response::merge_headers(&mut response, &ctx.response_headers, &ctx.request_id);

    dispatcher.log(&mut ctx);
    response
}

async fn forward(
    client: &Client<HttpConnector, Body>,
    route: &Route,
    ctx: &mut RequestContext,
    query: &str,
    body: Body,
) -> Option<Response> {
    let uri: Uri = match format!("{}{}{}", route.upstream, ctx.path, query).parse() {
        Ok(uri) => uri,
        Err(e) => {
            tracing::error!(route = %route.name, error = %e, "Invalid upstream URI");
            ctx.terminate(TerminalResponse::bad_gateway());
            return None;
        }
    };

    let mut builder = Request::builder().method(ctx.method.as_str()).uri(uri);
    if let Some(headers) = builder.headers_mut() {
        *headers = request::upstream_headers(ctx);
    }
    let upstream_request = match builder.body(body) {
        Ok(req) => req,
        Err(e) => {
            tracing::error!(route = %route.name, error = %e, "Failed to build upstream request");
            ctx.terminate(TerminalResponse::bad_gateway());
            return None;
        }
    };

    match client.request(upstream_request).await {
        Ok(upstream) => {
            ctx.upstream_status = Some(upstream.status());
            Some(response::from_upstream(upstream))
        }
        Err(e) => {
            tracing::error!(
                request_id = %ctx.request_id,
                route = %route.name,
                upstream = %route.upstream,
                error = %e,
                "Upstream error"
            );
            ctx.terminate(TerminalResponse::bad_gateway());
            None
        }
    }
}
