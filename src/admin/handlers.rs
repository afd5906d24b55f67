use std::net::IpAddr;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::admin::AdminState;
use crate::pipeline::{MiddlewareInfo, Phase, PipelineError};
use crate::security::artifact::BanRecord;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub now: u64,
    pub active_bans: usize,
    pub middleware: usize,
    pub routes: usize,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let worker = &state.worker;
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        now: worker.clock.now(),
        active_bans: worker.bans.active_bans().len(),
        middleware: worker.pipeline.describe().len(),
        routes: worker.routes.len(),
    })
}

pub async fn list_bans(State(state): State<AdminState>) -> Json<Vec<BanRecord>> {
    Json(state.worker.bans.active_bans())
}

fn parse_ip(raw: &str) -> Result<IpAddr, Response> {
    raw.parse().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_ip", "message": format!("`{raw}` is not an IP address") })),
        )
            .into_response()
    })
}

pub async fn ban_ip(State(state): State<AdminState>, Path(raw): Path<String>) -> Response {
    let ip = match parse_ip(&raw) {
        Ok(ip) => ip,
        Err(response) => return response,
    };
    let bans = state.worker.bans.clone();
    // Store calls are synchronous.
    match tokio::task::spawn_blocking(move || bans.ban(ip)).await {
        Ok(Some(record)) => {
            tracing::info!(%ip, until = record.ban_until, "Ban added via admin API");
            (StatusCode::CREATED, Json(record)).into_response()
        }
        Ok(None) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "store_unavailable", "message": "ban could not be stored" })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(%ip, error = %e, "Ban task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn unban_ip(State(state): State<AdminState>, Path(raw): Path<String>) -> Response {
    let ip = match parse_ip(&raw) {
        Ok(ip) => ip,
        Err(response) => return response,
    };
    let bans = state.worker.bans.clone();
    match tokio::task::spawn_blocking(move || bans.unban(ip)).await {
        Ok(true) => {
            tracing::info!(%ip, "Ban lifted via admin API");
            Json(json!({ "ip": ip, "unbanned": true })).into_response()
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "ip": ip, "unbanned": false })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(%ip, error = %e, "Unban task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChainQuery {
    pub phase: Option<String>,
    pub route: Option<String>,
}

#[derive(Serialize)]
pub struct ChainView {
    pub phase: Phase,
    pub route: Option<String>,
    pub chain: Vec<ChainStep>,
}

#[derive(Serialize)]
pub struct ChainStep {
    pub name: String,
    pub priority: i32,
}

/// Without `phase`: every registration. With `phase`: the effective chain.
pub async fn list_middleware(
    State(state): State<AdminState>,
    Query(query): Query<ChainQuery>,
) -> Response {
    let pipeline = &state.worker.pipeline;
    let Some(raw) = query.phase else {
        let all: Vec<MiddlewareInfo> = pipeline.describe();
        return Json(all).into_response();
    };

    let phase: Phase = match raw.parse() {
        Ok(phase) => phase,
        Err(e) => return config_error(e),
    };
    let chain = pipeline
        .get_chain(phase, query.route.as_deref())
        .iter()
        .map(|entry| ChainStep {
            name: entry.name.to_string(),
            priority: entry.priority,
        })
        .collect();

    Json(ChainView {
        phase,
        route: query.route,
        chain,
    })
    .into_response()
}

pub async fn set_middleware_state(
    State(state): State<AdminState>,
    Path((name, new_state)): Path<(String, String)>,
) -> Response {
    match state.worker.pipeline.set_state_str(&name, &new_state) {
        Ok(()) => {
            tracing::info!(middleware = %name, state = %new_state, "Middleware state changed via admin API");
            Json(json!({ "name": name, "state": new_state.to_lowercase() })).into_response()
        }
        Err(e) => config_error(e),
    }
}

fn config_error(e: PipelineError) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "configuration", "message": e.to_string() })),
    )
        .into_response()
}
