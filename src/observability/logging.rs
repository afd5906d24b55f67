//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber (pretty or JSON)
//! - Provide the log-phase access log middleware
//!
//! # Design Decisions
//! - `RUST_LOG` overrides the configured level
//! - Security audit events use the `security` target so a sink can split them

use std::time::Instant;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::schema::{LogFormat, ObservabilityConfig};
use crate::observability::metrics;
use crate::pipeline::{BoxError, Flow, Middleware, Phase, RequestContext};
use crate::security::rate_limit::RateLimitVerdict;

/// Install the global subscriber. Safe to call once per process.
pub fn init_logging(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("shield_proxy={0},tower_http={0},security=info", config.log_level).into());

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };

    if let Err(e) = result {
        eprintln!("tracing subscriber already installed: {e}");
    }
}

/// When the request entered the pipeline; inserted by the host.
#[derive(Debug, Clone, Copy)]
pub struct RequestStart(pub Instant);

/// Emits one line per request in the log phase.
#[derive(Debug, Default)]
pub struct AccessLogMiddleware;

impl Middleware for AccessLogMiddleware {
    fn handle(&self, _phase: Phase, ctx: &mut RequestContext) -> Result<Flow, BoxError> {
        let status = ctx.final_status().map(|s| s.as_u16()).unwrap_or(0);
        let route = ctx.route.as_deref().unwrap_or("none");
        let decision = ctx
            .extensions
            .get::<RateLimitVerdict>()
            .map(|verdict| verdict.decision.as_str())
            .unwrap_or("unchecked");

        tracing::info!(
            request_id = %ctx.request_id,
            client = %ctx.client_ip,
            method = %ctx.method,
            path = %ctx.path,
            route = %route,
            status,
            decision,
            "Request completed"
        );

        if let Some(RequestStart(start)) = ctx.extensions.get::<RequestStart>().copied() {
            metrics::record_request(&ctx.method, status, route, start);
        }
        Ok(Flow::Continue)
    }
}
