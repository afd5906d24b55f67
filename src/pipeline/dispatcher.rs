//! Entry points the host runtime calls once per request per phase.
//!
//! # Responsibilities
//! - Run the merged chain for the context's route
//! - Turn chain termination into the context's terminal response
//! - Turn chain failure into a generic 500, logged with middleware and phase
//!
//! # Design Decisions
//! - `content` is skipped once a terminal response exists
//! - `header_filter`, `body_filter` and `log` always run so the terminal
//!   response gets its headers and the request is audited
//! - A failure in `log` cannot change the response; it is only reported

use std::sync::Arc;

use crate::observability::metrics;
use crate::pipeline::{ChainOutcome, Phase, Pipeline, PipelineError, RequestContext, TerminalResponse};

/// Whether the host should keep processing the request in this phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseSignal {
    Continue,
    Stop,
}

#[derive(Clone)]
pub struct PhaseDispatcher {
    pipeline: Arc<Pipeline>,
}

impl PhaseDispatcher {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn access(&self, ctx: &mut RequestContext) -> PhaseSignal {
        self.dispatch(Phase::Access, ctx)
    }

    pub fn content(&self, ctx: &mut RequestContext) -> PhaseSignal {
        if ctx.is_terminated() {
            return PhaseSignal::Stop;
        }
        self.dispatch(Phase::Content, ctx)
    }

    pub fn header_filter(&self, ctx: &mut RequestContext) -> PhaseSignal {
        self.dispatch(Phase::HeaderFilter, ctx)
    }

    pub fn body_filter(&self, ctx: &mut RequestContext) -> PhaseSignal {
        self.dispatch(Phase::BodyFilter, ctx)
    }

    pub fn log(&self, ctx: &mut RequestContext) -> PhaseSignal {
        self.dispatch(Phase::Log, ctx)
    }

    fn dispatch(&self, phase: Phase, ctx: &mut RequestContext) -> PhaseSignal {
        let route = ctx.route.clone();
        match self.pipeline.run(phase, route.as_deref(), ctx) {
            Ok(ChainOutcome::Completed { .. }) => PhaseSignal::Continue,
            Ok(ChainOutcome::Terminated { by, response, .. }) => {
                if !ctx.terminate(response) {
                    tracing::debug!(
                        middleware = %by,
                        phase = %phase,
                        "Terminal response already set, keeping the earlier one"
                    );
                }
                PhaseSignal::Stop
            }
            Err(err) => {
                self.fail(phase, ctx, err);
                PhaseSignal::Stop
            }
        }
    }

    fn fail(&self, phase: Phase, ctx: &mut RequestContext, err: PipelineError) {
        let middleware = match &err {
            PipelineError::MiddlewareExecution { name, .. } => name.as_str(),
            PipelineError::Configuration(_) => "<registry>",
        };
        tracing::error!(
            request_id = %ctx.request_id,
            middleware = %middleware,
            phase = %phase,
            error = %err,
            "Middleware chain failed"
        );
        metrics::record_chain_error(phase, middleware);

        if phase != Phase::Log {
            ctx.replace_terminal(TerminalResponse::internal_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{from_fn, Flow, MiddlewareDescriptor, MiddlewareState};
    use axum::http::StatusCode;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> RequestContext {
        RequestContext::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), "GET", "/")
    }

    fn counter(calls: &Arc<AtomicUsize>) -> Arc<dyn crate::pipeline::Middleware> {
        let calls = calls.clone();
        from_fn(move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Flow::Continue)
        })
    }

    fn dispatcher_with(descriptors: Vec<MiddlewareDescriptor>) -> PhaseDispatcher {
        let pipeline = Arc::new(Pipeline::new());
        for descriptor in descriptors {
            pipeline
                .register(descriptor.state(MiddlewareState::Active))
                .unwrap();
        }
        PhaseDispatcher::new(pipeline)
    }

    #[test]
    fn test_access_denial_skips_content_but_not_log() {
        let content_calls = Arc::new(AtomicUsize::new(0));
        let log_calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher_with(vec![
            MiddlewareDescriptor::new(
                "deny",
                from_fn(|_, _| Ok(Flow::Terminate(TerminalResponse::banned()))),
            )
            .phase(Phase::Access),
            MiddlewareDescriptor::new("content", counter(&content_calls)).phase(Phase::Content),
            MiddlewareDescriptor::new("log", counter(&log_calls)).phase(Phase::Log),
        ]);
        let mut ctx = ctx();

        assert_eq!(dispatcher.access(&mut ctx), PhaseSignal::Stop);
        assert_eq!(dispatcher.content(&mut ctx), PhaseSignal::Stop);
        assert_eq!(dispatcher.header_filter(&mut ctx), PhaseSignal::Continue);
        assert_eq!(dispatcher.log(&mut ctx), PhaseSignal::Continue);

        assert_eq!(content_calls.load(Ordering::SeqCst), 0);
        assert_eq!(log_calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.final_status(), Some(StatusCode::FORBIDDEN));
    }

    #[test]
    fn test_failure_becomes_generic_500() {
        let dispatcher = dispatcher_with(vec![MiddlewareDescriptor::new(
            "broken",
            from_fn(|_, _| Err("database exploded".into())),
        )
        .phase(Phase::Access)]);
        let mut ctx = ctx();

        assert_eq!(dispatcher.access(&mut ctx), PhaseSignal::Stop);
        let terminal = ctx.terminal().unwrap();
        assert_eq!(terminal.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!terminal.body.to_string().contains("database"));
    }

    #[test]
    fn test_log_failure_keeps_response() {
        let dispatcher = dispatcher_with(vec![MiddlewareDescriptor::new(
            "broken_log",
            from_fn(|_, _| Err("sink down".into())),
        )
        .phase(Phase::Log)]);
        let mut ctx = ctx();
        ctx.terminate(TerminalResponse::rate_limited(1));

        assert_eq!(dispatcher.log(&mut ctx), PhaseSignal::Stop);
        assert_eq!(ctx.final_status(), Some(StatusCode::TOO_MANY_REQUESTS));
    }

    #[test]
    fn test_allowed_request_continues() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher_with(vec![MiddlewareDescriptor::new("count", counter(&calls))
            .phases([Phase::Access, Phase::Content])]);
        let mut ctx = ctx();

        assert_eq!(dispatcher.access(&mut ctx), PhaseSignal::Continue);
        assert_eq!(dispatcher.content(&mut ctx), PhaseSignal::Continue);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!ctx.is_terminated());
    }
}
