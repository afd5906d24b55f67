//! Middleware chain engine.
//!
//! # Data Flow
//! ```text
//! startup:
//!     MiddlewareDescriptor → Pipeline::register → registry snapshot
//!
//! per request, per phase:
//!     PhaseDispatcher::{access, content, header_filter, body_filter, log}
//!     → Pipeline::run(phase, route, ctx)
//!     → get_chain: ACTIVE global (by priority) ++ ACTIVE route-scoped (by priority)
//!     → handlers in order until Continue runs out, Terminate, or Err
//! ```
//!
//! # Design Decisions
//! - Registry is process-local and built identically by every worker
//! - Mutation publishes a fresh snapshot (copy-on-write), so `run` never
//!   sees a half-applied change and never takes a lock
//! - Early termination is a value (`Flow::Terminate`), not a non-local exit
//! - A failing handler aborts the chain; it never changes registered state

pub mod context;
pub mod descriptor;
pub mod dispatcher;
pub mod registry;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use context::{RequestContext, TerminalResponse};
pub use descriptor::{MiddlewareDescriptor, MiddlewareState};
pub use dispatcher::{PhaseDispatcher, PhaseSignal};
pub use registry::{Chain, ChainEntry, MiddlewareInfo, MiddlewareRegistry};

/// Boxed error returned by middleware handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Lifecycle stage at which the host runtime invokes the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Access,
    Content,
    HeaderFilter,
    BodyFilter,
    Log,
}

impl Phase {
    /// Every phase, in host execution order.
    pub const ALL: [Phase; 5] = [
        Phase::Access,
        Phase::Content,
        Phase::HeaderFilter,
        Phase::BodyFilter,
        Phase::Log,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Access => "access",
            Phase::Content => "content",
            Phase::HeaderFilter => "header_filter",
            Phase::BodyFilter => "body_filter",
            Phase::Log => "log",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PipelineError::Configuration(format!("unknown phase `{s}`")))
    }
}

/// What a handler wants the chain to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    Continue,
    /// Halt the chain; the response is complete and final.
    Terminate(TerminalResponse),
}

/// A unit of request processing.
///
/// Handlers are synchronous: the host only suspends between phases.
pub trait Middleware: Send + Sync {
    fn handle(&self, phase: Phase, ctx: &mut RequestContext) -> Result<Flow, BoxError>;
}

impl<F> Middleware for F
where
    F: Fn(Phase, &mut RequestContext) -> Result<Flow, BoxError> + Send + Sync,
{
    fn handle(&self, phase: Phase, ctx: &mut RequestContext) -> Result<Flow, BoxError> {
        self(phase, ctx)
    }
}

/// Wrap a closure as a shareable middleware handler.
pub fn from_fn<F>(f: F) -> Arc<dyn Middleware>
where
    F: Fn(Phase, &mut RequestContext) -> Result<Flow, BoxError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// How a chain run ended when no handler failed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    /// Every handler returned `Continue`.
    Completed { executed: usize },
    /// A handler halted the chain with a final response.
    Terminated {
        by: String,
        response: TerminalResponse,
        executed: usize,
    },
}

impl ChainOutcome {
    pub fn executed(&self) -> usize {
        match self {
            ChainOutcome::Completed { executed } | ChainOutcome::Terminated { executed, .. } => {
                *executed
            }
        }
    }
}

/// Errors raised by the chain engine.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Programmer error in registration or state changes; fatal at setup.
    #[error("middleware configuration error: {0}")]
    Configuration(String),

    /// A handler failed while the chain was running.
    #[error("middleware `{name}` failed in {phase} phase: {source}")]
    MiddlewareExecution {
        name: String,
        phase: Phase,
        #[source]
        source: BoxError,
    },
}

/// Owner of the middleware registry for one worker.
pub struct Pipeline {
    registry: ArcSwap<MiddlewareRegistry>,
    /// Serialises writers; readers only touch the `ArcSwap`.
    writer: Mutex<()>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::from_registry(MiddlewareRegistry::default())
    }

    pub fn from_registry(registry: MiddlewareRegistry) -> Self {
        Self {
            registry: ArcSwap::from_pointee(registry),
            writer: Mutex::new(()),
        }
    }

    /// Register a middleware, replacing any earlier one with the same name.
    pub fn register(&self, descriptor: MiddlewareDescriptor) -> Result<(), PipelineError> {
        self.update(|registry| registry.register(descriptor))
    }

    /// Remove a middleware by name. Returns whether it existed.
    pub fn remove(&self, name: &str) -> bool {
        self.update(|registry| Ok::<_, PipelineError>(registry.remove(name)))
            .unwrap_or(false)
    }

    pub fn set_state(&self, name: &str, state: MiddlewareState) -> Result<(), PipelineError> {
        self.update(|registry| registry.set_state(name, state))
    }

    /// Same as [`Pipeline::set_state`] with the state given as text.
    pub fn set_state_str(&self, name: &str, state: &str) -> Result<(), PipelineError> {
        let state = state.parse()?;
        self.set_state(name, state)
    }

    pub fn get_chain(&self, phase: Phase, route: Option<&str>) -> Chain {
        self.registry.load().get_chain(phase, route)
    }

    /// Execute the chain for `phase` and `route`.
    pub fn run(
        &self,
        phase: Phase,
        route: Option<&str>,
        ctx: &mut RequestContext,
    ) -> Result<ChainOutcome, PipelineError> {
        let chain = self.get_chain(phase, route);
        let mut executed = 0;

        for entry in chain.iter() {
            match entry.handler.handle(phase, ctx) {
                Ok(Flow::Continue) => executed += 1,
                Ok(Flow::Terminate(response)) => {
                    executed += 1;
                    tracing::debug!(
                        middleware = %entry.name,
                        phase = %phase,
                        status = %response.status,
                        "Chain terminated"
                    );
                    return Ok(ChainOutcome::Terminated {
                        by: entry.name.to_string(),
                        response,
                        executed,
                    });
                }
                Err(source) => {
                    return Err(PipelineError::MiddlewareExecution {
                        name: entry.name.to_string(),
                        phase,
                        source,
                    });
                }
            }
        }

        Ok(ChainOutcome::Completed { executed })
    }

    /// Current registry snapshot.
    pub fn snapshot(&self) -> Arc<MiddlewareRegistry> {
        self.registry.load_full()
    }

    pub fn describe(&self) -> Vec<MiddlewareInfo> {
        self.registry.load().describe()
    }

    fn update<T, E>(
        &self,
        mutate: impl FnOnce(&mut MiddlewareRegistry) -> Result<T, E>,
    ) -> Result<T, E> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = MiddlewareRegistry::clone(&self.registry.load());
        let result = mutate(&mut next)?;
        self.registry.store(Arc::new(next));
        Ok(result)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::StatusCode;

    fn ctx() -> RequestContext {
        RequestContext::new(IpAddr::V4(Ipv4Addr::LOCALHOST), "GET", "/")
    }

    /// Handler that appends its tag to a shared trace.
    fn tracer(trace: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Arc<dyn Middleware> {
        let trace = trace.clone();
        from_fn(move |_, _| {
            trace.lock().unwrap().push(tag);
            Ok(Flow::Continue)
        })
    }

    fn active(name: &str, priority: i32, handler: Arc<dyn Middleware>) -> MiddlewareDescriptor {
        MiddlewareDescriptor::new(name, handler)
            .priority(priority)
            .phase(Phase::Access)
            .state(MiddlewareState::Active)
    }

    #[test]
    fn test_lower_priority_runs_first() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new();
        pipeline.register(active("late", 50, tracer(&trace, "late"))).unwrap();
        pipeline.register(active("early", 5, tracer(&trace, "early"))).unwrap();
        pipeline.register(active("middle", 20, tracer(&trace, "middle"))).unwrap();

        let outcome = pipeline.run(Phase::Access, None, &mut ctx()).unwrap();

        assert_eq!(outcome, ChainOutcome::Completed { executed: 3 });
        assert_eq!(*trace.lock().unwrap(), vec!["early", "middle", "late"]);
    }

    #[test]
    fn test_error_aborts_chain() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new();
        pipeline.register(active("first", 1, tracer(&trace, "first"))).unwrap();
        pipeline
            .register(active(
                "broken",
                2,
                from_fn(|_, _| Err("boom".into())),
            ))
            .unwrap();
        pipeline.register(active("after", 3, tracer(&trace, "after"))).unwrap();

        let err = pipeline.run(Phase::Access, None, &mut ctx()).unwrap_err();

        match err {
            PipelineError::MiddlewareExecution { name, phase, .. } => {
                assert_eq!(name, "broken");
                assert_eq!(phase, Phase::Access);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*trace.lock().unwrap(), vec!["first"]);
    }

    #[test]
    fn test_terminate_halts_without_error() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new();
        pipeline.register(active("first", 1, tracer(&trace, "first"))).unwrap();
        pipeline
            .register(active(
                "gate",
                2,
                from_fn(|_, _| Ok(Flow::Terminate(TerminalResponse::banned()))),
            ))
            .unwrap();
        pipeline.register(active("after", 3, tracer(&trace, "after"))).unwrap();

        let outcome = pipeline.run(Phase::Access, None, &mut ctx()).unwrap();

        match outcome {
            ChainOutcome::Terminated { by, response, executed } => {
                assert_eq!(by, "gate");
                assert_eq!(response.status, StatusCode::FORBIDDEN);
                assert_eq!(executed, 2);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(*trace.lock().unwrap(), vec!["first"]);
    }

    #[test]
    fn test_disabled_entries_are_not_counted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = {
            let calls = calls.clone();
            from_fn(move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Flow::Continue)
            })
        };
        let pipeline = Pipeline::new();
        pipeline.register(active("on", 1, counted.clone())).unwrap();
        pipeline
            .register(
                MiddlewareDescriptor::new("off", counted)
                    .phase(Phase::Access)
                    .priority(2),
            )
            .unwrap();

        let outcome = pipeline.run(Phase::Access, None, &mut ctx()).unwrap();

        assert_eq!(outcome.executed(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disable_then_enable_restores_position() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new();
        pipeline.register(active("a", 10, tracer(&trace, "a"))).unwrap();
        pipeline.register(active("b", 20, tracer(&trace, "b"))).unwrap();
        pipeline.register(active("c", 30, tracer(&trace, "c"))).unwrap();
        let names = |chain: Chain| chain.iter().map(|e| e.name.to_string()).collect::<Vec<_>>();

        let before = names(pipeline.get_chain(Phase::Access, None));
        pipeline.set_state("b", MiddlewareState::Disabled).unwrap();
        assert_eq!(names(pipeline.get_chain(Phase::Access, None)), vec!["a", "c"]);

        pipeline.set_state_str("b", "active").unwrap();
        assert_eq!(names(pipeline.get_chain(Phase::Access, None)), before);
    }

    #[test]
    fn test_set_state_rejects_unknown_name_and_state() {
        let pipeline = Pipeline::new();
        let noop = from_fn(|_, _| Ok(Flow::Continue));
        pipeline.register(active("known", 1, noop)).unwrap();

        assert!(matches!(
            pipeline.set_state("missing", MiddlewareState::Active),
            Err(PipelineError::Configuration(_))
        ));
        assert!(matches!(
            pipeline.set_state_str("known", "paused"),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_remove() {
        let pipeline = Pipeline::new();
        let noop = from_fn(|_, _| Ok(Flow::Continue));
        pipeline.register(active("gone", 1, noop)).unwrap();

        assert!(pipeline.remove("gone"));
        assert!(!pipeline.remove("gone"));
        assert!(pipeline.get_chain(Phase::Access, None).is_empty());
    }

    #[test]
    fn test_phase_parse() {
        assert_eq!("header_filter".parse::<Phase>().unwrap(), Phase::HeaderFilter);
        assert_eq!("LOG".parse::<Phase>().unwrap(), Phase::Log);
        assert!("rewrite".parse::<Phase>().is_err());
    }
}
