//! Startup orchestration.
//!
//! # Responsibilities
//! - Check the counter store is reachable
//! - Build the ban manager, rate limiter and route table
//! - Register the built-in middleware and apply configured overrides
//! - Start background tasks (ban sweeper, artifact publisher, override reloader)
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Every worker builds an identical registry from the same config
//! - Listeners start last (traffic only when ready), see `main.rs`

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::config::schema::{MiddlewareOverride, ShieldConfig};
use crate::lifecycle::shutdown::Shutdown;
use crate::observability::logging::AccessLogMiddleware;
use crate::pipeline::{
    MiddlewareDescriptor, MiddlewareState, Phase, PhaseDispatcher, Pipeline, PipelineError,
};
use crate::routing::RouteTable;
use crate::security::artifact::{ArtifactWriter, CommandReload, NoopReload, ReloadTrigger};
use crate::security::ban::{BanCheckMiddleware, BanManager};
use crate::security::rate_limit::{RateLimitMiddleware, RateLimiter};
use crate::security::sweeper::{ArtifactPublisher, BanSweeper};
use crate::store::{CounterStore, StoreError};

pub const BAN_CHECK: &str = "ban_check";
pub const RATE_LIMIT: &str = "rate_limit";
pub const ACCESS_LOG: &str = "access_log";

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("counter store unavailable at startup: {0}")]
    StoreUnavailable(#[source] StoreError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Everything one worker needs to serve traffic.
#[derive(Clone)]
pub struct Worker {
    pub config: Arc<ShieldConfig>,
    pub store: Arc<dyn CounterStore>,
    pub clock: SharedClock,
    pub pipeline: Arc<Pipeline>,
    pub dispatcher: PhaseDispatcher,
    pub bans: Arc<BanManager>,
    pub limiter: Arc<RateLimiter>,
    pub routes: Arc<RouteTable>,
    artifact_signal: Arc<Notify>,
}

fn state_for(enabled: bool) -> MiddlewareState {
    if enabled {
        MiddlewareState::Active
    } else {
        MiddlewareState::Disabled
    }
}

pub fn build_worker(
    config: ShieldConfig,
    store: Arc<dyn CounterStore>,
    clock: SharedClock,
) -> Result<Worker, StartupError> {
    store.ping().map_err(StartupError::StoreUnavailable)?;

    let reload: Arc<dyn ReloadTrigger> = match CommandReload::from_argv(&config.ban.reload_command) {
        Some(command) => Arc::new(command),
        None => Arc::new(NoopReload),
    };
    let artifact_signal = Arc::new(Notify::new());
    let bans = Arc::new(
        BanManager::new(
            store.clone(),
            clock.clone(),
            Duration::from_secs(config.ban.duration_secs),
            ArtifactWriter::new(config.ban.artifact_path.clone(), reload),
        )
        .with_publish_signal(artifact_signal.clone()),
    );
    let limiter = Arc::new(RateLimiter::new(
        store.clone(),
        bans.clone(),
        clock.clone(),
        config.rate_limit.clone(),
    ));

    let pipeline = Arc::new(Pipeline::new());
    pipeline.register(
        MiddlewareDescriptor::new(BAN_CHECK, Arc::new(BanCheckMiddleware::new(bans.clone())))
            .priority(config.ban.priority)
            .phase(Phase::Access)
            .state(state_for(config.ban.enabled)),
    )?;
    pipeline.register(
        MiddlewareDescriptor::new(RATE_LIMIT, Arc::new(RateLimitMiddleware::new(limiter.clone())))
            .priority(config.rate_limit.priority)
            .phase(Phase::Access)
            .routes(config.rate_limit.routes.clone())
            .state(state_for(config.rate_limit.enabled)),
    )?;
    pipeline.register(
        MiddlewareDescriptor::new(ACCESS_LOG, Arc::new(AccessLogMiddleware))
            .phase(Phase::Log)
            .state(MiddlewareState::Active),
    )?;
    apply_middleware_overrides(&pipeline, &config.middleware)?;

    let routes = Arc::new(RouteTable::new(&config.routes));

    tracing::info!(
        middleware = pipeline.describe().len(),
        routes = routes.len(),
        artifact = ?config.ban.artifact_path,
        "Worker initialized"
    );

    Ok(Worker {
        config: Arc::new(config),
        store,
        clock,
        dispatcher: PhaseDispatcher::new(pipeline.clone()),
        pipeline,
        bans,
        limiter,
        routes,
        artifact_signal,
    })
}

/// Apply `[[middleware]]` state overrides to a live pipeline.
pub fn apply_middleware_overrides(
    pipeline: &Pipeline,
    overrides: &[MiddlewareOverride],
) -> Result<(), PipelineError> {
    for entry in overrides {
        pipeline.set_state_str(&entry.name, &entry.state)?;
        tracing::info!(middleware = %entry.name, state = %entry.state, "Middleware override applied");
    }
    Ok(())
}

/// Final state of every built-in middleware for `config`: the registered
/// default, replaced by a `[[middleware]]` override when one names it.
pub fn configured_states(
    config: &ShieldConfig,
) -> Result<Vec<(String, MiddlewareState)>, PipelineError> {
    let mut states = vec![
        (BAN_CHECK.to_string(), state_for(config.ban.enabled)),
        (RATE_LIMIT.to_string(), state_for(config.rate_limit.enabled)),
        (ACCESS_LOG.to_string(), MiddlewareState::Active),
    ];
    for entry in &config.middleware {
        let state: MiddlewareState = entry.state.parse()?;
        match states.iter_mut().find(|(name, _)| *name == entry.name) {
            Some(slot) => slot.1 = state,
            None => states.push((entry.name.clone(), state)),
        }
    }
    Ok(states)
}

impl Worker {
    /// Start the ban sweeper and the artifact publisher.
    ///
    /// Until this runs, ban changes reach the artifact only through an
    /// explicit [`BanManager::regenerate_artifact`].
    pub fn spawn_background(&self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let sweeper = BanSweeper::new(
            self.bans.clone(),
            self.store.clone(),
            Duration::from_secs(self.config.ban.sweep_interval_secs),
        );
        let publisher = ArtifactPublisher::new(self.bans.clone(), self.artifact_signal.clone());
        vec![
            tokio::spawn(sweeper.run(shutdown.subscribe())),
            tokio::spawn(publisher.run(shutdown.subscribe())),
        ]
    }
}

/// Re-derive middleware states whenever the watcher delivers a new config.
///
/// Each middleware is set straight to its final state, so dropping an
/// override from the file restores the registered default.
pub async fn reload_overrides(
    pipeline: Arc<Pipeline>,
    mut updates: mpsc::UnboundedReceiver<ShieldConfig>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(config) = update else { break };
                let states = match configured_states(&config) {
                    Ok(states) => states,
                    Err(e) => {
                        tracing::error!(error = %e, "Reloaded middleware overrides rejected");
                        continue;
                    }
                };
                for (name, state) in states {
                    if let Err(e) = pipeline.set_state(&name, state) {
                        tracing::error!(middleware = %name, error = %e, "Failed to apply reloaded middleware state");
                    }
                }
                tracing::info!("Middleware states reloaded");
            }
            _ = shutdown.recv() => break,
        }
    }
    tracing::debug!("Override reloader stopped");
}
