//! Background ban maintenance.
//!
//! # Responsibilities
//! - Periodically remove expired bans
//! - Drop expired entries from the counter store
//! - Render the ban artifact and run the reload command off the executor
//!
//! One sweeper and one publisher run per worker. Sweeps are sequential: a
//! slow sweep delays the next tick instead of overlapping it. Publish
//! requests that arrive while a render is running coalesce into one more
//! render.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::time::{self, MissedTickBehavior};

use crate::security::ban::BanManager;
use crate::store::CounterStore;

pub struct BanSweeper {
    bans: Arc<BanManager>,
    store: Arc<dyn CounterStore>,
    interval: Duration,
}

impl BanSweeper {
    pub fn new(bans: Arc<BanManager>, store: Arc<dyn CounterStore>, interval: Duration) -> Self {
        Self {
            bans,
            store,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Ban sweeper starting");

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; bans from a previous run are
        // cleared at startup.
        let sweeper = Arc::new(self);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sweeper = sweeper.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || sweeper.sweep_once()).await {
                        tracing::error!(error = %e, "Ban sweep panicked");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Ban sweeper received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// One pass: expired bans first, then expired store entries.
    pub fn sweep_once(&self) -> SweepReport {
        let bans_expired = self.bans.clean_expired();
        let entries_expired = match self.store.sweep_expired() {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "Counter store sweep failed");
                0
            }
        };

        if bans_expired > 0 || entries_expired > 0 {
            tracing::debug!(bans_expired, entries_expired, "Sweep complete");
        }
        SweepReport {
            bans_expired,
            entries_expired,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub bans_expired: usize,
    pub entries_expired: usize,
}

/// Regenerates the ban artifact whenever the ban manager signals a change.
pub struct ArtifactPublisher {
    bans: Arc<BanManager>,
    signal: Arc<Notify>,
}

impl ArtifactPublisher {
    pub fn new(bans: Arc<BanManager>, signal: Arc<Notify>) -> Self {
        Self { bans, signal }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!("Ban artifact publisher starting");

        loop {
            tokio::select! {
                // A pending change is flushed before shutdown is honoured.
                biased;
                _ = self.signal.notified() => {
                    let bans = self.bans.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || bans.regenerate_artifact()).await {
                        tracing::error!(error = %e, "Ban artifact regeneration panicked");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Ban artifact publisher received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
