//! IP ban manager.
//!
//! # Responsibilities
//! - Record per-IP ban expiry in the shared store
//! - Answer "is this IP banned now" for the access phase
//! - Sweep expired bans
//! - Regenerate the ban artifact after every ban, unban or expiry
//!
//! # State
//! ```text
//! (no record) ──ban──▶ banned (now < until) ──time──▶ stale (now >= until)
//!      ▲                      │                            │
//!      └──────── unban ───────┘◀──────── clean_expired ────┘
//! ```
//!
//! # Design Decisions
//! - The store is authoritative; the artifact is a best-effort projection
//! - Artifact writers are elected through a lock key; a loser leaves a
//!   dirty flag so the winner or the next sweep renders again
//! - With a publish signal attached, ban changes only wake the background
//!   [`ArtifactPublisher`](crate::security::sweeper::ArtifactPublisher);
//!   the file write and reload command never run on the request path
//! - Store failures fail open: an unreadable ban is treated as no ban

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::clock::SharedClock;
use crate::observability::metrics;
use crate::pipeline::{BoxError, Flow, Middleware, Phase, RequestContext, TerminalResponse};
use crate::security::artifact::{ArtifactWriter, BanArtifact, BanRecord};
use crate::security::events::SecurityEvent;
use crate::store::{CounterStore, SafeSet};

pub const BAN_KEY_PREFIX: &str = "ban:";
const ARTIFACT_LOCK_KEY: &str = "artifact:lock";
const ARTIFACT_DIRTY_KEY: &str = "artifact:dirty";
const ARTIFACT_LOCK_TTL: Duration = Duration::from_secs(10);

pub fn ban_key(ip: &IpAddr) -> String {
    format!("{BAN_KEY_PREFIX}{ip}")
}

pub struct BanManager {
    store: Arc<dyn CounterStore>,
    clock: SharedClock,
    duration: Duration,
    artifact: ArtifactWriter,
    publish: Option<Arc<Notify>>,
}

impl BanManager {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: SharedClock,
        duration: Duration,
        artifact: ArtifactWriter,
    ) -> Self {
        Self {
            store,
            clock,
            duration,
            artifact,
            publish: None,
        }
    }

    /// Hand artifact regeneration to whoever waits on `signal`.
    pub fn with_publish_signal(mut self, signal: Arc<Notify>) -> Self {
        self.publish = Some(signal);
        self
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Ban `ip` for the configured duration starting now.
    ///
    /// Returns `None` when the ban could not be stored.
    pub fn ban(&self, ip: IpAddr) -> Option<BanRecord> {
        let start = self.clock.now();
        let until = start.saturating_add(self.duration.as_secs());

        if let Err(e) = self.store.set(&ban_key(&ip), until as i64, None) {
            tracing::error!(%ip, error = %e, "Failed to store ban");
            return None;
        }

        SecurityEvent::IpBanned {
            ip,
            start,
            until,
            duration_secs: self.duration.as_secs(),
        }
        .emit();
        metrics::record_ban();

        self.artifact_changed();
        Some(BanRecord { ip, ban_until: until })
    }

    /// Lift a ban. Returns whether one was recorded.
    pub fn unban(&self, ip: IpAddr) -> bool {
        let key = ban_key(&ip);
        if self.read(&key).is_none() {
            return false;
        }

        if let Err(e) = self.store.delete(&key) {
            tracing::error!(%ip, error = %e, "Failed to delete ban");
            return false;
        }

        SecurityEvent::IpUnbanned { ip }.emit();
        self.artifact_changed();
        true
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        let Some(until) = self.read(&ban_key(&ip)) else {
            return false;
        };

        let now = self.clock.now();
        if now < until {
            SecurityEvent::BannedRequestBlocked {
                ip,
                remaining_secs: until - now,
            }
            .emit();
            true
        } else {
            tracing::debug!(
                target: "security",
                event = "BAN_CHECK",
                %ip,
                expired_at = until,
                remaining_secs = 0u64,
                "Stale ban ignored until swept"
            );
            false
        }
    }

    /// Bans whose expiry is still in the future.
    pub fn active_bans(&self) -> Vec<BanRecord> {
        self.snapshot(self.clock.now())
    }

    /// Delete every expired ban. Returns how many were removed.
    pub fn clean_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;

        for (key, ip) in self.ban_keys() {
            let Some(until) = self.read(&key) else {
                continue;
            };
            if until > now {
                continue;
            }

            match self.store.delete(&key) {
                Ok(()) => {
                    removed += 1;
                    SecurityEvent::BanExpired {
                        ip,
                        expired_at: until,
                    }
                    .emit();
                }
                Err(e) => tracing::warn!(%ip, error = %e, "Failed to delete expired ban"),
            }
        }

        if removed > 0 {
            metrics::record_bans_expired(removed);
        }
        if removed > 0 || self.take_dirty() {
            self.artifact_changed();
        }
        removed
    }

    /// Render and publish the current active set.
    ///
    /// Returns whether this call wrote the artifact.
    pub fn regenerate_artifact(&self) -> bool {
        if self.artifact.path().is_none() {
            return false;
        }

        match self
            .store
            .safe_set(ARTIFACT_LOCK_KEY, 1, Some(ARTIFACT_LOCK_TTL))
        {
            Ok(SafeSet::Stored) => {}
            Ok(SafeSet::Exists) => {
                if let Err(e) = self.store.set(ARTIFACT_DIRTY_KEY, 1, None) {
                    tracing::warn!(error = %e, "Failed to flag ban artifact as dirty");
                }
                tracing::debug!("Ban artifact writer busy, regeneration deferred");
                return false;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Ban artifact lock unavailable, writing anyway");
            }
        }

        self.take_dirty();
        self.publish_snapshot();
        if self.take_dirty() {
            self.publish_snapshot();
        }

        if let Err(e) = self.store.delete(ARTIFACT_LOCK_KEY) {
            tracing::warn!(error = %e, "Failed to release ban artifact lock");
        }
        true
    }

    fn artifact_changed(&self) {
        match &self.publish {
            Some(signal) => signal.notify_one(),
            None => {
                self.regenerate_artifact();
            }
        }
    }

    fn publish_snapshot(&self) {
        let now = self.clock.now();
        let artifact = BanArtifact::new(now, self.snapshot(now));

        match self.artifact.publish(&artifact) {
            Ok(()) => {
                tracing::info!(
                    path = ?self.artifact.path(),
                    active_bans = artifact.bans.len(),
                    "Ban artifact regenerated"
                );
                metrics::record_artifact_write(true);
                metrics::record_active_bans(artifact.bans.len());
            }
            Err(e) => {
                tracing::error!(error = %e, "Ban artifact regeneration failed, store remains authoritative");
                metrics::record_artifact_write(false);
            }
        }
    }

    fn snapshot(&self, now: u64) -> Vec<BanRecord> {
        self.ban_keys()
            .into_iter()
            .filter_map(|(key, ip)| {
                let until = self.read(&key)?;
                (until > now).then_some(BanRecord { ip, ban_until: until })
            })
            .collect()
    }

    fn ban_keys(&self) -> Vec<(String, IpAddr)> {
        let keys = match self.store.keys() {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to enumerate bans");
                return Vec::new();
            }
        };

        keys.into_iter()
            .filter_map(|key| {
                let ip = key.strip_prefix(BAN_KEY_PREFIX)?.parse().ok()?;
                Some((key, ip))
            })
            .collect()
    }

    fn read(&self, key: &str) -> Option<u64> {
        match self.store.get(key) {
            Ok(value) => value.map(|v| v.max(0) as u64),
            Err(e) => {
                tracing::warn!(key, error = %e, "Failed to read ban record");
                None
            }
        }
    }

    fn take_dirty(&self) -> bool {
        match self.store.get(ARTIFACT_DIRTY_KEY) {
            Ok(Some(_)) => {
                if let Err(e) = self.store.delete(ARTIFACT_DIRTY_KEY) {
                    tracing::warn!(error = %e, "Failed to clear ban artifact dirty flag");
                }
                true
            }
            _ => false,
        }
    }
}

/// Access-phase gate that rejects banned addresses before any counting.
pub struct BanCheckMiddleware {
    bans: Arc<BanManager>,
}

impl BanCheckMiddleware {
    pub fn new(bans: Arc<BanManager>) -> Self {
        Self { bans }
    }
}

impl Middleware for BanCheckMiddleware {
    fn handle(&self, _phase: Phase, ctx: &mut RequestContext) -> Result<Flow, BoxError> {
        if self.bans.is_banned(ctx.client_ip) {
            metrics::record_decision("banned");
            return Ok(Flow::Terminate(TerminalResponse::banned()));
        }
        Ok(Flow::Continue)
    }
}
