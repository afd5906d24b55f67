//! Shared counter store subsystem.
//!
//! # Data Flow
//! ```text
//! rate limiter ──┐
//!                ├──▶ CounterStore (get / set / incr / safe_set / delete / keys)
//! ban manager ───┘          │
//!                           ▼
//!                 MemoryStore (single host) or any cross-process backend
//! ```
//!
//! # Design Decisions
//! - The store is the only state shared between workers
//! - Only single-key atomic operations; no cross-key transactions
//! - Values are integers (counters and unix-second timestamps)
//! - TTLs are whole seconds measured against the injected clock

pub mod memory;

use std::time::Duration;

pub use memory::MemoryStore;

/// Errors surfaced by a counter store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store cannot be reached at all.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// The backend does not implement the requested operation.
    #[error("counter store does not support `{0}`")]
    Unsupported(&'static str),

    /// A single operation failed but the store is otherwise healthy.
    #[error("transient counter store failure: {0}")]
    Transient(String),
}

/// Result of a set-if-absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeSet {
    Stored,
    Exists,
}

/// Key/value store of integer values visible to every worker.
pub trait CounterStore: Send + Sync {
    /// Fetch a live value.
    fn get(&self, key: &str) -> Result<Option<i64>, StoreError>;

    /// Store a value, replacing any previous one. `None` means no expiry.
    fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Atomically add `delta` and return the new value.
    ///
    /// A missing key is first initialised to `default` with `ttl`; an existing
    /// key keeps its remaining TTL.
    fn incr(
        &self,
        key: &str,
        delta: i64,
        default: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StoreError>;

    /// Store only if no live value exists.
    fn safe_set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<SafeSet, StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Enumerate all live keys.
    fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Drop every expired entry, returning how many were removed.
    fn sweep_expired(&self) -> Result<usize, StoreError>;

    /// Connectivity check used at startup.
    fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
