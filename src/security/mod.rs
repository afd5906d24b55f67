//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Access phase:
//!     → ban.rs (BanCheckMiddleware, reject banned IPs first)
//!     → rate_limit.rs (fixed window + burst, violations, ban trigger)
//!
//! On ban / unban / expiry:
//!     → artifact.rs (render ban list, atomic write, reload command)
//!     → events.rs (audit trail on the `security` target)
//!
//! Background:
//!     → sweeper.rs (clean_expired on an interval)
//! ```
//!
//! # Design Decisions
//! - The counter store is the single source of truth shared by workers
//! - Store read failures fail open; a broken store must not take the site down
//! - The ban artifact is a projection that may lag by one sweep interval

pub mod artifact;
pub mod ban;
pub mod events;
pub mod rate_limit;
pub mod sweeper;
