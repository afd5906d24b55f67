//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events, access log in the log phase)
//!     → metrics.rs (counters, gauges, histograms)
//!     → security::events (audit trail on the `security` target)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Request ID flows through the pipeline context into every log line
//! - Metrics are cheap (atomic increments) and optional

pub mod logging;
pub mod metrics;
