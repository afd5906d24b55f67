//! Shield proxy library.
//!
//! A security and traffic-shaping layer for a reverse proxy: every request
//! runs through a phase-ordered middleware chain whose access phase checks
//! IP bans and per-IP rate limits kept in a shared counter store.
//!
//! ```text
//!                 ┌────────────────────────── worker ───────────────────────────┐
//!                 │                                                             │
//!  request ──────▶│ http::server ─▶ pipeline::dispatcher ─▶ access chain        │
//!                 │                      │                   ├ ban_check        │
//!                 │                      │                   └ rate_limit ──┐   │
//!                 │                      ▼                                  │   │
//!                 │                 content ─▶ upstream                     │   │
//!                 │                      ▼                                  ▼   │
//!  response ◀─────│ header/body filter ─▶ log (access_log)        security::ban │
//!                 │                                                   │         │
//!                 └───────────────────────────────────────────────────┼─────────┘
//!                                   ▲                                 │
//!                                   │ get / set / incr / keys         ▼
//!                            store::CounterStore              ban artifact + reload
//! ```

pub mod admin;
pub mod clock;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod pipeline;
pub mod routing;
pub mod security;
pub mod store;

pub use config::ShieldConfig;
pub use http::HttpServer;
pub use lifecycle::{build_worker, Shutdown, Worker};
pub use pipeline::Pipeline;
