//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for the shield proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ShieldConfig {
    /// Listener configuration (bind address, backpressure).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Per-IP rate limiting.
    pub rate_limit: RateLimitConfig,

    /// IP bans and the ban artifact.
    pub ban: BanConfig,

    /// Route definitions mapping requests to upstreams.
    pub routes: Vec<RouteConfig>,

    /// Middleware state overrides applied after registration.
    pub middleware: Vec<MiddlewareOverride>,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent requests (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,

    /// Idle upstream connection timeout in seconds.
    pub idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            request_secs: 30,
            idle_secs: 60,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Register the limiter as active.
    pub enabled: bool,

    /// Sustained requests allowed per window.
    pub requests_per_second: u32,

    /// Extra requests tolerated on top of `requests_per_second`.
    pub burst: u32,

    /// Length of the fixed counting window in seconds.
    pub violation_window_secs: u64,

    /// Violations within one window before the IP is banned.
    pub violations_before_ban: u32,

    /// Chain priority (lower runs first).
    pub priority: i32,

    /// Route keys to limit; empty applies to every route.
    pub routes: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 10,
            burst: 5,
            violation_window_secs: 60,
            violations_before_ban: 3,
            priority: 20,
            routes: Vec::new(),
        }
    }
}

/// Ban manager configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BanConfig {
    /// Register the ban check as active.
    pub enabled: bool,

    /// How long a ban lasts in seconds.
    pub duration_secs: u64,

    /// Where to write the nginx ban map. Unset disables the artifact.
    pub artifact_path: Option<PathBuf>,

    /// Command run after each artifact write, e.g. `["nginx", "-s", "reload"]`.
    pub reload_command: Vec<String>,

    /// Interval between expiry sweeps in seconds.
    pub sweep_interval_secs: u64,

    /// Chain priority of the ban check (lower runs first).
    pub priority: i32,
}

impl Default for BanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            duration_secs: 1_800,
            artifact_path: None,
            reload_command: Vec::new(),
            sweep_interval_secs: 60,
            priority: 10,
        }
    }
}

/// Route configuration mapping requests to an upstream.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route key, used for route-scoped middleware, logging and metrics.
    pub name: String,

    /// Host header to match (exact match).
    pub host: Option<String>,

    /// Path prefix to match.
    pub path_prefix: Option<String>,

    /// Upstream base URL (e.g., "http://127.0.0.1:3000").
    pub upstream: String,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,
}

/// Overrides the registered state of one middleware.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MiddlewareOverride {
    pub name: String,
    /// `active` or `disabled`.
    pub state: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
