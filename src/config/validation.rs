//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (rate limit routes reference existing routes)
//! - Validate value ranges (windows and durations > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ShieldConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::schema::ShieldConfig;
use crate::pipeline::MiddlewareState;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &ShieldConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_addr(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be greater than 0"));
    }

    let rate = &config.rate_limit;
    if rate.violation_window_secs == 0 {
        errors.push(ValidationError::new(
            "rate_limit.violation_window_secs",
            "must be greater than 0",
        ));
    }
    if rate.violations_before_ban == 0 {
        errors.push(ValidationError::new(
            "rate_limit.violations_before_ban",
            "must be greater than 0",
        ));
    }
    if rate.requests_per_second == 0 && rate.burst == 0 {
        errors.push(ValidationError::new(
            "rate_limit.requests_per_second",
            "requests_per_second + burst must allow at least one request",
        ));
    }

    if config.ban.duration_secs == 0 {
        errors.push(ValidationError::new("ban.duration_secs", "must be greater than 0"));
    }
    if config.ban.sweep_interval_secs == 0 {
        errors.push(ValidationError::new("ban.sweep_interval_secs", "must be greater than 0"));
    }

    let mut names = HashSet::new();
    for (i, route) in config.routes.iter().enumerate() {
        let field = format!("routes[{i}]");
        if route.name.is_empty() {
            errors.push(ValidationError::new(format!("{field}.name"), "must not be empty"));
        } else if !names.insert(route.name.as_str()) {
            errors.push(ValidationError::new(
                format!("{field}.name"),
                format!("duplicate route name `{}`", route.name),
            ));
        }
        if !route.upstream.starts_with("http://") {
            errors.push(ValidationError::new(
                format!("{field}.upstream"),
                "must be an http:// URL",
            ));
        }
        if let Some(prefix) = &route.path_prefix {
            if !prefix.starts_with('/') {
                errors.push(ValidationError::new(
                    format!("{field}.path_prefix"),
                    "must start with '/'",
                ));
            }
        }
    }

    for route in &rate.routes {
        if !names.contains(route.as_str()) {
            errors.push(ValidationError::new(
                "rate_limit.routes",
                format!("unknown route `{route}`"),
            ));
        }
    }

    for (i, entry) in config.middleware.iter().enumerate() {
        if entry.name.is_empty() {
            errors.push(ValidationError::new(format!("middleware[{i}].name"), "must not be empty"));
        }
        if entry.state.parse::<MiddlewareState>().is_err() {
            errors.push(ValidationError::new(
                format!("middleware[{i}].state"),
                format!("`{}` is not `active` or `disabled`", entry.state),
            ));
        }
    }

    if config.observability.metrics_enabled {
        check_addr(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    if config.admin.enabled {
        check_addr(&mut errors, "admin.bind_address", &config.admin.bind_address);
        if config.admin.api_key.is_empty() {
            errors.push(ValidationError::new(
                "admin.api_key",
                "must be set when the admin API is enabled",
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_addr(errors: &mut Vec<ValidationError>, field: &str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            field,
            format!("`{value}` is not a socket address"),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{MiddlewareOverride, RouteConfig};

    fn route(name: &str, upstream: &str) -> RouteConfig {
        RouteConfig {
            name: name.to_string(),
            host: None,
            path_prefix: Some("/".to_string()),
            upstream: upstream.to_string(),
            priority: 0,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(validate_config(&ShieldConfig::default()), Ok(()));
    }

    #[test]
    fn test_collects_every_error() {
        let mut config = ShieldConfig::default();
        config.listener.bind_address = "nowhere".to_string();
        config.rate_limit.violation_window_secs = 0;
        config.rate_limit.routes = vec!["missing".to_string()];
        config.routes = vec![route("api", "http://127.0.0.1:3000"), route("api", "ftp://x")];
        config.middleware = vec![MiddlewareOverride {
            name: "rate_limit".to_string(),
            state: "paused".to_string(),
        }];
        config.admin.enabled = true;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "listener.bind_address",
                "rate_limit.violation_window_secs",
                "routes[1].name",
                "routes[1].upstream",
                "rate_limit.routes",
                "middleware[0].state",
                "admin.api_key",
            ]
        );
    }
}
