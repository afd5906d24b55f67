//! Route lookup.
//!
//! # Responsibilities
//! - Store compiled routes
//! - Look up matching route for request
//! - Return matched route or explicit no-match
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(n) scan in priority order (acceptable for typical route counts)
//! - Explicit no-match (`None`) rather than silent default

use crate::config::schema::RouteConfig;
use crate::routing::matcher::{AndMatcher, HostMatcher, Matcher, PathPrefixMatcher, RouteTarget};

/// A compiled route.
#[derive(Debug)]
pub struct Route {
    /// Route key passed to the middleware chain.
    pub name: String,
    /// Upstream base URL without trailing slash.
    pub upstream: String,
    pub priority: u32,
    matcher: AndMatcher,
}

impl Route {
    pub fn from_config(config: &RouteConfig) -> Self {
        let mut matchers: Vec<Box<dyn Matcher>> = Vec::new();
        if let Some(host) = &config.host {
            matchers.push(Box::new(HostMatcher::new(host.clone())));
        }
        if let Some(prefix) = &config.path_prefix {
            matchers.push(Box::new(PathPrefixMatcher::new(prefix.clone())));
        }

        Self {
            name: config.name.clone(),
            upstream: config.upstream.trim_end_matches('/').to_string(),
            priority: config.priority,
            matcher: AndMatcher::new(matchers),
        }
    }

    pub fn matches(&self, target: &RouteTarget<'_>) -> bool {
        self.matcher.matches(target)
    }
}

#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Compile routes, highest priority first. Equal priorities keep file order.
    pub fn new(configs: &[RouteConfig]) -> Self {
        let mut routes: Vec<Route> = configs.iter().map(Route::from_config).collect();
        routes.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { routes }
    }

    pub fn resolve(&self, target: &RouteTarget<'_>) -> Option<&Route> {
        self.routes.iter().find(|route| route.matches(target))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(name: &str, host: Option<&str>, prefix: Option<&str>, priority: u32) -> RouteConfig {
        RouteConfig {
            name: name.to_string(),
            host: host.map(str::to_string),
            path_prefix: prefix.map(str::to_string),
            upstream: format!("http://{name}.internal/"),
            priority,
        }
    }

    #[test]
    fn test_priority_then_file_order() {
        let table = RouteTable::new(&[
            route("fallback", None, None, 0),
            route("api", None, Some("/api"), 10),
            route("api-shadow", None, Some("/api"), 10),
            route("admin-host", Some("admin.example.com"), None, 20),
        ]);

        let resolve = |host, path| {
            table
                .resolve(&RouteTarget { host, path })
                .map(|r| r.name.as_str())
        };

        assert_eq!(resolve(None, "/api/users"), Some("api"));
        assert_eq!(resolve(Some("admin.example.com"), "/api"), Some("admin-host"));
        assert_eq!(resolve(None, "/static"), Some("fallback"));
    }

    #[test]
    fn test_no_match() {
        let table = RouteTable::new(&[route("api", None, Some("/api"), 0)]);
        assert!(table.resolve(&RouteTarget { host: None, path: "/" }).is_none());
        assert_eq!(
            table.resolve(&RouteTarget { host: None, path: "/api" }).unwrap().upstream,
            "http://api.internal"
        );
    }
}
