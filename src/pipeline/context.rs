//! Per-request state carried through every phase.

use std::net::IpAddr;

use axum::http::{Extensions, HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde_json::{json, Value};

/// A complete response produced by the pipeline instead of the upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TerminalResponse {
    pub fn new(status: StatusCode, body: Value) -> Self {
        Self { status, body }
    }

    /// 429 with the number of violations left before a ban.
    pub fn rate_limited(violations_remaining: u64) -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            json!({
                "error": "rate_limited",
                "message": "Too many requests. Please slow down.",
                "violations_remaining": violations_remaining,
            }),
        )
    }

    pub fn banned() -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            json!({
                "error": "forbidden",
                "message": "Your IP address has been temporarily banned.",
            }),
        )
    }

    /// Generic failure; never carries internal detail.
    pub fn internal_error() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({
                "error": "internal_error",
                "message": "Internal server error.",
            }),
        )
    }

    pub fn not_found() -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            json!({
                "error": "not_found",
                "message": "No matching route found.",
            }),
        )
    }

    pub fn bad_gateway() -> Self {
        Self::new(
            StatusCode::BAD_GATEWAY,
            json!({
                "error": "bad_gateway",
                "message": "Upstream request failed.",
            }),
        )
    }
}

/// Request state shared by all middleware across phases.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub client_ip: IpAddr,
    pub method: String,
    pub host: Option<String>,
    pub path: String,
    /// Route key resolved by the route table, if any.
    pub route: Option<String>,
    pub request_headers: HeaderMap,
    /// Headers merged into whatever response is finally sent.
    pub response_headers: HeaderMap,
    /// Status received from the upstream, once forwarded.
    pub upstream_status: Option<StatusCode>,
    /// Typed slots for middleware to hand data to later phases.
    pub extensions: Extensions,
    terminal: Option<TerminalResponse>,
}

impl RequestContext {
    pub fn new(client_ip: IpAddr, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            request_id: String::new(),
            client_ip,
            method: method.into(),
            host: None,
            path: path.into(),
            route: None,
            request_headers: HeaderMap::new(),
            response_headers: HeaderMap::new(),
            upstream_status: None,
            extensions: Extensions::new(),
            terminal: None,
        }
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn terminal(&self) -> Option<&TerminalResponse> {
        self.terminal.as_ref()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminal.is_some()
    }

    /// Store a terminal response unless one is already set.
    ///
    /// Returns whether the response was stored.
    pub fn terminate(&mut self, response: TerminalResponse) -> bool {
        if self.terminal.is_some() {
            return false;
        }
        self.terminal = Some(response);
        true
    }

    /// Store a terminal response, replacing any earlier one.
    pub fn replace_terminal(&mut self, response: TerminalResponse) {
        self.terminal = Some(response);
    }

    pub fn take_terminal(&mut self) -> Option<TerminalResponse> {
        self.terminal.take()
    }

    /// Status the client will see.
    pub fn final_status(&self) -> Option<StatusCode> {
        self.terminal
            .as_ref()
            .map(|terminal| terminal.status)
            .or(self.upstream_status)
    }

    pub fn set_response_header(&mut self, name: &'static str, value: impl ToString) {
        if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
            self.response_headers
                .insert(HeaderName::from_static(name), value);
        }
    }
}
