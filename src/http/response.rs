//! Response assembly.
//!
//! # Responsibilities
//! - Render pipeline terminal responses as JSON
//! - Pass upstream responses through without buffering
//! - Merge headers set by middleware (rate-limit metadata, request ID)

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Response as HttpResponse};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::http::request::{strip_hop_by_hop, X_REQUEST_ID};
use crate::pipeline::TerminalResponse;

impl IntoResponse for TerminalResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Stream an upstream response back to the client.
pub fn from_upstream(upstream: HttpResponse<hyper::body::Incoming>) -> Response {
    let (mut parts, body) = upstream.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Response::from_parts(parts, Body::new(body))
}

/// Copy middleware-set headers onto the outgoing response.
pub fn merge_headers(response: &mut Response, headers: &HeaderMap, request_id: &str) {
    for (name, value) in headers {
        response.headers_mut().insert(name.clone(), value.clone());
    }
    if !request_id.is_empty() {
        if let Ok(value) = HeaderValue::from_str(request_id) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }
    }
}
