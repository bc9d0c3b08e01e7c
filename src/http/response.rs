//! Response handling and transformation.
//!
//! # Responsibilities
//! - Map gateway errors to the JSON error envelope
//! - Strip hop-by-hop headers from backend responses
//! - Run response hooks owned by external collaborators
//!
//! # Design Decisions
//! - Every response, success or error, carries `x-correlation-id`
//! - Hooks only see successful responses

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hyper::body::{Frame, Incoming, SizeHint};

use crate::config::RouteConfig;
use crate::context::{RequestContext, X_CORRELATION_ID};
use crate::error::{ErrorEnvelope, GatewayError};
use crate::http::request::is_hop_by_hop;
use crate::load_balancer::InstanceGuard;

/// A gateway error bound to the request's correlation ID.
#[derive(Debug)]
pub struct ErrorResponse {
    pub error: GatewayError,
    pub correlation_id: String,
}

impl ErrorResponse {
    pub fn new(error: GatewayError, correlation_id: impl Into<String>) -> Self {
        Self {
            error,
            correlation_id: correlation_id.into(),
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let envelope = ErrorEnvelope::new(&self.error, &self.correlation_id);
        let mut response = (self.error.status_code(), Json(envelope)).into_response();
        set_correlation_id(&mut response, &self.correlation_id);
        response
    }
}

pub fn set_correlation_id(response: &mut Response, correlation_id: &str) {
    if let Ok(value) = HeaderValue::from_str(correlation_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(X_CORRELATION_ID), value);
    }
}

/// Backend body that keeps the instance's connection slot until it is
/// fully streamed or dropped.
struct GuardedBody<B> {
    inner: B,
    _guard: InstanceGuard,
}

impl<B> hyper::body::Body for GuardedBody<B>
where
    B: hyper::body::Body + Unpin,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Convert a backend response for the client, dropping hop-by-hop headers.
///
/// `guard` is released once the client has the whole body.
pub fn from_upstream(upstream: hyper::Response<Incoming>, guard: InstanceGuard) -> Response {
    let (parts, incoming) = upstream.into_parts();
    let body = GuardedBody {
        inner: incoming,
        _guard: guard,
    };
    let mut response = Response::from_parts(parts, Body::new(body));
    strip_hop_by_hop(&mut response);
    response
}

pub fn strip_hop_by_hop(response: &mut Response) {
    let hop: Vec<HeaderName> = response
        .headers()
        .keys()
        .filter(|name| is_hop_by_hop(name))
        .cloned()
        .collect();
    for name in hop {
        response.headers_mut().remove(name);
    }
}

/// Transformation applied to successful backend responses.
pub trait ResponseHook: Send + Sync {
    fn on_response(&self, route: &RouteConfig, ctx: &RequestContext, response: &mut Response);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_error_response_envelope() {
        let response = ErrorResponse::new(GatewayError::RouteNotFound("/nope".into()), "corr-1").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[X_CORRELATION_ID], "corr-1");

        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], "ROUTE_NOT_FOUND");
        assert_eq!(json["error"]["correlation_id"], "corr-1");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut response = Response::new(axum::body::Body::empty());
        response.headers_mut().insert("connection", HeaderValue::from_static("close"));
        response.headers_mut().insert("x-keep", HeaderValue::from_static("1"));
        strip_hop_by_hop(&mut response);
        assert!(response.headers().get("connection").is_none());
        assert!(response.headers().get("x-keep").is_some());
    }
}
