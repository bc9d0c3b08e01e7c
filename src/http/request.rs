//! Request handling and transformation.
//!
//! # Responsibilities
//! - Ensure every request carries a correlation ID (reuse or generate)
//! - Build the request context from upstream headers
//! - Prepare the upstream request for a chosen instance
//!
//! # Design Decisions
//! - Correlation ID added as early as possible for tracing
//! - Priority and bypass headers are trusted as-is, never re-derived
//! - Hop-by-hop headers are stripped before forwarding

use std::net::SocketAddr;

use axum::body::{Body, Bytes};
use axum::http::{
    header, request::Parts, HeaderMap, HeaderName, HeaderValue, Request, Uri,
};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};

use crate::context::{
    parse_flag, AuthContext, Deadline, PriorityClass, RequestContext, X_BYPASS_CIRCUIT,
    X_CORRELATION_ID, X_PRIORITY_CLASS,
};
use crate::error::GatewayError;
use crate::resilience::TimeoutPolicy;

/// Caller identity asserted upstream.
pub const X_USER_ID: &str = "x-user-id";
/// Session identity for WebSocket connections.
pub const X_SESSION_ID: &str = "x-session-id";

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Sets `x-correlation-id` on requests that lack one.
pub fn set_correlation_id_layer() -> SetRequestIdLayer<MakeRequestUuid> {
    SetRequestIdLayer::new(HeaderName::from_static(X_CORRELATION_ID), MakeRequestUuid)
}

/// Copies `x-correlation-id` from the request onto the response.
pub fn propagate_correlation_id_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::new(HeaderName::from_static(X_CORRELATION_ID))
}

pub fn correlation_id(headers: &HeaderMap) -> Option<String> {
    header_str(headers, X_CORRELATION_ID).map(str::to_string)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Value of a query parameter, if present.
pub fn query_param(uri: &Uri, key: &str) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

/// Build the request context from headers, falling back to the route defaults.
pub fn build_context(
    headers: &HeaderMap,
    default_priority: PriorityClass,
    peer: Option<SocketAddr>,
    timeouts: impl Fn(PriorityClass) -> TimeoutPolicy,
) -> Result<RequestContext, GatewayError> {
    let priority = match header_str(headers, X_PRIORITY_CLASS) {
        Some(value) => value.parse::<PriorityClass>().map_err(GatewayError::BadRequest)?,
        None => default_priority,
    };
    let bypass = header_str(headers, X_BYPASS_CIRCUIT).is_some_and(parse_flag);

    let auth = AuthContext {
        authorization: header_str(headers, header::AUTHORIZATION.as_str()).map(str::to_string),
        user_id: header_str(headers, X_USER_ID)
            .map(str::to_string)
            .or_else(|| peer.map(|p| p.ip().to_string())),
    };

    Ok(RequestContext::new(
        correlation_id(headers),
        auth,
        priority,
        bypass,
        Deadline::after(timeouts(priority).deadline),
    ))
}

/// Session id from `x-session-id` or `?session_id=`.
pub fn session_id(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    header_str(headers, X_SESSION_ID)
        .map(str::to_string)
        .or_else(|| query_param(uri, "session_id"))
}

/// Upstream path plus the original query string.
pub fn upstream_path_and_query(upstream_path: &str, uri: &Uri) -> String {
    match uri.query() {
        Some(query) => format!("{}?{}", upstream_path, query),
        None => upstream_path.to_string(),
    }
}

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Copy the inbound request for one attempt against `address`.
pub fn upstream_request(
    parts: &Parts,
    address: &str,
    path_and_query: &str,
    body: Bytes,
    ctx_headers: &[(HeaderName, HeaderValue)],
) -> Result<Request<Body>, axum::http::Error> {
    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(format!("http://{}{}", address, path_and_query));

    if let Some(headers) = builder.headers_mut() {
        for (name, value) in parts.headers.iter() {
            if name != header::HOST && !is_hop_by_hop(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        for (name, value) in ctx_headers {
            headers.insert(name.clone(), value.clone());
        }
    }

    builder.body(Body::from(body))
}

/// Headers describing the request context to the backend.
pub fn context_headers(ctx: &RequestContext, peer: Option<SocketAddr>) -> Vec<(HeaderName, HeaderValue)> {
    let mut headers = Vec::with_capacity(4);
    if let Ok(value) = HeaderValue::from_str(ctx.correlation_id()) {
        headers.push((HeaderName::from_static(X_CORRELATION_ID), value));
    }
    headers.push((
        HeaderName::from_static(X_PRIORITY_CLASS),
        HeaderValue::from_static(ctx.priority().as_str()),
    ));
    if let Some(user) = ctx.auth().user_id.as_deref() {
        if let Ok(value) = HeaderValue::from_str(user) {
            headers.push((HeaderName::from_static(X_USER_ID), value));
        }
    }
    if let Some(peer) = peer {
        if let Ok(value) = HeaderValue::from_str(&peer.ip().to_string()) {
            headers.push((HeaderName::from_static("x-forwarded-for"), value));
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy(_: PriorityClass) -> TimeoutPolicy {
        TimeoutPolicy {
            attempt: Duration::from_secs(1),
            deadline: Duration::from_secs(3),
        }
    }

    #[test]
    fn test_context_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(X_PRIORITY_CLASS, HeaderValue::from_static("critical"));
        headers.insert(X_BYPASS_CIRCUIT, HeaderValue::from_static("true"));
        headers.insert(X_CORRELATION_ID, HeaderValue::from_static("corr-7"));
        headers.insert(X_USER_ID, HeaderValue::from_static("alice"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));

        let ctx = build_context(&headers, PriorityClass::Normal, None, policy).unwrap();
        assert_eq!(ctx.priority(), PriorityClass::Critical);
        assert!(ctx.bypass_circuit());
        assert_eq!(ctx.correlation_id(), "corr-7");
        assert_eq!(ctx.auth().user_id.as_deref(), Some("alice"));
        assert_eq!(ctx.auth().authorization.as_deref(), Some("Bearer t"));
    }

    #[test]
    fn test_context_defaults() {
        let peer: SocketAddr = "10.0.0.9:5000".parse().unwrap();
        let ctx = build_context(&HeaderMap::new(), PriorityClass::Elevated, Some(peer), policy).unwrap();
        assert_eq!(ctx.priority(), PriorityClass::Elevated);
        assert!(!ctx.bypass_circuit());
        assert_eq!(ctx.auth().user_id.as_deref(), Some("10.0.0.9"));
        assert!(!ctx.correlation_id().is_empty());
    }

    #[test]
    fn test_invalid_priority_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(X_PRIORITY_CLASS, HeaderValue::from_static("urgent"));
        let err = build_context(&headers, PriorityClass::Normal, None, policy).unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[test]
    fn test_session_and_query() {
        let uri: Uri = "/ws?session_id=s-1&kind=session".parse().unwrap();
        assert_eq!(session_id(&HeaderMap::new(), &uri).as_deref(), Some("s-1"));
        assert_eq!(query_param(&uri, "kind").as_deref(), Some("session"));
        assert_eq!(upstream_path_and_query("/v1/ws", &uri), "/v1/ws?session_id=s-1&kind=session");
    }

    #[test]
    fn test_upstream_request_strips_hop_by_hop() {
        let (parts, _) = Request::builder()
            .method("POST")
            .uri("http://gateway/api/x?q=1")
            .header("host", "gateway")
            .header("connection", "keep-alive")
            .header("x-custom", "1")
            .body(())
            .unwrap()
            .into_parts();
        let ctx_headers = vec![(HeaderName::from_static(X_CORRELATION_ID), HeaderValue::from_static("c"))];

        let req = upstream_request(&parts, "10.0.0.1:80", "/x?q=1", Bytes::from_static(b"hi"), &ctx_headers).unwrap();
        assert_eq!(req.uri(), "http://10.0.0.1:80/x?q=1");
        assert!(req.headers().get("connection").is_none());
        assert!(req.headers().get("host").is_none());
        assert_eq!(req.headers()["x-custom"], "1");
        assert_eq!(req.headers()[X_CORRELATION_ID], "c");
    }
}
