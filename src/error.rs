//! Gateway error taxonomy.

use axum::http::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the routing and resiliency layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// No route rule matches the request path.
    #[error("no route matches path '{0}'")]
    RouteNotFound(String),

    /// Every candidate is unusable for the service.
    #[error("no healthy instance available for service '{0}'")]
    NoHealthyInstance(String),

    /// The circuit for every candidate is open.
    #[error("circuit open for service '{0}'")]
    CircuitOpen(String),

    /// The backend call or the outer deadline timed out.
    #[error("request to service '{0}' timed out")]
    Timeout(String),

    /// Retry budget exhausted.
    #[error("service '{service}' unavailable after {attempts} attempts")]
    ServiceUnavailable { service: String, attempts: u32 },

    /// WebSocket admission rejected by a quota.
    #[error("connection limit exceeded ({scope} limit {limit})")]
    ConnectionLimitExceeded { scope: LimitScope, limit: usize },

    /// WebSocket backend could not be (re)bound.
    #[error("backend unavailable for service '{0}'")]
    BackendUnavailable(String),

    /// Registry lookup failed and nothing was cached.
    #[error("registry error: {0}")]
    Registry(String),

    /// Malformed inbound request.
    #[error("bad request: {0}")]
    BadRequest(String),
}

/// Which quota rejected an admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    Global,
    User,
}

impl std::fmt::Display for LimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitScope::Global => f.write_str("global"),
            LimitScope::User => f.write_str("per-user"),
        }
    }
}

impl GatewayError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::RouteNotFound(_) => "ROUTE_NOT_FOUND",
            GatewayError::NoHealthyInstance(_) => "NO_HEALTHY_INSTANCE",
            GatewayError::CircuitOpen(_) => "CIRCUIT_OPEN",
            GatewayError::Timeout(_) => "TIMEOUT",
            GatewayError::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            GatewayError::ConnectionLimitExceeded { .. } => "CONNECTION_LIMIT_EXCEEDED",
            GatewayError::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            GatewayError::Registry(_) => "REGISTRY_UNAVAILABLE",
            GatewayError::BadRequest(_) => "BAD_REQUEST",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::NoHealthyInstance(_)
            | GatewayError::CircuitOpen(_)
            | GatewayError::ServiceUnavailable { .. }
            | GatewayError::Registry(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::ConnectionLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::BackendUnavailable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Structural failures are surfaced immediately, never retried.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            GatewayError::RouteNotFound(_)
                | GatewayError::ConnectionLimitExceeded { .. }
                | GatewayError::BadRequest(_)
        )
    }
}

/// Failure of a single backend attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AttemptError {
    #[error("attempt timed out")]
    Timeout,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("upstream returned {0}")]
    Upstream(u16),
}

/// JSON body of every error response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub correlation_id: String,
}

impl ErrorEnvelope {
    pub fn new(err: &GatewayError, correlation_id: &str) -> Self {
        Self {
            error: ErrorBody {
                code: err.code(),
                message: err.to_string(),
                correlation_id: correlation_id.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(GatewayError::RouteNotFound("/x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(GatewayError::Timeout("s".into()).status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            GatewayError::ConnectionLimitExceeded { scope: LimitScope::User, limit: 5 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_structural() {
        assert!(GatewayError::RouteNotFound("/".into()).is_structural());
        assert!(!GatewayError::Timeout("s".into()).is_structural());
        assert!(!GatewayError::CircuitOpen("s".into()).is_structural());
    }

    #[test]
    fn test_envelope_carries_correlation_id() {
        let err = GatewayError::ServiceUnavailable { service: "chat".into(), attempts: 3 };
        let body = serde_json::to_value(ErrorEnvelope::new(&err, "corr-1")).unwrap();
        assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");
        assert_eq!(body["error"]["correlation_id"], "corr-1");
        assert!(body["error"]["message"].as_str().unwrap().contains("3 attempts"));
    }
}
