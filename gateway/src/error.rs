use http::StatusCode;
use serde::Serialize;
use std::time::SystemTime;

/// How an outbound call failed before a response arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// Connection refused or the backend is otherwise unreachable.
    Refused,
    /// Host could not be resolved.
    NotFound,
    Other,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("service unavailable: {service}")]
    ServiceUnavailable { service: String },

    #[error("circuit open: {service}")]
    CircuitOpen { service: String },

    #[error("upstream timeout after {timeout_ms}ms: {service}")]
    UpstreamTimeout { service: String, timeout_ms: u64 },

    #[error("upstream transport error ({kind:?}): {service}: {message}")]
    UpstreamTransport {
        service: String,
        kind: TransportErrorKind,
        message: String,
    },

    #[error("upstream returned status {status}: {service}")]
    UpstreamStatus { service: String, status: u16 },

    #[error("no route matched: {path}")]
    RouteNotFound { path: String },

    #[error("method {method} not allowed: {path}")]
    MethodNotAllowed { method: String, path: String },

    #[error("authentication required")]
    AuthRequired,

    #[error("access denied: {reason}")]
    AuthzDenied { reason: String },

    #[error("rate limited")]
    RateLimited,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unknown service: {service}")]
    UnknownService { service: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::ServiceUnavailable { .. } | GatewayError::CircuitOpen { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamTransport { kind, .. } => match kind {
                TransportErrorKind::Refused | TransportErrorKind::NotFound => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                TransportErrorKind::Other => StatusCode::INTERNAL_SERVER_ERROR,
            },
            GatewayError::UpstreamStatus { status, .. } => StatusCode::from_u16(*status)
                .ok()
                .filter(|s| s.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            GatewayError::RouteNotFound { .. } | GatewayError::UnknownService { .. } => {
                StatusCode::NOT_FOUND
            }
            GatewayError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::AuthRequired => StatusCode::UNAUTHORIZED,
            GatewayError::AuthzDenied { .. } => StatusCode::FORBIDDEN,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::BadRequest(_) | GatewayError::Config(_) => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code carried in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            GatewayError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            GatewayError::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            GatewayError::UpstreamTransport { .. } => "UPSTREAM_TRANSPORT_ERROR",
            GatewayError::UpstreamStatus { .. } => "UPSTREAM_STATUS_ERROR",
            GatewayError::RouteNotFound { .. } => "ROUTE_NOT_FOUND",
            GatewayError::MethodNotAllowed { .. } => "METHOD_NOT_ALLOWED",
            GatewayError::AuthRequired => "AUTH_REQUIRED",
            GatewayError::AuthzDenied { .. } => "AUTHZ_DENIED",
            GatewayError::RateLimited => "RATE_LIMITED",
            GatewayError::BadRequest(_) => "BAD_REQUEST",
            GatewayError::UnknownService { .. } => "UNKNOWN_SERVICE",
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn service(&self) -> Option<&str> {
        match self {
            GatewayError::ServiceUnavailable { service }
            | GatewayError::CircuitOpen { service }
            | GatewayError::UpstreamTimeout { service, .. }
            | GatewayError::UpstreamTransport { service, .. }
            | GatewayError::UpstreamStatus { service, .. }
            | GatewayError::UnknownService { service } => Some(service),
            _ => None,
        }
    }

    /// Transient upstream failures are retried with backoff and count against
    /// the breaker; everything else is surfaced on the first occurrence.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamTimeout { .. }
                | GatewayError::UpstreamTransport { .. }
                | GatewayError::UpstreamStatus { .. }
        )
    }

    pub fn to_body(&self) -> ErrorBody {
        let status = self.status_code();
        let service = self.service().map(str::to_owned);
        ErrorBody {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: self.code(),
            message: self.to_string(),
            service_name: service.clone(),
            service,
            timestamp: humantime::format_rfc3339_millis(SystemTime::now()).to_string(),
        }
    }
}

/// JSON body returned to clients for every gateway-generated error.
///
/// `service` and `serviceName` carry the same value; dashboards written
/// against either field keep working.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(rename = "serviceName", skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    pub timestamp: String,
}
