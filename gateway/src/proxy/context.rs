use crate::error::GatewayError;
use crate::proxy::auth::Principal;
use crate::routing::CompiledRoute;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Serialize `value` as the JSON body of a response with `status`.
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> hyper::Response<BoxBody> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    let mut resp = hyper::Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    resp
}

/// Per-request state threaded through routing, the filter chain and the
/// proxy step.
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub client_ip: IpAddr,
    pub bearer_token: Option<String>,
    /// Set by the auth filter once the token is verified.
    pub principal: Option<Principal>,
    pub route: Option<Arc<CompiledRoute>>,
    pub service: String,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
}

impl RequestContext {
    pub fn new(method: Method, uri: &Uri, headers: &HeaderMap, client_ip: IpAddr) -> Self {
        Self {
            method,
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            client_ip,
            bearer_token: bearer_token(headers),
            principal: None,
            route: None,
            service: String::new(),
            start: Instant::now(),
            upstream_start: None,
        }
    }

    pub fn route_pattern(&self) -> &str {
        self.route
            .as_ref()
            .map(|r| r.config.path_pattern.as_str())
            .unwrap_or("")
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// JSON error body `{error, code, message, service, serviceName, timestamp}`
    /// with the error's status, plus request metrics.
    pub fn error_response(&self, err: &GatewayError) -> hyper::Response<BoxBody> {
        let status = err.status_code();
        self.finalize_metrics(status.as_u16());
        json_response(status, &err.to_body())
    }

    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "gateway_http_requests_total",
            "route" => self.route_pattern().to_string(),
            "service" => self.service.clone(),
            "method" => self.method.to_string(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "route" => self.route_pattern().to_string(),
            "service" => self.service.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!(
                "gateway_proxy_upstream_duration_seconds",
                "service" => self.service.clone(),
            )
            .record(upstream_start.elapsed().as_secs_f64());
        }
    }
}

/// Token from `Authorization: Bearer <token>`; scheme is case-insensitive.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
        Some(token.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ctx(uri: &str, headers: HeaderMap) -> RequestContext {
        RequestContext::new(
            Method::GET,
            &uri.parse::<Uri>().unwrap(),
            &headers,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        )
    }

    #[test]
    fn test_request_context_new() {
        let c = ctx("/api/orders/1?x=1", HeaderMap::new());
        assert_eq!(c.path, "/api/orders/1");
        assert_eq!(c.query.as_deref(), Some("x=1"));
        assert!(c.bearer_token.is_none());
        assert!(c.route.is_none());
        assert_eq!(c.route_pattern(), "");
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut h = HeaderMap::new();
        h.insert("authorization", "Bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&h).as_deref(), Some("abc123"));

        h.insert("authorization", "bearer  xyz ".parse().unwrap());
        assert_eq!(bearer_token(&h).as_deref(), Some("xyz"));

        h.insert("authorization", "Basic dXNlcjpw".parse().unwrap());
        assert!(bearer_token(&h).is_none());

        h.insert("authorization", "Bearer ".parse().unwrap());
        assert!(bearer_token(&h).is_none());
    }

    #[tokio::test]
    async fn test_error_response_body() {
        let c = ctx("/api/x", HeaderMap::new());
        let resp = c.error_response(&GatewayError::ServiceUnavailable {
            service: "orders".into(),
        });
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "application/json"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["code"], "SERVICE_UNAVAILABLE");
        assert_eq!(v["service"], "orders");
        assert_eq!(v["serviceName"], "orders");
        assert!(v["timestamp"].is_string());
    }
}
