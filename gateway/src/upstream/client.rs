use crate::config::RetryConfig;
use crate::discovery::ServiceRegistry;
use crate::error::{GatewayError, TransportErrorKind};
use crate::upstream::circuit_breaker::{BreakerCheck, CircuitBreakerRegistry};
use crate::upstream::loadbalance::{LoadBalancer, ServiceInstance};
use bytes::Bytes;
use futures_util::future::join_all;
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub type HttpClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Produces a canned response when the circuit is open.
pub type Fallback = Arc<dyn Fn() -> UpstreamResponse + Send + Sync>;

/// Fully buffered backend response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Per-attempt bound. Defaults to the descriptor's timeout.
    pub timeout: Option<Duration>,
    /// Total attempts. Defaults to the descriptor's `max_retries`.
    pub max_retries: Option<u32>,
    pub headers: HeaderMap,
    pub fallback: Option<Fallback>,
}

/// Outbound calls to registered services: instance selection, per-attempt
/// timeout, retry with exponential backoff, and breaker bookkeeping.
#[derive(Clone)]
pub struct ServiceClient {
    http: HttpClient,
    registry: Arc<ServiceRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    balancer: Arc<LoadBalancer>,
    base_delay: Duration,
    max_delay: Duration,
}

impl ServiceClient {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        balancer: Arc<LoadBalancer>,
        retry: &RetryConfig,
    ) -> Self {
        Self {
            http: build_upstream_http_client(),
            registry,
            breakers,
            balancer,
            base_delay: Duration::from_millis(retry.base_delay_ms),
            max_delay: Duration::from_millis(retry.max_delay_ms),
        }
    }

    pub async fn request(
        &self,
        service: &str,
        method: Method,
        path: &str,
        body: Option<Bytes>,
        opts: &RequestOptions,
    ) -> Result<UpstreamResponse, GatewayError> {
        let descriptor = self
            .registry
            .get(service)
            .ok_or_else(|| GatewayError::ServiceUnavailable {
                service: service.to_string(),
            })?;
        let attempts = opts.max_retries.unwrap_or(descriptor.max_retries).max(1);
        let timeout = opts.timeout.unwrap_or(descriptor.timeout);
        let body = body.unwrap_or_default();

        let mut last_err: Option<GatewayError> = None;
        let mut trial = false;
        let mut made = 0;
        for attempt in 1..=attempts {
            let check = self.breakers.try_acquire(service);
            if check == BreakerCheck::Rejected {
                metrics::counter!(
                    "gateway_circuit_breaker_rejected_total",
                    "service" => service.to_string(),
                )
                .increment(1);
                if let Some(fallback) = &opts.fallback {
                    debug!("client: circuit open, serving fallback, service={}", service);
                    return Ok(fallback());
                }
                return Err(last_err.unwrap_or_else(|| GatewayError::CircuitOpen {
                    service: service.to_string(),
                }));
            }
            // A half-open circuit gets exactly one trial, reported as soon as it ends.
            trial = check == BreakerCheck::Probe;

            let Some(guard) = self.balancer.acquire(service) else {
                if trial {
                    self.breakers.release_trial(service);
                }
                return Err(GatewayError::ServiceUnavailable {
                    service: service.to_string(),
                });
            };

            made = attempt;
            let started = Instant::now();
            let outcome = self
                .send_once(service, guard.instance(), &method, path, &body, &opts.headers, timeout)
                .await;
            drop(guard);
            metrics::histogram!(
                "gateway_upstream_request_duration_seconds",
                "service" => service.to_string(),
            )
            .record(started.elapsed().as_secs_f64());

            let err = match outcome {
                Ok(resp) if !resp.status.is_server_error() => {
                    self.breakers.record_success(service);
                    return Ok(resp);
                }
                Ok(resp) => GatewayError::UpstreamStatus {
                    service: service.to_string(),
                    status: resp.status.as_u16(),
                },
                Err(e) => e,
            };
            let retry = attempt < attempts && !trial && err.is_retryable();
            last_err = Some(err);
            if !retry {
                break;
            }

            let delay = backoff_delay(attempt, self.base_delay, self.max_delay);
            debug!(
                "client: attempt failed, retrying, service={}, attempt={}, delay_ms={}, error={}",
                service,
                attempt,
                delay.as_millis(),
                last_err.as_ref().map(|e| e.to_string()).unwrap_or_default()
            );
            metrics::counter!(
                "gateway_upstream_retries_total",
                "service" => service.to_string(),
            )
            .increment(1);
            tokio::time::sleep(delay).await;
        }

        let err = last_err.unwrap_or_else(|| GatewayError::Internal("no attempt made".into()));
        if err.is_retryable() {
            self.breakers.record_failure(service);
        } else if trial {
            self.breakers.release_trial(service);
        }
        warn!(
            "client: upstream call failed, service={}, attempts={}, half_open_trial={}, error={}",
            service, made, trial, err
        );
        metrics::counter!(
            "gateway_upstream_failures_total",
            "service" => service.to_string(),
            "code" => err.code(),
        )
        .increment(1);

        if let Some(fallback) = &opts.fallback {
            if self.breakers.is_open(service) {
                return Ok(fallback());
            }
        }
        Err(err)
    }

    /// Same request to several services concurrently; one result per service,
    /// in input order.
    pub async fn broadcast(
        &self,
        services: &[String],
        method: Method,
        path: &str,
        body: Option<Bytes>,
        opts: &RequestOptions,
    ) -> Vec<(String, Result<UpstreamResponse, GatewayError>)> {
        let calls = services.iter().map(|name| {
            let method = method.clone();
            let body = body.clone();
            async move {
                let result = self.request(name, method, path, body, opts).await;
                (name.clone(), result)
            }
        });
        join_all(calls).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_once(
        &self,
        service: &str,
        instance: &ServiceInstance,
        method: &Method,
        path: &str,
        body: &Bytes,
        headers: &HeaderMap,
        timeout: Duration,
    ) -> Result<UpstreamResponse, GatewayError> {
        let url = instance.descriptor.url_for(path);
        let mut builder = Request::builder().method(method.clone()).uri(&url);
        if let Some(h) = builder.headers_mut() {
            h.extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        let req = builder
            .body(Full::new(body.clone()))
            .map_err(|e| GatewayError::Internal(format!("invalid upstream request {}: {}", url, e)))?;

        let exchange = async {
            let resp = self.http.request(req).await.map_err(|e| {
                let mut kind = classify_transport(&e);
                if kind == TransportErrorKind::Other && e.is_connect() {
                    kind = TransportErrorKind::Refused;
                }
                GatewayError::UpstreamTransport {
                    service: service.to_string(),
                    kind,
                    message: e.to_string(),
                }
            })?;
            let (parts, body) = resp.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| GatewayError::UpstreamTransport {
                    service: service.to_string(),
                    kind: TransportErrorKind::Other,
                    message: e.to_string(),
                })?
                .to_bytes();
            Ok(UpstreamResponse {
                status: parts.status,
                headers: parts.headers,
                body,
            })
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::UpstreamTimeout {
                service: service.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

/// `min(base * 2^(attempt-1), cap)` for 1-based attempts.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

/// Walk the source chain looking for refused connections and DNS failures.
fn classify_transport(err: &(dyn StdError + 'static)) -> TransportErrorKind {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionRefused => return TransportErrorKind::Refused,
                std::io::ErrorKind::NotFound => return TransportErrorKind::NotFound,
                _ => {}
            }
        }
        let msg = e.to_string();
        if msg.contains("dns error") || msg.contains("failed to lookup address") {
            return TransportErrorKind::NotFound;
        }
        current = e.source();
    }
    TransportErrorKind::Other
}

/// Pooled client for both `http://` and `https://` backends. TLS uses the
/// webpki root store; HTTP/2 is negotiated via ALPN.
pub fn build_upstream_http_client() -> HttpClient {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(90))
        .build(https)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::discovery::{HealthStatus, ServiceDescriptor, ServiceHealthRecord};
    use crate::upstream::loadbalance::Strategy;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_millis(1000);
        assert_eq!(backoff_delay(1, base, cap), Duration::from_millis(100));
        assert_eq!(backoff_delay(2, base, cap), Duration::from_millis(200));
        assert_eq!(backoff_delay(3, base, cap), Duration::from_millis(400));
        assert_eq!(backoff_delay(5, base, cap), cap);
        assert_eq!(backoff_delay(64, base, cap), cap);
    }

    #[test]
    fn test_classify_refused() {
        let err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(classify_transport(&err), TransportErrorKind::Refused);
        let err = std::io::Error::new(std::io::ErrorKind::Other, "dns error: no such host");
        assert_eq!(classify_transport(&err), TransportErrorKind::NotFound);
        let err = std::io::Error::new(std::io::ErrorKind::Other, "reset");
        assert_eq!(classify_transport(&err), TransportErrorKind::Other);
    }

    fn client_for(url: &str, threshold: u32) -> (ServiceClient, Arc<CircuitBreakerRegistry>) {
        let registry = Arc::new(ServiceRegistry::new());
        let mut d = ServiceDescriptor::new("svc", url);
        d.max_retries = 2;
        let d = registry.register(d);
        registry.record_health(ServiceHealthRecord::observed(
            "svc",
            HealthStatus::Healthy,
            None,
            None,
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout_ms: 60_000,
        }));
        let balancer = Arc::new(LoadBalancer::new(registry.clone(), Strategy::RoundRobin));
        balancer.set_instances(&d, &[]);
        let retry = RetryConfig {
            base_delay_ms: 1,
            max_delay_ms: 5,
        };
        (
            ServiceClient::new(registry, breakers.clone(), balancer, &retry),
            breakers,
        )
    }

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_unregistered_service_is_unavailable() {
        let (client, _) = client_for("http://127.0.0.1:1", 5);
        let err = client
            .request("ghost", Method::GET, "/", None, &RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ServiceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_refused_exhausts_and_records_one_failure() {
        let url = format!("http://127.0.0.1:{}", closed_port());
        let (client, breakers) = client_for(&url, 5);
        let err = client
            .request("svc", Method::GET, "/x", None, &RequestOptions::default())
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                GatewayError::UpstreamTransport {
                    kind: TransportErrorKind::Refused,
                    ..
                }
            ),
            "got {:?}",
            err
        );
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(breakers.snapshot("svc").consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_open_circuit_serves_fallback_without_io() {
        let url = format!("http://127.0.0.1:{}", closed_port());
        let (client, breakers) = client_for(&url, 1);
        breakers.open_circuit("svc");

        let opts = RequestOptions {
            fallback: Some(Arc::new(|| UpstreamResponse::new(StatusCode::OK, "cached"))),
            ..Default::default()
        };
        let resp = client
            .request("svc", Method::GET, "/price", None, &opts)
            .await
            .unwrap();
        assert_eq!(resp.body, Bytes::from_static(b"cached"));

        let err = client
            .request("svc", Method::GET, "/price", None, &RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_broadcast_returns_one_result_per_service() {
        let (client, _) = client_for("http://127.0.0.1:1", 5);
        let names = vec!["ghost-a".to_string(), "ghost-b".to_string()];
        let results = client
            .broadcast(&names, Method::GET, "/", None, &RequestOptions::default())
            .await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "ghost-a");
        assert!(results.iter().all(|(_, r)| r.is_err()));
    }
}
