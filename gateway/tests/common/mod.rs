//! Shared fixtures: mock backends on ephemeral ports and gateway builders.

#![allow(dead_code)]

use bulwark_gateway::config::{GatewayConfig, RetryConfig, RouteConfig, ServiceConfig};
use bulwark_gateway::proxy::auth::{Principal, StaticAuthenticator};
use bulwark_gateway::Gateway;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

/// What a mock backend saw for one proxied request.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
}

pub struct Reply {
    pub status: StatusCode,
    pub body: String,
    pub delay: Duration,
}

impl Reply {
    pub fn ok(body: &str) -> Self {
        Self::status(StatusCode::OK, body)
    }

    pub fn status(status: StatusCode, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

pub struct MockBackend {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl MockBackend {
    /// `handler` gets the request and its 1-based hit number. Health probes
    /// are answered separately and never counted.
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Recorded, usize) -> Reply + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let (h, r) = (hits.clone(), requests.clone());
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let (handler, hits, requests) = (handler.clone(), h.clone(), r.clone());
                tokio::spawn(async move {
                    let svc = service_fn(move |req: Request<Incoming>| {
                        let (handler, hits, requests) =
                            (handler.clone(), hits.clone(), requests.clone());
                        async move {
                            if req.uri().path() == "/health" {
                                return Ok::<_, Infallible>(Response::new(Full::new(
                                    Bytes::from_static(b"ok"),
                                )));
                            }
                            let recorded = Recorded {
                                method: req.method().clone(),
                                path_and_query: req
                                    .uri()
                                    .path_and_query()
                                    .map(|p| p.as_str().to_string())
                                    .unwrap_or_default(),
                                headers: req.headers().clone(),
                            };
                            let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                            requests.lock().unwrap().push(recorded.clone());
                            let reply = handler(&recorded, n);
                            if !reply.delay.is_zero() {
                                tokio::time::sleep(reply.delay).await;
                            }
                            let mut resp = Response::new(Full::new(Bytes::from(reply.body)));
                            *resp.status_mut() = reply.status;
                            Ok(resp)
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await;
                });
            }
        });

        Self {
            addr,
            hits,
            requests,
        }
    }

    /// Always answers 200 with `body`.
    pub async fn ok(body: &'static str) -> Self {
        Self::start(move |_, _| Reply::ok(body)).await
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<Recorded> {
        self.requests.lock().unwrap().last().cloned()
    }
}

/// An address nothing listens on.
pub async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

pub fn service(name: &str, url: &str) -> ServiceConfig {
    ServiceConfig {
        name: name.into(),
        url: url.into(),
        health_path: "/health".into(),
        timeout: 2_000,
        retries: 1,
        prefix: String::new(),
        instances: vec![],
        circuit_breaker: None,
        strategy: None,
    }
}

pub fn route(pattern: &str, target: &str) -> RouteConfig {
    RouteConfig {
        path_pattern: pattern.into(),
        target_service: target.into(),
        methods: vec![],
        require_auth: false,
        required_roles: vec![],
        rate_limit: None,
        timeout_ms: None,
    }
}

pub fn config(services: Vec<ServiceConfig>, routes: Vec<RouteConfig>) -> GatewayConfig {
    GatewayConfig {
        services,
        routes,
        retry: RetryConfig {
            base_delay_ms: 5,
            max_delay_ms: 20,
        },
        ..Default::default()
    }
}

pub fn principal(subject: &str, roles: &[&str]) -> Principal {
    Principal {
        subject: subject.into(),
        roles: roles.iter().map(|r| r.to_string()).collect(),
        organization_id: Some("org-1".into()),
        session_id: "sess-1".into(),
    }
}

/// Build a gateway with known tokens `admin-token` and `viewer-token`, and
/// run one health round so reachable backends are balanceable.
pub async fn gateway(config: GatewayConfig) -> Gateway {
    let auth = StaticAuthenticator::new()
        .with_token("admin-token", principal("u-admin", &["admin"]))
        .with_token("viewer-token", principal("u-viewer", &["viewer"]));
    let gw = Gateway::new(config, Arc::new(auth)).unwrap();
    gw.health().check_all().await;
    gw
}

pub fn peer() -> SocketAddr {
    "192.0.2.10:40000".parse().unwrap()
}

pub fn request(method: Method, uri: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

pub fn authed(method: Method, uri: &str, token: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", token))
        .body(Full::new(Bytes::new()))
        .unwrap()
}

pub async fn body_json(resp: Response<bulwark_gateway::proxy::BoxBody>) -> serde_json::Value {
    use http_body_util::BodyExt;
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(resp: Response<bulwark_gateway::proxy::BoxBody>) -> String {
    use http_body_util::BodyExt;
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}
