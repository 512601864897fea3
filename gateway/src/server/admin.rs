use super::Gateway;
use crate::config::ServiceConfig;
use crate::discovery::{ServiceDescriptor, ServiceHealthRecord};
use crate::error::GatewayError;
use crate::monitor::OverallHealth;
use crate::proxy::context::{full_body, json_response};
use crate::proxy::BoxBody;
use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::{Request, Response};
use serde::Serialize;
use tracing::info;

#[derive(Serialize)]
struct ServiceView {
    #[serde(flatten)]
    descriptor: ServiceDescriptor,
    health: Option<ServiceHealthRecord>,
}

/// Operator surface on its own listener. Never reachable through the proxy
/// port.
pub async fn handle_admin<B>(req: Request<B>, gw: Gateway) -> Response<BoxBody>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) => {
            let report = gw.monitor().health_report();
            let status = if report.status == OverallHealth::Unhealthy {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            json_response(status, &report)
        }

        (&Method::GET, ["metrics"]) => match gw.metrics() {
            Some(m) => {
                let mut resp = Response::new(full_body(m.render()));
                resp.headers_mut().insert(
                    http::header::CONTENT_TYPE,
                    http::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
                );
                resp
            }
            None => error(&GatewayError::Internal("metrics recorder not installed".into())),
        },

        (&Method::GET, ["metrics", "services"]) => {
            json_response(StatusCode::OK, &gw.monitor().all_metrics())
        }

        (&Method::GET, ["circuits"]) => json_response(StatusCode::OK, &gw.breakers().snapshots()),

        (&Method::POST, ["circuits", name, action]) => circuit_action(&gw, name, action),

        (&Method::GET, ["load-balancer"]) => json_response(StatusCode::OK, &gw.balancer().stats()),

        (&Method::GET, ["routes"]) => json_response(StatusCode::OK, &gw.routes().configs()),

        (&Method::GET, ["services"]) => {
            let registry = gw.registry();
            let services: Vec<ServiceView> = registry
                .list()
                .into_iter()
                .map(|d| ServiceView {
                    health: registry.health(&d.name),
                    descriptor: (*d).clone(),
                })
                .collect();
            json_response(StatusCode::OK, &services)
        }

        (&Method::POST, ["services"]) => register_service(req, gw).await,

        (&Method::DELETE, ["services", name]) => {
            if gw.deregister_service(name).await {
                info!("admin: service deregistered, name={}", name);
                json_response(StatusCode::OK, &serde_json::json!({ "deregistered": name }))
            } else {
                error(&GatewayError::UnknownService {
                    service: name.to_string(),
                })
            }
        }

        _ => json_response(
            StatusCode::NOT_FOUND,
            &serde_json::json!({ "error": "not found", "path": path }),
        ),
    }
}

async fn register_service<B>(req: Request<B>, gw: Gateway) -> Response<BoxBody>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let body = match req.into_body().collect().await {
        Ok(c) => c.to_bytes(),
        Err(e) => return error(&GatewayError::BadRequest(e.to_string())),
    };
    let cfg: ServiceConfig = match serde_json::from_slice(&body) {
        Ok(c) => c,
        Err(e) => return error(&GatewayError::BadRequest(format!("invalid service: {}", e))),
    };

    match gw.register_service(cfg).await {
        Ok(descriptor) => {
            info!(
                "admin: service registered, name={}, url={}",
                descriptor.name, descriptor.base_url
            );
            // First probe in the background; the service stays `unknown`
            // (and unbalanceable) until it reports.
            let health = gw.health().clone();
            let name = descriptor.name.clone();
            tokio::spawn(async move {
                health.check_health(&name).await;
            });
            json_response(StatusCode::CREATED, &*descriptor)
        }
        Err(e) => error(&e),
    }
}

fn circuit_action(gw: &Gateway, name: &str, action: &str) -> Response<BoxBody> {
    let breakers = gw.breakers();
    match action {
        "open" => breakers.open_circuit(name),
        "close" => breakers.close_circuit(name),
        "reset" => breakers.reset_circuit(name),
        other => {
            return error(&GatewayError::BadRequest(format!(
                "unknown circuit action '{}', expected open, close or reset",
                other
            )))
        }
    }
    info!("admin: circuit {}, service={}", action, name);
    json_response(StatusCode::OK, &breakers.snapshot(name))
}

fn error(err: &GatewayError) -> Response<BoxBody> {
    json_response(err.status_code(), &err.to_body())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::proxy::auth::StaticAuthenticator;
    use http_body_util::Full;
    use std::sync::Arc;

    fn gateway() -> Gateway {
        Gateway::new(GatewayConfig::default(), Arc::new(StaticAuthenticator::new())).unwrap()
    }

    fn request(method: Method, path: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn json(resp: Response<BoxBody>) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_register_list_and_deregister() {
        let gw = gateway();
        let body = r#"{"name":"reports","url":"http://127.0.0.1:9","prefix":"/r","retries":2}"#;
        let resp = handle_admin(request(Method::POST, "/services", body), gw.clone()).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = handle_admin(request(Method::GET, "/services", ""), gw.clone()).await;
        let services = json(resp).await;
        assert_eq!(services[0]["name"], "reports");
        assert_eq!(services[0]["path_prefix"], "/r");

        let resp = handle_admin(request(Method::DELETE, "/services/reports", ""), gw.clone()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = handle_admin(request(Method::DELETE, "/services/reports", ""), gw).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_body() {
        let gw = gateway();
        let resp = handle_admin(request(Method::POST, "/services", "{"), gw.clone()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let body = r#"{"name":"x","url":"ftp://nope"}"#;
        let resp = handle_admin(request(Method::POST, "/services", body), gw).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_circuit_actions() {
        let gw = gateway();
        let resp = handle_admin(request(Method::POST, "/circuits/pricing/open", ""), gw.clone()).await;
        assert_eq!(json(resp).await["phase"], "open");
        assert!(gw.breakers().is_open("pricing"));

        let resp = handle_admin(request(Method::GET, "/circuits", ""), gw.clone()).await;
        assert_eq!(json(resp).await.as_array().unwrap().len(), 1);

        let resp = handle_admin(request(Method::POST, "/circuits/pricing/close", ""), gw.clone()).await;
        assert_eq!(json(resp).await["phase"], "closed");

        let resp = handle_admin(request(Method::POST, "/circuits/pricing/flip", ""), gw).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_and_unknown_path() {
        let gw = gateway();
        let resp = handle_admin(request(Method::GET, "/health", ""), gw.clone()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(json(resp).await.get("system").is_some());

        let resp = handle_admin(request(Method::GET, "/metrics", ""), gw.clone()).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let resp = handle_admin(request(Method::GET, "/nope", ""), gw).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
