use crate::error::GatewayError;
use crate::proxy::context::{full_body, BoxBody, RequestContext};
use crate::proxy::filter::{Filter, FilterResult};
use crate::routing::CompiledRoute;
use crate::server::state::Gateway;
use crate::upstream::{RequestOptions, UpstreamResponse};
use bytes::Bytes;
use http::header::{
    AUTHORIZATION, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING,
};
use http::{HeaderMap, HeaderName, HeaderValue};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::{Request, Response};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

static X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");
static X_USER_ROLES: HeaderName = HeaderName::from_static("x-user-roles");
static X_ORGANIZATION_ID: HeaderName = HeaderName::from_static("x-organization-id");
static X_SESSION_ID: HeaderName = HeaderName::from_static("x-session-id");

/// Handle one client request through a phased lifecycle:
///
/// 1. ROUTE_MATCH: longest-prefix route, 404 otherwise
/// 2. METHOD: 405 when the route restricts methods
/// 3. ON_REQUEST: filter chain (availability, auth, rate limit)
/// 4. UPSTREAM: prefix rewrite, then `ServiceClient` (retry, breaker)
/// 5. LOG: monitor sample, metrics and the access line
///
/// Generic over the body so tests can drive it without a socket.
pub async fn handle<B>(req: Request<B>, gw: &Gateway, peer_addr: SocketAddr) -> Response<BoxBody>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let mut req_headers = req.headers().clone();
    let client_ip = client_ip(&req_headers, peer_addr);
    let host = req_headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    inject_forwarded_headers(&mut req_headers, peer_addr, &host);

    let mut ctx = RequestContext::new(req.method().clone(), req.uri(), &req_headers, client_ip);

    // Route match
    let route = match phase_route_match(&ctx, gw) {
        Ok(r) => r,
        Err(e) => return ctx.error_response(&e),
    };
    ctx.service = route.config.target_service.clone();
    ctx.route = Some(route.clone());

    if !route.allows_method(&ctx.method) {
        let err = GatewayError::MethodNotAllowed {
            method: ctx.method.to_string(),
            path: ctx.path.clone(),
        };
        let mut resp = ctx.error_response(&err);
        let allow = route
            .methods
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        if let Ok(v) = HeaderValue::from_str(&allow) {
            resp.headers_mut().insert(http::header::ALLOW, v);
        }
        return resp;
    }

    // Request filters
    if let Some(err) = phase_on_request(&route.filters, gw, &mut ctx).await {
        return ctx.error_response(&err);
    }

    // Body is read only once the request is admitted.
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let err = GatewayError::BadRequest(format!("failed to read request body: {}", e));
            return ctx.error_response(&err);
        }
    };

    let result = phase_upstream(gw, &mut ctx, &route, req_headers, body).await;
    let upstream_elapsed = ctx
        .upstream_start
        .map(|s| s.elapsed())
        .unwrap_or(Duration::ZERO);

    let resp = match result {
        Ok(upstream_resp) => {
            gw.monitor()
                .record_request(&ctx.service, duration_ms(upstream_elapsed));
            let resp = build_downstream_response(upstream_resp);
            ctx.finalize_metrics(resp.status().as_u16());
            resp
        }
        Err(err) => {
            let monitor = gw.monitor();
            monitor.record_request(&ctx.service, duration_ms(upstream_elapsed));
            monitor.record_error(&ctx.service, None);
            ctx.error_response(&err)
        }
    };

    phase_log(&ctx, &resp, upstream_elapsed);
    resp
}

fn phase_route_match(ctx: &RequestContext, gw: &Gateway) -> Result<Arc<CompiledRoute>, GatewayError> {
    match gw.routes().match_route(&ctx.path) {
        Some(r) => Ok(r),
        None => {
            debug!("proxy: no route matched, path={}", ctx.path);
            Err(GatewayError::RouteNotFound {
                path: ctx.path.clone(),
            })
        }
    }
}

async fn phase_on_request(
    filters: &[Filter],
    gw: &Gateway,
    ctx: &mut RequestContext,
) -> Option<GatewayError> {
    for filter in filters {
        if let FilterResult::Reject(err) = filter.on_request(gw, ctx).await {
            debug!(
                "proxy: rejected by filter, route={}, code={}",
                ctx.route_pattern(),
                err.code()
            );
            return Some(err);
        }
    }
    None
}

async fn phase_upstream(
    gw: &Gateway,
    ctx: &mut RequestContext,
    route: &CompiledRoute,
    mut headers: HeaderMap,
    body: Bytes,
) -> Result<UpstreamResponse, GatewayError> {
    let descriptor = gw
        .registry()
        .get(&ctx.service)
        .ok_or_else(|| GatewayError::ServiceUnavailable {
            service: ctx.service.clone(),
        })?;
    let path = route.upstream_path(&ctx.path, ctx.query.as_deref(), &descriptor.path_prefix);

    prepare_upstream_headers(&mut headers, ctx);
    let opts = RequestOptions {
        timeout: route.config.timeout_ms.map(Duration::from_millis),
        headers,
        ..Default::default()
    };
    let body = (!body.is_empty()).then_some(body);

    ctx.upstream_start = Some(Instant::now());
    gw.client()
        .request(&ctx.service, ctx.method.clone(), &path, body, &opts)
        .await
}

/// Strip what must not travel upstream and attach the verified identity.
/// Client-supplied identity headers are always dropped so they cannot be
/// spoofed on routes without auth.
fn prepare_upstream_headers(headers: &mut HeaderMap, ctx: &RequestContext) {
    remove_hop_headers(headers);
    headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);
    for h in [&X_USER_ID, &X_USER_ROLES, &X_ORGANIZATION_ID, &X_SESSION_ID] {
        headers.remove(h);
    }

    let Some(principal) = &ctx.principal else {
        return;
    };
    // The token was consumed by the gateway.
    headers.remove(AUTHORIZATION);
    let mut set = |name: &HeaderName, value: &str| {
        if let Ok(v) = HeaderValue::from_str(value) {
            headers.insert(name.clone(), v);
        }
    };
    set(&X_USER_ID, &principal.subject);
    set(&X_USER_ROLES, &principal.roles.join(","));
    if let Some(org) = &principal.organization_id {
        set(&X_ORGANIZATION_ID, org);
    }
    if !principal.session_id.is_empty() {
        set(&X_SESSION_ID, &principal.session_id);
    }
}

fn phase_log(ctx: &RequestContext, resp: &Response<BoxBody>, upstream_elapsed: Duration) {
    let resp_status = resp.status().as_u16();
    let total_ms = ctx.start.elapsed().as_millis();
    let upstream_ms = upstream_elapsed.as_millis();

    // Structured access log: one line per proxied request.
    tracing::info!(
        client_ip = %ctx.client_ip,
        method = %ctx.method,
        path = %ctx.path,
        status = resp_status,
        route = %ctx.route_pattern(),
        service = %ctx.service,
        latency_ms = %total_ms,
        upstream_ms = %upstream_ms,
        "access"
    );
}

fn build_downstream_response(upstream: UpstreamResponse) -> Response<BoxBody> {
    let mut resp = Response::new(full_body(upstream.body));
    *resp.status_mut() = upstream.status;
    *resp.headers_mut() = upstream.headers;
    remove_hop_headers(resp.headers_mut());
    resp
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Left-most `X-Forwarded-For` entry if present (assumes a trusted reverse
/// proxy in front), otherwise the TCP peer.
fn client_ip(headers: &HeaderMap, peer_addr: SocketAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
        .unwrap_or_else(|| peer_addr.ip())
}

fn remove_hop_headers(headers: &mut HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

/// Inject standard `X-Forwarded-*` and `X-Real-IP` headers so backends can
/// identify the original client.
///
/// - `X-Forwarded-For`: append the TCP peer IP to any existing value.
/// - `X-Forwarded-Proto`: trust an incoming value, default `http`.
/// - `X-Forwarded-Host`: the original `Host`.
/// - `X-Real-IP`: always the immediate peer.
fn inject_forwarded_headers(headers: &mut HeaderMap, peer_addr: SocketAddr, original_host: &str) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");

    let peer_ip = peer_addr.ip().to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let combined = format!("{}, {}", existing, peer_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if !original_host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(original_host) {
            headers.insert(XFH.clone(), v);
        }
    }

    if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XRI.clone(), v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::auth::Principal;
    use http::{Method, Uri};

    fn peer() -> SocketAddr {
        "10.1.2.3:5555".parse().unwrap()
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut h = HeaderMap::new();
        assert_eq!(client_ip(&h, peer()), "10.1.2.3".parse::<IpAddr>().unwrap());
        h.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&h, peer()), "203.0.113.7".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_forwarded_headers() {
        let mut h = HeaderMap::new();
        h.insert("x-forwarded-for", "203.0.113.7".parse().unwrap());
        inject_forwarded_headers(&mut h, peer(), "api.example.com");
        assert_eq!(h["x-forwarded-for"], "203.0.113.7, 10.1.2.3");
        assert_eq!(h["x-forwarded-proto"], "http");
        assert_eq!(h["x-forwarded-host"], "api.example.com");
        assert_eq!(h["x-real-ip"], "10.1.2.3");
    }

    #[test]
    fn test_principal_headers_replace_client_supplied() {
        let mut h = HeaderMap::new();
        h.insert("x-user-id", "spoofed".parse().unwrap());
        h.insert("authorization", "Bearer t".parse().unwrap());
        h.insert("connection", "keep-alive".parse().unwrap());
        let mut ctx = RequestContext::new(
            Method::GET,
            &"/x".parse::<Uri>().unwrap(),
            &h,
            peer().ip(),
        );

        let mut anon = h.clone();
        prepare_upstream_headers(&mut anon, &ctx);
        assert!(anon.get("x-user-id").is_none());
        assert!(anon.get("connection").is_none());
        assert!(anon.get("authorization").is_some());

        ctx.principal = Some(Principal {
            subject: "u-7".into(),
            roles: vec!["admin".into(), "ops".into()],
            organization_id: Some("org-1".into()),
            session_id: "sess-9".into(),
        });
        prepare_upstream_headers(&mut h, &ctx);
        assert_eq!(h["x-user-id"], "u-7");
        assert_eq!(h["x-user-roles"], "admin,ops");
        assert_eq!(h["x-organization-id"], "org-1");
        assert_eq!(h["x-session-id"], "sess-9");
        assert!(h.get("authorization").is_none());
    }
}
