pub mod rate_limit;

use crate::config::RouteConfig;
use crate::discovery::HealthStatus;
use crate::error::GatewayError;
use crate::proxy::context::RequestContext;
use crate::server::state::Gateway;
use rate_limit::RateLimiter;
use std::sync::Arc;
use tracing::debug;

/// Result of a filter's on_request phase.
#[derive(Debug)]
pub enum FilterResult {
    /// Continue to the next filter / phase.
    Continue,
    /// Short-circuit with this error; no upstream I/O happens.
    Reject(GatewayError),
}

/// Enum-based filter: static dispatch, exhaustive match.
///
/// Filters are pre-built once when the route is compiled, NOT per-request.
pub enum Filter {
    /// 503 when the target is unregistered, unhealthy, or its circuit is open.
    Availability { service: String },
    /// 401 without a verified bearer token, 403 when `required_roles` is
    /// non-empty and the principal holds none of them.
    Auth { required_roles: Vec<String> },
    RateLimit {
        /// Each route gets its own limiter so windows are isolated per route.
        limiter: Arc<RateLimiter>,
    },
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Filter::Availability { service } => f
                .debug_struct("Availability")
                .field("service", service)
                .finish(),
            Filter::Auth { required_roles } => f
                .debug_struct("Auth")
                .field("required_roles", required_roles)
                .finish(),
            Filter::RateLimit { .. } => f.debug_struct("RateLimit").finish(),
        }
    }
}

impl Filter {
    /// Request phase: runs before any upstream selection.
    pub async fn on_request(&self, gw: &Gateway, ctx: &mut RequestContext) -> FilterResult {
        match self {
            Filter::Availability { service } => availability_on_request(gw, service),
            Filter::Auth { required_roles } => auth_on_request(gw, required_roles, ctx).await,
            Filter::RateLimit { limiter } => rate_limit::rate_limit_on_request(limiter, ctx).await,
        }
    }

    pub fn evict_stale(&self) {
        if let Filter::RateLimit { limiter } = self {
            limiter.evict_stale();
        }
    }
}

fn availability_on_request(gw: &Gateway, service: &str) -> FilterResult {
    let unavailable = || {
        FilterResult::Reject(GatewayError::ServiceUnavailable {
            service: service.to_string(),
        })
    };
    if !gw.registry().contains(service) {
        return unavailable();
    }
    if gw.registry().status(service) == HealthStatus::Unhealthy {
        debug!("filter: availability: unhealthy, service={}", service);
        return unavailable();
    }
    if gw.breakers().is_open(service) {
        return FilterResult::Reject(GatewayError::CircuitOpen {
            service: service.to_string(),
        });
    }
    FilterResult::Continue
}

async fn auth_on_request(
    gw: &Gateway,
    required_roles: &[String],
    ctx: &mut RequestContext,
) -> FilterResult {
    let Some(token) = ctx.bearer_token.as_deref() else {
        return FilterResult::Reject(GatewayError::AuthRequired);
    };
    let principal = match gw.authenticator().verify(token).await {
        Ok(p) => p,
        Err(e) => {
            debug!(
                "filter: auth: rejected, route={}, error={}",
                ctx.route_pattern(),
                e
            );
            metrics::counter!("gateway_auth_rejected_total").increment(1);
            return FilterResult::Reject(GatewayError::AuthRequired);
        }
    };
    if !required_roles.is_empty() && !principal.has_any_role(required_roles) {
        return FilterResult::Reject(GatewayError::AuthzDenied {
            reason: format!("requires one of roles: {}", required_roles.join(", ")),
        });
    }
    ctx.principal = Some(principal);
    FilterResult::Continue
}

/// Build the filter chain for a route. Called once per route, NOT per request.
///
/// Order matters:
/// 1. Availability (cheap, local state only)
/// 2. Auth
/// 3. RateLimit
pub fn build_route_filters(route: &RouteConfig) -> Vec<Filter> {
    let mut filters = vec![Filter::Availability {
        service: route.target_service.clone(),
    }];

    if route.require_auth || !route.required_roles.is_empty() {
        filters.push(Filter::Auth {
            required_roles: route.required_roles.clone(),
        });
    }

    if let Some(ref rl) = route.rate_limit {
        filters.push(Filter::RateLimit {
            limiter: Arc::new(RateLimiter::new(rl)),
        });
    }

    filters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;

    fn route() -> RouteConfig {
        RouteConfig {
            path_pattern: "/api/orders/*".into(),
            target_service: "orders".into(),
            methods: vec![],
            require_auth: false,
            required_roles: vec![],
            rate_limit: None,
            timeout_ms: None,
        }
    }

    #[test]
    fn test_minimal_chain() {
        let filters = build_route_filters(&route());
        assert_eq!(filters.len(), 1);
        assert!(matches!(filters[0], Filter::Availability { .. }));
    }

    #[test]
    fn test_full_chain_order() {
        let mut r = route();
        r.required_roles = vec!["admin".into()];
        r.rate_limit = Some(RateLimitConfig {
            max: 10,
            window_ms: 1000,
        });
        let filters = build_route_filters(&r);
        assert_eq!(filters.len(), 3);
        assert!(matches!(filters[0], Filter::Availability { .. }));
        assert!(matches!(filters[1], Filter::Auth { .. }));
        assert!(matches!(filters[2], Filter::RateLimit { .. }));
    }
}
