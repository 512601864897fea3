use crate::config::RouteConfig;
use crate::proxy::filter::{build_route_filters, Filter};
use http::Method;
use std::sync::Arc;

/// A route ready for matching: normalized prefix, parsed methods and the
/// pre-built filter chain.
pub struct CompiledRoute {
    pub config: RouteConfig,
    /// `/api/orders/*` and `/api/orders` both compile to `/api/orders`.
    pub prefix: String,
    /// Empty means any method.
    pub methods: Vec<Method>,
    pub filters: Vec<Filter>,
}

impl std::fmt::Debug for CompiledRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledRoute")
            .field("prefix", &self.prefix)
            .field("target_service", &self.config.target_service)
            .field("methods", &self.methods)
            .field("filters", &self.filters)
            .finish()
    }
}

impl CompiledRoute {
    /// Method names are checked by `config::validate_route` before a route is
    /// compiled.
    pub fn new(config: RouteConfig) -> Self {
        let methods = config
            .methods
            .iter()
            .filter_map(|m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()).ok())
            .collect();
        Self {
            prefix: normalize_pattern(&config.path_pattern),
            methods,
            filters: build_route_filters(&config),
            config,
        }
    }

    /// Exact prefix, or prefix followed by `/`. Never a partial segment.
    pub fn matches(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return true;
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    pub fn allows_method(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }

    /// Replace the matched prefix with the backend's own prefix, keeping the
    /// remainder and the query string.
    pub fn upstream_path(&self, path: &str, query: Option<&str>, backend_prefix: &str) -> String {
        let rest = if self.prefix == "/" {
            path
        } else {
            path.strip_prefix(self.prefix.as_str()).unwrap_or(path)
        };
        let backend_prefix = backend_prefix.trim_end_matches('/');

        let mut out = String::with_capacity(backend_prefix.len() + rest.len() + 16);
        out.push_str(backend_prefix);
        if !rest.is_empty() && !rest.starts_with('/') {
            out.push('/');
        }
        out.push_str(rest);
        if out.is_empty() {
            out.push('/');
        }
        if let Some(q) = query.filter(|q| !q.is_empty()) {
            out.push('?');
            out.push_str(q);
        }
        out
    }
}

pub(crate) fn normalize_pattern(pattern: &str) -> String {
    let trimmed = pattern.trim_end_matches('*').trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Immutable route set ordered by prefix length, longest first. Mutations
/// build a new table; unchanged routes keep their `Arc` (and their rate
/// limiter state).
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Arc<CompiledRoute>>,
}

impl RouteTable {
    pub fn new(configs: &[RouteConfig]) -> Self {
        let routes = configs
            .iter()
            .map(|c| Arc::new(CompiledRoute::new(c.clone())))
            .collect();
        let table = Self::from_routes(routes);
        tracing::info!("routing: compiled route table, count={}", table.len());
        table
    }

    fn from_routes(mut routes: Vec<Arc<CompiledRoute>>) -> Self {
        // Stable: equal-length prefixes keep insertion order.
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { routes }
    }

    /// Longest-prefix match.
    pub fn match_route(&self, path: &str) -> Option<Arc<CompiledRoute>> {
        self.routes.iter().find(|r| r.matches(path)).cloned()
    }

    /// New table with `config` added, replacing any route with the same
    /// normalized pattern.
    pub fn with_route(&self, config: RouteConfig) -> Self {
        let compiled = Arc::new(CompiledRoute::new(config));
        let mut routes: Vec<Arc<CompiledRoute>> = self
            .routes
            .iter()
            .filter(|r| r.prefix != compiled.prefix)
            .cloned()
            .collect();
        routes.push(compiled);
        Self::from_routes(routes)
    }

    /// New table without the route for `pattern`; `None` if there was none.
    pub fn without_route(&self, pattern: &str) -> Option<Self> {
        let prefix = normalize_pattern(pattern);
        if !self.routes.iter().any(|r| r.prefix == prefix) {
            return None;
        }
        let routes = self
            .routes
            .iter()
            .filter(|r| r.prefix != prefix)
            .cloned()
            .collect();
        Some(Self::from_routes(routes))
    }

    pub fn get(&self, pattern: &str) -> Option<Arc<CompiledRoute>> {
        let prefix = normalize_pattern(pattern);
        self.routes.iter().find(|r| r.prefix == prefix).cloned()
    }

    pub fn routes(&self) -> &[Arc<CompiledRoute>] {
        &self.routes
    }

    pub fn configs(&self) -> Vec<RouteConfig> {
        self.routes.iter().map(|r| r.config.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn evict_stale(&self) {
        for route in &self.routes {
            for filter in &route.filters {
                filter.evict_stale();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(pattern: &str, target: &str) -> RouteConfig {
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

    #[test]
    fn test_normalize_pattern() {
        assert_eq!(normalize_pattern("/api/orders/*"), "/api/orders");
        assert_eq!(normalize_pattern("/api/orders"), "/api/orders");
        assert_eq!(normalize_pattern("/api/orders/"), "/api/orders");
        assert_eq!(normalize_pattern("/*"), "/");
        assert_eq!(normalize_pattern("/"), "/");
    }

    #[test]
    fn test_prefix_matching_respects_segments() {
        for pattern in ["/api/orders/*", "/api/orders"] {
            let r = CompiledRoute::new(route(pattern, "orders"));
            assert!(r.matches("/api/orders"));
            assert!(r.matches("/api/orders/"));
            assert!(r.matches("/api/orders/42/items"));
            assert!(!r.matches("/api/ordersX"));
            assert!(!r.matches("/api/order"));
        }
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = RouteTable::new(&[
            route("/*", "default"),
            route("/api/*", "api"),
            route("/api/orders/*", "orders"),
        ]);
        let target = |p: &str| table.match_route(p).map(|r| r.config.target_service.clone());
        assert_eq!(target("/api/orders/1").as_deref(), Some("orders"));
        assert_eq!(target("/api/users").as_deref(), Some("api"));
        assert_eq!(target("/health").as_deref(), Some("default"));
    }

    #[test]
    fn test_no_match() {
        let table = RouteTable::new(&[route("/api/orders/*", "orders")]);
        assert!(table.match_route("/api/users").is_none());
        assert!(table.match_route("/").is_none());
    }

    #[test]
    fn test_methods() {
        let mut cfg = route("/api/orders", "orders");
        cfg.methods = vec!["get".into(), "POST".into()];
        let r = CompiledRoute::new(cfg);
        assert!(r.allows_method(&Method::GET));
        assert!(r.allows_method(&Method::POST));
        assert!(!r.allows_method(&Method::DELETE));
        assert!(CompiledRoute::new(route("/x", "x")).allows_method(&Method::PATCH));
    }

    #[test]
    fn test_upstream_path_rewrite() {
        let r = CompiledRoute::new(route("/api/orders/*", "orders"));
        assert_eq!(r.upstream_path("/api/orders/42", None, "/orders"), "/orders/42");
        assert_eq!(r.upstream_path("/api/orders", None, "/orders"), "/orders");
        assert_eq!(r.upstream_path("/api/orders", None, ""), "/");
        assert_eq!(
            r.upstream_path("/api/orders/42", Some("expand=items&x=1"), "/v2/"),
            "/v2/42?expand=items&x=1"
        );
        let root = CompiledRoute::new(route("/*", "any"));
        assert_eq!(root.upstream_path("/a/b", Some(""), "/svc"), "/svc/a/b");
    }

    #[test]
    fn test_table_mutations_keep_unchanged_routes() {
        let table = RouteTable::new(&[route("/api/a/*", "a"), route("/api/b/*", "b")]);
        let a_before = table.get("/api/a").unwrap();

        let updated = table.with_route(route("/api/b", "b2"));
        assert_eq!(updated.len(), 2);
        assert!(Arc::ptr_eq(&a_before, &updated.get("/api/a/*").unwrap()));
        assert_eq!(updated.get("/api/b").unwrap().config.target_service, "b2");

        let removed = updated.without_route("/api/a/*").unwrap();
        assert_eq!(removed.len(), 1);
        assert!(removed.without_route("/api/a").is_none());
    }
}
