use crate::config::{self, GatewayConfig, RouteConfig, ServiceConfig};
use crate::discovery::{HealthChecker, ServiceDescriptor, ServiceRegistry};
use crate::error::GatewayError;
use crate::metrics::Metrics;
use crate::monitor::Monitor;
use crate::proxy::auth::{Authenticator, DenyAllAuthenticator, HttpAuthenticator};
use crate::routing::RouteTable;
use crate::upstream::{CircuitBreakerRegistry, LoadBalancer, ServiceClient, Strategy};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Shared gateway state, cheaply cloneable.
///
/// Owns every component; nothing is process-global, so several gateways can
/// live side by side (tests do this). All registry and route mutations are
/// serialized through `config_mu`. Reads via `ArcSwap::load` remain
/// lock-free.
#[derive(Clone)]
pub struct Gateway {
    config: Arc<GatewayConfig>,
    registry: Arc<ServiceRegistry>,
    health: HealthChecker,
    breakers: Arc<CircuitBreakerRegistry>,
    balancer: Arc<LoadBalancer>,
    client: ServiceClient,
    monitor: Arc<Monitor>,
    routes: Arc<ArcSwap<RouteTable>>,
    authenticator: Arc<dyn Authenticator>,
    metrics: Option<Metrics>,
    config_mu: Arc<Mutex<()>>,
}

impl Gateway {
    /// Build every component from `config` and register the configured
    /// services and routes. Health starts `unknown` for every service.
    pub fn new(config: GatewayConfig, authenticator: Arc<dyn Authenticator>) -> Result<Self> {
        config.validate()?;
        let default_strategy: Strategy = config.load_balancer.strategy.parse()?;

        let registry = Arc::new(ServiceRegistry::new());
        let health = HealthChecker::new(registry.clone(), &config.health_check);
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let balancer = Arc::new(LoadBalancer::new(registry.clone(), default_strategy));
        let client = ServiceClient::new(
            registry.clone(),
            breakers.clone(),
            balancer.clone(),
            &config.retry,
        );
        let monitor = Arc::new(Monitor::new(
            registry.clone(),
            breakers.clone(),
            config.monitor.clone(),
        ));
        let routes = RouteTable::new(&config.routes);

        let gateway = Self {
            registry,
            health,
            breakers,
            balancer,
            client,
            monitor,
            routes: Arc::new(ArcSwap::from_pointee(routes)),
            authenticator,
            metrics: None,
            config_mu: Arc::new(Mutex::new(())),
            config: Arc::new(config),
        };
        for svc in &gateway.config.services {
            gateway.apply_service(svc);
        }
        gateway.update_config_metrics();
        Ok(gateway)
    }

    /// Like `new`, with the authenticator chosen from `config.auth`: an
    /// `HttpAuthenticator` when a verify URL is set, deny-all otherwise.
    pub fn from_config(config: GatewayConfig) -> Result<Self> {
        let authenticator: Arc<dyn Authenticator> = match &config.auth.verify_url {
            Some(url) => {
                info!("auth: using remote verifier, url={}", url);
                Arc::new(HttpAuthenticator::new(
                    url.clone(),
                    Duration::from_millis(config.auth.timeout_ms),
                ))
            }
            None => {
                warn!("auth: no verify_url configured, protected routes will reject all tokens");
                Arc::new(DenyAllAuthenticator)
            }
        };
        Self::new(config, authenticator)
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &HealthChecker {
        &self.health
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn client(&self) -> &ServiceClient {
        &self.client
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.authenticator
    }

    pub fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_ref()
    }

    pub fn routes(&self) -> arc_swap::Guard<Arc<RouteTable>> {
        self.routes.load()
    }

    /// Register (or replace) a service at runtime.
    pub async fn register_service(
        &self,
        cfg: ServiceConfig,
    ) -> Result<Arc<ServiceDescriptor>, GatewayError> {
        config::validate_service(&cfg).map_err(|e| GatewayError::BadRequest(e.to_string()))?;
        let _guard = self.config_mu.lock().await;
        let descriptor = self.apply_service(&cfg);
        self.update_config_metrics();
        Ok(descriptor)
    }

    /// Remove a service and its balancer, breaker and monitor state. Routes
    /// pointing at it stay and answer 503 until it is registered again.
    pub async fn deregister_service(&self, name: &str) -> bool {
        let _guard = self.config_mu.lock().await;
        let removed = self.registry.deregister(name);
        if removed {
            self.balancer.remove_service(name);
            self.breakers.remove(name);
            self.monitor.reset(name);
            self.update_config_metrics();
        }
        removed
    }

    /// Add a route, replacing one with the same pattern. The target must be
    /// registered.
    pub async fn add_route(&self, route: RouteConfig) -> Result<(), GatewayError> {
        config::validate_route(&route).map_err(|e| GatewayError::BadRequest(e.to_string()))?;
        let _guard = self.config_mu.lock().await;
        if !self.registry.contains(&route.target_service) {
            return Err(GatewayError::UnknownService {
                service: route.target_service.clone(),
            });
        }
        info!(
            "config: route added, pattern={}, service={}",
            route.path_pattern, route.target_service
        );
        let next = self.routes.load().with_route(route);
        self.routes.store(Arc::new(next));
        self.update_config_metrics();
        Ok(())
    }

    /// Replace an existing route; `RouteNotFound` if the pattern is unknown.
    pub async fn update_route(&self, route: RouteConfig) -> Result<(), GatewayError> {
        config::validate_route(&route).map_err(|e| GatewayError::BadRequest(e.to_string()))?;
        let _guard = self.config_mu.lock().await;
        let table = self.routes.load();
        if table.get(&route.path_pattern).is_none() {
            return Err(GatewayError::RouteNotFound {
                path: route.path_pattern.clone(),
            });
        }
        info!(
            "config: route updated, pattern={}, service={}",
            route.path_pattern, route.target_service
        );
        let next = table.with_route(route);
        self.routes.store(Arc::new(next));
        Ok(())
    }

    pub async fn remove_route(&self, pattern: &str) -> bool {
        let _guard = self.config_mu.lock().await;
        match self.routes.load().without_route(pattern) {
            Some(next) => {
                self.routes.store(Arc::new(next));
                self.update_config_metrics();
                info!("config: route removed, pattern={}", pattern);
                true
            }
            None => {
                info!("config: route remove ignored (not found), pattern={}", pattern);
                false
            }
        }
    }

    // -- private helpers --

    /// Caller holds `config_mu` (or is the constructor). A re-registration
    /// replaces the whole service config, so overrides it omits are dropped.
    fn apply_service(&self, cfg: &ServiceConfig) -> Arc<ServiceDescriptor> {
        let descriptor = self.registry.register(ServiceDescriptor::from(cfg));
        self.balancer.set_instances(&descriptor, &cfg.instances);
        match &cfg.circuit_breaker {
            Some(cb) => self.breakers.configure(&cfg.name, cb.clone()),
            None => self.breakers.clear_override(&cfg.name),
        }
        self.balancer.clear_strategy(&cfg.name);
        if let Some(s) = &cfg.strategy {
            match s.parse::<Strategy>() {
                Ok(strategy) => self.balancer.set_strategy(&cfg.name, strategy),
                Err(e) => warn!("config: ignoring strategy, service={}, error={}", cfg.name, e),
            }
        }
        descriptor
    }

    fn update_config_metrics(&self) {
        metrics::gauge!("gateway_config_routes_total").set(self.routes.load().len() as f64);
        metrics::gauge!("gateway_config_services_total").set(self.registry.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::auth::StaticAuthenticator;

    fn service(name: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.into(),
            url: "http://127.0.0.1:9".into(),
            health_path: "/health".into(),
            timeout: 1_000,
            retries: 1,
            prefix: String::new(),
            instances: vec![],
            circuit_breaker: None,
            strategy: Some("least_connections".into()),
        }
    }

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

    fn gateway(config: GatewayConfig) -> Gateway {
        Gateway::new(config, Arc::new(StaticAuthenticator::new())).unwrap()
    }

    #[test]
    fn test_new_registers_configured_services() {
        let g = gateway(GatewayConfig {
            services: vec![service("orders")],
            routes: vec![route("/api/orders/*", "orders")],
            ..Default::default()
        });
        assert!(g.registry().contains("orders"));
        assert_eq!(g.balancer().instances("orders").len(), 1);
        assert_eq!(g.balancer().strategy_for("orders"), Strategy::LeastConnections);
        assert_eq!(g.routes().len(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = GatewayConfig {
            routes: vec![route("/api/x/*", "missing")],
            ..Default::default()
        };
        assert!(Gateway::new(cfg, Arc::new(StaticAuthenticator::new())).is_err());
    }

    #[tokio::test]
    async fn test_runtime_registration_and_routes() {
        let g = gateway(GatewayConfig::default());
        let err = g.add_route(route("/api/a/*", "a")).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownService { .. }));

        g.register_service(service("a")).await.unwrap();
        g.add_route(route("/api/a/*", "a")).await.unwrap();
        assert!(g.routes().match_route("/api/a/1").is_some());

        let mut updated = route("/api/a", "a");
        updated.methods = vec!["GET".into()];
        g.update_route(updated).await.unwrap();
        assert_eq!(g.routes().get("/api/a").unwrap().methods.len(), 1);

        assert!(matches!(
            g.update_route(route("/api/zzz", "a")).await,
            Err(GatewayError::RouteNotFound { .. })
        ));

        assert!(g.remove_route("/api/a/*").await);
        assert!(!g.remove_route("/api/a/*").await);
    }

    #[tokio::test]
    async fn test_deregister_clears_component_state() {
        let g = gateway(GatewayConfig {
            services: vec![service("a")],
            ..Default::default()
        });
        g.breakers().record_failure("a");
        g.monitor().record_request("a", 5.0);

        assert!(g.deregister_service("a").await);
        assert!(!g.deregister_service("a").await);
        assert!(g.balancer().instances("a").is_empty());
        assert!(g.monitor().service_metrics("a").is_none());
        assert_eq!(g.breakers().snapshot("a").consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_reregistration_drops_omitted_overrides() {
        let g = gateway(GatewayConfig::default());
        let mut svc = service("a");
        svc.circuit_breaker = Some(config::CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout_ms: 500,
        });
        g.register_service(svc).await.unwrap();
        assert_eq!(g.balancer().strategy_for("a"), Strategy::LeastConnections);
        assert_eq!(g.breakers().snapshot("a").failure_threshold, 1);

        let mut plain = service("a");
        plain.strategy = None;
        g.register_service(plain).await.unwrap();
        assert_eq!(g.balancer().strategy_for("a"), Strategy::RoundRobin);
        let snap = g.breakers().snapshot("a");
        assert_eq!(snap.failure_threshold, 5);
        assert_eq!(snap.reset_timeout_ms, 60_000);
    }

    #[tokio::test]
    async fn test_route_with_bad_method_rejected() {
        let g = gateway(GatewayConfig {
            services: vec![service("a")],
            ..Default::default()
        });
        let mut r = route("/api/a/*", "a");
        r.methods = vec!["G(ET".into()];
        assert!(matches!(
            g.add_route(r).await,
            Err(GatewayError::BadRequest(_))
        ));
        assert!(g.routes().is_empty());
    }

    #[tokio::test]
    async fn test_register_rejects_bad_url() {
        let g = gateway(GatewayConfig::default());
        let mut svc = service("a");
        svc.url = "not-a-url".into();
        assert!(matches!(
            g.register_service(svc).await,
            Err(GatewayError::BadRequest(_))
        ));
    }
}
