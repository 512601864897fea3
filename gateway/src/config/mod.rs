pub mod types;


pub use types::*;

use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;

const STRATEGIES: &[&str] = &["round_robin", "least_connections", "weighted"];

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults are
    /// used and services/routes can be registered at runtime via the admin API.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!(
            services = config.services.len(),
            routes = config.routes.len(),
            "loaded gateway configuration"
        );
        Ok(config)
    }

    /// Environment overrides for operational knobs. Services and routes come
    /// from the file or the admin API, never from the environment.
    fn apply_env_overrides(&mut self) {
        if let Some(n) = env_parse::<u32>("BULWARK_CB_FAILURE_THRESHOLD") {
            self.circuit_breaker.failure_threshold = n;
        }
        if let Some(n) = env_parse::<u64>("BULWARK_CB_RESET_TIMEOUT_MS") {
            self.circuit_breaker.reset_timeout_ms = n;
        }
        if let Ok(v) = std::env::var("BULWARK_LB_STRATEGY") {
            self.load_balancer.strategy = v;
        }
        if let Some(n) = env_parse::<u64>("BULWARK_HEALTH_INTERVAL_SECS") {
            self.health_check.interval_secs = n;
        }
        if let Some(n) = env_parse::<u64>("BULWARK_HEALTH_TIMEOUT_MS") {
            self.health_check.timeout_ms = n;
        }
        if let Some(n) = env_parse::<u64>("BULWARK_MONITOR_INTERVAL_SECS") {
            self.monitor.interval_secs = n;
        }
        if let Ok(v) = std::env::var("BULWARK_AUTH_VERIFY_URL") {
            self.auth.verify_url = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for svc in &self.services {
            validate_service(svc)?;
            if !names.insert(svc.name.as_str()) {
                anyhow::bail!("service '{}' is defined more than once", svc.name);
            }
        }

        for route in &self.routes {
            validate_route(route)?;
            if !names.contains(route.target_service.as_str()) {
                anyhow::bail!(
                    "route '{}' references unknown service '{}'",
                    route.path_pattern,
                    route.target_service
                );
            }
        }

        validate_breaker(&self.circuit_breaker)?;
        if !STRATEGIES.contains(&self.load_balancer.strategy.as_str()) {
            anyhow::bail!(
                "unknown load balancer strategy '{}'",
                self.load_balancer.strategy
            );
        }
        let alpha = self.monitor.ema_alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            anyhow::bail!("monitor.ema_alpha must be in (0, 1], got {}", alpha);
        }
        Ok(())
    }
}

/// Checks shared by config loading and runtime registration.
pub fn validate_service(svc: &ServiceConfig) -> Result<()> {
    if svc.name.is_empty() {
        anyhow::bail!("service has an empty name");
    }
    if !(svc.url.starts_with("http://") || svc.url.starts_with("https://")) {
        anyhow::bail!("service '{}' url must be http(s), got '{}'", svc.name, svc.url);
    }
    if svc.retries == 0 {
        anyhow::bail!("service '{}' retries must be >= 1", svc.name);
    }
    if let Some(ref cb) = svc.circuit_breaker {
        validate_breaker(cb)?;
    }
    if let Some(ref s) = svc.strategy {
        if !STRATEGIES.contains(&s.as_str()) {
            anyhow::bail!("service '{}' has unknown strategy '{}'", svc.name, s);
        }
    }
    Ok(())
}

pub fn validate_route(route: &RouteConfig) -> Result<()> {
    if !route.path_pattern.starts_with('/') {
        anyhow::bail!(
            "route pattern '{}' must start with '/'",
            route.path_pattern
        );
    }
    if route.target_service.is_empty() {
        anyhow::bail!("route '{}' has no target service", route.path_pattern);
    }
    for m in &route.methods {
        if http::Method::from_bytes(m.to_ascii_uppercase().as_bytes()).is_err() {
            anyhow::bail!("route '{}': invalid method '{}'", route.path_pattern, m);
        }
    }
    if let Some(ref rl) = route.rate_limit {
        if rl.max == 0 || rl.window_ms == 0 {
            anyhow::bail!(
                "route '{}': rate_limit requires max > 0 and windowMs > 0",
                route.path_pattern
            );
        }
    }
    Ok(())
}

fn validate_breaker(cb: &CircuitBreakerConfig) -> Result<()> {
    if cb.failure_threshold == 0 {
        anyhow::bail!("circuit_breaker.failure_threshold must be >= 1");
    }
    Ok(())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
