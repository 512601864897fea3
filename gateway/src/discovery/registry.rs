use crate::config::ServiceConfig;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::info;

/// Immutable description of a backend service. Re-registration replaces the
/// whole `Arc`, never individual fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub base_url: String,
    pub health_path: String,
    pub path_prefix: String,
    #[serde(serialize_with = "serialize_millis")]
    pub timeout: Duration,
    pub max_retries: u32,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            health_path: "/health".to_string(),
            path_prefix: String::new(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }

    /// `{base_url}{path}` without doubling the separator.
    pub fn url_for(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    pub fn health_url(&self) -> String {
        self.url_for(&self.health_path)
    }
}

impl From<&ServiceConfig> for ServiceDescriptor {
    fn from(cfg: &ServiceConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            base_url: cfg.url.clone(),
            health_path: cfg.health_path.clone(),
            path_prefix: cfg.prefix.clone(),
            timeout: Duration::from_millis(cfg.timeout),
            max_retries: cfg.retries.max(1),
        }
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.is_empty() {
        return base.to_string();
    }
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }

    /// Numeric form for the `gateway_service_health_status` gauge.
    pub fn gauge_value(&self) -> f64 {
        match self {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Degraded => 0.5,
            HealthStatus::Unhealthy => 0.0,
            HealthStatus::Unknown => -1.0,
        }
    }
}

/// Latest health observation for a service; replaced on every check.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealthRecord {
    pub service_name: String,
    pub status: HealthStatus,
    #[serde(serialize_with = "serialize_opt_time")]
    pub last_checked_at: Option<SystemTime>,
    pub last_response_time_ms: Option<u64>,
    pub last_error: Option<String>,
}

impl ServiceHealthRecord {
    pub fn unknown(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            status: HealthStatus::Unknown,
            last_checked_at: None,
            last_response_time_ms: None,
            last_error: None,
        }
    }

    pub fn observed(
        service_name: &str,
        status: HealthStatus,
        response_time_ms: Option<u64>,
        error: Option<String>,
    ) -> Self {
        Self {
            service_name: service_name.to_string(),
            status,
            last_checked_at: Some(SystemTime::now()),
            last_response_time_ms: response_time_ms,
            last_error: error,
        }
    }
}

fn serialize_opt_time<S: serde::Serializer>(
    t: &Option<SystemTime>,
    s: S,
) -> Result<S::Ok, S::Error> {
    match t {
        Some(t) => s.serialize_str(&humantime::format_rfc3339_millis(*t).to_string()),
        None => s.serialize_none(),
    }
}

/// Catalog of backend services and their live health.
///
/// Both maps are keyed by service name; there is no cross-key locking.
pub struct ServiceRegistry {
    services: DashMap<String, Arc<ServiceDescriptor>>,
    health: DashMap<String, ServiceHealthRecord>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self {
            services: DashMap::new(),
            health: DashMap::new(),
        }
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or wholesale replace) a descriptor. The health record starts
    /// over as `unknown` because the endpoint may have changed.
    pub fn register(&self, descriptor: ServiceDescriptor) -> Arc<ServiceDescriptor> {
        let name = descriptor.name.clone();
        let descriptor = Arc::new(descriptor);
        let replaced = self
            .services
            .insert(name.clone(), descriptor.clone())
            .is_some();
        self.health
            .insert(name.clone(), ServiceHealthRecord::unknown(&name));
        metrics::gauge!("gateway_service_health_status", "service" => name.clone())
            .set(HealthStatus::Unknown.gauge_value());
        info!(
            "registry: service {}, name={}, url={}",
            if replaced { "re-registered" } else { "registered" },
            name,
            descriptor.base_url
        );
        descriptor
    }

    /// Idempotent. Returns whether a descriptor was removed.
    pub fn deregister(&self, name: &str) -> bool {
        let removed = self.services.remove(name).is_some();
        self.health.remove(name);
        if removed {
            info!("registry: service deregistered, name={}", name);
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServiceDescriptor>> {
        self.services.get(name).map(|e| e.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Descriptors sorted by name.
    pub fn list(&self) -> Vec<Arc<ServiceDescriptor>> {
        let mut all: Vec<_> = self.services.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn health(&self, name: &str) -> Option<ServiceHealthRecord> {
        self.health.get(name).map(|e| e.value().clone())
    }

    /// `Unknown` for services that were never checked or are not registered.
    pub fn status(&self, name: &str) -> HealthStatus {
        self.health
            .get(name)
            .map(|e| e.value().status)
            .unwrap_or(HealthStatus::Unknown)
    }

    pub fn is_healthy(&self, name: &str) -> bool {
        self.status(name) == HealthStatus::Healthy
    }

    /// Health records sorted by service name.
    pub fn all_health(&self) -> Vec<ServiceHealthRecord> {
        let mut all: Vec<_> = self.health.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        all
    }

    /// Replace the record for a registered service. Records for unknown
    /// services are dropped so a late probe cannot resurrect a deregistered one.
    pub fn record_health(&self, record: ServiceHealthRecord) {
        if !self.services.contains_key(&record.service_name) {
            return;
        }
        metrics::gauge!(
            "gateway_service_health_status",
            "service" => record.service_name.clone(),
        )
        .set(record.status.gauge_value());
        self.health.insert(record.service_name.clone(), record);
    }

    /// Fraction of registered services that are healthy. An empty registry
    /// counts as fully available.
    pub fn availability(&self) -> f64 {
        let total = self.services.len();
        if total == 0 {
            return 1.0;
        }
        let healthy = self
            .services
            .iter()
            .filter(|e| self.is_healthy(e.key()))
            .count();
        healthy as f64 / total as f64
    }
}
