pub mod alerts;

use crate::config::MonitorConfig;
use crate::discovery::{HealthStatus, ServiceRegistry};
use crate::upstream::{CircuitBreakerRegistry, CircuitPhase};
use alerts::Alert;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Alerts kept for the admin API.
const RECENT_ALERTS: usize = 100;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetrics {
    pub service_name: String,
    pub total_requests: u64,
    pub total_errors: u64,
    pub ema_latency_ms: f64,
    #[serde(serialize_with = "serialize_opt_time")]
    pub last_request_at: Option<SystemTime>,
}

impl ServiceMetrics {
    fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            total_requests: 0,
            total_errors: 0,
            ema_latency_ms: 0.0,
            last_request_at: None,
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_errors as f64 / self.total_requests as f64
        }
    }

    /// The first sample seeds the average.
    fn observe_latency(&mut self, sample_ms: f64, alpha: f64, first: bool) {
        self.ema_latency_ms = if first {
            sample_ms
        } else {
            alpha * sample_ms + (1.0 - alpha) * self.ema_latency_ms
        };
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

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub total_requests: u64,
    pub total_errors: u64,
    pub error_rate: f64,
    /// Request-weighted mean of the per-service averages.
    pub avg_response_time_ms: f64,
    pub open_circuits: usize,
    pub availability: f64,
    pub registered_services: usize,
    pub healthy_services: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl OverallHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallHealth::Healthy => "healthy",
            OverallHealth::Degraded => "degraded",
            OverallHealth::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReport {
    pub name: String,
    pub health: HealthStatus,
    pub circuit: CircuitPhase,
    pub metrics: Option<ServiceMetrics>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: OverallHealth,
    pub system: SystemMetrics,
    pub services: Vec<ServiceReport>,
    pub alerts: Vec<Alert>,
}

/// Aggregates per-service request metrics and turns them, together with
/// registry health and breaker state, into alerts and a health verdict.
///
/// Purely observational: nothing here feeds back into routing.
pub struct Monitor {
    registry: Arc<ServiceRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: DashMap<String, ServiceMetrics>,
    cfg: MonitorConfig,
    alerts_tx: broadcast::Sender<Alert>,
    recent: Mutex<VecDeque<Alert>>,
}

impl Monitor {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        cfg: MonitorConfig,
    ) -> Self {
        let (alerts_tx, _) = broadcast::channel(RECENT_ALERTS);
        Self {
            registry,
            breakers,
            metrics: DashMap::new(),
            cfg,
            alerts_tx,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_ALERTS)),
        }
    }

    pub fn record_request(&self, service: &str, latency_ms: f64) {
        let alpha = self.cfg.ema_alpha;
        let mut entry = self
            .metrics
            .entry(service.to_string())
            .or_insert_with(|| ServiceMetrics::new(service));
        let first = entry.total_requests == 0;
        entry.total_requests += 1;
        entry.observe_latency(latency_ms, alpha, first);
        entry.last_request_at = Some(SystemTime::now());
    }

    /// Counts an error against requests already recorded. An error with no
    /// matching request raises the request count so errors never exceed it.
    pub fn record_error(&self, service: &str, latency_ms: Option<f64>) {
        let alpha = self.cfg.ema_alpha;
        let mut entry = self
            .metrics
            .entry(service.to_string())
            .or_insert_with(|| ServiceMetrics::new(service));
        let first = entry.total_requests == 0;
        entry.total_errors += 1;
        if entry.total_errors > entry.total_requests {
            entry.total_requests = entry.total_errors;
            entry.last_request_at = Some(SystemTime::now());
        }
        if let Some(ms) = latency_ms {
            entry.observe_latency(ms, alpha, first);
        }
    }

    pub fn service_metrics(&self, service: &str) -> Option<ServiceMetrics> {
        self.metrics.get(service).map(|e| e.value().clone())
    }

    /// Sorted by service name.
    pub fn all_metrics(&self) -> Vec<ServiceMetrics> {
        let mut all: Vec<_> = self.metrics.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        all
    }

    pub fn reset(&self, service: &str) {
        self.metrics.remove(service);
    }

    pub fn system_metrics(&self) -> SystemMetrics {
        let all = self.all_metrics();
        let total_requests: u64 = all.iter().map(|m| m.total_requests).sum();
        let total_errors: u64 = all.iter().map(|m| m.total_errors).sum();
        let weighted_latency: f64 = all
            .iter()
            .map(|m| m.ema_latency_ms * m.total_requests as f64)
            .sum();
        let registered = self.registry.len();
        let healthy = self
            .registry
            .all_health()
            .iter()
            .filter(|r| r.status == HealthStatus::Healthy)
            .count();

        SystemMetrics {
            total_requests,
            total_errors,
            error_rate: if total_requests == 0 {
                0.0
            } else {
                total_errors as f64 / total_requests as f64
            },
            avg_response_time_ms: if total_requests == 0 {
                0.0
            } else {
                weighted_latency / total_requests as f64
            },
            open_circuits: self.breakers.open_count(),
            availability: self.registry.availability(),
            registered_services: registered,
            healthy_services: healthy,
        }
    }

    /// `unhealthy` below 50% availability, `degraded` when any threshold is
    /// breached, `healthy` otherwise.
    pub fn health_report(&self) -> HealthReport {
        let system = self.system_metrics();
        let all = self.all_metrics();
        let alerts = alerts::evaluate(&system, &all, &self.cfg.thresholds);

        let status = if system.availability < 0.5 {
            OverallHealth::Unhealthy
        } else if !alerts.is_empty() {
            OverallHealth::Degraded
        } else {
            OverallHealth::Healthy
        };

        let services = self
            .registry
            .list()
            .iter()
            .map(|d| ServiceReport {
                name: d.name.clone(),
                health: self.registry.status(&d.name),
                circuit: self.breakers.state(&d.name),
                metrics: self.service_metrics(&d.name),
            })
            .collect();

        HealthReport {
            status,
            system,
            services,
            alerts,
        }
    }

    /// One monitoring round over the health records the registry already
    /// holds: evaluate, emit alerts. Probing is the health loop's job.
    pub fn tick(&self) -> HealthReport {
        let report = self.health_report();
        for alert in &report.alerts {
            self.emit(alert.clone());
        }

        metrics::gauge!("gateway_system_error_rate").set(report.system.error_rate);
        metrics::gauge!("gateway_system_availability").set(report.system.availability);
        metrics::gauge!("gateway_open_circuits").set(report.system.open_circuits as f64);
        debug!(
            "monitor: tick, status={}, requests={}, errors={}, alerts={}",
            report.status.as_str(),
            report.system.total_requests,
            report.system.total_errors,
            report.alerts.len()
        );
        report
    }

    fn emit(&self, alert: Alert) {
        warn!(
            "monitor: alert, kind={}, service={}, value={:.3}, threshold={:.3}, message={}",
            alert.kind.as_str(),
            alert.service.as_deref().unwrap_or("-"),
            alert.value,
            alert.threshold,
            alert.message
        );
        metrics::counter!("gateway_alerts_total", "kind" => alert.kind.as_str()).increment(1);
        {
            let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
            if recent.len() == RECENT_ALERTS {
                recent.pop_front();
            }
            recent.push_back(alert.clone());
        }
        // No subscribers is fine.
        let _ = self.alerts_tx.send(alert);
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts_tx.subscribe()
    }

    /// Oldest first.
    pub fn recent_alerts(&self) -> Vec<Alert> {
        self.recent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::discovery::{ServiceDescriptor, ServiceHealthRecord};

    fn monitor() -> (Monitor, Arc<ServiceRegistry>, Arc<CircuitBreakerRegistry>) {
        let registry = Arc::new(ServiceRegistry::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        let m = Monitor::new(registry.clone(), breakers.clone(), MonitorConfig::default());
        (m, registry, breakers)
    }

    fn mark(registry: &ServiceRegistry, name: &str, status: HealthStatus) {
        registry.record_health(ServiceHealthRecord::observed(name, status, Some(1), None));
    }

    #[test]
    fn test_ema_seeded_by_first_sample() {
        let (m, _, _) = monitor();
        m.record_request("a", 100.0);
        assert_eq!(m.service_metrics("a").unwrap().ema_latency_ms, 100.0);
        m.record_request("a", 200.0);
        let ema = m.service_metrics("a").unwrap().ema_latency_ms;
        assert!((ema - 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_errors_never_exceed_requests() {
        let (m, _, _) = monitor();
        m.record_error("a", None);
        m.record_error("a", Some(50.0));
        let s = m.service_metrics("a").unwrap();
        assert_eq!(s.total_errors, 2);
        assert_eq!(s.total_requests, 2);

        m.record_request("b", 10.0);
        m.record_error("b", None);
        let s = m.service_metrics("b").unwrap();
        assert_eq!((s.total_requests, s.total_errors), (1, 1));
    }

    #[test]
    fn test_twelve_percent_errors_is_degraded() {
        let (m, registry, _) = monitor();
        registry.register(ServiceDescriptor::new("orders", "http://127.0.0.1:1"));
        mark(&registry, "orders", HealthStatus::Healthy);
        for i in 0..100 {
            m.record_request("orders", 20.0);
            if i < 12 {
                m.record_error("orders", None);
            }
        }
        let report = m.health_report();
        assert_eq!(report.system.total_requests, 100);
        assert_eq!(report.system.total_errors, 12);
        assert_eq!(report.status, OverallHealth::Degraded);
    }

    #[test]
    fn test_healthy_when_quiet() {
        let (m, registry, _) = monitor();
        registry.register(ServiceDescriptor::new("orders", "http://127.0.0.1:1"));
        mark(&registry, "orders", HealthStatus::Healthy);
        m.record_request("orders", 20.0);
        let report = m.health_report();
        assert_eq!(report.status, OverallHealth::Healthy);
        assert_eq!(report.services.len(), 1);
        assert_eq!(report.services[0].circuit, CircuitPhase::Closed);
    }

    #[test]
    fn test_unhealthy_below_half_availability() {
        let (m, registry, _) = monitor();
        for name in ["a", "b", "c"] {
            registry.register(ServiceDescriptor::new(name, "http://127.0.0.1:1"));
        }
        mark(&registry, "a", HealthStatus::Healthy);
        assert_eq!(m.health_report().status, OverallHealth::Unhealthy);
    }

    #[test]
    fn test_open_circuit_degrades() {
        let (m, registry, breakers) = monitor();
        registry.register(ServiceDescriptor::new("a", "http://127.0.0.1:1"));
        mark(&registry, "a", HealthStatus::Healthy);
        breakers.open_circuit("a");
        assert_eq!(m.health_report().status, OverallHealth::Degraded);
    }

    #[tokio::test]
    async fn test_tick_emits_alerts() {
        let (m, _, breakers) = monitor();
        let mut rx = m.subscribe_alerts();
        breakers.open_circuit("a");

        let report = m.tick();
        assert_eq!(report.alerts.len(), 1);
        let alert = rx.recv().await.unwrap();
        assert_eq!(alert.kind, alerts::AlertKind::OpenCircuits);
        assert_eq!(m.recent_alerts().len(), 1);
    }

    #[test]
    fn test_tick_reads_existing_health_records() {
        let (m, registry, _) = monitor();
        // Nothing listens here; a probe would mark it unhealthy.
        registry.register(ServiceDescriptor::new("orders", "http://127.0.0.1:1"));
        mark(&registry, "orders", HealthStatus::Healthy);
        let before = registry.health("orders").and_then(|r| r.last_checked_at);

        let report = m.tick();
        assert_eq!(report.status, OverallHealth::Healthy);
        assert_eq!(report.services[0].health, HealthStatus::Healthy);
        assert_eq!(registry.health("orders").and_then(|r| r.last_checked_at), before);
    }

    #[test]
    fn test_reset_clears_service() {
        let (m, _, _) = monitor();
        m.record_request("a", 1.0);
        m.reset("a");
        assert!(m.service_metrics("a").is_none());
    }
}
