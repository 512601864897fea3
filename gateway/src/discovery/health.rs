use crate::config::HealthCheckConfig;
use crate::discovery::registry::{
    HealthStatus, ServiceDescriptor, ServiceHealthRecord, ServiceRegistry,
};
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Active health prober for registered services.
///
/// Probe failures never surface as errors: they downgrade the service's
/// record and are reported through logs and the health gauge.
#[derive(Clone)]
pub struct HealthChecker {
    registry: Arc<ServiceRegistry>,
    client: reqwest::Client,
    timeout: Duration,
    poll_interval: Duration,
    concurrency: usize,
    round_timeout: Duration,
}

impl HealthChecker {
    pub fn new(registry: Arc<ServiceRegistry>, cfg: &HealthCheckConfig) -> Self {
        Self {
            registry,
            client: build_health_check_client(),
            timeout: Duration::from_millis(cfg.timeout_ms),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms.max(1)),
            concurrency: cfg.concurrency.max(1),
            round_timeout: Duration::from_millis(cfg.round_timeout_ms.max(1)),
        }
    }

    /// Probe one service and overwrite its record. `None` if not registered.
    pub async fn check_health(&self, name: &str) -> Option<ServiceHealthRecord> {
        let descriptor = self.registry.get(name)?;
        let record = self.probe(&descriptor).await;
        self.registry.record_health(record.clone());
        Some(record)
    }

    /// One round over every registered service with bounded concurrency.
    /// The caller is responsible for looping / scheduling.
    pub async fn check_all(&self) -> Vec<ServiceHealthRecord> {
        let services = self.registry.list();
        stream::iter(services)
            .map(|descriptor| async move {
                let record = self.probe(&descriptor).await;
                self.registry.record_health(record.clone());
                record
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }

    /// `check_all` bounded by the configured round timeout, for the periodic
    /// loop. Returns `false` when the round was cut short; services not yet
    /// probed keep their previous record.
    pub async fn check_round(&self) -> bool {
        match tokio::time::timeout(self.round_timeout, self.check_all()).await {
            Ok(records) => {
                debug!("health: round complete, services={}", records.len());
                true
            }
            Err(_) => {
                warn!(
                    "health: round timed out, timeout_ms={}",
                    self.round_timeout.as_millis()
                );
                false
            }
        }
    }

    /// Poll at a fixed interval until the service reports healthy or
    /// `timeout` elapses.
    pub async fn wait_until_healthy(&self, name: &str, timeout: Duration) -> bool {
        let poll = async {
            loop {
                if let Some(record) = self.check_health(name).await {
                    if record.status == HealthStatus::Healthy {
                        return true;
                    }
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(healthy) => healthy,
            Err(_) => {
                warn!(
                    "health: service did not become healthy, name={}, timeout_ms={}",
                    name,
                    timeout.as_millis()
                );
                false
            }
        }
    }

    async fn probe(&self, descriptor: &ServiceDescriptor) -> ServiceHealthRecord {
        let url = descriptor.health_url();
        let start = Instant::now();
        let result = self.client.get(&url).timeout(self.timeout).send().await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let record = match result {
            Ok(resp) => {
                let code = resp.status().as_u16();
                let status = classify_status(code);
                let error = (status != HealthStatus::Healthy)
                    .then(|| format!("health endpoint returned {}", code));
                ServiceHealthRecord::observed(&descriptor.name, status, Some(elapsed_ms), error)
            }
            Err(e) => {
                let error = if e.is_timeout() {
                    format!("timeout after {}ms", self.timeout.as_millis())
                } else {
                    e.to_string()
                };
                ServiceHealthRecord::observed(
                    &descriptor.name,
                    HealthStatus::Unhealthy,
                    None,
                    Some(error),
                )
            }
        };

        metrics::counter!(
            "gateway_health_check_total",
            "service" => descriptor.name.clone(),
            "status" => record.status.as_str(),
        )
        .increment(1);

        if record.status == HealthStatus::Healthy {
            debug!(
                "health: check passed, name={}, latency_ms={}",
                descriptor.name, elapsed_ms
            );
        } else {
            warn!(
                "health: check failed, name={}, status={}, error={}",
                descriptor.name,
                record.status.as_str(),
                record.last_error.as_deref().unwrap_or("")
            );
        }
        record
    }
}

/// 2xx → healthy, 5xx → unhealthy, anything else (4xx, stray 1xx/3xx) → degraded.
pub fn classify_status(code: u16) -> HealthStatus {
    match code {
        200..=299 => HealthStatus::Healthy,
        500..=599 => HealthStatus::Unhealthy,
        _ => HealthStatus::Degraded,
    }
}

/// Shared HTTP client for health checks. Redirects are not followed so a 3xx
/// is observed as-is.
pub fn build_health_check_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
        .unwrap_or_default()
}
