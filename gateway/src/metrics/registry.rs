use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) used throughout the gateway are recorded. Without it they are
/// no-ops, which is what tests rely on. The `PrometheusHandle` is retained
/// solely for rendering the admin `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric descriptions.
    ///
    /// Call **once**, from the binary bootstrap.
    pub fn install() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )?
            .install_recorder()?;

        // request path
        describe_counter!(
            "gateway_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed"
        );
        describe_histogram!(
            "gateway_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from client perspective"
        );
        describe_histogram!(
            "gateway_proxy_upstream_duration_seconds",
            Unit::Seconds,
            "Time spent in the upstream call including retries"
        );
        describe_counter!(
            "gateway_rate_limit_rejected_total",
            Unit::Count,
            "Total requests rejected by rate limiter"
        );
        describe_counter!(
            "gateway_auth_rejected_total",
            Unit::Count,
            "Total requests rejected by token verification"
        );

        // upstream calls
        describe_histogram!(
            "gateway_upstream_request_duration_seconds",
            Unit::Seconds,
            "Single upstream attempt duration"
        );
        describe_counter!(
            "gateway_upstream_retries_total",
            Unit::Count,
            "Total upstream retry attempts"
        );
        describe_counter!(
            "gateway_upstream_failures_total",
            Unit::Count,
            "Upstream calls that failed after exhausting retries"
        );
        describe_counter!(
            "gateway_lb_selections_total",
            Unit::Count,
            "Instance selections per service and instance"
        );

        // circuit breaker
        describe_counter!(
            "gateway_circuit_breaker_rejected_total",
            Unit::Count,
            "Total requests rejected by circuit breaker"
        );
        describe_counter!(
            "gateway_circuit_breaker_transitions_total",
            Unit::Count,
            "Circuit breaker phase transitions"
        );
        describe_gauge!(
            "gateway_circuit_breaker_state",
            Unit::Count,
            "Circuit phase: 0=closed 1=open 2=half_open"
        );

        // service health
        describe_gauge!(
            "gateway_service_health_status",
            Unit::Count,
            "Service health: 1=healthy 0.5=degraded 0=unhealthy -1=unknown"
        );
        describe_counter!(
            "gateway_health_check_total",
            Unit::Count,
            "Total active health check attempts"
        );

        // monitor
        describe_gauge!(
            "gateway_system_error_rate",
            Unit::Count,
            "Errors / requests across all services"
        );
        describe_gauge!(
            "gateway_system_availability",
            Unit::Count,
            "Healthy / registered services"
        );
        describe_gauge!(
            "gateway_open_circuits",
            Unit::Count,
            "Number of open circuits"
        );
        describe_counter!(
            "gateway_alerts_total",
            Unit::Count,
            "Alerts emitted by the monitor"
        );

        // connections & config
        describe_gauge!(
            "gateway_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );
        describe_counter!(
            "gateway_connections_total",
            Unit::Count,
            "Total connections accepted"
        );
        describe_gauge!(
            "gateway_config_routes_total",
            Unit::Count,
            "Number of routes currently loaded"
        );
        describe_gauge!(
            "gateway_config_services_total",
            Unit::Count,
            "Number of registered services"
        );

        Ok(Self { handle })
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
