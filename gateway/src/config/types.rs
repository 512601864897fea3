use serde::{Deserialize, Deserializer, Serialize};

/// Deserialize a `T` that implements `Default`: treats JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Backend services registered at startup.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub services: Vec<ServiceConfig>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub routes: Vec<RouteConfig>,

    /// Defaults for every breaker; services may override.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

/// Service registration contract: `{name, url, healthPath, timeout, retries, prefix}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub name: String,

    /// Base URL, e.g. `http://10.0.0.4:8081`.
    pub url: String,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Per-call timeout in milliseconds.
    #[serde(default = "default_service_timeout_ms")]
    pub timeout: u64,

    /// Total attempts per outbound call (>= 1).
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Path prefix the backend expects, e.g. `/orders`.
    #[serde(default)]
    pub prefix: String,

    /// Additional instances. When empty, `url` is the single instance.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub instances: Vec<InstanceConfig>,

    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    /// Overrides `load_balancer.strategy` for this service.
    #[serde(default)]
    pub strategy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_service_timeout_ms() -> u64 {
    30_000
}

fn default_retries() -> u32 {
    3
}

fn default_weight() -> u32 {
    1
}

/// Route entry: `{pathPattern, targetService, methods[], requireAuth, rateLimit, timeoutMs}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    /// `/api/orders/*` or `/api/orders`: both are prefix patterns.
    pub path_pattern: String,

    pub target_service: String,

    /// Empty means any method.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub methods: Vec<String>,

    #[serde(default)]
    pub require_auth: bool,

    /// When non-empty, the principal must hold at least one of these roles.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub required_roles: Vec<String>,

    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    /// Overrides the service timeout for requests on this route.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub max: u64,

    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

fn default_window_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open circuit rejects calls before allowing a probe.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    /// `round_robin`, `least_connections` or `weighted`.
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
        }
    }
}

fn default_strategy() -> String {
    "round_robin".to_string()
}

/// Exponential backoff between attempts: `min(base * 2^(attempt-1), max)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_backoff_base_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_backoff_base_ms(),
            max_delay_ms: default_backoff_max_ms(),
        }
    }
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_hc_interval")]
    pub interval_secs: u64,

    /// Bound on a single health probe.
    #[serde(default = "default_hc_timeout")]
    pub timeout_ms: u64,

    /// Polling interval used by `wait_until_healthy`.
    #[serde(default = "default_hc_poll_interval")]
    pub poll_interval_ms: u64,

    /// How long startup waits for each service to become healthy.
    #[serde(default = "default_hc_startup_timeout")]
    pub startup_timeout_ms: u64,

    /// Prevents probe storms when many services are registered.
    #[serde(default = "default_hc_concurrency")]
    pub concurrency: usize,

    /// Bound on one periodic round over every service. Probes still in
    /// flight when it elapses are dropped and keep their previous record.
    #[serde(default = "default_hc_round_timeout")]
    pub round_timeout_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_hc_interval(),
            timeout_ms: default_hc_timeout(),
            poll_interval_ms: default_hc_poll_interval(),
            startup_timeout_ms: default_hc_startup_timeout(),
            concurrency: default_hc_concurrency(),
            round_timeout_ms: default_hc_round_timeout(),
        }
    }
}

fn default_hc_interval() -> u64 {
    30
}

fn default_hc_round_timeout() -> u64 {
    20_000
}

fn default_hc_timeout() -> u64 {
    5_000
}

fn default_hc_poll_interval() -> u64 {
    1_000
}

fn default_hc_startup_timeout() -> u64 {
    30_000
}

fn default_hc_concurrency() -> usize {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,

    /// EMA smoothing factor for latency.
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,

    #[serde(default)]
    pub thresholds: AlertThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval(),
            ema_alpha: default_ema_alpha(),
            thresholds: AlertThresholds::default(),
        }
    }
}

fn default_monitor_interval() -> u64 {
    30
}

fn default_ema_alpha() -> f64 {
    0.1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Errors / requests above this ratio breach.
    #[serde(default = "default_error_rate")]
    pub error_rate: f64,

    #[serde(default = "default_latency_ms")]
    pub response_time_ms: f64,

    /// More open circuits than this breach.
    #[serde(default)]
    pub open_circuits: usize,

    /// Healthy / registered services below this ratio breach.
    #[serde(default = "default_availability")]
    pub availability: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate: default_error_rate(),
            response_time_ms: default_latency_ms(),
            open_circuits: 0,
            availability: default_availability(),
        }
    }
}

fn default_error_rate() -> f64 {
    0.10
}

fn default_latency_ms() -> f64 {
    1_000.0
}

fn default_availability() -> f64 {
    0.95
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Endpoint of the auth collaborator. Requests carrying a bearer token are
    /// verified with `GET verify_url` + `Authorization: Bearer <token>`.
    #[serde(default)]
    pub verify_url: Option<String>,

    #[serde(default = "default_auth_timeout")]
    pub timeout_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            verify_url: None,
            timeout_ms: default_auth_timeout(),
        }
    }
}

fn default_auth_timeout() -> u64 {
    3_000
}
