use crate::config::CircuitBreakerConfig;
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker state machine: Closed → Open → HalfOpen → Closed/Open.
///
/// Per-service granularity: each logical service gets its own breaker,
/// created lazily in `Closed` on first reference. The Open → HalfOpen
/// transition is evaluated on read (every query below calls `refresh`), so
/// there are no per-service timers.
pub struct CircuitBreakerRegistry {
    circuits: DashMap<String, CircuitState>,
    defaults: CircuitBreakerConfig,
    overrides: DashMap<String, CircuitBreakerConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitPhase::Closed => "closed",
            CircuitPhase::Open => "open",
            CircuitPhase::HalfOpen => "half_open",
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            CircuitPhase::Closed => 0.0,
            CircuitPhase::Open => 1.0,
            CircuitPhase::HalfOpen => 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitState {
    pub service_name: String,
    pub phase: CircuitPhase,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    /// Set while the single half-open trial is outstanding.
    probe_started_at: Option<Instant>,
}

/// Result of checking the circuit breaker before a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerCheck {
    /// Breaker is closed: proceed normally.
    Allowed,
    /// Breaker is half-open and this caller owns the single trial.
    Probe,
    /// Breaker is open (or the trial is taken): reject without I/O.
    Rejected,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    #[error("circuit open: {service}")]
    Open { service: String },
    #[error("{0}")]
    Failed(E),
}

/// Read-only view for the admin API and the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub service: String,
    pub phase: CircuitPhase,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    /// Milliseconds since the last recorded failure.
    pub last_failure_ago_ms: Option<u64>,
}

impl CircuitState {
    fn new(service_name: &str, cfg: &CircuitBreakerConfig) -> Self {
        Self {
            service_name: service_name.to_string(),
            phase: CircuitPhase::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            failure_threshold: cfg.failure_threshold.max(1),
            reset_timeout: Duration::from_millis(cfg.reset_timeout_ms),
            probe_started_at: None,
        }
    }

    /// Lazy Open → HalfOpen once `reset_timeout` has passed since the last failure.
    fn refresh(&mut self, now: Instant) {
        if self.phase != CircuitPhase::Open {
            return;
        }
        let elapsed = self
            .last_failure_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(Duration::MAX);
        if elapsed >= self.reset_timeout {
            self.transition(CircuitPhase::HalfOpen);
            self.probe_started_at = None;
        }
    }

    fn transition(&mut self, to: CircuitPhase) {
        if self.phase == to {
            return;
        }
        info!(
            "circuit_breaker: transition, service={}, from={}, to={}, failures={}",
            self.service_name,
            self.phase.as_str(),
            to.as_str(),
            self.consecutive_failures
        );
        self.phase = to;
        metrics::counter!(
            "gateway_circuit_breaker_transitions_total",
            "service" => self.service_name.clone(),
            "to" => to.as_str(),
        )
        .increment(1);
        metrics::gauge!(
            "gateway_circuit_breaker_state",
            "service" => self.service_name.clone(),
        )
        .set(to.gauge_value());
    }

    fn snapshot(&self, now: Instant) -> CircuitSnapshot {
        CircuitSnapshot {
            service: self.service_name.clone(),
            phase: self.phase,
            consecutive_failures: self.consecutive_failures,
            failure_threshold: self.failure_threshold,
            reset_timeout_ms: self.reset_timeout.as_millis() as u64,
            last_failure_ago_ms: self
                .last_failure_at
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
        }
    }
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            circuits: DashMap::new(),
            defaults,
            overrides: DashMap::new(),
        }
    }

    /// Per-service thresholds. Applies to the live state too.
    pub fn configure(&self, name: &str, cfg: CircuitBreakerConfig) {
        self.apply_thresholds(name, &cfg);
        self.overrides.insert(name.to_string(), cfg);
    }

    /// Drop a per-service override; the service falls back to the defaults.
    pub fn clear_override(&self, name: &str) {
        if self.overrides.remove(name).is_some() {
            self.apply_thresholds(name, &self.defaults);
        }
    }

    fn apply_thresholds(&self, name: &str, cfg: &CircuitBreakerConfig) {
        if let Some(mut state) = self.circuits.get_mut(name) {
            state.failure_threshold = cfg.failure_threshold.max(1);
            state.reset_timeout = Duration::from_millis(cfg.reset_timeout_ms);
        }
    }

    /// Forget a service entirely (state and overrides).
    pub fn remove(&self, name: &str) {
        self.circuits.remove(name);
        self.overrides.remove(name);
    }

    /// Run `f` with exclusive access to the service's state, after the lazy
    /// half-open check. The entry lock is per key.
    fn with_state<R>(&self, name: &str, f: impl FnOnce(&mut CircuitState, Instant) -> R) -> R {
        let now = Instant::now();
        // Fast path: key already exists, no allocation.
        if let Some(mut entry) = self.circuits.get_mut(name) {
            entry.refresh(now);
            return f(entry.value_mut(), now);
        }
        let cfg = self
            .overrides
            .get(name)
            .map(|c| c.value().clone())
            .unwrap_or_else(|| self.defaults.clone());
        let mut entry = self
            .circuits
            .entry(name.to_string())
            .or_insert_with(|| CircuitState::new(name, &cfg));
        entry.refresh(now);
        f(entry.value_mut(), now)
    }

    pub fn state(&self, name: &str) -> CircuitPhase {
        self.with_state(name, |s, _| s.phase)
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.state(name) == CircuitPhase::Open
    }

    /// Check whether a call to `name` may proceed. In half-open exactly one
    /// caller receives `Probe`; an abandoned probe is reissued after another
    /// `reset_timeout`.
    pub fn try_acquire(&self, name: &str) -> BreakerCheck {
        self.with_state(name, |s, now| match s.phase {
            CircuitPhase::Closed => BreakerCheck::Allowed,
            CircuitPhase::Open => BreakerCheck::Rejected,
            CircuitPhase::HalfOpen => {
                let taken = s
                    .probe_started_at
                    .map(|at| now.saturating_duration_since(at) < s.reset_timeout)
                    .unwrap_or(false);
                if taken {
                    BreakerCheck::Rejected
                } else {
                    s.probe_started_at = Some(now);
                    BreakerCheck::Probe
                }
            }
        })
    }

    pub fn record_success(&self, name: &str) {
        self.with_state(name, |s, _| match s.phase {
            CircuitPhase::Closed => s.consecutive_failures = 0,
            CircuitPhase::HalfOpen => {
                s.consecutive_failures = 0;
                s.probe_started_at = None;
                s.transition(CircuitPhase::Closed);
            }
            // A straggler that started before the circuit opened.
            CircuitPhase::Open => {}
        })
    }

    pub fn record_failure(&self, name: &str) {
        self.with_state(name, |s, now| {
            s.consecutive_failures = s.consecutive_failures.saturating_add(1);
            match s.phase {
                CircuitPhase::Closed => {
                    if s.consecutive_failures >= s.failure_threshold {
                        s.last_failure_at = Some(now);
                        s.transition(CircuitPhase::Open);
                        warn!(
                            "circuit_breaker: opened, service={}, consecutive_failures={}",
                            s.service_name, s.consecutive_failures
                        );
                    }
                }
                CircuitPhase::HalfOpen => {
                    s.last_failure_at = Some(now);
                    s.probe_started_at = None;
                    s.transition(CircuitPhase::Open);
                    warn!(
                        "circuit_breaker: re-opened (probe failed), service={}",
                        s.service_name
                    );
                }
                CircuitPhase::Open => {}
            }
        })
    }

    /// Give back a half-open trial that never reached the backend, so the
    /// next caller can take it without waiting out `reset_timeout`.
    pub fn release_trial(&self, name: &str) {
        self.with_state(name, |s, _| {
            if s.phase == CircuitPhase::HalfOpen {
                s.probe_started_at = None;
            }
        })
    }

    /// Operator override: force open now.
    pub fn open_circuit(&self, name: &str) {
        self.with_state(name, |s, now| {
            s.last_failure_at = Some(now);
            s.probe_started_at = None;
            s.transition(CircuitPhase::Open);
        });
        warn!("circuit_breaker: manually opened, service={}", name);
    }

    /// Operator override: force closed and clear the failure count.
    pub fn close_circuit(&self, name: &str) {
        self.with_state(name, |s, _| {
            s.consecutive_failures = 0;
            s.probe_started_at = None;
            s.transition(CircuitPhase::Closed);
        });
        info!("circuit_breaker: manually closed, service={}", name);
    }

    /// Drop all state; the next reference starts fresh in `Closed`.
    pub fn reset_circuit(&self, name: &str) {
        self.circuits.remove(name);
        metrics::gauge!("gateway_circuit_breaker_state", "service" => name.to_string())
            .set(CircuitPhase::Closed.gauge_value());
        info!("circuit_breaker: reset, service={}", name);
    }

    pub fn reset_all(&self) {
        let names: Vec<String> = self.circuits.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.reset_circuit(&name);
        }
    }

    pub fn snapshot(&self, name: &str) -> CircuitSnapshot {
        self.with_state(name, |s, now| s.snapshot(now))
    }

    /// Snapshots of every known circuit, sorted by service name.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let now = Instant::now();
        let mut all: Vec<CircuitSnapshot> = self
            .circuits
            .iter_mut()
            .map(|mut e| {
                e.refresh(now);
                e.snapshot(now)
            })
            .collect();
        all.sort_by(|a, b| a.service.cmp(&b.service));
        all
    }

    pub fn open_count(&self) -> usize {
        self.snapshots()
            .iter()
            .filter(|s| s.phase == CircuitPhase::Open)
            .count()
    }

    /// Run `op` under the breaker: rejected without calling `op` while open,
    /// outcome recorded otherwise.
    pub async fn execute<T, E, F, Fut>(&self, name: &str, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if self.try_acquire(name) == BreakerCheck::Rejected {
            metrics::counter!(
                "gateway_circuit_breaker_rejected_total",
                "service" => name.to_string(),
            )
            .increment(1);
            return Err(CircuitError::Open {
                service: name.to_string(),
            });
        }
        match op().await {
            Ok(v) => {
                self.record_success(name);
                Ok(v)
            }
            Err(e) => {
                self.record_failure(name);
                Err(CircuitError::Failed(e))
            }
        }
    }

    /// Like `execute`, but answers with `fallback()` while the circuit is open
    /// and when a failure leaves it open.
    pub async fn execute_with_fallback<T, E, F, Fut, Fb>(
        &self,
        name: &str,
        op: F,
        fallback: Fb,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Fb: FnOnce() -> T,
    {
        match self.execute(name, op).await {
            Ok(v) => Ok(v),
            Err(CircuitError::Open { .. }) => Ok(fallback()),
            Err(CircuitError::Failed(e)) => {
                if self.is_open(name) {
                    Ok(fallback())
                } else {
                    Err(e)
                }
            }
        }
    }
}
