use crate::config::AlertThresholds;
use crate::monitor::{ServiceMetrics, SystemMetrics};
use serde::Serialize;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighErrorRate,
    SlowResponses,
    OpenCircuits,
    LowAvailability,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::HighErrorRate => "high_error_rate",
            AlertKind::SlowResponses => "slow_responses",
            AlertKind::OpenCircuits => "open_circuits",
            AlertKind::LowAvailability => "low_availability",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    /// `None` for system-wide alerts.
    pub service: Option<String>,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    #[serde(serialize_with = "serialize_time")]
    pub timestamp: SystemTime,
}

fn serialize_time<S: serde::Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&humantime::format_rfc3339_millis(*t).to_string())
}

impl Alert {
    fn new(
        kind: AlertKind,
        severity: Severity,
        service: Option<&str>,
        value: f64,
        threshold: f64,
        message: String,
    ) -> Self {
        Self {
            kind,
            severity,
            service: service.map(str::to_string),
            message,
            value,
            threshold,
            timestamp: SystemTime::now(),
        }
    }
}

/// Compare aggregates against the thresholds. Pure: no side effects, so the
/// health report and the periodic tick see the same verdict.
pub fn evaluate(
    system: &SystemMetrics,
    services: &[ServiceMetrics],
    thresholds: &AlertThresholds,
) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if system.total_requests > 0 && system.error_rate > thresholds.error_rate {
        alerts.push(Alert::new(
            AlertKind::HighErrorRate,
            severity_above(system.error_rate, thresholds.error_rate),
            None,
            system.error_rate,
            thresholds.error_rate,
            format!(
                "system error rate {:.1}% exceeds {:.1}%",
                system.error_rate * 100.0,
                thresholds.error_rate * 100.0
            ),
        ));
    }
    if system.total_requests > 0 && system.avg_response_time_ms > thresholds.response_time_ms {
        alerts.push(Alert::new(
            AlertKind::SlowResponses,
            severity_above(system.avg_response_time_ms, thresholds.response_time_ms),
            None,
            system.avg_response_time_ms,
            thresholds.response_time_ms,
            format!(
                "average response time {:.0}ms exceeds {:.0}ms",
                system.avg_response_time_ms, thresholds.response_time_ms
            ),
        ));
    }
    if system.open_circuits > thresholds.open_circuits {
        alerts.push(Alert::new(
            AlertKind::OpenCircuits,
            Severity::Warning,
            None,
            system.open_circuits as f64,
            thresholds.open_circuits as f64,
            format!("{} circuit(s) open", system.open_circuits),
        ));
    }
    if system.availability < thresholds.availability {
        let severity = if system.availability < 0.5 {
            Severity::Critical
        } else {
            Severity::Warning
        };
        alerts.push(Alert::new(
            AlertKind::LowAvailability,
            severity,
            None,
            system.availability,
            thresholds.availability,
            format!(
                "{}/{} services healthy",
                system.healthy_services, system.registered_services
            ),
        ));
    }

    for svc in services.iter().filter(|s| s.total_requests > 0) {
        let rate = svc.error_rate();
        if rate > thresholds.error_rate {
            alerts.push(Alert::new(
                AlertKind::HighErrorRate,
                severity_above(rate, thresholds.error_rate),
                Some(&svc.service_name),
                rate,
                thresholds.error_rate,
                format!(
                    "{} error rate {:.1}% ({} of {})",
                    svc.service_name,
                    rate * 100.0,
                    svc.total_errors,
                    svc.total_requests
                ),
            ));
        }
        if svc.ema_latency_ms > thresholds.response_time_ms {
            alerts.push(Alert::new(
                AlertKind::SlowResponses,
                severity_above(svc.ema_latency_ms, thresholds.response_time_ms),
                Some(&svc.service_name),
                svc.ema_latency_ms,
                thresholds.response_time_ms,
                format!(
                    "{} latency {:.0}ms exceeds {:.0}ms",
                    svc.service_name, svc.ema_latency_ms, thresholds.response_time_ms
                ),
            ));
        }
    }

    alerts
}

/// Twice the threshold or more is critical.
fn severity_above(value: f64, threshold: f64) -> Severity {
    if value >= threshold * 2.0 {
        Severity::Critical
    } else {
        Severity::Warning
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system(requests: u64, errors: u64) -> SystemMetrics {
        SystemMetrics {
            total_requests: requests,
            total_errors: errors,
            error_rate: if requests == 0 {
                0.0
            } else {
                errors as f64 / requests as f64
            },
            avg_response_time_ms: 20.0,
            open_circuits: 0,
            availability: 1.0,
            registered_services: 1,
            healthy_services: 1,
        }
    }

    #[test]
    fn test_quiet_system_has_no_alerts() {
        let alerts = evaluate(&system(100, 5), &[], &AlertThresholds::default());
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_error_rate_breach() {
        let alerts = evaluate(&system(100, 12), &[], &AlertThresholds::default());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::HighErrorRate);
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert!(alerts[0].service.is_none());
    }

    #[test]
    fn test_open_circuits_and_availability() {
        let mut sys = system(0, 0);
        sys.open_circuits = 1;
        sys.availability = 0.4;
        sys.healthy_services = 2;
        sys.registered_services = 5;
        let alerts = evaluate(&sys, &[], &AlertThresholds::default());
        let kinds: Vec<AlertKind> = alerts.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::OpenCircuits, AlertKind::LowAvailability]);
        assert_eq!(alerts[1].severity, Severity::Critical);
    }

    #[test]
    fn test_per_service_breaches() {
        let svc = ServiceMetrics {
            service_name: "search".into(),
            total_requests: 10,
            total_errors: 5,
            ema_latency_ms: 2500.0,
            last_request_at: None,
        };
        let alerts = evaluate(&system(1000, 5), &[svc], &AlertThresholds::default());
        assert_eq!(alerts.len(), 2);
        assert!(alerts
            .iter()
            .all(|a| a.service.as_deref() == Some("search") && a.severity == Severity::Critical));
    }
}
