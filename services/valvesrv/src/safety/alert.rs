//! Alerts raised by the supervisor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::rules::Violation;
use crate::protocol::TelemetrySample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    SafetyViolation,
    DeviceEmergency,
    ForceOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertPriority {
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub raised_at: DateTime<Utc>,
    pub kind: AlertKind,
    pub priority: AlertPriority,
    pub message: String,
    pub violations: Vec<Violation>,
    pub sample: Option<TelemetrySample>,
}

impl Alert {
    fn new(kind: AlertKind, priority: AlertPriority, message: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            raised_at: Utc::now(),
            kind,
            priority,
            message,
            violations: Vec::new(),
            sample: None,
        }
    }

    /// CRITICAL when any violation is a monitoring violation, HIGH otherwise
    pub fn safety_violation(violations: Vec<Violation>, sample: &TelemetrySample) -> Self {
        let priority = if violations.iter().any(|v| v.kind.is_critical()) {
            AlertPriority::Critical
        } else {
            AlertPriority::High
        };
        let details: Vec<String> = violations.iter().map(Violation::describe).collect();
        let mut alert = Self::new(
            AlertKind::SafetyViolation,
            priority,
            format!("EMERGENCY: {}", details.join("; ")),
        );
        alert.violations = violations;
        alert.sample = Some(sample.clone());
        alert
    }

    pub fn device_emergency(detail: &str, sample: Option<&TelemetrySample>) -> Self {
        let mut alert = Self::new(
            AlertKind::DeviceEmergency,
            AlertPriority::Critical,
            format!("EMERGENCY: device reported emergency ({})", detail),
        );
        alert.sample = sample.cloned();
        alert
    }

    pub fn force_open(issuer: &str, emergency_active: bool) -> Self {
        let suffix = if emergency_active {
            " while emergency is active"
        } else {
            ""
        };
        Self::new(
            AlertKind::ForceOpen,
            AlertPriority::High,
            format!("Valve force-opened by {}{}", issuer, suffix),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ValvePosition;
    use crate::safety::rules::{evaluate, EvaluationMode, SafetyThresholds};

    fn sample(p1: f64, c_src: f64) -> TelemetrySample {
        TelemetrySample {
            t: 7,
            valve: ValvePosition::Open,
            p1,
            p2: 3.0,
            c_src,
            c_dst: 50.0,
            em: false,
            raw_line: String::new(),
        }
    }

    #[test]
    fn test_overpressure_alert_is_critical() {
        let s = sample(6.5, 50.0);
        let v = evaluate(&s, &SafetyThresholds::default(), EvaluationMode::Monitoring);
        let alert = Alert::safety_violation(v, &s);
        assert_eq!(alert.priority, AlertPriority::Critical);
        assert_eq!(alert.kind, AlertKind::SafetyViolation);
        assert!(alert.message.contains("p1=6.5"));
        assert_eq!(alert.sample.as_ref().map(|s| s.t), Some(7));
    }

    #[test]
    fn test_open_intent_only_alert_is_high() {
        let s = sample(3.0, 5.0);
        let v = evaluate(&s, &SafetyThresholds::default(), EvaluationMode::OpenIntent);
        assert_eq!(Alert::safety_violation(v, &s).priority, AlertPriority::High);
    }

    #[test]
    fn test_force_open_names_issuer() {
        let alert = Alert::force_open("alice", true);
        assert_eq!(alert.priority, AlertPriority::High);
        assert!(alert.message.contains("alice"));
        assert!(alert.message.contains("emergency"));
    }
}
