//! Safety rule evaluator
//!
//! Pure threshold checks over a single [`TelemetrySample`]. All comparisons
//! are strict: a reading exactly at a threshold is not a violation.

use serde::{Deserialize, Serialize};

use crate::protocol::TelemetrySample;

/// Configured safety thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyThresholds {
    pub max_pressure: f64,
    pub critical_concentration: f64,
    pub min_src_concentration: f64,
    pub max_dst_concentration: f64,
}

impl Default for SafetyThresholds {
    fn default() -> Self {
        Self {
            max_pressure: 6.0,
            critical_concentration: 500.0,
            min_src_concentration: 10.0,
            max_dst_concentration: 400.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationKind {
    Overpressure,
    CriticalConcentration,
    LowSourceConcentration,
    HighDestConcentration,
}

impl ViolationKind {
    /// Monitoring violations force an emergency; open-intent ones only gate OPEN
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Overpressure | Self::CriticalConcentration)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub measured_value: f64,
    pub threshold: f64,
    /// `p1`, `p2`, `c_src` or `c_dst`
    pub sensor_id: String,
}

impl Violation {
    fn new(kind: ViolationKind, sensor_id: &str, measured_value: f64, threshold: f64) -> Self {
        Self {
            kind,
            measured_value,
            threshold,
            sensor_id: sensor_id.to_string(),
        }
    }

    pub fn describe(&self) -> String {
        let relation = match self.kind {
            ViolationKind::LowSourceConcentration => "below",
            _ => "above",
        };
        format!(
            "{:?}: {}={} {} {}",
            self.kind, self.sensor_id, self.measured_value, relation, self.threshold
        )
    }
}

/// Which rule subset to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationMode {
    /// Passive monitoring: overpressure and critical concentration only
    Monitoring,
    /// Pre-check before OPEN: monitoring rules plus the concentration window
    OpenIntent,
}

/// Evaluate one sample; deterministic, no side effects
pub fn evaluate(
    sample: &TelemetrySample,
    thresholds: &SafetyThresholds,
    mode: EvaluationMode,
) -> Vec<Violation> {
    let mut violations = Vec::new();

    for (sensor, value) in [("p1", sample.p1), ("p2", sample.p2)] {
        if value > thresholds.max_pressure {
            violations.push(Violation::new(
                ViolationKind::Overpressure,
                sensor,
                value,
                thresholds.max_pressure,
            ));
        }
    }

    for (sensor, value) in [("c_src", sample.c_src), ("c_dst", sample.c_dst)] {
        if value > thresholds.critical_concentration {
            violations.push(Violation::new(
                ViolationKind::CriticalConcentration,
                sensor,
                value,
                thresholds.critical_concentration,
            ));
        }
    }

    if mode == EvaluationMode::OpenIntent {
        if sample.c_src < thresholds.min_src_concentration {
            violations.push(Violation::new(
                ViolationKind::LowSourceConcentration,
                "c_src",
                sample.c_src,
                thresholds.min_src_concentration,
            ));
        }
        if sample.c_dst > thresholds.max_dst_concentration {
            violations.push(Violation::new(
                ViolationKind::HighDestConcentration,
                "c_dst",
                sample.c_dst,
                thresholds.max_dst_concentration,
            ));
        }
    }

    violations
}

/// Distinct kinds in evaluation order
pub fn kinds(violations: &[Violation]) -> Vec<ViolationKind> {
    let mut out: Vec<ViolationKind> = Vec::with_capacity(violations.len());
    for v in violations {
        if !out.contains(&v.kind) {
            out.push(v.kind);
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::protocol::ValvePosition;
    use proptest::prelude::*;

    fn sample(p1: f64, p2: f64, c_src: f64, c_dst: f64) -> TelemetrySample {
        TelemetrySample {
            t: 0,
            valve: ValvePosition::Closed,
            p1,
            p2,
            c_src,
            c_dst,
            em: false,
            raw_line: String::new(),
        }
    }

    #[test]
    fn test_nominal_sample_is_clean() {
        let s = sample(3.0, 3.0, 50.0, 50.0);
        let t = SafetyThresholds::default();
        assert!(evaluate(&s, &t, EvaluationMode::Monitoring).is_empty());
        assert!(evaluate(&s, &t, EvaluationMode::OpenIntent).is_empty());
    }

    #[test]
    fn test_pressure_boundary_is_strict() {
        let t = SafetyThresholds::default();
        assert!(evaluate(&sample(5.999, 3.0, 50.0, 50.0), &t, EvaluationMode::Monitoring).is_empty());
        assert!(evaluate(&sample(6.0, 6.0, 50.0, 50.0), &t, EvaluationMode::Monitoring).is_empty());

        let v = evaluate(&sample(6.5, 3.0, 50.0, 50.0), &t, EvaluationMode::Monitoring);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].kind, ViolationKind::Overpressure);
        assert_eq!(v[0].sensor_id, "p1");
        assert_eq!(v[0].measured_value, 6.5);
        assert_eq!(v[0].threshold, 6.0);
    }

    #[test]
    fn test_both_pressure_sensors_reported() {
        let t = SafetyThresholds::default();
        let v = evaluate(&sample(7.0, 8.0, 50.0, 50.0), &t, EvaluationMode::Monitoring);
        let sensors: Vec<_> = v.iter().map(|v| v.sensor_id.as_str()).collect();
        assert_eq!(sensors, vec!["p1", "p2"]);
        assert_eq!(kinds(&v), vec![ViolationKind::Overpressure]);
    }

    #[test]
    fn test_critical_concentration() {
        let t = SafetyThresholds::default();
        assert!(evaluate(&sample(1.0, 1.0, 500.0, 50.0), &t, EvaluationMode::Monitoring).is_empty());
        let v = evaluate(&sample(1.0, 1.0, 50.0, 500.5), &t, EvaluationMode::Monitoring);
        assert_eq!(v[0].kind, ViolationKind::CriticalConcentration);
        assert_eq!(v[0].sensor_id, "c_dst");
    }

    #[test]
    fn test_open_intent_only_rules() {
        let t = SafetyThresholds::default();
        let low_src = sample(1.0, 1.0, 9.5, 50.0);
        assert!(evaluate(&low_src, &t, EvaluationMode::Monitoring).is_empty());
        assert_eq!(
            kinds(&evaluate(&low_src, &t, EvaluationMode::OpenIntent)),
            vec![ViolationKind::LowSourceConcentration]
        );

        let high_dst = sample(1.0, 1.0, 50.0, 450.0);
        assert!(evaluate(&high_dst, &t, EvaluationMode::Monitoring).is_empty());
        assert_eq!(
            kinds(&evaluate(&high_dst, &t, EvaluationMode::OpenIntent)),
            vec![ViolationKind::HighDestConcentration]
        );

        // window edges are inclusive
        assert!(evaluate(&sample(1.0, 1.0, 10.0, 400.0), &t, EvaluationMode::OpenIntent).is_empty());
    }

    #[test]
    fn test_critical_classification() {
        assert!(ViolationKind::Overpressure.is_critical());
        assert!(ViolationKind::CriticalConcentration.is_critical());
        assert!(!ViolationKind::LowSourceConcentration.is_critical());
        assert!(!ViolationKind::HighDestConcentration.is_critical());
    }

    proptest! {
        #[test]
        fn prop_evaluate_is_deterministic(
            p1 in -10.0f64..20.0, p2 in -10.0f64..20.0,
            c_src in 0.0f64..1000.0, c_dst in 0.0f64..1000.0,
        ) {
            let s = sample(p1, p2, c_src, c_dst);
            let t = SafetyThresholds::default();
            for mode in [EvaluationMode::Monitoring, EvaluationMode::OpenIntent] {
                prop_assert_eq!(evaluate(&s, &t, mode), evaluate(&s, &t, mode));
            }
        }

        #[test]
        fn prop_inside_thresholds_is_clean(
            p1 in 0.0f64..=6.0, p2 in 0.0f64..=6.0,
            c_src in 10.0f64..=400.0, c_dst in 0.0f64..=400.0,
        ) {
            let s = sample(p1, p2, c_src, c_dst);
            prop_assert!(evaluate(&s, &SafetyThresholds::default(), EvaluationMode::OpenIntent).is_empty());
        }

        #[test]
        fn prop_monitoring_is_subset_of_open_intent(
            p1 in 0.0f64..12.0, p2 in 0.0f64..12.0,
            c_src in 0.0f64..1000.0, c_dst in 0.0f64..1000.0,
        ) {
            let s = sample(p1, p2, c_src, c_dst);
            let t = SafetyThresholds::default();
            let monitoring = evaluate(&s, &t, EvaluationMode::Monitoring);
            let open = evaluate(&s, &t, EvaluationMode::OpenIntent);
            for v in &monitoring {
                prop_assert!(v.kind.is_critical());
                prop_assert!(open.contains(v));
            }
        }

        #[test]
        fn prop_pressure_above_max_always_flags(excess in 1e-6f64..10.0) {
            let s = sample(6.0 + excess, 1.0, 50.0, 50.0);
            let v = evaluate(&s, &SafetyThresholds::default(), EvaluationMode::Monitoring);
            prop_assert_eq!(kinds(&v), vec![ViolationKind::Overpressure]);
        }
    }
}
