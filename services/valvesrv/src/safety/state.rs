//! Canonical system state and the emergency state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::rules::ViolationKind;
use crate::link::LinkState;
use crate::protocol::{TelemetrySample, ValvePosition};

/// What put the system into emergency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum EmergencyCause {
    /// Local monitoring found critical violations
    Violations { kinds: Vec<ViolationKind> },
    /// Sample carried `em = 1`
    DeviceFlag,
    /// Device announced an emergency via `EVENT:`
    DeviceEvent { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyMode {
    Normal,
    Emergency {
        since: DateTime<Utc>,
        cause: EmergencyCause,
    },
}

impl SafetyMode {
    pub fn is_emergency(&self) -> bool {
        matches!(self, Self::Emergency { .. })
    }
}

/// Inputs that may move the safety mode
#[derive(Debug, Clone, PartialEq)]
pub enum SafetyTrigger {
    /// Monitoring pass over one sample
    Sample {
        violations: Vec<ViolationKind>,
        device_flag: bool,
    },
    DeviceEmergency(String),
    /// Device acknowledged RESET_EMERGENCY and the last sample is clean
    ResetAccepted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeChange {
    Unchanged,
    Entered,
    Cleared,
}

/// Emergency is sticky: only `ResetAccepted` leaves it
pub fn next_mode(
    current: &SafetyMode,
    trigger: SafetyTrigger,
    now: DateTime<Utc>,
) -> (SafetyMode, ModeChange) {
    match (current, trigger) {
        (SafetyMode::Emergency { .. }, SafetyTrigger::ResetAccepted) => {
            (SafetyMode::Normal, ModeChange::Cleared)
        },
        (SafetyMode::Emergency { .. }, _) => (current.clone(), ModeChange::Unchanged),
        (SafetyMode::Normal, SafetyTrigger::Sample { violations, device_flag }) => {
            let cause = if !violations.is_empty() {
                EmergencyCause::Violations { kinds: violations }
            } else if device_flag {
                EmergencyCause::DeviceFlag
            } else {
                return (SafetyMode::Normal, ModeChange::Unchanged);
            };
            (SafetyMode::Emergency { since: now, cause }, ModeChange::Entered)
        },
        (SafetyMode::Normal, SafetyTrigger::DeviceEmergency(text)) => (
            SafetyMode::Emergency {
                since: now,
                cause: EmergencyCause::DeviceEvent { text },
            },
            ModeChange::Entered,
        ),
        (SafetyMode::Normal, SafetyTrigger::ResetAccepted) => {
            (SafetyMode::Normal, ModeChange::Unchanged)
        },
    }
}

/// Singleton state owned by the supervisor; readers get `Arc` snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub valve: ValvePosition,
    pub safety: SafetyMode,
    pub link: LinkState,
    pub last_sample: Option<TelemetrySample>,
    pub last_command_at: Option<DateTime<Utc>>,
}

impl Default for SystemState {
    fn default() -> Self {
        Self {
            valve: ValvePosition::Closed,
            safety: SafetyMode::Normal,
            link: LinkState::Disconnected,
            last_sample: None,
            last_command_at: None,
        }
    }
}

impl SystemState {
    pub fn emergency(&self) -> bool {
        self.safety.is_emergency()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn sample_trigger(violations: Vec<ViolationKind>, device_flag: bool) -> SafetyTrigger {
        SafetyTrigger::Sample {
            violations,
            device_flag,
        }
    }

    #[test]
    fn test_clean_sample_keeps_normal() {
        let (mode, change) = next_mode(&SafetyMode::Normal, sample_trigger(vec![], false), Utc::now());
        assert_eq!(mode, SafetyMode::Normal);
        assert_eq!(change, ModeChange::Unchanged);
    }

    #[test]
    fn test_violation_enters_emergency() {
        let (mode, change) = next_mode(
            &SafetyMode::Normal,
            sample_trigger(vec![ViolationKind::Overpressure], false),
            Utc::now(),
        );
        assert_eq!(change, ModeChange::Entered);
        match mode {
            SafetyMode::Emergency {
                cause: EmergencyCause::Violations { kinds },
                ..
            } => assert_eq!(kinds, vec![ViolationKind::Overpressure]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_device_flag_enters_emergency() {
        let (mode, change) = next_mode(&SafetyMode::Normal, sample_trigger(vec![], true), Utc::now());
        assert_eq!(change, ModeChange::Entered);
        assert!(matches!(
            mode,
            SafetyMode::Emergency {
                cause: EmergencyCause::DeviceFlag,
                ..
            }
        ));
    }

    #[test]
    fn test_emergency_is_sticky() {
        let since = Utc::now();
        let mut mode = SafetyMode::Emergency {
            since,
            cause: EmergencyCause::DeviceFlag,
        };
        for _ in 0..100 {
            let (next, change) = next_mode(&mode, sample_trigger(vec![], false), Utc::now());
            assert_eq!(change, ModeChange::Unchanged);
            mode = next;
        }
        let (next, change) = next_mode(&mode, SafetyTrigger::DeviceEmergency("again".into()), Utc::now());
        assert_eq!(change, ModeChange::Unchanged);
        // original entry time and cause survive
        assert_eq!(
            next,
            SafetyMode::Emergency {
                since,
                cause: EmergencyCause::DeviceFlag
            }
        );
    }

    #[test]
    fn test_reset_clears_only_emergency() {
        let mode = SafetyMode::Emergency {
            since: Utc::now(),
            cause: EmergencyCause::DeviceFlag,
        };
        let (next, change) = next_mode(&mode, SafetyTrigger::ResetAccepted, Utc::now());
        assert_eq!(next, SafetyMode::Normal);
        assert_eq!(change, ModeChange::Cleared);

        let (next, change) = next_mode(&SafetyMode::Normal, SafetyTrigger::ResetAccepted, Utc::now());
        assert_eq!(next, SafetyMode::Normal);
        assert_eq!(change, ModeChange::Unchanged);
    }

    #[test]
    fn test_state_serialization() {
        let state = SystemState::default();
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["valve"], "CLOSED");
        assert_eq!(json["safety"]["mode"], "NORMAL");
        assert_eq!(json["link"], "DISCONNECTED");
        assert!(!state.emergency());
    }
}
