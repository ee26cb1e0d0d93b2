//! Safety rules, alerts and the supervisor that enforces them

pub mod alert;
pub mod rules;
pub mod state;
pub mod supervisor;

pub use alert::{Alert, AlertKind, AlertPriority};
pub use rules::{evaluate, kinds, EvaluationMode, SafetyThresholds, Violation, ViolationKind};
pub use state::{next_mode, EmergencyCause, ModeChange, SafetyMode, SafetyTrigger, SystemState};
pub use supervisor::{Supervisor, SupervisorHandle, SupervisorStats};
