//! Command request/result types

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::codec;
use crate::protocol::CommandVerb;
use crate::safety::ViolationKind;

/// Issuer recorded for commands raised by the supervisor itself
pub const SUPERVISOR_ISSUER: &str = "supervisor";

/// One request/reply cycle over the link
///
/// The deadline is `timeout` measured from the moment the request acquires
/// the link's in-flight slot, not from `issued_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub id: Uuid,
    pub verb: CommandVerb,
    pub issuer: String,
    pub issued_at: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl CommandRequest {
    pub fn new(verb: CommandVerb, issuer: impl Into<String>, timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            verb,
            issuer: issuer.into(),
            issued_at: Utc::now(),
            timeout,
        }
    }

    /// Terminal result for this request
    pub fn complete(&self, outcome: CommandOutcome) -> CommandResult {
        CommandResult {
            request_id: self.id,
            verb: self.verb,
            issuer: self.issuer.clone(),
            outcome,
            completed_at: Utc::now(),
        }
    }
}

/// Why a command was refused
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    /// Local emergency lockout is active
    Emergency,
    /// OPEN pre-check failed against the last sample
    UnsafeConditions(Vec<ViolationKind>),
    /// No telemetry observed yet to check against
    NoTelemetry,
    /// Reset refused while the last sample still violates a rule
    StillUnsafe(Vec<ViolationKind>),
    /// Device answered `ERROR: ...`
    Device(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandOutcome {
    Ack(String),
    Timeout,
    Rejected(RejectReason),
    LinkDown,
}

impl CommandOutcome {
    /// Map accepted reply text; `ERROR:` replies become device rejections
    pub fn from_reply(text: &str) -> Self {
        match codec::device_error(text) {
            Some(reason) => Self::Rejected(RejectReason::Device(reason.to_string())),
            None => Self::Ack(text.to_string()),
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack(_))
    }

    /// Stable label for logs and counters
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ack(_) => "ack",
            Self::Timeout => "timeout",
            Self::Rejected(_) => "rejected",
            Self::LinkDown => "link_down",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub request_id: Uuid,
    pub verb: CommandVerb,
    pub issuer: String,
    pub outcome: CommandOutcome,
    pub completed_at: DateTime<Utc>,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
