//! Subscriber wire messages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::auth::Role;
use crate::link::{CommandOutcome, CommandResult, LinkState};
use crate::protocol::{CommandVerb, TelemetrySample, ValvePosition};
use crate::safety::Alert;

/// Server → subscriber, encoded as `{"type": ..., "data": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundMessage {
    Telemetry(TelemetrySample),
    Alert(Alert),
    ValveEvent(ValveEvent),
    Log(LogEvent),
    LinkStatus { state: LinkState },
    Heartbeat { at: DateTime<Utc> },
    AuthSuccess { subject: String, role: Role },
    AuthError { reason: String },
    Pong,
}

impl OutboundMessage {
    pub fn heartbeat() -> Self {
        Self::Heartbeat { at: Utc::now() }
    }

    /// Stable label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Telemetry(_) => "telemetry",
            Self::Alert(_) => "alert",
            Self::ValveEvent(_) => "valve_event",
            Self::Log(_) => "log",
            Self::LinkStatus { .. } => "link_status",
            Self::Heartbeat { .. } => "heartbeat",
            Self::AuthSuccess { .. } => "auth_success",
            Self::AuthError { .. } => "auth_error",
            Self::Pong => "pong",
        }
    }

    pub fn to_json(&self) -> String {
        // only derived Serialize impls over plain data, cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Result of one command, as seen by observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValveEvent {
    pub request_id: Uuid,
    pub verb: CommandVerb,
    pub issuer: String,
    pub outcome: CommandOutcome,
    pub valve: ValvePosition,
    pub emergency: bool,
    pub at: DateTime<Utc>,
}

impl ValveEvent {
    pub fn from_result(result: &CommandResult, valve: ValvePosition, emergency: bool) -> Self {
        Self {
            request_id: result.request_id,
            verb: result.verb,
            issuer: result.issuer.clone(),
            outcome: result.outcome.clone(),
            valve,
            emergency,
            at: result.completed_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
}

/// Free-form device text forwarded to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl LogEvent {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Subscriber → server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InboundMessage {
    Auth { token: String },
    Typed {
        #[serde(rename = "type")]
        kind: String,
    },
}

impl InboundMessage {
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn is_ping(&self) -> bool {
        matches!(self, Self::Typed { kind } if kind.eq_ignore_ascii_case("ping"))
    }
}
