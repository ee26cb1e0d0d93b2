//! Wire-level types shared by the codec, the link and the supervisor

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ProtocolError;

/// Reported valve position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValvePosition {
    Open,
    Closed,
}

impl ValvePosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for ValvePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded `TELEMETRY:` line
///
/// Immutable once constructed; `raw_line` keeps the exact device text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Device clock, seconds since epoch or since boot
    pub t: i64,
    pub valve: ValvePosition,
    pub p1: f64,
    pub p2: f64,
    pub c_src: f64,
    pub c_dst: f64,
    #[serde(deserialize_with = "deserialize_flag")]
    pub em: bool,
    #[serde(default)]
    pub raw_line: String,
}

/// Accepts `0`/`1` as sent by the firmware, or a JSON bool
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => Ok(b),
        Flag::Int(0) => Ok(false),
        Flag::Int(1) => Ok(true),
        Flag::Int(other) => Err(serde::de::Error::custom(format!(
            "em must be 0 or 1, got {}",
            other
        ))),
    }
}

impl TelemetrySample {
    /// Wire-shaped record used for storage, `em` encoded as 0/1
    pub fn to_record_json(&self) -> serde_json::Value {
        serde_json::json!({
            "t": self.t,
            "valve": self.valve.as_str(),
            "p1": self.p1,
            "p2": self.p2,
            "c_src": self.c_src,
            "c_dst": self.c_dst,
            "em": u8::from(self.em),
        })
    }
}

/// Outbound command verbs understood by the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandVerb {
    Open,
    Close,
    ForceOpen,
    ResetEmergency,
    Status,
    Info,
    Ping,
    TestModeOn,
    TestModeOff,
}

impl CommandVerb {
    pub const ALL: [CommandVerb; 9] = [
        Self::Open,
        Self::Close,
        Self::ForceOpen,
        Self::ResetEmergency,
        Self::Status,
        Self::Info,
        Self::Ping,
        Self::TestModeOn,
        Self::TestModeOff,
    ];

    /// Canonical wire text, without the newline
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Close => "CLOSE",
            Self::ForceOpen => "FORCE_OPEN",
            Self::ResetEmergency => "RESET_EMERGENCY",
            Self::Status => "STATUS",
            Self::Info => "INFO",
            Self::Ping => "PING",
            Self::TestModeOn => "TEST_MODE_ON",
            Self::TestModeOff => "TEST_MODE_OFF",
        }
    }
}

impl fmt::Display for CommandVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandVerb {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == wanted)
            .ok_or_else(|| ProtocolError::UnknownVerb(s.to_string()))
    }
}

/// Classification of one inbound line
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedLine {
    Telemetry(TelemetrySample),
    /// Telemetry prefix present but body unusable, or line overflowed
    Malformed(String),
    /// Text received while a command is in flight
    CommandReply(String),
    /// `EVENT:` text with no command in flight
    Event(String),
    /// `COMMAND_RECEIVED:` acknowledgement echo, never a reply
    Echo(String),
    /// Other free text with no command in flight
    Unsolicited(String),
    Blank,
}
