//! Line protocol codec
//!
//! Pure encode/decode for the newline-delimited ASCII protocol. No I/O:
//! the link feeds raw bytes into [`LineAssembler`] and classifies each
//! completed line with [`decode`].

use bytes::{Buf, Bytes, BytesMut};

use super::types::{CommandVerb, DecodedLine, TelemetrySample};
use crate::error::ProtocolError;

pub const TELEMETRY_PREFIX: &str = "TELEMETRY:";
pub const EVENT_PREFIX: &str = "EVENT:";
pub const ERROR_PREFIX: &str = "ERROR:";
pub const ECHO_PREFIX: &str = "COMMAND_RECEIVED";

/// Default cap on a single buffered line
pub const DEFAULT_MAX_LINE_LENGTH: usize = 512;

/// Encode a command as its newline-terminated wire text
pub fn encode(verb: CommandVerb) -> Bytes {
    Bytes::from(format!("{}\n", verb.as_str()))
}

/// Classify one line; never fails, unusable telemetry becomes `Malformed`
pub fn decode(line: &str, command_in_flight: bool) -> DecodedLine {
    let text = line.trim();
    if text.is_empty() {
        return DecodedLine::Blank;
    }

    if let Some(body) = text.strip_prefix(TELEMETRY_PREFIX) {
        return match parse_telemetry(body, text) {
            Ok(sample) => DecodedLine::Telemetry(sample),
            Err(_) => DecodedLine::Malformed(text.to_string()),
        };
    }

    if text.starts_with(ECHO_PREFIX) {
        return DecodedLine::Echo(text.to_string());
    }

    if command_in_flight {
        DecodedLine::CommandReply(text.to_string())
    } else if text.starts_with(EVENT_PREFIX) {
        DecodedLine::Event(text.to_string())
    } else {
        DecodedLine::Unsolicited(text.to_string())
    }
}

/// Parse the JSON body after `TELEMETRY:`
pub fn parse_telemetry(body: &str, raw_line: &str) -> Result<TelemetrySample, ProtocolError> {
    let mut sample: TelemetrySample = serde_json::from_str(body.trim()).map_err(|e| {
        ProtocolError::MalformedTelemetry {
            reason: e.to_string(),
        }
    })?;
    sample.raw_line = raw_line.to_string();
    Ok(sample)
}

// ============================================================================
// Reply correlation
// ============================================================================

/// What to do with text received while `verb` is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDisposition {
    /// Resolves the in-flight command
    Accept,
    /// Known reply token for some other verb; discard
    Stale,
    /// Asynchronous device event that happened to arrive mid-command
    Event,
}

/// Verbs a known reply token answers, `None` for free text
fn known_reply_verbs(text: &str) -> Option<&'static [CommandVerb]> {
    const OPENED: &[CommandVerb] = &[CommandVerb::Open, CommandVerb::ForceOpen];
    const CLOSED: &[CommandVerb] = &[CommandVerb::Close];
    const PONG: &[CommandVerb] = &[CommandVerb::Ping];
    const STATUS: &[CommandVerb] = &[CommandVerb::Status];
    const INFO: &[CommandVerb] = &[CommandVerb::Info];
    const TEST_MODE: &[CommandVerb] = &[CommandVerb::TestModeOn, CommandVerb::TestModeOff];

    let token = text.trim();
    match token {
        "PONG" => Some(PONG),
        "VALVE_OPENED" => Some(OPENED),
        "VALVE_CLOSED" | "VALVE_ALREADY_CLOSED" | "ALREADY_CLOSED" => Some(CLOSED),
        _ if token.starts_with("STATUS:") || token.starts_with("=== SYSTEM STATUS") => Some(STATUS),
        _ if token.starts_with("SYSTEM_INFO:") => Some(INFO),
        _ if token.starts_with("TEST_MODE") => Some(TEST_MODE),
        _ => None,
    }
}

/// Decide whether `text` answers the in-flight `verb`
pub fn classify_reply(verb: CommandVerb, text: &str) -> ReplyDisposition {
    if text.starts_with(ERROR_PREFIX) {
        return ReplyDisposition::Accept;
    }
    if text.starts_with(EVENT_PREFIX) {
        // only the reset acknowledgement answers a reset; announcements stay events
        return if verb == CommandVerb::ResetEmergency && is_reset_ack(text) {
            ReplyDisposition::Accept
        } else {
            ReplyDisposition::Event
        };
    }
    match known_reply_verbs(text) {
        Some(verbs) if verbs.contains(&verb) => ReplyDisposition::Accept,
        Some(_) => ReplyDisposition::Stale,
        None => ReplyDisposition::Accept,
    }
}

/// `EVENT: Emergency mode reset successfully.`
pub fn is_reset_ack(text: &str) -> bool {
    text.starts_with(EVENT_PREFIX) && text.to_ascii_uppercase().contains("RESET")
}

/// Text that only ever comes back as a command reply (`PONG`, `VALVE_OPENED`, ...)
pub fn is_reply_token(text: &str) -> bool {
    known_reply_verbs(text).is_some()
}

/// Device refusal text after `ERROR:`, if the reply is one
pub fn device_error(text: &str) -> Option<&str> {
    text.strip_prefix(ERROR_PREFIX).map(str::trim)
}

/// `VALVE_ALREADY_CLOSED` / `ALREADY_CLOSED`
pub fn is_already_closed(text: &str) -> bool {
    matches!(text.trim(), "VALVE_ALREADY_CLOSED" | "ALREADY_CLOSED")
}

// ============================================================================
// Line framing
// ============================================================================

/// One framed unit from the byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawLine {
    Line(String),
    /// A line exceeded the cap; its bytes up to the next newline are skipped
    Overflow,
}

/// Accumulates bytes and yields newline-terminated lines with a length cap
///
/// Unlike a terminating codec, overflow is reported once per offending line
/// and framing resumes at the following newline.
#[derive(Debug)]
pub struct LineAssembler {
    buf: BytesMut,
    max_len: usize,
    discarding: bool,
}

impl LineAssembler {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(max_len.max(64)),
            max_len,
            discarding: false,
        }
    }

    /// Buffer for direct reads (`AsyncReadExt::read_buf`)
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete line, if any
    pub fn next_line(&mut self) -> Option<RawLine> {
        loop {
            match self.buf.iter().position(|b| *b == b'\n') {
                Some(idx) => {
                    let line = self.buf.split_to(idx + 1);
                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    // newline excluded from the length check
                    if idx > self.max_len {
                        return Some(RawLine::Overflow);
                    }
                    let text = String::from_utf8_lossy(&line[..idx]);
                    return Some(RawLine::Line(text.trim_end_matches('\r').to_string()));
                },
                None => {
                    if self.buf.len() > self.max_len {
                        self.buf.advance(self.buf.len());
                        if !self.discarding {
                            self.discarding = true;
                            return Some(RawLine::Overflow);
                        }
                    }
                    return None;
                },
            }
        }
    }
}
