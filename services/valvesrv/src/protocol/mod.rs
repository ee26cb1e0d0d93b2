//! Device line protocol

pub mod codec;
pub mod types;

pub use codec::{classify_reply, decode, encode, LineAssembler, RawLine, ReplyDisposition};
pub use types::{CommandVerb, DecodedLine, TelemetrySample, ValvePosition};
