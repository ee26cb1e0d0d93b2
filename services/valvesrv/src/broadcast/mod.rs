//! Subscriber fan-out

pub mod auth;
pub mod broadcaster;
pub mod mailbox;
pub mod messages;
pub mod sink;

pub use auth::{JwtVerifier, Principal, Role, StaticToken, StaticTokenVerifier, TokenVerifier, VerifierChain};
pub use broadcaster::{BroadcastSettings, BroadcastStats, Broadcaster, SubscriberId, SubscriberInfo};
pub use mailbox::Mailbox;
pub use messages::{InboundMessage, LogEvent, LogLevel, OutboundMessage, ValveEvent};
pub use sink::{ChannelSink, SinkFrame, SubscriberSink};
