//! Device link: transport, command correlation and reconnection

pub mod command;
pub mod device_link;
pub mod reconnect;
pub mod transport;

pub use command::{CommandOutcome, CommandRequest, CommandResult, RejectReason, SUPERVISOR_ISSUER};
pub use device_link::{DeviceEvent, DeviceEventKind, DeviceLink, LinkSettings, LinkState, LinkStats};
pub use reconnect::ReconnectPolicy;
pub use transport::{transport_for_endpoint, MemoryPeer, MemoryTransport, Transport};
