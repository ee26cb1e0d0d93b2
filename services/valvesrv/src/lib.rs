//! Valve Service Library (valvesrv)
//!
//! Telemetry ingestion and safety supervision for a single gas-transfer
//! valve controller attached over a serial line.
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │  Transport   │───►│  DeviceLink  │───►│  Supervisor  │
//! │ (serial/tcp) │    │ (codec, slot)│    │ (safety mode)│
//! └──────────────┘    └──────────────┘    └──────┬───────┘
//!                                               │
//!                          ┌────────────────────┼────────────────┐
//!                          ▼                                     ▼
//!                 ┌──────────────┐                      ┌──────────────┐
//!                 │ Broadcaster  │                      │   Storage    │
//!                 │ (subscribers)│                      │  (recorder)  │
//!                 └──────────────┘                      └──────────────┘
//! ```
//!
//! - **`protocol`**: line codec for telemetry, replies and device events
//! - **`link`**: transports, one-command-in-flight correlation, reconnect
//! - **`safety`**: threshold rules, sticky emergency mode, alerts
//! - **`broadcast`**: authenticated subscriber fan-out with bounded mailboxes
//! - **`storage`**: non-blocking hand-off to a persistence collaborator
//! - **`simulator`**: in-process device for development and tests

pub mod broadcast;
pub mod config;
pub mod error;
pub mod link;
pub mod protocol;
pub mod safety;
pub mod service;
pub mod simulator;
pub mod storage;

pub use config::ValvesrvConfig;
pub use error::{AuthError, LinkError, ProtocolError, Result};
pub use service::{ServiceStats, ValveService};
