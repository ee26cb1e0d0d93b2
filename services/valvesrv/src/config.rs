//! Service configuration
//!
//! Defaults, then `config/valvesrv.yaml` (or `--config`), then
//! `VALVESRV_*` environment variables (`VALVESRV_LINK__ENDPOINT=...`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::config_loader;
use errors::{ValveError, ValveResult};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::broadcast::{BroadcastSettings, JwtVerifier, StaticToken, StaticTokenVerifier, TokenVerifier, VerifierChain};
use crate::link::{LinkSettings, ReconnectPolicy};
use crate::protocol::codec::DEFAULT_MAX_LINE_LENGTH;
use crate::safety::supervisor::SupervisorSettings;
use crate::safety::SafetyThresholds;
use crate::simulator::SimulatorSettings;

pub const DEFAULT_CONFIG_PATH: &str = "config/valvesrv.yaml";
pub const ENV_PREFIX: &str = "VALVESRV_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValvesrvConfig {
    pub service: ServiceConfig,
    pub link: LinkConfig,
    pub safety: SafetyThresholds,
    pub pipeline: PipelineConfig,
    pub broadcast: BroadcastSettings,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
    pub simulator: SimulatorSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    /// Grace period for tasks to stop on shutdown
    pub shutdown_timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "valvesrv".to_string(),
            shutdown_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Serial path, `AUTO`, or `tcp://host:port`
    pub endpoint: String,
    pub baud_rate: u32,
    pub command_timeout_ms: u64,
    pub max_line_length: usize,
    pub probe_on_connect: bool,
    pub reconnect: ReconnectPolicy,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            endpoint: "AUTO".to_string(),
            baud_rate: 115_200,
            command_timeout_ms: 3_000,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            probe_on_connect: true,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl LinkConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn to_settings(&self) -> LinkSettings {
        LinkSettings {
            command_timeout: self.command_timeout(),
            max_line_length: self.max_line_length,
            reconnect: self.reconnect.clone(),
            probe_on_connect: self.probe_on_connect,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Link → supervisor sample queue; full drops the newest sample
    pub sample_queue_capacity: usize,
    pub event_queue_capacity: usize,
    pub storage_queue_capacity: usize,
    pub control_queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_queue_capacity: 64,
            event_queue_capacity: 64,
            storage_queue_capacity: 256,
            control_queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret shared with the HTTP layer
    pub jwt_secret: Option<String>,
    /// Fixed tokens, e.g. for kiosk displays
    pub tokens: HashMap<String, StaticToken>,
}

impl AuthConfig {
    pub fn build_verifier(&self) -> Arc<dyn TokenVerifier> {
        let mut chain = VerifierChain::new();
        if let Some(secret) = self.jwt_secret.as_deref().filter(|s| !s.is_empty()) {
            chain = chain.with(Arc::new(JwtVerifier::new(secret)));
        }
        if !self.tokens.is_empty() {
            chain = chain.with(Arc::new(StaticTokenVerifier::new(self.tokens.clone())));
        }
        if chain.is_empty() {
            warn!("No subscriber credentials configured, every subscriber will time out");
        }
        Arc::new(chain)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: Option<String>,
    pub file: bool,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            file: true,
            json: false,
        }
    }
}

impl ValvesrvConfig {
    /// Load from `path`, or the default file when present
    pub fn load(path: Option<&Path>) -> ValveResult<Self> {
        let file: Option<PathBuf> = match path {
            Some(p) => Some(p.to_path_buf()),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                default.exists().then_some(default)
            },
        };
        if file.is_none() {
            info!("No config file, using defaults and environment");
        }

        let config: Self = config_loader::load_layered(&Self::default(), file.as_deref(), ENV_PREFIX)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ValveResult<()> {
        let invalid = |field: &str, reason: &str| {
            Err(ValveError::InvalidConfig {
                field: field.to_string(),
                reason: reason.to_string(),
            })
        };

        if self.link.endpoint.trim().is_empty() {
            return invalid("link.endpoint", "cannot be empty");
        }
        if self.link.baud_rate == 0 {
            return invalid("link.baud_rate", "must be positive");
        }
        if self.link.command_timeout_ms == 0 {
            return invalid("link.command_timeout_ms", "must be positive");
        }
        if self.link.max_line_length == 0 {
            return invalid("link.max_line_length", "must be positive");
        }
        if self.link.reconnect.initial_delay_ms == 0
            || self.link.reconnect.max_delay_ms < self.link.reconnect.initial_delay_ms
        {
            return invalid(
                "link.reconnect",
                "need 0 < initial_delay_ms <= max_delay_ms",
            );
        }

        let s = &self.safety;
        for (field, value) in [
            ("safety.max_pressure", s.max_pressure),
            ("safety.critical_concentration", s.critical_concentration),
            ("safety.min_src_concentration", s.min_src_concentration),
            ("safety.max_dst_concentration", s.max_dst_concentration),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return invalid(field, "must be a positive number");
            }
        }
        if s.min_src_concentration >= s.critical_concentration {
            return invalid(
                "safety.min_src_concentration",
                "must be below critical_concentration",
            );
        }

        let p = &self.pipeline;
        for (field, value) in [
            ("pipeline.sample_queue_capacity", p.sample_queue_capacity),
            ("pipeline.event_queue_capacity", p.event_queue_capacity),
            ("pipeline.storage_queue_capacity", p.storage_queue_capacity),
            ("pipeline.control_queue_capacity", p.control_queue_capacity),
            ("broadcast.queue_capacity", self.broadcast.queue_capacity),
        ] {
            if value == 0 {
                return invalid(field, "must be positive");
            }
        }
        if self.broadcast.heartbeat_interval_ms == 0 || self.broadcast.auth_grace_ms == 0 {
            return invalid("broadcast", "heartbeat_interval_ms and auth_grace_ms must be positive");
        }

        Ok(())
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            thresholds: self.safety.clone(),
            command_timeout: self.link.command_timeout(),
            control_capacity: self.pipeline.control_queue_capacity,
        }
    }
}
