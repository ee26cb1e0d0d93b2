//! Service assembly
//!
//! Wires transport → link → supervisor → broadcaster/storage and owns the
//! background tasks. This is the surface an HTTP or WebSocket layer talks to.

use std::sync::Arc;
use std::time::Duration;

use errors::{ValveError, ValveResult};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broadcast::{BroadcastStats, Broadcaster, Principal, SubscriberId, SubscriberSink};
use crate::config::ValvesrvConfig;
use crate::error::AuthError;
use crate::link::{
    transport_for_endpoint, CommandResult, DeviceLink, LinkStats, MemoryTransport, Transport,
};
use crate::protocol::CommandVerb;
use crate::safety::supervisor::Supervisor;
use crate::safety::{SupervisorHandle, SupervisorStats, SystemState};
use crate::simulator::{DeviceSimulator, SimulatorControl};
use crate::storage::{self, Recorder, StorageHandle, TracingRecorder};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub failed: u64,
}

/// Counters from every stage of the pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub link: LinkStats,
    pub supervisor: SupervisorStats,
    pub broadcast: BroadcastStats,
    pub storage: StorageStats,
}

pub struct ValveService {
    link: DeviceLink,
    supervisor: SupervisorHandle,
    broadcaster: Arc<Broadcaster>,
    storage: StorageHandle,
    simulator: Option<SimulatorControl>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
}

impl ValveService {
    /// Build from configuration: the configured endpoint, or an in-process
    /// simulated device when `simulate` is set
    pub fn from_config(config: ValvesrvConfig, simulate: bool) -> ValveResult<Self> {
        let recorder: Arc<dyn Recorder> = Arc::new(TracingRecorder);
        if !simulate {
            let transport = transport_for_endpoint(&config.link.endpoint, config.link.baud_rate);
            return Self::start(config, transport, recorder);
        }

        let (transport, peer) = MemoryTransport::new();
        let (simulator, control) = DeviceSimulator::new(config.simulator.clone());
        let mut service = Self::start(config, transport, recorder)?;
        let task = tokio::spawn(simulator.serve(peer, service.shutdown.child_token()));
        service.tasks.push(("simulator", task));
        service.simulator = Some(control);
        info!("[OK] Simulated device attached");
        Ok(service)
    }

    /// Start the pipeline on an explicit transport and recorder
    pub fn start(
        config: ValvesrvConfig,
        transport: Arc<dyn Transport>,
        recorder: Arc<dyn Recorder>,
    ) -> ValveResult<Self> {
        config.validate()?;
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let (storage, storage_task) = storage::spawn_worker(
            recorder,
            config.pipeline.storage_queue_capacity,
            shutdown.child_token(),
        );
        tasks.push(("storage", storage_task));

        let broadcaster = Broadcaster::new(
            config.auth.build_verifier(),
            config.broadcast.clone(),
            shutdown.child_token(),
        );
        tasks.push(("heartbeat", broadcaster.start()));

        let (sample_tx, sample_rx) = mpsc::channel(config.pipeline.sample_queue_capacity);
        let (event_tx, event_rx) = mpsc::channel(config.pipeline.event_queue_capacity);
        let link = DeviceLink::new(
            transport,
            config.link.to_settings(),
            sample_tx,
            event_tx,
            shutdown.child_token(),
        );

        let (supervisor, handle) = Supervisor::new(
            config.supervisor_settings(),
            link.clone(),
            Arc::clone(&broadcaster),
            storage.clone(),
            sample_rx,
            event_rx,
            shutdown.child_token(),
        );
        tasks.push(("supervisor", supervisor.spawn()));
        tasks.push(("link", link.start()));

        info!("[OK] Valve service started on {}", link.endpoint());
        Ok(Self {
            link,
            supervisor: handle,
            broadcaster,
            storage,
            simulator: None,
            tasks,
            shutdown,
            shutdown_timeout: Duration::from_millis(config.service.shutdown_timeout_ms),
        })
    }

    // ========================================================================
    // Commands and state
    // ========================================================================

    pub async fn submit_command(&self, verb: CommandVerb, issuer: &str) -> ValveResult<CommandResult> {
        self.supervisor.submit_command(verb, issuer).await
    }

    pub fn current_state(&self) -> Arc<SystemState> {
        self.supervisor.current_state()
    }

    pub fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor
    }

    pub fn link(&self) -> &DeviceLink {
        &self.link
    }

    /// Present only for simulated devices
    pub fn simulator(&self) -> Option<&SimulatorControl> {
        self.simulator.as_ref()
    }

    // ========================================================================
    // Subscribers
    // ========================================================================

    pub fn subscribe(&self, sink: Arc<dyn SubscriberSink>) -> SubscriberId {
        self.broadcaster.subscribe(sink)
    }

    pub fn subscribe_with_token(
        &self,
        sink: Arc<dyn SubscriberSink>,
        token: &str,
    ) -> Result<(SubscriberId, Principal), AuthError> {
        self.broadcaster.subscribe_with_token(sink, token)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.broadcaster.unsubscribe(id)
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            link: self.link.stats(),
            supervisor: self.supervisor.stats(),
            broadcast: self.broadcaster.stats(),
            storage: StorageStats {
                enqueued: self.storage.enqueued(),
                dropped: self.storage.dropped(),
                failed: self.storage.failed(),
            },
        }
    }

    // ========================================================================
    // Logging
    // ========================================================================

    /// Swap the process log filter (`debug`, `warn,valvesrv=trace`) while running
    pub fn set_log_filter(&self, filter: &str) -> ValveResult<()> {
        common::logging::set_log_level(filter).map_err(|reason| ValveError::InvalidConfig {
            field: "logging.level".to_string(),
            reason,
        })
    }

    /// Active filter directives, `None` when logging was never initialized
    pub fn log_filter(&self) -> Option<String> {
        common::logging::get_log_level()
    }

    /// Stop every task, waiting up to the configured shutdown timeout
    pub async fn shutdown(self) {
        info!("Shutting down valve service");
        self.link.shutdown().await;
        self.broadcaster.shutdown();
        self.shutdown.cancel();

        let limit = self.shutdown_timeout;
        join_all(self.tasks.into_iter().map(|(name, task)| async move {
            match tokio::time::timeout(limit, task).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => warn!("{} task failed: {}", name, e),
                Err(_) => warn!("{} task did not stop within {:?}", name, limit),
            }
        }))
        .await;
        info!("[OK] Valve service stopped");
    }
}
