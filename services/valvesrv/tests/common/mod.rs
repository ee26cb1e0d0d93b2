//! Common test utilities and helpers

#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use valvesrv::broadcast::{ChannelSink, Role, SinkFrame, StaticToken};
use valvesrv::link::{LinkState, MemoryPeer, MemoryTransport};
use valvesrv::simulator::{DeviceSimulator, SimulatorControl};
use valvesrv::storage::MemoryRecorder;
use valvesrv::{ValveService, ValvesrvConfig};

pub const VIEWER_TOKEN: &str = "viewer-token";

/// Fast timeouts, no periodic telemetry, one static viewer token
pub fn test_config() -> ValvesrvConfig {
    let mut config = ValvesrvConfig::default();
    config.link.endpoint = "memory".to_string();
    config.link.command_timeout_ms = 500;
    config.link.probe_on_connect = false;
    config.link.reconnect.initial_delay_ms = 100;
    config.link.reconnect.max_delay_ms = 400;
    config.link.reconnect.jitter = false;
    config.simulator.telemetry_interval_ms = 3_600_000;
    config.simulator.noise = false;
    config.auth.tokens = HashMap::from([(
        VIEWER_TOKEN.to_string(),
        StaticToken {
            subject: "test-viewer".to_string(),
            role: Role::Viewer,
        },
    )]);
    config
}

pub struct Harness {
    pub service: ValveService,
    pub device: SimulatorControl,
    pub recorder: Arc<MemoryRecorder>,
    pub transport: Arc<MemoryTransport>,
    device_stop: CancellationToken,
}

impl Harness {
    /// Service wired to a simulated device, returned once the link is up
    pub async fn start(config: ValvesrvConfig) -> Self {
        let (transport, peer) = MemoryTransport::new();
        let (simulator, device) = DeviceSimulator::new(config.simulator.clone());
        let device_stop = CancellationToken::new();
        tokio::spawn(simulator.serve(peer, device_stop.clone()));

        let recorder = MemoryRecorder::new();
        let service = ValveService::start(config, transport.clone(), recorder.clone()).unwrap();
        wait_for_link(&service, LinkState::Connected).await;

        Self {
            service,
            device,
            recorder,
            transport,
            device_stop,
        }
    }

    /// Push one telemetry line and wait until the supervisor has seen it
    pub async fn emit_sample(&self) {
        let before = self.service.stats().supervisor.samples_processed;
        self.device.emit_now();
        wait_until(|| self.service.stats().supervisor.samples_processed > before).await;
    }

    pub async fn stop(self) {
        self.service.shutdown().await;
        self.device_stop.cancel();
    }
}

/// Service wired to a bare [`MemoryPeer`] the test drives by hand
pub fn start_with_peer(config: ValvesrvConfig) -> (ValveService, Arc<MemoryTransport>, MemoryPeer) {
    let (transport, peer) = MemoryTransport::new();
    let service = ValveService::start(config, transport.clone(), MemoryRecorder::new()).unwrap();
    (service, transport, peer)
}

pub async fn wait_for_link(service: &ValveService, state: LinkState) {
    let mut rx = service.link().subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .expect("link state not reached")
        .unwrap();
}

/// Poll `condition` every 10ms for up to 5s
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// Authenticated channel subscriber
pub fn viewer(service: &ValveService, capacity: usize) -> mpsc::Receiver<SinkFrame> {
    let (sink, rx) = ChannelSink::new(capacity);
    service
        .subscribe_with_token(Arc::new(sink), VIEWER_TOKEN)
        .unwrap();
    rx
}

/// Next text frame whose `type` is `kind`
pub async fn next_of_kind(rx: &mut mpsc::Receiver<SinkFrame>, kind: &str) -> serde_json::Value {
    within(async {
        loop {
            match rx.recv().await {
                Some(SinkFrame::Text(text)) => {
                    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                    if value["type"] == kind {
                        return value;
                    }
                },
                Some(SinkFrame::Close(reason)) => panic!("subscriber closed: {}", reason),
                None => panic!("subscriber channel ended"),
            }
        }
    })
    .await
}
