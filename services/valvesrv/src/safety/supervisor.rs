//! Safety & state supervisor
//!
//! A single task owns [`SystemState`] and applies every input in order:
//! decoded samples, device events, link state changes, command submissions
//! and command completions. Commands run on their own tasks and report
//! back, so a slow device reply never stalls sample processing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::alert::Alert;
use super::rules::{evaluate, kinds, EvaluationMode, SafetyThresholds, ViolationKind};
use super::state::{next_mode, ModeChange, SafetyTrigger, SystemState};
use crate::broadcast::{Broadcaster, LogEvent, LogLevel, OutboundMessage, ValveEvent};
use crate::error::Result;
use crate::link::{
    CommandOutcome, CommandRequest, CommandResult, DeviceEvent, DeviceEventKind, DeviceLink,
    LinkState, RejectReason, SUPERVISOR_ISSUER,
};
use crate::protocol::codec;
use crate::protocol::{CommandVerb, TelemetrySample, ValvePosition};
use crate::storage::{Record, StorageHandle};
use errors::ValveError;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub thresholds: SafetyThresholds,
    pub command_timeout: Duration,
    pub control_capacity: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            thresholds: SafetyThresholds::default(),
            command_timeout: Duration::from_millis(3_000),
            control_capacity: 64,
        }
    }
}

struct Submission {
    request: CommandRequest,
    reply: oneshot::Sender<CommandResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    External,
    InternalClose,
}

struct Completion {
    result: CommandResult,
    purpose: Purpose,
    reply: Option<oneshot::Sender<CommandResult>>,
}

#[derive(Debug, Default)]
struct SupervisorCounters {
    samples_processed: AtomicU64,
    unsafe_samples: AtomicU64,
    emergencies: AtomicU64,
    alerts_raised: AtomicU64,
    internal_closes: AtomicU64,
    commands_ack: AtomicU64,
    commands_rejected: AtomicU64,
    commands_timeout: AtomicU64,
    commands_link_down: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorStats {
    pub samples_processed: u64,
    pub unsafe_samples: u64,
    pub emergencies: u64,
    pub alerts_raised: u64,
    pub internal_closes: u64,
    pub commands_ack: u64,
    pub commands_rejected: u64,
    pub commands_timeout: u64,
    pub commands_link_down: u64,
}

impl SupervisorCounters {
    fn count_outcome(&self, outcome: &CommandOutcome) {
        let counter = match outcome {
            CommandOutcome::Ack(_) => &self.commands_ack,
            CommandOutcome::Rejected(_) => &self.commands_rejected,
            CommandOutcome::Timeout => &self.commands_timeout,
            CommandOutcome::LinkDown => &self.commands_link_down,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SupervisorStats {
        SupervisorStats {
            samples_processed: self.samples_processed.load(Ordering::Relaxed),
            unsafe_samples: self.unsafe_samples.load(Ordering::Relaxed),
            emergencies: self.emergencies.load(Ordering::Relaxed),
            alerts_raised: self.alerts_raised.load(Ordering::Relaxed),
            internal_closes: self.internal_closes.load(Ordering::Relaxed),
            commands_ack: self.commands_ack.load(Ordering::Relaxed),
            commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
            commands_timeout: self.commands_timeout.load(Ordering::Relaxed),
            commands_link_down: self.commands_link_down.load(Ordering::Relaxed),
        }
    }
}

/// Caller-facing side of the supervisor
#[derive(Clone)]
pub struct SupervisorHandle {
    control_tx: mpsc::Sender<Submission>,
    state_rx: watch::Receiver<Arc<SystemState>>,
    command_timeout: Duration,
    counters: Arc<SupervisorCounters>,
}

impl SupervisorHandle {
    /// Gate, execute and record one command on behalf of `issuer`
    pub async fn submit_command(&self, verb: CommandVerb, issuer: &str) -> Result<CommandResult> {
        self.submit(CommandRequest::new(verb, issuer, self.command_timeout))
            .await
    }

    pub async fn submit(&self, request: CommandRequest) -> Result<CommandResult> {
        let (reply, rx) = oneshot::channel();
        self.control_tx
            .send(Submission { request, reply })
            .await
            .map_err(|_| ValveError::ServiceUnavailable("supervisor stopped".to_string()))?;
        rx.await
            .map_err(|_| ValveError::ServiceUnavailable("supervisor stopped".to_string()))
    }

    pub fn current_state(&self) -> Arc<SystemState> {
        Arc::clone(&self.state_rx.borrow())
    }

    pub fn subscribe_state(&self) -> watch::Receiver<Arc<SystemState>> {
        self.state_rx.clone()
    }

    pub fn stats(&self) -> SupervisorStats {
        self.counters.snapshot()
    }
}

pub struct Supervisor {
    thresholds: SafetyThresholds,
    command_timeout: Duration,
    link: DeviceLink,
    broadcaster: Arc<Broadcaster>,
    storage: StorageHandle,

    state: SystemState,
    state_tx: watch::Sender<Arc<SystemState>>,
    close_in_flight: bool,

    samples_rx: mpsc::Receiver<TelemetrySample>,
    events_rx: mpsc::Receiver<DeviceEvent>,
    link_rx: watch::Receiver<LinkState>,
    control_rx: mpsc::Receiver<Submission>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,

    counters: Arc<SupervisorCounters>,
    shutdown: CancellationToken,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: SupervisorSettings,
        link: DeviceLink,
        broadcaster: Arc<Broadcaster>,
        storage: StorageHandle,
        samples_rx: mpsc::Receiver<TelemetrySample>,
        events_rx: mpsc::Receiver<DeviceEvent>,
        shutdown: CancellationToken,
    ) -> (Self, SupervisorHandle) {
        let link_rx = link.subscribe_state();
        let state = SystemState {
            link: *link_rx.borrow(),
            ..Default::default()
        };
        let (state_tx, state_rx) = watch::channel(Arc::new(state.clone()));
        let (control_tx, control_rx) = mpsc::channel(settings.control_capacity.max(1));
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(SupervisorCounters::default());

        let handle = SupervisorHandle {
            control_tx,
            state_rx,
            command_timeout: settings.command_timeout,
            counters: Arc::clone(&counters),
        };

        let supervisor = Self {
            thresholds: settings.thresholds,
            command_timeout: settings.command_timeout,
            link,
            broadcaster,
            storage,
            state,
            state_tx,
            close_in_flight: false,
            samples_rx,
            events_rx,
            link_rx,
            control_rx,
            completions_tx,
            completions_rx,
            counters,
            shutdown,
        };
        (supervisor, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!("[OK] Supervisor started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(done) = self.completions_rx.recv() => self.on_completed(done),
                Some(sample) = self.samples_rx.recv() => self.on_sample(sample),
                Some(event) = self.events_rx.recv() => self.on_device_event(event),
                Ok(()) = self.link_rx.changed() => {
                    let state = *self.link_rx.borrow_and_update();
                    self.on_link_state(state);
                },
                Some(submission) = self.control_rx.recv() => self.on_submit(submission),
            }
        }
        debug!("Supervisor stopped");
    }

    // ========================================================================
    // Samples
    // ========================================================================

    fn on_sample(&mut self, sample: TelemetrySample) {
        self.counters.samples_processed.fetch_add(1, Ordering::Relaxed);

        let violations = evaluate(&sample, &self.thresholds, EvaluationMode::Monitoring);
        let violation_kinds = kinds(&violations);
        if !violations.is_empty() {
            self.counters.unsafe_samples.fetch_add(1, Ordering::Relaxed);
            debug!("Sample t={} violates {:?}", sample.t, violation_kinds);
        }

        let (mode, change) = next_mode(
            &self.state.safety,
            SafetyTrigger::Sample {
                violations: violation_kinds,
                device_flag: sample.em,
            },
            Utc::now(),
        );
        self.state.safety = mode;
        self.state.valve = sample.valve;
        self.state.last_sample = Some(sample.clone());

        if change == ModeChange::Entered {
            self.counters.emergencies.fetch_add(1, Ordering::Relaxed);
            let alert = if violations.is_empty() {
                Alert::device_emergency("em flag set", Some(&sample))
            } else {
                Alert::safety_violation(violations.clone(), &sample)
            };
            error!("{}", alert.message);
            self.raise(alert);
        }

        if !violations.is_empty() && sample.valve == ValvePosition::Open && !self.close_in_flight {
            self.issue_internal_close();
        }

        self.broadcaster.publish(OutboundMessage::Telemetry(sample.clone()));
        self.storage.record(Record::Sample(sample));
        self.publish_state();
    }

    fn issue_internal_close(&mut self) {
        self.close_in_flight = true;
        self.counters.internal_closes.fetch_add(1, Ordering::Relaxed);
        let request = CommandRequest::new(CommandVerb::Close, SUPERVISOR_ISSUER, self.command_timeout);
        warn!(request_id = %request.id, "Valve open during safety violation, closing");
        self.dispatch(request, Purpose::InternalClose, None);
    }

    // ========================================================================
    // Device events and link state
    // ========================================================================

    fn on_device_event(&mut self, event: DeviceEvent) {
        let announces_emergency = event.kind == DeviceEventKind::Event && announces_emergency(&event.text);

        if announces_emergency {
            let (mode, change) = next_mode(
                &self.state.safety,
                SafetyTrigger::DeviceEmergency(event.text.clone()),
                Utc::now(),
            );
            self.state.safety = mode;
            if change == ModeChange::Entered {
                self.counters.emergencies.fetch_add(1, Ordering::Relaxed);
                let alert = Alert::device_emergency(&event.text, self.state.last_sample.as_ref());
                error!("{}", alert.message);
                self.raise(alert);
            }
            self.publish_state();
        }

        let level = if announces_emergency || codec::device_error(&event.text).is_some() {
            LogLevel::Warning
        } else {
            LogLevel::Info
        };
        self.broadcaster
            .publish(OutboundMessage::Log(LogEvent::new(level, event.text)));
    }

    fn on_link_state(&mut self, link: LinkState) {
        if self.state.link == link {
            return;
        }
        match link {
            LinkState::Connected => info!("Device link up"),
            LinkState::Disconnected => warn!("Device link down"),
            LinkState::Connecting => debug!("Device link connecting"),
        }
        self.state.link = link;
        self.broadcaster
            .publish(OutboundMessage::LinkStatus { state: link });
        self.publish_state();
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn on_submit(&mut self, submission: Submission) {
        let Submission { request, reply } = submission;
        info!(
            request_id = %request.id,
            verb = %request.verb,
            "Command requested by {}",
            request.issuer
        );

        match self.gate(&request) {
            Some(reason) => {
                warn!(request_id = %request.id, verb = %request.verb, "Rejected locally: {:?}", reason);
                let result = request.complete(CommandOutcome::Rejected(reason));
                self.finish(result, Some(reply));
            },
            None => self.dispatch(request, Purpose::External, Some(reply)),
        }
    }

    /// Local pre-checks; `None` means send to the device
    fn gate(&self, request: &CommandRequest) -> Option<RejectReason> {
        match request.verb {
            CommandVerb::Open => {
                if self.state.emergency() {
                    return Some(RejectReason::Emergency);
                }
                let Some(sample) = &self.state.last_sample else {
                    return Some(RejectReason::NoTelemetry);
                };
                let unsafe_kinds = kinds(&evaluate(sample, &self.thresholds, EvaluationMode::OpenIntent));
                (!unsafe_kinds.is_empty()).then_some(RejectReason::UnsafeConditions(unsafe_kinds))
            },
            CommandVerb::ResetEmergency => match self.current_violations() {
                None => Some(RejectReason::NoTelemetry),
                Some(still) if !still.is_empty() => Some(RejectReason::StillUnsafe(still)),
                Some(_) => None,
            },
            _ => None,
        }
    }

    /// Monitoring violations on the last sample, `None` before any sample
    fn current_violations(&self) -> Option<Vec<ViolationKind>> {
        self.state
            .last_sample
            .as_ref()
            .map(|s| kinds(&evaluate(s, &self.thresholds, EvaluationMode::Monitoring)))
    }

    fn dispatch(
        &self,
        request: CommandRequest,
        purpose: Purpose,
        reply: Option<oneshot::Sender<CommandResult>>,
    ) {
        let link = self.link.clone();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = link.execute(request).await;
            let _ = completions.send(Completion {
                result,
                purpose,
                reply,
            });
        });
    }

    fn on_completed(&mut self, completion: Completion) {
        let Completion {
            mut result,
            purpose,
            reply,
        } = completion;

        if purpose == Purpose::InternalClose {
            self.close_in_flight = false;
        }

        if let CommandOutcome::Rejected(RejectReason::Device(text)) = &result.outcome {
            if result.verb == CommandVerb::Close && codec::is_already_closed(text) {
                result.outcome = CommandOutcome::Ack(text.clone());
            }
        }

        if result.outcome.is_ack() {
            match result.verb {
                CommandVerb::Open => self.state.valve = ValvePosition::Open,
                CommandVerb::ForceOpen => {
                    self.state.valve = ValvePosition::Open;
                    let alert = Alert::force_open(&result.issuer, self.state.emergency());
                    warn!("{}", alert.message);
                    self.raise(alert);
                },
                CommandVerb::Close => self.state.valve = ValvePosition::Closed,
                CommandVerb::ResetEmergency => self.apply_reset(&mut result),
                _ => {},
            }
        }

        if purpose == Purpose::InternalClose && !result.outcome.is_ack() {
            warn!(request_id = %result.request_id, "Safety close failed: {}", result.outcome.label());
        }

        self.finish(result, reply);
    }

    /// Clear emergency only if the latest sample is clean
    fn apply_reset(&mut self, result: &mut CommandResult) {
        let still = self.current_violations().unwrap_or_default();
        if !still.is_empty() {
            warn!(
                request_id = %result.request_id,
                "Device reset acknowledged but {:?} persists, emergency kept",
                still
            );
            result.outcome = CommandOutcome::Rejected(RejectReason::StillUnsafe(still));
            return;
        }

        let (mode, change) = next_mode(&self.state.safety, SafetyTrigger::ResetAccepted, Utc::now());
        self.state.safety = mode;
        if change == ModeChange::Cleared {
            info!("[OK] Emergency cleared by {}", result.issuer);
        }
    }

    fn finish(&mut self, result: CommandResult, reply: Option<oneshot::Sender<CommandResult>>) {
        self.state.last_command_at = Some(result.completed_at);
        self.counters.count_outcome(&result.outcome);
        debug!(
            request_id = %result.request_id,
            verb = %result.verb,
            outcome = result.outcome.label(),
            "Command finished"
        );

        self.broadcaster
            .publish(OutboundMessage::ValveEvent(ValveEvent::from_result(
                &result,
                self.state.valve,
                self.state.emergency(),
            )));
        self.storage.record(Record::Command(result.clone()));
        self.publish_state();

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    // ========================================================================
    // Output
    // ========================================================================

    fn raise(&self, alert: Alert) {
        self.counters.alerts_raised.fetch_add(1, Ordering::Relaxed);
        self.broadcaster.publish(OutboundMessage::Alert(alert.clone()));
        self.storage.record(Record::Alert(alert));
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(Arc::new(self.state.clone()));
    }
}

/// `EVENT: OVER_PRESSURE - emergency mode triggered.` and the like
fn announces_emergency(text: &str) -> bool {
    let upper = text.to_ascii_uppercase();
    upper.contains("EMERGENCY") && !upper.contains("RESET")
}
