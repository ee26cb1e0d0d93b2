//! Device link
//!
//! Owns the single physical connection. One task runs the connection
//! lifecycle (open, read loop, reconnect with backoff); callers issue
//! commands through [`DeviceLink::execute`], which serializes them through
//! a FIFO in-flight slot so at most one command is ever outstanding.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::command::{CommandOutcome, CommandRequest, CommandResult, SUPERVISOR_ISSUER};
use super::reconnect::{Backoff, ReconnectPolicy};
use super::transport::{BoxedIo, Transport};
use crate::error::{LinkError, ProtocolError};
use crate::protocol::codec::{self, LineAssembler, RawLine, ReplyDisposition};
use crate::protocol::{CommandVerb, DecodedLine, TelemetrySample};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEventKind {
    /// `EVENT:` line
    Event,
    /// Any other free text outside a command exchange
    Unsolicited,
}

/// Non-telemetry text from the device, forwarded to the supervisor
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEvent {
    pub text: String,
    pub kind: DeviceEventKind,
}

#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub command_timeout: Duration,
    pub max_line_length: usize,
    pub reconnect: ReconnectPolicy,
    pub probe_on_connect: bool,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_millis(3_000),
            max_line_length: codec::DEFAULT_MAX_LINE_LENGTH,
            reconnect: ReconnectPolicy::default(),
            probe_on_connect: true,
        }
    }
}

#[derive(Debug, Default)]
struct LinkCounters {
    samples_received: AtomicU64,
    samples_dropped: AtomicU64,
    lines_malformed: AtomicU64,
    replies_discarded: AtomicU64,
    events_dropped: AtomicU64,
    connect_attempts: AtomicU64,
    disconnects: AtomicU64,
    commands_sent: AtomicU64,
}

/// Point-in-time link counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub samples_received: u64,
    pub samples_dropped: u64,
    pub lines_malformed: u64,
    pub replies_discarded: u64,
    pub events_dropped: u64,
    pub connect_attempts: u64,
    pub disconnects: u64,
    pub commands_sent: u64,
}

struct PendingCommand {
    id: Uuid,
    verb: CommandVerb,
    tx: oneshot::Sender<CommandOutcome>,
}

type LinkReader = ReadHalf<BoxedIo>;
type LinkWriter = WriteHalf<BoxedIo>;

/// Cheap clonable handle to the link
#[derive(Clone)]
pub struct DeviceLink {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    transport: Arc<dyn Transport>,
    settings: LinkSettings,
    writer: tokio::sync::Mutex<Option<LinkWriter>>,
    /// FIFO-fair; held for the whole write-and-wait exchange
    slot: tokio::sync::Mutex<()>,
    pending: Mutex<Option<PendingCommand>>,
    state_tx: watch::Sender<LinkState>,
    sample_tx: mpsc::Sender<TelemetrySample>,
    event_tx: mpsc::Sender<DeviceEvent>,
    counters: LinkCounters,
    /// Cancelled when the current connection must be torn down
    conn_token: Mutex<Option<CancellationToken>>,
    conn_error: Mutex<Option<LinkError>>,
    shutdown: CancellationToken,
}

impl DeviceLink {
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: LinkSettings,
        sample_tx: mpsc::Sender<TelemetrySample>,
        event_tx: mpsc::Sender<DeviceEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        Self {
            inner: Arc::new(LinkInner {
                transport,
                settings,
                writer: tokio::sync::Mutex::new(None),
                slot: tokio::sync::Mutex::new(()),
                pending: Mutex::new(None),
                state_tx,
                sample_tx,
                event_tx,
                counters: LinkCounters::default(),
                conn_token: Mutex::new(None),
                conn_error: Mutex::new(None),
                shutdown,
            }),
        }
    }

    /// Spawn the connection task: connect, read, reconnect until shutdown
    pub fn start(&self) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(&self.inner).run())
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.inner.state_tx.subscribe()
    }

    pub fn endpoint(&self) -> String {
        self.inner.transport.endpoint()
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.settings.command_timeout
    }

    /// Send one command and wait for its reply
    ///
    /// Returns `LinkDown` immediately, without queueing, when the link is not
    /// connected. Otherwise waits for the in-flight slot in FIFO order; the
    /// request's timeout starts once the slot is held.
    pub async fn execute(&self, request: CommandRequest) -> CommandResult {
        self.inner.execute(request).await
    }

    /// Stop the connection task and fail any in-flight command
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.teardown(LinkError::Shutdown).await;
    }

    pub fn stats(&self) -> LinkStats {
        let c = &self.inner.counters;
        LinkStats {
            samples_received: c.samples_received.load(Ordering::Relaxed),
            samples_dropped: c.samples_dropped.load(Ordering::Relaxed),
            lines_malformed: c.lines_malformed.load(Ordering::Relaxed),
            replies_discarded: c.replies_discarded.load(Ordering::Relaxed),
            events_dropped: c.events_dropped.load(Ordering::Relaxed),
            connect_attempts: c.connect_attempts.load(Ordering::Relaxed),
            disconnects: c.disconnects.load(Ordering::Relaxed),
            commands_sent: c.commands_sent.load(Ordering::Relaxed),
        }
    }
}

impl LinkInner {
    fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: LinkState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!("Link state: {:?} -> {:?}", *current, state);
                *current = state;
                true
            }
        });
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    async fn run(self: Arc<Self>) {
        let endpoint = self.transport.endpoint();
        let mut backoff = Backoff::new(self.settings.reconnect.clone());
        // first attempt is immediate
        let mut wait = Duration::ZERO;

        loop {
            if !wait.is_zero() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {},
                }
            }

            let attempt = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                r = self.connect() => r,
            };

            let (reader, token) = match attempt {
                Ok(conn) => {
                    backoff.succeeded();
                    conn
                },
                Err(LinkError::Shutdown) => break,
                Err(e) => {
                    wait = backoff.failed();
                    warn!(
                        "Connection attempt {} to {} failed: {}",
                        backoff.failures(),
                        endpoint,
                        e
                    );
                    if !backoff.may_retry() {
                        error!("Giving up on {} after {} attempts", endpoint, backoff.failures());
                        break;
                    }
                    debug!("Next attempt in {:?}", wait);
                    continue;
                },
            };

            match self.read_loop(reader, token).await {
                Some(reason) => {
                    warn!("Link lost: {}", reason);
                    self.teardown(reason).await;
                    wait = self.settings.reconnect.delay_after(1);
                    info!("Reconnecting to {} in {:?}", endpoint, wait);
                },
                None => break,
            }
        }

        self.teardown(LinkError::Shutdown).await;
        debug!("Link task stopped");
    }

    /// One connection attempt; on success the link is CONNECTED
    async fn connect(self: &Arc<Self>) -> Result<(LinkReader, CancellationToken), LinkError> {
        if self.shutdown.is_cancelled() {
            return Err(LinkError::Shutdown);
        }
        self.counters.connect_attempts.fetch_add(1, Ordering::Relaxed);
        self.set_state(LinkState::Connecting);

        let io = match self.transport.open().await {
            Ok(io) => io,
            Err(e) => {
                self.set_state(LinkState::Disconnected);
                return Err(e);
            },
        };

        let (reader, writer) = tokio::io::split(io);
        *self.writer.lock().await = Some(writer);

        let token = self.shutdown.child_token();
        *self.conn_token.lock() = Some(token.clone());
        *self.conn_error.lock() = None;

        self.set_state(LinkState::Connected);
        info!("[OK] Link connected: {}", self.transport.endpoint());

        if self.settings.probe_on_connect {
            tokio::spawn(Arc::clone(self).probe());
        }

        Ok((reader, token))
    }

    async fn probe(self: Arc<Self>) {
        let request = CommandRequest::new(
            CommandVerb::Ping,
            SUPERVISOR_ISSUER,
            self.settings.command_timeout,
        );
        let result = self.execute(request).await;
        match &result.outcome {
            CommandOutcome::Ack(text) if text.contains("PONG") => {
                info!("[OK] Device responding")
            },
            other => warn!("Device connected but not responding to PING: {:?}", other),
        }
    }

    /// Returns the loss reason, or `None` on shutdown
    async fn read_loop(&self, mut reader: LinkReader, token: CancellationToken) -> Option<LinkError> {
        let mut assembler = LineAssembler::new(self.settings.max_line_length);

        loop {
            let read = tokio::select! {
                _ = token.cancelled() => {
                    if self.shutdown.is_cancelled() {
                        return None;
                    }
                    return Some(self.conn_error.lock().take().unwrap_or(LinkError::Closed));
                },
                r = reader.read_buf(assembler.buffer_mut()) => r,
            };

            match read {
                Ok(0) => return Some(LinkError::Closed),
                Ok(_) => {
                    while let Some(frame) = assembler.next_line() {
                        self.dispatch(frame);
                    }
                },
                Err(e) => return Some(LinkError::Read(e.to_string())),
            }
        }
    }

    /// Mark the link down, drop the writer and fail the in-flight command
    async fn teardown(&self, reason: LinkError) {
        if let Some(token) = self.conn_token.lock().take() {
            token.cancel();
        }
        let had_writer = self.writer.lock().await.take().is_some();
        if had_writer {
            self.counters.disconnects.fetch_add(1, Ordering::Relaxed);
        }
        self.set_state(LinkState::Disconnected);

        if let Some(pending) = self.pending.lock().take() {
            debug!(request_id = %pending.id, verb = %pending.verb, "Failing in-flight command: {}", reason);
            let _ = pending.tx.send(CommandOutcome::LinkDown);
        }
    }

    // ========================================================================
    // Inbound dispatch
    // ========================================================================

    fn dispatch(&self, frame: RawLine) {
        let line = match frame {
            RawLine::Line(line) => line,
            RawLine::Overflow => {
                self.counters.lines_malformed.fetch_add(1, Ordering::Relaxed);
                let err = ProtocolError::LineTooLong {
                    limit: self.settings.max_line_length,
                };
                warn!("Discarding line: {}", err);
                return;
            },
        };

        let in_flight = self.pending.lock().is_some();
        match codec::decode(&line, in_flight) {
            DecodedLine::Telemetry(sample) => {
                self.counters.samples_received.fetch_add(1, Ordering::Relaxed);
                match self.sample_tx.try_send(sample) {
                    Ok(()) => {},
                    Err(mpsc::error::TrySendError::Full(sample)) => {
                        self.counters.samples_dropped.fetch_add(1, Ordering::Relaxed);
                        warn!("Sample queue full, dropping sample t={}", sample.t);
                    },
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("Sample intake closed");
                    },
                }
            },
            DecodedLine::Malformed(text) => {
                self.counters.lines_malformed.fetch_add(1, Ordering::Relaxed);
                warn!("Malformed telemetry dropped: {}", text);
            },
            DecodedLine::CommandReply(text) => self.resolve_reply(text),
            DecodedLine::Event(text) => self.forward_event(text, DeviceEventKind::Event),
            DecodedLine::Unsolicited(text) if codec::is_reply_token(&text) => {
                self.counters.replies_discarded.fetch_add(1, Ordering::Relaxed);
                warn!("Reply with no command in flight discarded: {}", text);
            },
            DecodedLine::Unsolicited(text) => {
                debug!("Device: {}", text);
                self.forward_event(text, DeviceEventKind::Unsolicited);
            },
            DecodedLine::Echo(text) => trace!("Echo: {}", text),
            DecodedLine::Blank => {},
        }
    }

    fn resolve_reply(&self, text: String) {
        let mut pending = self.pending.lock();
        let Some((id, verb)) = pending.as_ref().map(|p| (p.id, p.verb)) else {
            drop(pending);
            self.counters.replies_discarded.fetch_add(1, Ordering::Relaxed);
            warn!("Reply with no command in flight discarded: {}", text);
            return;
        };

        match codec::classify_reply(verb, &text) {
            ReplyDisposition::Accept => {
                if let Some(p) = pending.take() {
                    trace!(request_id = %id, verb = %verb, "Reply: {}", text);
                    let _ = p.tx.send(CommandOutcome::from_reply(&text));
                }
            },
            ReplyDisposition::Stale => {
                drop(pending);
                self.counters.replies_discarded.fetch_add(1, Ordering::Relaxed);
                warn!(request_id = %id, verb = %verb, "Stale reply discarded: {}", text);
            },
            ReplyDisposition::Event => {
                drop(pending);
                self.forward_event(text, DeviceEventKind::Event);
            },
        }
    }

    fn forward_event(&self, text: String, kind: DeviceEventKind) {
        if let Err(e) = self.event_tx.try_send(DeviceEvent { text, kind }) {
            if matches!(e, mpsc::error::TrySendError::Full(_)) {
                self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Event queue full, device event dropped");
            }
        }
    }

    // ========================================================================
    // Command path
    // ========================================================================

    async fn execute(&self, request: CommandRequest) -> CommandResult {
        if self.state() != LinkState::Connected {
            debug!(request_id = %request.id, verb = %request.verb, "Link down, command not sent");
            return request.complete(CommandOutcome::LinkDown);
        }

        let _slot = self.slot.lock().await;
        let outcome = self.exchange(&request).await;
        debug!(
            request_id = %request.id,
            verb = %request.verb,
            outcome = outcome.label(),
            "Command completed"
        );
        request.complete(outcome)
    }

    /// Write and wait; caller holds the slot
    async fn exchange(&self, request: &CommandRequest) -> CommandOutcome {
        if self.state() != LinkState::Connected {
            return CommandOutcome::LinkDown;
        }

        let (tx, rx) = oneshot::channel();
        *self.pending.lock() = Some(PendingCommand {
            id: request.id,
            verb: request.verb,
            tx,
        });

        let exchange = async {
            self.write_command(request.verb).await?;
            Ok::<_, LinkError>(rx.await)
        };

        match tokio::time::timeout(request.timeout, exchange).await {
            Ok(Ok(Ok(outcome))) => outcome,
            Ok(Ok(Err(_))) => CommandOutcome::LinkDown,
            Ok(Err(e)) => {
                self.clear_pending(request.id);
                warn!(request_id = %request.id, verb = %request.verb, "Write failed: {}", e);
                self.fail_connection(e);
                CommandOutcome::LinkDown
            },
            Err(_) => {
                self.clear_pending(request.id);
                warn!(
                    request_id = %request.id,
                    verb = %request.verb,
                    "No reply within {:?}",
                    request.timeout
                );
                CommandOutcome::Timeout
            },
        }
    }

    async fn write_command(&self, verb: CommandVerb) -> Result<(), LinkError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(LinkError::Closed)?;
        let bytes = codec::encode(verb);
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| LinkError::Write(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| LinkError::Write(e.to_string()))?;
        self.counters.commands_sent.fetch_add(1, Ordering::Relaxed);
        trace!("Sent: {}", verb);
        Ok(())
    }

    /// Drop the pending entry if it still belongs to `id`
    fn clear_pending(&self, id: Uuid) {
        let mut pending = self.pending.lock();
        if pending.as_ref().is_some_and(|p| p.id == id) {
            *pending = None;
        }
    }

    /// Ask the read loop to tear the current connection down
    fn fail_connection(&self, reason: LinkError) {
        if let Some(token) = self.conn_token.lock().as_ref() {
            *self.conn_error.lock() = Some(reason);
            token.cancel();
        }
    }
}
