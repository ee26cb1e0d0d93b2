//! Hand-off to the storage collaborator
//!
//! The pipeline only enqueues; a background worker drives the
//! [`Recorder`]. A full queue drops the record instead of blocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::link::CommandResult;
use crate::protocol::TelemetrySample;
use crate::safety::Alert;

#[derive(Debug, Clone)]
pub enum Record {
    Sample(TelemetrySample),
    Alert(Alert),
    /// Carries the issuer identity
    Command(CommandResult),
}

impl Record {
    fn kind(&self) -> &'static str {
        match self {
            Self::Sample(_) => "sample",
            Self::Alert(_) => "alert",
            Self::Command(_) => "command",
        }
    }
}

#[async_trait]
pub trait Recorder: Send + Sync + 'static {
    async fn record_sample(&self, sample: &TelemetrySample) -> Result<()>;

    async fn record_alert(&self, alert: &Alert) -> Result<()>;

    async fn record_command(&self, result: &CommandResult) -> Result<()>;
}

#[derive(Debug, Default)]
struct StorageCounters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Producer side; cheap to clone
#[derive(Clone)]
pub struct StorageHandle {
    tx: mpsc::Sender<Record>,
    counters: Arc<StorageCounters>,
}

impl StorageHandle {
    /// Fire-and-forget
    pub fn record(&self, record: Record) {
        match self.tx.try_send(record) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            },
            Err(mpsc::error::TrySendError::Full(record)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Storage queue full, dropping {} record", record.kind());
            },
            Err(mpsc::error::TrySendError::Closed(record)) => {
                debug!("Storage worker stopped, {} record discarded", record.kind());
            },
        }
    }

    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    pub fn enqueued(&self) -> u64 {
        self.counters.enqueued.load(Ordering::Relaxed)
    }
}

/// Spawn the worker feeding `recorder`
pub fn spawn_worker(
    recorder: Arc<dyn Recorder>,
    capacity: usize,
    shutdown: CancellationToken,
) -> (StorageHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(capacity.max(1));
    let counters = Arc::new(StorageCounters::default());
    let handle = StorageHandle {
        tx,
        counters: Arc::clone(&counters),
    };

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                record = rx.recv() => match record {
                    Some(record) => write(&*recorder, &counters, record).await,
                    None => break,
                },
            }
        }
        // flush what was already accepted
        rx.close();
        while let Some(record) = rx.recv().await {
            write(&*recorder, &counters, record).await;
        }
        debug!("Storage worker stopped");
    });

    (handle, task)
}

async fn write(recorder: &dyn Recorder, counters: &StorageCounters, record: Record) {
    let result = match &record {
        Record::Sample(sample) => recorder.record_sample(sample).await,
        Record::Alert(alert) => recorder.record_alert(alert).await,
        Record::Command(result) => recorder.record_command(result).await,
    };
    if let Err(e) = result {
        counters.failed.fetch_add(1, Ordering::Relaxed);
        error!("Failed to record {}: {}", record.kind(), e);
    }
}

// ============================================================================
// Recorders
// ============================================================================

/// Writes records to the log; default when no database is wired in
#[derive(Debug, Default)]
pub struct TracingRecorder;

#[async_trait]
impl Recorder for TracingRecorder {
    async fn record_sample(&self, sample: &TelemetrySample) -> Result<()> {
        debug!(target: "valvesrv::record", "sample {}", sample.to_record_json());
        Ok(())
    }

    async fn record_alert(&self, alert: &Alert) -> Result<()> {
        warn!(target: "valvesrv::record", "alert [{:?}] {}", alert.priority, alert.message);
        Ok(())
    }

    async fn record_command(&self, result: &CommandResult) -> Result<()> {
        info!(
            target: "valvesrv::record",
            request_id = %result.request_id,
            "command {} by {} -> {}",
            result.verb,
            result.issuer,
            result.outcome.label()
        );
        Ok(())
    }
}

/// Keeps everything in memory
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    samples: Mutex<Vec<TelemetrySample>>,
    alerts: Mutex<Vec<Alert>>,
    commands: Mutex<Vec<CommandResult>>,
}

impl MemoryRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn samples(&self) -> Vec<TelemetrySample> {
        self.samples.lock().clone()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn commands(&self) -> Vec<CommandResult> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl Recorder for MemoryRecorder {
    async fn record_sample(&self, sample: &TelemetrySample) -> Result<()> {
        self.samples.lock().push(sample.clone());
        Ok(())
    }

    async fn record_alert(&self, alert: &Alert) -> Result<()> {
        self.alerts.lock().push(alert.clone());
        Ok(())
    }

    async fn record_command(&self, result: &CommandResult) -> Result<()> {
        self.commands.lock().push(result.clone());
        Ok(())
    }
}
