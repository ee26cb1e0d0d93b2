//! Stop-signal handling

use std::fmt;

use tracing::{info, warn};

/// Signal that asked the process to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopSignal::Interrupt => write!(f, "SIGINT"),
            StopSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Resolve on the first Ctrl+C, or SIGTERM on Unix
pub async fn wait_for_shutdown() -> StopSignal {
    let signal = wait_for_signal().await;
    info!("{} received, shutting down", signal);
    signal
}

#[cfg(unix)]
async fn wait_for_signal() -> StopSignal {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            warn!("SIGTERM handler unavailable ({}), Ctrl+C only", e);
            return interrupt().await;
        },
    };

    tokio::select! {
        s = interrupt() => s,
        _ = term.recv() => StopSignal::Terminate,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> StopSignal {
    interrupt().await
}

async fn interrupt() -> StopSignal {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Ctrl+C handler failed: {}", e);
        std::future::pending::<()>().await;
    }
    StopSignal::Interrupt
}
