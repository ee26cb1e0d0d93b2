//! Transport side of a subscriber
//!
//! The broadcaster never owns sockets. Whatever carries frames to the
//! client (a WebSocket task, an SSE stream, a test harness) implements
//! [`SubscriberSink`].

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::messages::OutboundMessage;

#[async_trait]
pub trait SubscriberSink: Send + Sync + 'static {
    /// Deliver one message; an error ends the subscription
    async fn send(&self, message: &OutboundMessage) -> anyhow::Result<()>;

    /// Close the underlying connection
    async fn close(&self, reason: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkFrame {
    Text(String),
    Close(String),
}

/// Sink writing JSON text frames into a bounded channel
///
/// `send` waits while the channel is full, the same way a socket write
/// waits on a slow client.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<SinkFrame>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SinkFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SubscriberSink for ChannelSink {
    async fn send(&self, message: &OutboundMessage) -> anyhow::Result<()> {
        self.tx
            .send(SinkFrame::Text(message.to_json()))
            .await
            .map_err(|_| anyhow::anyhow!("subscriber channel closed"))
    }

    async fn close(&self, reason: &str) {
        let _ = self.tx.send(SinkFrame::Close(reason.to_string())).await;
    }
}
