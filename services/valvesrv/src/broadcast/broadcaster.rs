//! Fan-out broadcaster
//!
//! Registry of subscribers, each with its own bounded drop-oldest mailbox
//! drained by a dedicated delivery task. `publish` only pushes into
//! mailboxes, so a stalled subscriber never slows the producer or its
//! peers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::auth::{Principal, TokenVerifier};
use super::mailbox::Mailbox;
use super::messages::{InboundMessage, OutboundMessage};
use super::sink::SubscriberSink;
use crate::error::AuthError;

pub type SubscriberId = Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastSettings {
    pub queue_capacity: usize,
    pub auth_grace_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub client_timeout_ms: u64,
    pub close_timeout_ms: u64,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            auth_grace_ms: 10_000,
            heartbeat_interval_ms: 10_000,
            client_timeout_ms: 60_000,
            close_timeout_ms: 1_000,
        }
    }
}

impl BroadcastSettings {
    fn auth_grace(&self) -> Duration {
        Duration::from_millis(self.auth_grace_ms)
    }

    fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

struct SubscriberEntry {
    id: SubscriberId,
    mailbox: Mailbox,
    authenticated: AtomicBool,
    principal: Mutex<Option<Principal>>,
    /// Last client message or accepted delivery
    last_activity: Mutex<Instant>,
    close_reason: Mutex<Option<String>>,
    cancel: CancellationToken,
}

impl SubscriberEntry {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn set_reason(&self, reason: &str) {
        self.close_reason
            .lock()
            .get_or_insert_with(|| reason.to_string());
    }

    fn reason(&self) -> String {
        self.close_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "closed".to_string())
    }
}

/// Snapshot of one subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberInfo {
    pub id: SubscriberId,
    pub authenticated: bool,
    pub principal: Option<Principal>,
    pub queued: usize,
    pub dropped: u64,
    pub delivered: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastStats {
    pub subscribers: usize,
    pub authenticated: usize,
    pub published: u64,
    /// Mailbox evictions, including subscribers already gone
    pub dropped: u64,
    pub auth_failures: u64,
    pub auth_timeouts: u64,
    pub idle_disconnects: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    retired_dropped: AtomicU64,
    auth_failures: AtomicU64,
    auth_timeouts: AtomicU64,
    idle_disconnects: AtomicU64,
}

pub struct Broadcaster {
    subscribers: DashMap<SubscriberId, Arc<SubscriberEntry>>,
    verifier: Arc<dyn TokenVerifier>,
    settings: BroadcastSettings,
    counters: Counters,
    shutdown: CancellationToken,
}

impl Broadcaster {
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        settings: BroadcastSettings,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            subscribers: DashMap::new(),
            verifier,
            settings,
            counters: Counters::default(),
            shutdown,
        })
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register an unauthenticated subscriber
    ///
    /// Without a valid token within the grace period it receives an
    /// `auth_error` and is disconnected.
    pub fn subscribe(self: &Arc<Self>, sink: Arc<dyn SubscriberSink>) -> SubscriberId {
        let entry = self.register(sink);

        let this = Arc::clone(self);
        let watched = Arc::clone(&entry);
        let grace = self.settings.auth_grace();
        tokio::spawn(async move {
            tokio::select! {
                _ = watched.cancel.cancelled() => {},
                _ = tokio::time::sleep(grace) => {
                    if !watched.is_authenticated() {
                        this.counters.auth_timeouts.fetch_add(1, Ordering::Relaxed);
                        warn!(subscriber_id = %watched.id, "Authentication timeout after {:?}", grace);
                        watched.mailbox.push(Arc::new(OutboundMessage::AuthError {
                            reason: AuthError::Timeout.to_string(),
                        }));
                        this.close_gracefully(&watched, "auth timeout");
                    }
                },
            }
        });

        entry.id
    }

    /// Verify first, then register already authenticated
    pub fn subscribe_with_token(
        self: &Arc<Self>,
        sink: Arc<dyn SubscriberSink>,
        token: &str,
    ) -> Result<(SubscriberId, Principal), AuthError> {
        let principal = self.verifier.verify(token).map_err(|e| {
            self.counters.auth_failures.fetch_add(1, Ordering::Relaxed);
            e
        })?;
        let entry = self.register(sink);
        self.mark_authenticated(&entry, principal.clone());
        Ok((entry.id, principal))
    }

    fn register(self: &Arc<Self>, sink: Arc<dyn SubscriberSink>) -> Arc<SubscriberEntry> {
        let entry = Arc::new(SubscriberEntry {
            id: Uuid::new_v4(),
            mailbox: Mailbox::new(self.settings.queue_capacity),
            authenticated: AtomicBool::new(false),
            principal: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            close_reason: Mutex::new(None),
            cancel: self.shutdown.child_token(),
        });
        self.subscribers.insert(entry.id, Arc::clone(&entry));
        debug!(subscriber_id = %entry.id, "Subscriber registered");

        tokio::spawn(Arc::clone(self).deliver(Arc::clone(&entry), sink));
        entry
    }

    /// Remove a subscriber; safe to call repeatedly
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        match self.subscribers.remove(&id) {
            Some((_, entry)) => {
                entry.set_reason("unsubscribed");
                entry.cancel.cancel();
                self.retire(&entry);
                debug!(subscriber_id = %id, "Subscriber removed");
                true
            },
            None => false,
        }
    }

    fn retire(&self, entry: &SubscriberEntry) {
        self.counters
            .retired_dropped
            .fetch_add(entry.mailbox.dropped(), Ordering::Relaxed);
    }

    // ========================================================================
    // Authentication and client messages
    // ========================================================================

    pub fn authenticate(&self, id: SubscriberId, token: &str) -> Result<Principal, AuthError> {
        let entry = self.entry(id).ok_or(AuthError::UnknownSubscriber)?;
        entry.touch();

        match self.verifier.verify(token) {
            Ok(principal) => {
                self.mark_authenticated(&entry, principal.clone());
                Ok(principal)
            },
            Err(e) => {
                self.counters.auth_failures.fetch_add(1, Ordering::Relaxed);
                warn!(subscriber_id = %id, "Authentication failed: {}", e);
                entry.mailbox.push(Arc::new(OutboundMessage::AuthError {
                    reason: e.to_string(),
                }));
                Err(e)
            },
        }
    }

    fn mark_authenticated(&self, entry: &SubscriberEntry, principal: Principal) {
        info!(
            subscriber_id = %entry.id,
            "Subscriber authenticated: {} ({})",
            principal.subject,
            principal.role
        );
        entry.mailbox.push(Arc::new(OutboundMessage::AuthSuccess {
            subject: principal.subject.clone(),
            role: principal.role,
        }));
        *entry.principal.lock() = Some(principal);
        entry.authenticated.store(true, Ordering::Release);
    }

    /// Handle one text frame from a client
    pub fn handle_client_message(&self, id: SubscriberId, text: &str) -> Result<(), AuthError> {
        let entry = self.entry(id).ok_or(AuthError::UnknownSubscriber)?;
        entry.touch();

        match InboundMessage::parse(text) {
            Some(InboundMessage::Auth { token }) => self.authenticate(id, &token).map(|_| ()),
            Some(msg) if msg.is_ping() => {
                entry.mailbox.push(Arc::new(OutboundMessage::Pong));
                Ok(())
            },
            _ => {
                debug!(subscriber_id = %id, "Ignoring client message: {}", text);
                Ok(())
            },
        }
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    /// Enqueue for every authenticated subscriber; never blocks
    pub fn publish(&self, message: OutboundMessage) -> usize {
        let message = Arc::new(message);
        let mut recipients = 0;
        for entry in self.subscribers.iter() {
            if entry.is_authenticated() {
                if entry.mailbox.push(Arc::clone(&message)) {
                    debug!(subscriber_id = %entry.id, "Mailbox full, dropped oldest");
                }
                recipients += 1;
            }
        }
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        recipients
    }

    /// Spawn the heartbeat and idle-client sweep
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let period = this.settings.heartbeat_interval();
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = ticker.tick() => this.heartbeat_tick(),
                }
            }
            debug!("Heartbeat task stopped");
        })
    }

    fn heartbeat_tick(&self) {
        let heartbeat = Arc::new(OutboundMessage::heartbeat());
        let timeout = self.settings.client_timeout();
        let mut idle = Vec::new();

        for entry in self.subscribers.iter() {
            entry.mailbox.push(Arc::clone(&heartbeat));
            if entry.last_activity.lock().elapsed() > timeout {
                idle.push(entry.id);
            }
        }

        for id in idle {
            warn!(subscriber_id = %id, "No client activity for {:?}, disconnecting", timeout);
            self.counters.idle_disconnects.fetch_add(1, Ordering::Relaxed);
            if let Some((_, entry)) = self.subscribers.remove(&id) {
                entry.set_reason("client timeout");
                entry.cancel.cancel();
                self.retire(&entry);
            }
        }
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    async fn deliver(self: Arc<Self>, entry: Arc<SubscriberEntry>, sink: Arc<dyn SubscriberSink>) {
        loop {
            let message = tokio::select! {
                _ = entry.cancel.cancelled() => break,
                m = entry.mailbox.recv() => m,
            };
            let Some(message) = message else { break };

            let sent = tokio::select! {
                _ = entry.cancel.cancelled() => break,
                r = sink.send(&message) => r,
            };
            if let Err(e) = sent {
                debug!(subscriber_id = %entry.id, "Send failed: {}", e);
                entry.set_reason("send failed");
                break;
            }
            entry.touch();
        }

        if self.subscribers.remove(&entry.id).is_some() {
            self.retire(&entry);
        }
        entry.mailbox.close();

        let reason = entry.reason();
        if tokio::time::timeout(self.settings.close_timeout(), sink.close(&reason))
            .await
            .is_err()
        {
            debug!(subscriber_id = %entry.id, "Close timed out");
        }
        debug!(subscriber_id = %entry.id, "Delivery stopped: {}", reason);
    }

    /// Let queued messages drain, then close; hard stop after `close_timeout`
    fn close_gracefully(&self, entry: &Arc<SubscriberEntry>, reason: &str) {
        entry.set_reason(reason);
        entry.mailbox.close();

        let entry = Arc::clone(entry);
        let limit = self.settings.close_timeout();
        tokio::spawn(async move {
            tokio::select! {
                _ = entry.cancel.cancelled() => {},
                _ = tokio::time::sleep(limit) => entry.cancel.cancel(),
            }
        });
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    fn entry(&self, id: SubscriberId) -> Option<Arc<SubscriberEntry>> {
        self.subscribers.get(&id).map(|e| Arc::clone(e.value()))
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn subscriber_info(&self, id: SubscriberId) -> Option<SubscriberInfo> {
        self.entry(id).map(|e| SubscriberInfo {
            id: e.id,
            authenticated: e.is_authenticated(),
            principal: e.principal.lock().clone(),
            queued: e.mailbox.len(),
            dropped: e.mailbox.dropped(),
            delivered: e.mailbox.delivered(),
        })
    }

    pub fn stats(&self) -> BroadcastStats {
        let mut stats = BroadcastStats {
            published: self.counters.published.load(Ordering::Relaxed),
            dropped: self.counters.retired_dropped.load(Ordering::Relaxed),
            auth_failures: self.counters.auth_failures.load(Ordering::Relaxed),
            auth_timeouts: self.counters.auth_timeouts.load(Ordering::Relaxed),
            idle_disconnects: self.counters.idle_disconnects.load(Ordering::Relaxed),
            ..Default::default()
        };
        for entry in self.subscribers.iter() {
            stats.subscribers += 1;
            if entry.is_authenticated() {
                stats.authenticated += 1;
            }
            stats.dropped += entry.mailbox.dropped();
        }
        stats
    }

    /// Disconnect everyone
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let ids: Vec<SubscriberId> = self.subscribers.iter().map(|e| e.id).collect();
        for id in ids {
            self.unsubscribe(id);
        }
        info!("Broadcaster stopped");
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::broadcast::auth::{Role, StaticToken, StaticTokenVerifier};
    use crate::broadcast::messages::{LogEvent, LogLevel};
    use crate::broadcast::sink::{ChannelSink, SinkFrame};
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn verifier() -> Arc<dyn TokenVerifier> {
        let mut tokens = HashMap::new();
        tokens.insert(
            "good".to_string(),
            StaticToken {
                subject: "alice".to_string(),
                role: Role::Operator,
            },
        );
        Arc::new(StaticTokenVerifier::new(tokens))
    }

    fn broadcaster(settings: BroadcastSettings) -> Arc<Broadcaster> {
        Broadcaster::new(verifier(), settings, CancellationToken::new())
    }

    fn log(text: &str) -> OutboundMessage {
        OutboundMessage::Log(LogEvent::new(LogLevel::Info, text))
    }

    async fn next_type(rx: &mut mpsc::Receiver<SinkFrame>) -> String {
        match rx.recv().await.unwrap() {
            SinkFrame::Text(json) => {
                let value: serde_json::Value = serde_json::from_str(&json).unwrap();
                value["type"].as_str().unwrap().to_string()
            },
            SinkFrame::Close(reason) => format!("close:{}", reason),
        }
    }

    #[tokio::test]
    async fn test_publish_skips_unauthenticated() {
        let b = broadcaster(BroadcastSettings::default());
        let (sink, mut rx) = ChannelSink::new(8);
        let id = b.subscribe(Arc::new(sink));

        assert_eq!(b.publish(log("before")), 0);
        b.authenticate(id, "good").unwrap();
        assert_eq!(b.publish(log("after")), 1);

        assert_eq!(next_type(&mut rx).await, "auth_success");
        assert_eq!(next_type(&mut rx).await, "log");
        assert_eq!(b.stats().authenticated, 1);
    }

    #[tokio::test]
    async fn test_subscribe_with_bad_token_rejected() {
        let b = broadcaster(BroadcastSettings::default());
        let (sink, _rx) = ChannelSink::new(8);
        let err = b.subscribe_with_token(Arc::new(sink), "bad").unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
        assert_eq!(b.subscriber_count(), 0);
        assert_eq!(b.stats().auth_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_grace_timeout_disconnects() {
        let b = broadcaster(BroadcastSettings::default());
        let (sink, mut rx) = ChannelSink::new(8);
        let id = b.subscribe(Arc::new(sink));

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(next_type(&mut rx).await, "auth_error");
        assert_eq!(next_type(&mut rx).await, "close:auth timeout");
        assert!(b.subscriber_info(id).is_none());
        assert_eq!(b.stats().auth_timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authenticated_subscriber_survives_grace() {
        let b = broadcaster(BroadcastSettings::default());
        let (sink, mut rx) = ChannelSink::new(8);
        let id = b.subscribe(Arc::new(sink));
        b.handle_client_message(id, r#"{"token":"good"}"#).unwrap();

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(b.subscriber_info(id).unwrap().authenticated);
        assert_eq!(next_type(&mut rx).await, "auth_success");
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let b = broadcaster(BroadcastSettings::default());
        let (sink, mut rx) = ChannelSink::new(8);
        let (id, _) = b.subscribe_with_token(Arc::new(sink), "good").unwrap();
        b.handle_client_message(id, r#"{"type":"ping"}"#).unwrap();

        assert_eq!(next_type(&mut rx).await, "auth_success");
        assert_eq!(next_type(&mut rx).await, "pong");
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let b = broadcaster(BroadcastSettings::default());
        let (sink, mut rx) = ChannelSink::new(8);
        let (id, _) = b.subscribe_with_token(Arc::new(sink), "good").unwrap();

        assert!(b.unsubscribe(id));
        assert!(!b.unsubscribe(id));
        assert_eq!(b.publish(log("gone")), 0);

        // delivery task closes the sink on the way out
        loop {
            match rx.recv().await {
                Some(SinkFrame::Close(reason)) => {
                    assert_eq!(reason, "unsubscribed");
                    break;
                },
                Some(_) => continue,
                None => panic!("sink dropped without close"),
            }
        }
        assert!(matches!(
            b.authenticate(id, "good"),
            Err(AuthError::UnknownSubscriber)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listening_subscriber_outlives_client_timeout() {
        let b = broadcaster(BroadcastSettings {
            heartbeat_interval_ms: 1_000,
            client_timeout_ms: 2_500,
            ..Default::default()
        });
        let _heartbeat = b.start();
        let (sink, mut rx) = ChannelSink::new(64);
        let (id, _) = b.subscribe_with_token(Arc::new(sink), "good").unwrap();
        assert_eq!(next_type(&mut rx).await, "auth_success");

        // never sends anything itself, only takes deliveries
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert!(b.subscriber_info(id).is_some());
        assert_eq!(b.stats().idle_disconnects, 0);

        let mut heartbeats = 0;
        while let Ok(SinkFrame::Text(json)) = rx.try_recv() {
            let value: serde_json::Value = serde_json::from_str(&json).unwrap();
            if value["type"] == "heartbeat" {
                heartbeats += 1;
            }
        }
        assert!(heartbeats >= 10, "{} heartbeats", heartbeats);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_sink_is_swept_after_client_timeout() {
        let b = broadcaster(BroadcastSettings {
            heartbeat_interval_ms: 1_000,
            client_timeout_ms: 2_500,
            ..Default::default()
        });
        let _heartbeat = b.start();
        // one slot, never read: auth_success fits, the first heartbeat blocks
        let (sink, _rx) = ChannelSink::new(1);
        let (id, _) = b.subscribe_with_token(Arc::new(sink), "good").unwrap();

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert!(b.subscriber_info(id).is_some());

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(b.subscriber_info(id).is_none());
        assert_eq!(b.stats().idle_disconnects, 1);
    }

    #[tokio::test]
    async fn test_stalled_subscriber_drops_oldest_only() {
        let b = broadcaster(BroadcastSettings {
            queue_capacity: 4,
            ..Default::default()
        });
        let (fast, mut fast_rx) = ChannelSink::new(256);
        let (slow, _slow_rx) = ChannelSink::new(1);
        let (fast_id, _) = b.subscribe_with_token(Arc::new(fast), "good").unwrap();
        let (slow_id, _) = b.subscribe_with_token(Arc::new(slow), "good").unwrap();
        assert_eq!(next_type(&mut fast_rx).await, "auth_success");

        for i in 0..50 {
            b.publish(log(&i.to_string()));
            if i % 4 == 0 {
                tokio::task::yield_now().await;
            }
        }

        for _ in 0..50 {
            assert_eq!(next_type(&mut fast_rx).await, "log");
        }
        assert_eq!(b.subscriber_info(fast_id).unwrap().dropped, 0);
        assert!(b.subscriber_info(slow_id).unwrap().dropped > 0);
        assert!(b.stats().dropped > 0);
    }
}
