//! Event Bus
//!
//! In-process publish/subscribe keyed by `(session code, signal kind)`.
//! Fans provider lifecycle signals out to whoever is waiting on that
//! session: typically one subscriber updating state and one caller blocked
//! in a bounded wait. Delivery per subscriber is at-most-once per publish,
//! and publishes for one key reach each subscriber in publish order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::session::ConnectionMetadata;

/// The closed set of lifecycle signal kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Scan or pairing payload became available
    Credential,
    /// Session finished linking
    Connected,
    /// Provider session closed
    Closed,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Credential => "credential",
            Self::Connected => "connected",
            Self::Closed => "closed",
        })
    }
}

/// Payload carried by a published signal
#[derive(Debug, Clone)]
pub enum SignalPayload {
    Credential(String),
    Connected(ConnectionMetadata),
    Closed { should_reconnect: bool },
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Credential(_) => SignalKind::Credential,
            Self::Connected(_) => SignalKind::Connected,
            Self::Closed { .. } => SignalKind::Closed,
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<SignalPayload>,
}

/// Publish/subscribe hub keyed by `(code, kind)`
pub struct EventBus {
    subscribers: DashMap<(String, SignalKind), Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Deliver a payload to every subscriber of `(code, payload.kind())`.
    /// Returns the number of subscribers reached.
    pub fn publish(&self, code: &str, payload: SignalPayload) -> usize {
        let kind = payload.kind();
        let key = (code.to_string(), kind);
        let Some(mut subs) = self.subscribers.get_mut(&key) else {
            debug!("No subscribers for {} {}", code, kind);
            return 0;
        };

        // Dead receivers are pruned as a side effect of delivery
        subs.retain(|s| s.tx.send(payload.clone()).is_ok());
        let delivered = subs.len();
        debug!("Published {} on session {} to {} subscriber(s)", kind, code, delivered);
        delivered
    }

    /// Register a subscriber for `(code, kind)`. The returned subscription
    /// detaches on drop or on an explicit `unsubscribe`.
    pub fn subscribe(self: &Arc<Self>, code: &str, kind: SignalKind) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .entry((code.to_string(), kind))
            .or_default()
            .push(Subscriber { id, tx });

        Subscription {
            bus: Arc::clone(self),
            code: code.to_string(),
            kind,
            id,
            rx,
        }
    }

    /// Current subscriber count for `(code, kind)`
    pub fn subscriber_count(&self, code: &str, kind: SignalKind) -> usize {
        self.subscribers
            .get(&(code.to_string(), kind))
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Drop every subscriber of a session, across all kinds. Called when a
    /// session is removed; pending waits on it observe a closed channel.
    pub fn purge(&self, code: &str) {
        for kind in [SignalKind::Credential, SignalKind::Connected, SignalKind::Closed] {
            self.subscribers.remove(&(code.to_string(), kind));
        }
    }

    fn unsubscribe(&self, code: &str, kind: SignalKind, id: u64) {
        let key = (code.to_string(), kind);
        if let Some(mut subs) = self.subscribers.get_mut(&key) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                drop(subs);
                self.subscribers.remove_if(&key, |_, v| v.is_empty());
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription to one `(code, kind)` key.
///
/// Detaches from the bus on drop, so abandoning a wait can never leak a
/// subscriber. `unsubscribe` may be called repeatedly and after the event
/// already fired; later calls are no-ops.
pub struct Subscription {
    bus: Arc<EventBus>,
    code: String,
    kind: SignalKind,
    id: u64,
    rx: mpsc::UnboundedReceiver<SignalPayload>,
}

impl Subscription {
    /// Next payload for this key, or `None` once detached/purged
    pub async fn recv(&mut self) -> Option<SignalPayload> {
        self.rx.recv().await
    }

    /// Detach from the bus. Safe to call multiple times.
    pub fn unsubscribe(&mut self) {
        self.bus.unsubscribe(&self.code, self.kind, self.id);
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> Arc<EventBus> {
        Arc::new(EventBus::new())
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = bus();
        let mut sub = bus.subscribe("s1", SignalKind::Credential);

        let delivered = bus.publish("s1", SignalPayload::Credential("QR".into()));
        assert_eq!(delivered, 1);

        match sub.recv().await {
            Some(SignalPayload::Credential(data)) => assert_eq!(data, "QR"),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let bus = bus();
        let mut credential = bus.subscribe("s1", SignalKind::Credential);
        let _other_session = bus.subscribe("s2", SignalKind::Credential);

        assert_eq!(bus.publish("s1", SignalPayload::Closed { should_reconnect: false }), 0);
        bus.publish("s1", SignalPayload::Credential("QR".into()));

        // Only the credential payload arrives on the credential key
        match credential.recv().await.unwrap() {
            SignalPayload::Credential(data) => assert_eq!(data, "QR"),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_observe_once() {
        let bus = bus();
        let mut a = bus.subscribe("s1", SignalKind::Connected);
        let mut b = bus.subscribe("s1", SignalKind::Connected);

        let delivered = bus.publish(
            "s1",
            SignalPayload::Connected(ConnectionMetadata::default()),
        );
        assert_eq!(delivered, 2);
        assert!(matches!(a.recv().await, Some(SignalPayload::Connected(_))));
        assert!(matches!(b.recv().await, Some(SignalPayload::Connected(_))));
    }

    #[tokio::test]
    async fn test_publish_order_preserved() {
        let bus = bus();
        let mut sub = bus.subscribe("s1", SignalKind::Credential);
        for i in 0..5 {
            bus.publish("s1", SignalPayload::Credential(format!("p{}", i)));
        }
        for i in 0..5 {
            match sub.recv().await.unwrap() {
                SignalPayload::Credential(data) => assert_eq!(data, format!("p{}", i)),
                other => panic!("unexpected payload: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_idempotent_and_after_fire() {
        let bus = bus();
        let mut sub = bus.subscribe("s1", SignalKind::Credential);
        assert_eq!(bus.subscriber_count("s1", SignalKind::Credential), 1);

        bus.publish("s1", SignalPayload::Credential("QR".into()));
        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count("s1", SignalKind::Credential), 0);

        // The already-delivered payload is still readable
        assert!(matches!(
            sub.recv().await,
            Some(SignalPayload::Credential(_))
        ));
    }

    #[tokio::test]
    async fn test_drop_detaches() {
        let bus = bus();
        {
            let _sub = bus.subscribe("s1", SignalKind::Closed);
            assert_eq!(bus.subscriber_count("s1", SignalKind::Closed), 1);
        }
        assert_eq!(bus.subscriber_count("s1", SignalKind::Closed), 0);
    }

    #[tokio::test]
    async fn test_purge_closes_pending_receivers() {
        let bus = bus();
        let mut sub = bus.subscribe("s1", SignalKind::Credential);
        bus.purge("s1");
        assert_eq!(bus.subscriber_count("s1", SignalKind::Credential), 0);
        assert!(sub.recv().await.is_none());
    }
}
