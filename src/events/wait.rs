//! Bounded Wait
//!
//! The one reusable shape for every asynchronous delivery in the manager:
//! subscribe to `(code, kind)`, race the subscription against a timer (and
//! optionally an external cancel), settle exactly once, and always detach.
//! The subscription guard drops on every exit path, so neither a timeout,
//! a cancel, nor caller abandonment can leak a subscriber.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::debug;

use super::bus::{EventBus, SignalKind, SignalPayload};

/// Outcome of a bounded wait that produced no payload
#[derive(Debug, Error)]
pub enum WaitError {
    /// The timer won the race
    #[error("timed out after {waited:?} waiting for {kind} on session {code}")]
    Timeout {
        code: String,
        kind: SignalKind,
        waited: Duration,
    },

    /// The external cancel won the race
    #[error("wait for {kind} on session {code} was cancelled")]
    Cancelled { code: String, kind: SignalKind },

    /// The session was purged from the bus while waiting
    #[error("session {code} closed while waiting for {kind}")]
    SessionClosed { code: String, kind: SignalKind },
}

/// Wait at most `timeout` for the next `(code, kind)` signal.
///
/// The caller's task suspends; nothing else blocks. Exactly one outcome is
/// returned and the subscription is released unconditionally.
pub async fn await_signal(
    bus: &std::sync::Arc<EventBus>,
    code: &str,
    kind: SignalKind,
    timeout: Duration,
) -> Result<SignalPayload, WaitError> {
    // Never-resolving cancel: the select arm is disabled below
    let (_tx, rx) = oneshot::channel();
    await_signal_inner(bus, code, kind, timeout, Some(_tx), rx).await
}

/// [`await_signal`] with an external cancel in the race. Dropping the
/// sender cancels the wait; cancellation and timeout release resources
/// through the identical path.
pub async fn await_signal_cancellable(
    bus: &std::sync::Arc<EventBus>,
    code: &str,
    kind: SignalKind,
    timeout: Duration,
    cancel: oneshot::Receiver<()>,
) -> Result<SignalPayload, WaitError> {
    await_signal_inner(bus, code, kind, timeout, None, cancel).await
}

async fn await_signal_inner(
    bus: &std::sync::Arc<EventBus>,
    code: &str,
    kind: SignalKind,
    timeout: Duration,
    keepalive: Option<oneshot::Sender<()>>,
    mut cancel: oneshot::Receiver<()>,
) -> Result<SignalPayload, WaitError> {
    // Subscribe before arming the timer so a publish racing with the
    // subscription cannot slip between them
    let mut subscription = bus.subscribe(code, kind);
    let timer = sleep(timeout);
    tokio::pin!(timer);

    let outcome = tokio::select! {
        payload = subscription.recv() => match payload {
            Some(payload) => Ok(payload),
            None => Err(WaitError::SessionClosed {
                code: code.to_string(),
                kind,
            }),
        },
        _ = &mut timer => Err(WaitError::Timeout {
            code: code.to_string(),
            kind,
            waited: timeout,
        }),
        // Armed only for cancellable waits; a dropped sender counts as a
        // cancel, same as an explicit send
        result = &mut cancel, if keepalive.is_none() => {
            let _ = result;
            Err(WaitError::Cancelled {
                code: code.to_string(),
                kind,
            })
        }
    };

    subscription.unsubscribe();
    if outcome.is_err() {
        debug!(
            "Bounded wait for {} on session {} settled without payload",
            kind, code
        );
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::session::ConnectionMetadata;

    fn bus() -> Arc<EventBus> {
        Arc::new(EventBus::new())
    }

    #[tokio::test]
    async fn test_event_before_timeout() {
        let bus = bus();
        let publisher = Arc::clone(&bus);
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            publisher.publish("s1", SignalPayload::Credential("QR-1".into()));
        });

        let payload = await_signal(&bus, "s1", SignalKind::Credential, Duration::from_millis(500))
            .await
            .unwrap();
        assert!(matches!(payload, SignalPayload::Credential(d) if d == "QR-1"));
        // No residual subscription after settle
        assert_eq!(bus.subscriber_count("s1", SignalKind::Credential), 0);
    }

    #[tokio::test]
    async fn test_timeout_leaves_no_subscription() {
        let bus = bus();
        let result =
            await_signal(&bus, "s1", SignalKind::Credential, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(WaitError::Timeout { .. })));
        assert_eq!(bus.subscriber_count("s1", SignalKind::Credential), 0);
    }

    #[tokio::test]
    async fn test_single_resolution_despite_later_publishes() {
        let bus = bus();
        let publisher = Arc::clone(&bus);
        let task = tokio::spawn({
            let bus = Arc::clone(&bus);
            async move {
                await_signal(&bus, "s1", SignalKind::Credential, Duration::from_millis(500)).await
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher.publish("s1", SignalPayload::Credential("first".into()));
        publisher.publish("s1", SignalPayload::Credential("second".into()));
        publisher.publish("s1", SignalPayload::Credential("third".into()));

        let payload = task.await.unwrap().unwrap();
        assert!(matches!(payload, SignalPayload::Credential(d) if d == "first"));
        assert_eq!(bus.subscriber_count("s1", SignalKind::Credential), 0);
    }

    #[tokio::test]
    async fn test_external_cancel() {
        let bus = bus();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn({
            let bus = Arc::clone(&bus);
            async move {
                await_signal_cancellable(
                    &bus,
                    "s1",
                    SignalKind::Connected,
                    Duration::from_secs(30),
                    cancel_rx,
                )
                .await
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel_tx.send(()).unwrap();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(WaitError::Cancelled { .. })));
        assert_eq!(bus.subscriber_count("s1", SignalKind::Connected), 0);
    }

    #[tokio::test]
    async fn test_dropped_cancel_sender_cancels() {
        let bus = bus();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        drop(cancel_tx);
        let result = await_signal_cancellable(
            &bus,
            "s1",
            SignalKind::Connected,
            Duration::from_secs(30),
            cancel_rx,
        )
        .await;
        assert!(matches!(result, Err(WaitError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_purge_while_waiting() {
        let bus = bus();
        let task = tokio::spawn({
            let bus = Arc::clone(&bus);
            async move {
                await_signal(&bus, "s1", SignalKind::Connected, Duration::from_secs(30)).await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.purge("s1");
        let result = task.await.unwrap();
        assert!(matches!(result, Err(WaitError::SessionClosed { .. })));
    }

    #[tokio::test]
    async fn test_connected_notification_shape() {
        // The same utility serves non-credential lifecycle waits
        let bus = bus();
        let publisher = Arc::clone(&bus);
        tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            publisher.publish(
                "s1",
                SignalPayload::Connected(ConnectionMetadata {
                    remote_id: Some("12345".into()),
                    display_name: None,
                }),
            );
        });

        let payload = await_signal(&bus, "s1", SignalKind::Connected, Duration::from_millis(500))
            .await
            .unwrap();
        assert!(matches!(payload, SignalPayload::Connected(_)));
    }
}
