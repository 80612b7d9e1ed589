//! Broadcast channel for panel events.
//!
//! The reconciler and the accountant publish; notifiers subscribe. Nothing in
//! the panel core waits on a subscriber, so a missing or slow notifier never
//! delays a restart or an accounting tick.

use tokio::sync::broadcast;

use super::PanelEvent;

/// Fan-out of [`PanelEvent`]s.
///
/// A receiver that falls more than `capacity` events behind loses the oldest
/// ones and sees [`broadcast::error::RecvError::Lagged`].
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PanelEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per receiver.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes `event` and returns how many notifiers got it. With no
    /// notifier attached the event is dropped.
    pub fn publish(&self, event: PanelEvent) -> usize {
        tracing::debug!(event = event.event_type_str(), "panel event");
        self.sender.send(event).unwrap_or(0)
    }

    /// Attaches a notifier; it sees events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PanelEvent> {
        self.sender.subscribe()
    }

    /// Attached notifiers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::DisableReason;
    use chrono::Utc;
    use tokio::sync::broadcast::error::RecvError;

    fn disabled(email: &str) -> PanelEvent {
        PanelEvent::ClientDisabled {
            email: email.to_string(),
            reason: DisableReason::Exhausted,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn events_without_notifiers_are_dropped() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish(disabled("a@x")), 0);
    }

    #[tokio::test]
    async fn every_notifier_sees_enforcement_in_order() {
        let bus = EventBus::new(8);
        let mut bot = bus.subscribe();
        let mut toasts = bus.subscribe();

        assert_eq!(bus.publish(disabled("a@x")), 2);
        assert_eq!(
            bus.publish(PanelEvent::XrayStopped {
                timestamp: Utc::now()
            }),
            2
        );

        for rx in [&mut bot, &mut toasts] {
            let Ok(first) = rx.recv().await else {
                panic!("first event");
            };
            let Ok(second) = rx.recv().await else {
                panic!("second event");
            };
            assert_eq!(first.event_type_str(), "client_disabled");
            assert_eq!(second.event_type_str(), "xray_stopped");
        }
    }

    #[tokio::test]
    async fn slow_notifier_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for email in ["a@x", "b@x", "c@x"] {
            bus.publish(disabled(email));
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(1))));
        let Ok(PanelEvent::ClientDisabled { email, .. }) = rx.recv().await else {
            panic!("expected the newest buffered event");
        };
        assert_eq!(email, "b@x");
        drop(rx);
        assert_eq!(bus.receiver_count(), 0);
    }
}
