//! Queue lifecycle events and the observer bridge.
//!
//! A broadcast fan-out lets reactive UI layers observe queue state without
//! polling the persisted store. There is no buffering or replay: a
//! subscriber that joins after an event fires never sees it, so consumers
//! needing current state query it directly (e.g. the manager's
//! `all_progress`) and rely on events for deltas only.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::download::DownloadProgress;

/// Default broadcast capacity; slow consumers lag rather than block emitters.
const DEFAULT_CAPACITY: usize = 256;

/// A queue state change, broadcast on every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum QueueEvent {
    /// A download transitioned to `downloading`.
    Started {
        /// Queue entry id.
        queue_id: i64,
        /// Book the entry downloads.
        book_id: String,
    },
    /// Byte-level progress tick; emitted on every executor callback.
    Progress {
        /// Queue entry id.
        queue_id: i64,
        /// Book the entry downloads.
        book_id: String,
        /// Current progress snapshot.
        progress: DownloadProgress,
    },
    /// A download completed and was materialized.
    Completed {
        /// Queue entry id.
        queue_id: i64,
        /// Book the entry downloaded.
        book_id: String,
    },
    /// A download failed; the entry is retained with the reason.
    Failed {
        /// Queue entry id.
        queue_id: i64,
        /// Book the entry was downloading.
        book_id: String,
        /// User-facing failure reason.
        reason: String,
    },
    /// An active download was cancelled by the user.
    Cancelled {
        /// Queue entry id.
        queue_id: i64,
        /// Book the entry was downloading.
        book_id: String,
    },
    /// The set of queue rows changed; consumers re-query their listings.
    QueueChanged,
}

/// Broadcast bridge between the manager and its observers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Creates a bus with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribes to all future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    /// Emits an event to all current subscribers.
    ///
    /// Emission never fails: with no subscribers the event is dropped.
    pub fn emit(&self, event: QueueEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(QueueEvent::Started {
            queue_id: 1,
            book_id: "b1".to_string(),
        });
        bus.emit(QueueEvent::QueueChanged);

        assert!(matches!(
            rx.recv().await.unwrap(),
            QueueEvent::Started { queue_id: 1, .. }
        ));
        assert!(matches!(rx.recv().await.unwrap(), QueueEvent::QueueChanged));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_dropped() {
        let bus = EventBus::default();
        // Must not panic or error.
        bus.emit(QueueEvent::QueueChanged);
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_no_replay() {
        let bus = EventBus::default();
        bus.emit(QueueEvent::QueueChanged);

        let mut rx = bus.subscribe();
        bus.emit(QueueEvent::Started {
            queue_id: 2,
            book_id: "b2".to_string(),
        });

        // The first event observed is the one emitted after subscribing.
        assert!(matches!(
            rx.recv().await.unwrap(),
            QueueEvent::Started { queue_id: 2, .. }
        ));
    }

    #[test]
    fn test_event_serializes_with_kebab_case_tag() {
        let event = QueueEvent::QueueChanged;
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("queue-changed"));
    }
}
