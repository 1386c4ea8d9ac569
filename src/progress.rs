//! Progress channel between stage workers and the listener.
//!
//! Many producers (the session worker and every in-flight item task) share
//! clones of one [`ProgressSender`]; exactly one [`ProgressReceiver`] drains
//! the events in production order. The channel is bounded, so a listener
//! that stops reading applies backpressure. Dropping the receiver turns
//! every send into a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::session::{SessionCounters, SessionStage, StageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Info,
    Success,
    Warning,
    Error,
    StageTransition,
    Terminal,
}

/// Structured detail attached to an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Item {
        stage: StageKind,
        item_id: String,
    },
    Transition {
        from: SessionStage,
        to: SessionStage,
    },
    Terminal {
        stage: SessionStage,
        counters: SessionCounters,
        failure: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<EventPayload>,
}

impl ProgressEvent {
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            message: message.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: EventPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Event about a single item in a stage.
    pub fn item(
        kind: EventKind,
        stage: StageKind,
        item_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(kind, message).with_payload(EventPayload::Item {
            stage,
            item_id: item_id.into(),
        })
    }

    pub fn transition(from: SessionStage, to: SessionStage) -> Self {
        Self::new(
            EventKind::StageTransition,
            format!("Stage {} -> {}", from, to),
        )
        .with_payload(EventPayload::Transition { from, to })
    }

    pub fn terminal(
        stage: SessionStage,
        counters: SessionCounters,
        failure: Option<String>,
    ) -> Self {
        let message = match &failure {
            Some(reason) => format!("Session {}: {}", stage, reason),
            None => format!("Session {}", stage),
        };
        Self::new(EventKind::Terminal, message).with_payload(EventPayload::Terminal {
            stage,
            counters,
            failure,
        })
    }

    /// Item id carried by the payload, if any.
    pub fn item_id(&self) -> Option<&str> {
        match &self.payload {
            Some(EventPayload::Item { item_id, .. }) => Some(item_id),
            _ => None,
        }
    }
}

/// Producer half of the progress channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressSender {
    /// Deliver an event, waiting for capacity. Returns `false` once the
    /// listener has gone away.
    pub async fn send(&self, event: ProgressEvent) -> bool {
        if self.tx.send(event).await.is_err() {
            tracing::trace!("progress listener dropped, event discarded");
            return false;
        }
        true
    }

    pub async fn info(&self, message: impl Into<String>) -> bool {
        self.send(ProgressEvent::new(EventKind::Info, message)).await
    }

    pub async fn warning(&self, message: impl Into<String>) -> bool {
        self.send(ProgressEvent::new(EventKind::Warning, message))
            .await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of the progress channel.
#[derive(Debug)]
pub struct ProgressReceiver {
    rx: mpsc::Receiver<ProgressEvent>,
}

impl ProgressReceiver {
    /// Next event, or `None` once every sender is gone and the buffer is drained.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Non-blocking poll for an already-buffered event.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }
}

/// Create a bounded progress channel.
pub fn channel(capacity: usize) -> (ProgressSender, ProgressReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ProgressSender { tx }, ProgressReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_production_order() {
        let (tx, mut rx) = channel(8);
        tx.info("first").await;
        tx.warning("second").await;
        tx.send(ProgressEvent::transition(
            SessionStage::Scanning,
            SessionStage::Transforming,
        ))
        .await;
        drop(tx);

        let kinds: Vec<EventKind> = std::iter::from_fn(|| rx.try_recv())
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Info,
                EventKind::Warning,
                EventKind::StageTransition
            ]
        );
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_multiple_producers_share_one_receiver() {
        let (tx, mut rx) = channel(4);
        let mut handles = Vec::new();
        for worker in 0..3 {
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                for n in 0..5 {
                    tx.info(format!("worker {worker} event {n}")).await;
                }
            }));
        }
        drop(tx);

        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(received, 15);
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped_is_noop() {
        let (tx, rx) = channel(1);
        drop(rx);
        assert!(tx.is_closed());
        assert!(!tx.info("nobody listening").await);
    }

    #[test]
    fn test_item_event_serializes_with_payload() {
        let event = ProgressEvent::item(EventKind::Error, StageKind::Transform, "p3", "bad");
        assert_eq!(event.item_id(), Some("p3"));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"error\""));
        assert!(json.contains("\"type\":\"item\""));
        assert!(json.contains("\"stage\":\"transform\""));
    }

    #[test]
    fn test_terminal_event_message_includes_failure() {
        let event = ProgressEvent::terminal(
            SessionStage::Failed,
            SessionCounters::default(),
            Some("engine unavailable".into()),
        );
        assert_eq!(event.kind, EventKind::Terminal);
        assert!(event.message.contains("failed"));
        assert!(event.message.contains("engine unavailable"));
    }
}
