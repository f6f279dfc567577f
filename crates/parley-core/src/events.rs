//! Chat event types for front-ends.
//!
//! Events are serializable so a front-end can log or forward them as JSON.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::credentials::KeyStatus;
use crate::providers::ProviderErrorKind;

/// Events emitted by the chat controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A generation started writing into the message at `index`.
    TurnStarted { index: usize, regenerate: bool },

    /// Incremental text for the message at `index`.
    AssistantDelta { index: usize, text: String },

    /// No output yet after the watchdog delay (`active = true`), or output
    /// finally arrived (`active = false`).
    TakingLong { active: bool },

    /// The message at `index` was finalized.
    Completed { index: usize, text: String },

    /// The generation failed; the pending exchange was rolled back.
    Failed {
        kind: ProviderErrorKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },

    /// The generation was stopped; partial content was kept.
    Cancelled { index: usize, partial_content: String },

    /// A personal key probe changed state.
    KeyStatusChanged { provider: String, status: KeyStatus },
}

pub type ChatEventTx = mpsc::Sender<Arc<ChatEvent>>;
pub type ChatEventRx = mpsc::Receiver<Arc<ChatEvent>>;

/// Default channel capacity for event streams.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 128;

/// Creates a bounded event channel with the default capacity.
pub fn create_event_channel() -> (ChatEventTx, ChatEventRx) {
    mpsc::channel(DEFAULT_EVENT_CHANNEL_CAPACITY)
}

/// Event sender with best-effort and reliable send modes.
///
/// Use `send_delta()` for high-volume events that may be dropped if the
/// consumer is slow, `send_important()` for lifecycle events.
#[derive(Clone)]
pub struct EventSender {
    tx: ChatEventTx,
}

impl EventSender {
    pub fn new(tx: ChatEventTx) -> Self {
        Self { tx }
    }

    /// Best-effort send: never awaits, drops if the channel is full.
    pub fn send_delta(&self, ev: ChatEvent) {
        let _ = self.tx.try_send(Arc::new(ev));
    }

    /// Reliable send: awaits delivery.
    pub async fn send_important(&self, ev: ChatEvent) {
        let _ = self.tx.send(Arc::new(ev)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(ChatEvent::AssistantDelta {
            index: 1,
            text: "hi".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "assistant_delta");
        assert_eq!(json["index"], 1);

        let failed = serde_json::to_value(ChatEvent::Failed {
            kind: ProviderErrorKind::HttpStatus,
            message: "boom".to_string(),
            details: None,
        })
        .unwrap();
        assert_eq!(failed["kind"], "http_status");
        assert!(failed.get("details").is_none());
    }

    #[tokio::test]
    async fn send_delta_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sender = EventSender::new(tx);

        sender.send_delta(ChatEvent::TakingLong { active: true });
        sender.send_delta(ChatEvent::TakingLong { active: false });

        assert_eq!(
            *rx.recv().await.unwrap(),
            ChatEvent::TakingLong { active: true }
        );
        assert!(rx.try_recv().is_err());
    }
}
