//! Typed publish/subscribe routing for decoded records.
//!
//! [`EventRouter`] classifies each [`ChunkedRecord`] by payload kind and
//! republishes it on broadcast channels: every message payload goes out on
//! the generic `messages` channel, then once more on its kind-specific
//! channel (chat, gift, notification); state payloads go out on `states`.
//! Unknown message kinds stop after the generic publication; unknown record
//! payloads are dropped entirely. The metadata envelope rides along with
//! every publication.
//!
//! Subscribers are independent: each `subscribe_*` call returns its own
//! receiver, and slow subscribers lag (dropping their oldest events)
//! without affecting anyone else.

use tokio::sync::broadcast;

use crate::protocol::{
    Chat, ChunkedRecord, Gift, LiveMessage, LiveState, Notification, RecordMeta, RecordPayload,
};

/// A routed publication: the classified body plus the record's metadata
/// envelope.
#[derive(Debug, Clone)]
pub struct Published<T> {
    /// The classified payload body.
    pub body: T,
    /// Metadata envelope of the carrying record, if present.
    pub meta: Option<RecordMeta>,
}

/// Multi-subscriber router for decoded records.
///
/// Cloning shares the underlying channels, so any clone can dispatch or
/// subscribe.
#[derive(Debug, Clone)]
pub struct EventRouter {
    messages: broadcast::Sender<Published<LiveMessage>>,
    chats: broadcast::Sender<Published<Chat>>,
    gifts: broadcast::Sender<Published<Gift>>,
    notifications: broadcast::Sender<Published<Notification>>,
    states: broadcast::Sender<Published<LiveState>>,
}

impl EventRouter {
    /// Create a router whose channels buffer `capacity` events per
    /// subscriber before lagging.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: broadcast::channel(capacity).0,
            chats: broadcast::channel(capacity).0,
            gifts: broadcast::channel(capacity).0,
            notifications: broadcast::channel(capacity).0,
            states: broadcast::channel(capacity).0,
        }
    }

    /// Subscribe to every message payload, regardless of kind.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Published<LiveMessage>> {
        self.messages.subscribe()
    }

    /// Subscribe to viewer comments.
    pub fn subscribe_chats(&self) -> broadcast::Receiver<Published<Chat>> {
        self.chats.subscribe()
    }

    /// Subscribe to gift events.
    pub fn subscribe_gifts(&self) -> broadcast::Receiver<Published<Gift>> {
        self.gifts.subscribe()
    }

    /// Subscribe to server notifications.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Published<Notification>> {
        self.notifications.subscribe()
    }

    /// Subscribe to broadcast state changes.
    pub fn subscribe_states(&self) -> broadcast::Receiver<Published<LiveState>> {
        self.states.subscribe()
    }

    /// Classify one record and publish it to the matching channels.
    pub fn dispatch(&self, record: ChunkedRecord) {
        let meta = record.meta;
        match record.payload {
            RecordPayload::Message(message) => {
                // Generic publication first, then the kind-specific one.
                let _ = self
                    .messages
                    .send(Published { body: message.clone(), meta: meta.clone() });

                match message {
                    LiveMessage::Chat(chat) => {
                        let _ = self.chats.send(Published { body: chat, meta });
                    }
                    LiveMessage::Gift(gift) => {
                        let _ = self.gifts.send(Published { body: gift, meta });
                    }
                    LiveMessage::SimpleNotification(notification) => {
                        let _ = self
                            .notifications
                            .send(Published { body: notification, meta });
                    }
                    LiveMessage::Unknown(_) => {
                        log::trace!("unknown message kind, generic publication only");
                    }
                }
            }
            RecordPayload::State(state) => {
                let _ = self.states.send(Published { body: state, meta });
            }
            RecordPayload::Unknown(value) => {
                log::trace!("dropping unknown record payload: {value}");
            }
        }
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_record(content: &str, id: &str) -> ChunkedRecord {
        serde_json::from_value(serde_json::json!({
            "meta": { "id": id },
            "payload": { "message": { "chat": { "content": content } } },
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_chat_published_generic_and_specific() {
        let router = EventRouter::new(8);
        let mut messages = router.subscribe_messages();
        let mut chats = router.subscribe_chats();

        router.dispatch(chat_record("hello", "m-1"));

        let generic = messages.recv().await.unwrap();
        assert!(matches!(generic.body, LiveMessage::Chat(_)));
        assert_eq!(generic.meta.unwrap().id.as_deref(), Some("m-1"));

        let specific = chats.recv().await.unwrap();
        assert_eq!(specific.body.content, "hello");
        assert_eq!(specific.meta.unwrap().id.as_deref(), Some("m-1"));
    }

    #[tokio::test]
    async fn test_unknown_message_kind_only_generic() {
        let router = EventRouter::new(8);
        let mut messages = router.subscribe_messages();
        let mut chats = router.subscribe_chats();

        let record: ChunkedRecord = serde_json::from_value(serde_json::json!({
            "payload": { "message": { "nicoad": { "totalPoint": 900 } } },
        }))
        .unwrap();
        router.dispatch(record);
        router.dispatch(chat_record("after", "m-2"));

        assert!(matches!(
            messages.recv().await.unwrap().body,
            LiveMessage::Unknown(_)
        ));
        // The chat channel never saw the unknown kind.
        assert_eq!(chats.recv().await.unwrap().body.content, "after");
    }

    #[tokio::test]
    async fn test_unknown_payload_dropped() {
        let router = EventRouter::new(8);
        let mut messages = router.subscribe_messages();

        let record: ChunkedRecord = serde_json::from_value(serde_json::json!({
            "payload": { "signal": "flushed" },
        }))
        .unwrap();
        router.dispatch(record);
        router.dispatch(chat_record("visible", "m-3"));

        // Only the chat arrives; the signal payload was dropped outright.
        assert!(matches!(
            messages.recv().await.unwrap().body,
            LiveMessage::Chat(_)
        ));
    }

    #[tokio::test]
    async fn test_state_routed_to_state_channel() {
        let router = EventRouter::new(8);
        let mut states = router.subscribe_states();

        let record: ChunkedRecord = serde_json::from_value(serde_json::json!({
            "payload": { "state": { "statistics": { "viewers": 12 } } },
        }))
        .unwrap();
        router.dispatch(record);

        let published = states.recv().await.unwrap();
        assert_eq!(published.body.0["statistics"]["viewers"], 12);
    }

    #[tokio::test]
    async fn test_independent_subscribers() {
        let router = EventRouter::new(8);
        let mut first = router.subscribe_chats();
        let mut second = router.subscribe_chats();

        router.dispatch(chat_record("fan-out", "m-4"));

        assert_eq!(first.recv().await.unwrap().body.content, "fan-out");
        assert_eq!(second.recv().await.unwrap().body.content, "fan-out");
    }

    #[test]
    fn test_dispatch_without_subscribers_is_fine() {
        let router = EventRouter::new(8);
        router.dispatch(chat_record("nobody listening", "m-5"));
    }
}
