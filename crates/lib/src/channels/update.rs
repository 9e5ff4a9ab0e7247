//! Inbound update from a channel: routed to a conversation by its id.

use tokio::sync::mpsc;

/// Stable identity of a conversation (e.g. Telegram chat id). Sole routing key for the dispatcher.
pub type ConversationId = i64;

/// Ordered stream of updates produced by a [`crate::channels::MessagingClient`].
pub type UpdateReceiver = mpsc::Receiver<Update>;

/// One inbound event. Immutable once received; ownership moves to whichever processor consumes it.
#[derive(Debug, Clone)]
pub struct Update {
    /// Provider sequence number; the next poll offset is the last seen id + 1.
    pub update_id: i64,
    pub conversation_id: ConversationId,
    /// Message text (or caption). Empty when the message carried neither.
    pub text: String,
    /// File id of the attached document, audio, voice note or largest photo.
    pub attachment_id: Option<String>,
    /// Provider payload as received.
    pub raw: serde_json::Value,
}

impl Update {
    /// Update with only a conversation and text (no provider payload).
    pub fn new(conversation_id: ConversationId, text: impl Into<String>) -> Self {
        Self {
            update_id: 0,
            conversation_id,
            text: text.into(),
            attachment_id: None,
            raw: serde_json::Value::Null,
        }
    }

    /// Key used to select a state handler: the message text as sent.
    pub fn routing_key(&self) -> &str {
        &self.text
    }
}
