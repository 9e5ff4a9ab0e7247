//! Messaging client capability: the narrow interface the dispatcher and handlers use.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::update::{ConversationId, UpdateReceiver};

/// Telegram rejects messages longer than this many characters.
pub const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("bot token not configured")]
    NotConfigured,
    #[error("messaging request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("messaging api error: {0}")]
    Api(String),
    #[error("update stream closed")]
    StreamClosed,
    #[error("operation cancelled")]
    Cancelled,
}

/// Text formatting mode for [`MessagingClient::send_with_parse_mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Markdown,
    MarkdownV2,
    Html,
}

impl ParseMode {
    /// Value of the Bot API `parse_mode` field.
    pub fn as_api_str(self) -> &'static str {
        match self {
            ParseMode::Markdown => "Markdown",
            ParseMode::MarkdownV2 => "MarkdownV2",
            ParseMode::Html => "HTML",
        }
    }
}

/// Outbound sends, attachment download and the inbound update stream.
///
/// Implementations must be safe to share across every conversation task without extra locking.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Send plain text. Long text goes out as several messages, in order.
    async fn send(&self, conversation_id: ConversationId, text: &str) -> Result<(), ClientError>;

    /// Send text rendered with the given parse mode. Chunked like [`MessagingClient::send`].
    async fn send_with_parse_mode(
        &self,
        conversation_id: ConversationId,
        text: &str,
        mode: ParseMode,
    ) -> Result<(), ClientError>;

    /// Send an audio file.
    async fn send_audio(
        &self,
        conversation_id: ConversationId,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), ClientError>;

    /// Fetch the bytes of an attachment. Returns [`ClientError::Cancelled`] if `ctx` fires first.
    async fn download_attachment(
        &self,
        ctx: &CancellationToken,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ClientError>;

    /// Open the ordered update stream starting at `offset`. `limit` bounds each poll batch and
    /// `timeout_secs` bounds how long one poll waits for new updates. The stream ends (yields
    /// `None`) when the client stops polling.
    fn update_stream(
        &self,
        offset: i64,
        limit: u32,
        timeout_secs: u64,
    ) -> Result<UpdateReceiver, ClientError>;
}

/// Split text into segments of at most `limit` characters (Unicode scalar values, not bytes).
/// Empty text yields no segments.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for c in text.chars() {
        if count == limit {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(c);
        count += 1;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_text_counts_characters_not_bytes() {
        let text = "ж".repeat(5);
        let chunks = chunk_text(&text, 2);
        assert_eq!(chunks, vec!["жж", "жж", "ж"]);
    }

    #[test]
    fn chunk_text_exact_multiple_has_no_trailing_empty_chunk() {
        let text = "a".repeat(TELEGRAM_MAX_MESSAGE_LEN * 2);
        let chunks = chunk_text(&text, TELEGRAM_MAX_MESSAGE_LEN);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.chars().count() == TELEGRAM_MAX_MESSAGE_LEN));
    }

    #[test]
    fn chunk_text_empty_and_short() {
        assert!(chunk_text("", 10).is_empty());
        assert_eq!(chunk_text("hello", TELEGRAM_MAX_MESSAGE_LEN), vec!["hello"]);
    }

    #[test]
    fn parse_mode_api_strings() {
        assert_eq!(ParseMode::Markdown.as_api_str(), "Markdown");
        assert_eq!(ParseMode::MarkdownV2.as_api_str(), "MarkdownV2");
        assert_eq!(ParseMode::Html.as_api_str(), "HTML");
    }
}
