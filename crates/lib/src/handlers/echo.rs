//! `/echo`: a two-turn flow that reads one more message from the conversation.

use crate::channels::{ConversationId, MessagingClient};
use crate::handler::{HandlerError, StateHandler, UpdateStream};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const ECHO_COMMAND: &str = "/echo";
pub const ECHO_PROMPT: &str = "Send me a message and I'll repeat it";

pub struct EchoHandler;

#[async_trait]
impl StateHandler for EchoHandler {
    fn command(&self) -> &str {
        ECHO_COMMAND
    }

    fn description(&self) -> &str {
        "Repeat the next message"
    }

    async fn process(
        &self,
        _ctx: CancellationToken,
        client: Arc<dyn MessagingClient>,
        conversation_id: ConversationId,
        updates: &mut UpdateStream<'_>,
    ) -> Result<(), HandlerError> {
        client.send(conversation_id, ECHO_PROMPT).await?;
        let Some(next) = updates.next_or_cancelled().await? else {
            return Ok(());
        };
        if next.text.is_empty() {
            client.send(conversation_id, "Nothing to repeat").await?;
        } else {
            client.send(conversation_id, &next.text).await?;
        }
        Ok(())
    }
}
