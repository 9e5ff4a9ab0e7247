//! `/help`: list the registered commands.

use crate::channels::{ConversationId, MessagingClient};
use crate::handler::{HandlerError, StateHandler, UpdateStream};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const HELP_COMMAND: &str = "/help";
const HELP_DESCRIPTION: &str = "Show available commands";

/// Replies with one `/command - description` line per command, itself included.
pub struct HelpHandler {
    text: String,
}

impl HelpHandler {
    /// `commands` are the (command, description) pairs of the other registered handlers.
    pub fn new(commands: Vec<(String, String)>) -> Self {
        let mut all = commands;
        if !all.iter().any(|(c, _)| c == HELP_COMMAND) {
            all.push((HELP_COMMAND.to_string(), HELP_DESCRIPTION.to_string()));
        }
        all.sort();
        let text = all
            .iter()
            .map(|(c, d)| format!("{} - {}", c, d))
            .collect::<Vec<_>>()
            .join("\n");
        Self { text }
    }

    /// Help for the given handlers plus `/help` itself.
    pub fn for_handlers(handlers: &[Arc<dyn StateHandler>]) -> Self {
        Self::new(
            handlers
                .iter()
                .map(|h| (h.command().to_string(), h.description().to_string()))
                .collect(),
        )
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

#[async_trait]
impl StateHandler for HelpHandler {
    fn command(&self) -> &str {
        HELP_COMMAND
    }

    fn description(&self) -> &str {
        HELP_DESCRIPTION
    }

    async fn process(
        &self,
        _ctx: CancellationToken,
        client: Arc<dyn MessagingClient>,
        conversation_id: ConversationId,
        _updates: &mut UpdateStream<'_>,
    ) -> Result<(), HandlerError> {
        client.send(conversation_id, &self.text).await?;
        Ok(())
    }
}
