//! State handler contract: pluggable units that each drive one named interaction flow.
//!
//! Handlers are registered once, at startup, into a [`HandlerSet`] keyed by command. The set is
//! shared read-only by every conversation processor.

use crate::channels::{ClientError, ConversationId, MessagingClient, Update};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler cancelled")]
    Cancelled,
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("{0}")]
    Failed(String),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// One named interaction flow.
///
/// `process` runs while the conversation is in the active state. It may read further updates from
/// `updates` until its interaction is complete, and must return promptly once `ctx` is cancelled
/// (either `Ok(())` or [`HandlerError::Cancelled`]).
#[async_trait]
pub trait StateHandler: Send + Sync {
    /// Routing key, e.g. "/start".
    fn command(&self) -> &str;

    /// One-line description shown in help output.
    fn description(&self) -> &str;

    async fn process(
        &self,
        ctx: CancellationToken,
        client: Arc<dyn MessagingClient>,
        conversation_id: ConversationId,
        updates: &mut UpdateStream<'_>,
    ) -> Result<(), HandlerError>;
}

/// The conversation's queue, lent to the active handler for the duration of one call.
///
/// Updates read here are consumed by the handler and never seen by the processor loop.
pub struct UpdateStream<'a> {
    trigger: Update,
    rx: &'a mut mpsc::Receiver<Update>,
    ctx: CancellationToken,
}

impl<'a> UpdateStream<'a> {
    pub fn new(trigger: Update, rx: &'a mut mpsc::Receiver<Update>, ctx: CancellationToken) -> Self {
        Self { trigger, rx, ctx }
    }

    /// The update whose routing key selected this handler.
    pub fn trigger(&self) -> &Update {
        &self.trigger
    }

    /// Next update for this conversation. None when the queue is closed or the call is cancelled.
    pub async fn next(&mut self) -> Option<Update> {
        tokio::select! {
            biased;
            _ = self.ctx.cancelled() => None,
            update = self.rx.recv() => update,
        }
    }

    /// Like [`UpdateStream::next`], but distinguishes cancellation from a closed queue.
    pub async fn next_or_cancelled(&mut self) -> Result<Option<Update>, HandlerError> {
        tokio::select! {
            biased;
            _ = self.ctx.cancelled() => Err(HandlerError::Cancelled),
            update = self.rx.recv() => Ok(update),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HandlerSetError {
    #[error("at least one state handler is required")]
    Empty,
    #[error("duplicate handler for command {0:?}")]
    Duplicate(String),
    #[error("invalid handler command {0:?}")]
    InvalidCommand(String),
}

/// Command -> handler map. Fixed at construction, never empty, cheap to clone.
#[derive(Clone)]
pub struct HandlerSet {
    handlers: Arc<HashMap<String, Arc<dyn StateHandler>>>,
}

impl HandlerSet {
    pub fn builder() -> HandlerSetBuilder {
        HandlerSetBuilder::default()
    }

    /// Exact-match lookup by routing key.
    pub fn get(&self, command: &str) -> Option<Arc<dyn StateHandler>> {
        self.handlers.get(command).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// (command, description) pairs sorted by command.
    pub fn commands(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .handlers
            .values()
            .map(|h| (h.command().to_string(), h.description().to_string()))
            .collect();
        out.sort();
        out
    }
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut commands: Vec<&String> = self.handlers.keys().collect();
        commands.sort();
        f.debug_struct("HandlerSet").field("commands", &commands).finish()
    }
}

#[derive(Default)]
pub struct HandlerSetBuilder {
    handlers: Vec<Arc<dyn StateHandler>>,
}

impl HandlerSetBuilder {
    pub fn register(mut self, handler: Arc<dyn StateHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Fails on an empty set, a blank command, or two handlers with the same command.
    pub fn build(self) -> Result<HandlerSet, HandlerSetError> {
        if self.handlers.is_empty() {
            return Err(HandlerSetError::Empty);
        }
        let mut map: HashMap<String, Arc<dyn StateHandler>> = HashMap::new();
        for h in self.handlers {
            let command = h.command().to_string();
            if command.trim().is_empty() || command.trim() != command {
                return Err(HandlerSetError::InvalidCommand(command));
            }
            if map.insert(command.clone(), h).is_some() {
                return Err(HandlerSetError::Duplicate(command));
            }
        }
        Ok(HandlerSet {
            handlers: Arc::new(map),
        })
    }
}
