//! Dispatcher: single reader of the shared update stream, fanning updates out to one
//! [`ConversationProcessor`] per conversation.
//!
//! The registry is owned by the dispatcher and only touched from [`Dispatcher::run`], so it needs
//! no lock. Conversation tasks are spawned on a [`TaskTracker`] which teardown closes and awaits.
//! Handing an update to a processor never waits, so a stuck conversation cannot hold up the
//! shared stream.

use crate::channels::{ClientError, ConversationId, MessagingClient, Update};
use crate::handler::{HandlerSet, HandlerSetBuilder, HandlerSetError, StateHandler};
use crate::processor::{
    ConversationProcessor, ProcessorError, ProcessorOptions, DEFAULT_IDLE_TIMEOUT,
};
use crate::stats::DispatchStats;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub const DEFAULT_POLL_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_REAP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("messaging client is required")]
    MissingClient,
    #[error(transparent)]
    Handlers(#[from] HandlerSetError),
    #[error("update stream closed")]
    StreamClosed,
    #[error("opening update stream: {0}")]
    Client(#[from] ClientError),
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub processor: ProcessorOptions,
    /// Long-poll timeout passed to the update stream.
    pub poll_timeout_secs: u64,
    /// Upper bound on waiting for conversation tasks during teardown.
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            processor: ProcessorOptions::default(),
            poll_timeout_secs: DEFAULT_POLL_TIMEOUT_SECS,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

#[derive(Default)]
pub struct DispatcherBuilder {
    client: Option<Arc<dyn MessagingClient>>,
    handlers: HandlerSetBuilder,
    options: DispatcherOptions,
}

impl DispatcherBuilder {
    pub fn client(mut self, client: Arc<dyn MessagingClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn StateHandler>) -> Self {
        self.handlers = self.handlers.register(handler);
        self
    }

    pub fn options(mut self, options: DispatcherOptions) -> Self {
        self.options = options;
        self
    }

    /// Fails when no client was given or the handler set is invalid (at least one is required).
    pub fn build(self) -> Result<Dispatcher, DispatchError> {
        let client = self.client.ok_or(DispatchError::MissingClient)?;
        let handlers = self.handlers.build()?;
        Ok(Dispatcher {
            client,
            handlers,
            options: self.options,
            registry: HashMap::new(),
            tracker: TaskTracker::new(),
            stats: Arc::new(DispatchStats::new()),
        })
    }
}

pub struct Dispatcher {
    client: Arc<dyn MessagingClient>,
    handlers: HandlerSet,
    options: DispatcherOptions,
    registry: HashMap<ConversationId, Arc<ConversationProcessor>>,
    tracker: TaskTracker,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    pub fn handlers(&self) -> &HandlerSet {
        &self.handlers
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        self.stats.clone()
    }

    /// Completion barrier for conversation tasks.
    pub fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    /// Number of registered conversation processors.
    pub fn conversation_count(&self) -> usize {
        self.registry.len()
    }

    /// Read the update stream until `cancel` fires (returns Ok) or the stream closes (returns
    /// [`DispatchError::StreamClosed`]). Either way every conversation queue is closed and the
    /// conversation tasks are awaited, up to the shutdown timeout, before returning.
    pub async fn run(
        &mut self,
        cancel: CancellationToken,
        offset: i64,
        limit: u32,
    ) -> Result<(), DispatchError> {
        let mut updates = self
            .client
            .update_stream(offset, limit, self.options.poll_timeout_secs)?;
        self.tracker.reopen();
        log::info!("dispatcher: reading updates from offset {}", offset);

        // Stopped processors are dropped from the registry about once per idle timeout.
        let reap_period = self
            .options
            .processor
            .idle_timeout
            .map(|t| t.max(MIN_REAP_INTERVAL));
        let mut reap = tokio::time::interval(reap_period.unwrap_or(DEFAULT_IDLE_TIMEOUT));
        reap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                update = updates.recv() => Some(update),
                _ = reap.tick(), if reap_period.is_some() => {
                    self.reap_stopped();
                    continue;
                }
            };
            match next {
                None => {
                    log::info!("dispatcher: cancelled, stopping");
                    break Ok(());
                }
                Some(None) => {
                    log::error!("dispatcher: update stream closed");
                    break Err(DispatchError::StreamClosed);
                }
                Some(Some(update)) => self.dispatch_update(&cancel, update),
            }
        };

        drop(updates);
        self.teardown().await;
        result
    }

    fn dispatch_update(&mut self, cancel: &CancellationToken, update: Update) {
        self.stats.record_update();
        let chat_id = update.conversation_id;
        let result = match self.processor_for(chat_id, cancel).offer(update) {
            // The processor stopped on its own after the registry lookup; its successor waits
            // for it to finish, so the conversation stays in order.
            Err((ProcessorError::Closed(_), update)) => {
                log::debug!("chat[id:{}] processor stopped, handing over to a new one", chat_id);
                self.start_processor(chat_id, cancel).offer(update)
            }
            other => other,
        };
        if let Err((e, _)) = result {
            self.stats.record_enqueue_failure();
            log::warn!("failed to put the update into the chat[ID:{}]: {}", chat_id, e);
        }
    }

    /// Registered processor for `chat_id`, or a new one (registered and started). A processor
    /// whose task has already stopped is replaced.
    fn processor_for(
        &mut self,
        chat_id: ConversationId,
        cancel: &CancellationToken,
    ) -> Arc<ConversationProcessor> {
        if let Some(existing) = self.registry.get(&chat_id) {
            if !existing.is_stopped() {
                return existing.clone();
            }
            log::debug!("chat[id:{}] processor had stopped, replacing it", chat_id);
        }
        self.start_processor(chat_id, cancel)
    }

    /// Register and start a fresh processor. It begins reading only after the processor it
    /// replaces has finished.
    fn start_processor(
        &mut self,
        chat_id: ConversationId,
        cancel: &CancellationToken,
    ) -> Arc<ConversationProcessor> {
        let processor = Arc::new(ConversationProcessor::new(
            chat_id,
            self.client.clone(),
            self.handlers.clone(),
            self.options.processor.clone(),
            self.stats.clone(),
        ));
        let previous = self.registry.insert(chat_id, processor.clone());
        self.stats.set_active_conversations(self.registry.len());

        let task = processor.clone();
        let token = cancel.child_token();
        self.tracker.spawn(async move {
            if let Some(previous) = previous {
                previous.finished().await;
            }
            if let Err(e) = task.run(token).await {
                log::error!("chat[id:{}] processor: {}", chat_id, e);
            }
        });
        log::debug!("chat[id:{}] processor created", chat_id);
        processor
    }

    fn reap_stopped(&mut self) {
        let before = self.registry.len();
        self.registry.retain(|_, p| !p.is_stopped());
        if self.registry.len() != before {
            log::debug!(
                "dispatcher: released {} stopped conversation(s)",
                before - self.registry.len()
            );
            self.stats.set_active_conversations(self.registry.len());
        }
    }

    async fn teardown(&mut self) {
        for (chat_id, processor) in self.registry.drain() {
            if let Err(e) = processor.close() {
                log::warn!("chat[id:{}] close: {}", chat_id, e);
            }
        }
        self.stats.set_active_conversations(0);

        self.tracker.close();
        let timeout = self.options.shutdown_timeout;
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            log::warn!(
                "dispatcher: {} conversation task(s) still running after {:?}",
                self.tracker.len(),
                timeout
            );
        } else {
            log::info!("dispatcher: all conversation tasks finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::HelpHandler;

    #[test]
    fn build_without_client_fails() {
        let err = Dispatcher::builder()
            .handler(Arc::new(HelpHandler::new(Vec::new())))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, DispatchError::MissingClient));
    }

    #[test]
    fn default_options() {
        let o = DispatcherOptions::default();
        assert_eq!(o.poll_timeout_secs, 30);
        assert_eq!(o.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(o.processor.queue_capacity, 64);
        assert_eq!(o.processor.idle_timeout, Some(Duration::from_secs(1800)));
        assert!(!o.processor.notify_on_shutdown);
    }
}
