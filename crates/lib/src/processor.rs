//! Conversation processor: serializes one conversation's updates and runs its state machine.
//!
//! Two states only. Idle matches each update's routing key against the handler set; a match
//! moves the conversation into the handler (which may keep reading the queue) until the call
//! returns, then back to Idle. Nothing carries over between updates.

use crate::channels::{ConversationId, MessagingClient, Update};
use crate::handler::{HandlerError, HandlerSet, UpdateStream};
use crate::stats::DispatchStats;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

pub const UNKNOWN_COMMAND_NOTICE: &str = "Unknown command";
pub const IDLE_NOTICE: &str = "You're in the main state";
pub const CLOSED_NOTICE: &str = "Conversation closed";

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Told to the conversation once it is back in Idle after updates were rejected on a full queue.
pub fn overflow_notice(dropped: u64) -> String {
    format!("Too many messages at once, {} dropped", dropped)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    #[error("update for chat {actual} routed to the processor of chat {expected}")]
    RoutingMismatch {
        expected: ConversationId,
        actual: ConversationId,
    },
    #[error("queue of chat {0} is closed")]
    Closed(ConversationId),
    #[error("queue of chat {0} is already closed")]
    AlreadyClosed(ConversationId),
    #[error("queue of chat {0} is full")]
    QueueFull(ConversationId),
    #[error("processor of chat {0} is already running")]
    AlreadyRunning(ConversationId),
}

/// Queue and notification settings for each processor.
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Bounded queue size (minimum 1). Updates beyond it are rejected, never waited on.
    pub queue_capacity: usize,
    /// Stop a processor that sat in Idle with an empty queue this long. `None` keeps it forever.
    pub idle_timeout: Option<Duration>,
    /// Send [`CLOSED_NOTICE`] to the conversation when the processor is cancelled.
    pub notify_on_shutdown: bool,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            notify_on_shutdown: false,
        }
    }
}

enum Next {
    Cancelled,
    Closed,
    IdleTimeout,
    Update(Update),
}

/// One conversation's queue and state machine. Shared between the dispatcher registry and the
/// processor's own task.
pub struct ConversationProcessor {
    id: ConversationId,
    client: Arc<dyn MessagingClient>,
    handlers: HandlerSet,
    options: ProcessorOptions,
    stats: Arc<DispatchStats>,
    tx: Mutex<Option<mpsc::Sender<Update>>>,
    rx: Mutex<Option<mpsc::Receiver<Update>>>,
    /// Cancelled when the run loop ends, including by panic.
    finished: CancellationToken,
    dropped: AtomicU64,
}

impl ConversationProcessor {
    pub fn new(
        id: ConversationId,
        client: Arc<dyn MessagingClient>,
        handlers: HandlerSet,
        options: ProcessorOptions,
        stats: Arc<DispatchStats>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        Self {
            id,
            client,
            handlers,
            options,
            stats,
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            finished: CancellationToken::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ConversationId {
        self.id
    }

    /// True once [`ConversationProcessor::run`] has ended, normally or by panic.
    pub fn is_stopped(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Resolves once the run loop has ended.
    pub async fn finished(&self) {
        self.finished.cancelled().await
    }

    /// Queue an update for this conversation without waiting.
    ///
    /// A full queue rejects the update with [`ProcessorError::QueueFull`] and the conversation
    /// is told how many updates it lost once it is back in Idle. An update for another
    /// conversation is rejected before touching the queue.
    pub fn enqueue(&self, update: Update) -> Result<(), ProcessorError> {
        self.offer(update).map_err(|(e, _)| e)
    }

    /// Like [`ConversationProcessor::enqueue`], but hands a rejected update back.
    pub fn offer(&self, update: Update) -> Result<(), (ProcessorError, Update)> {
        if update.conversation_id != self.id {
            let err = ProcessorError::RoutingMismatch {
                expected: self.id,
                actual: update.conversation_id,
            };
            return Err((err, update));
        }
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            return Err((ProcessorError::Closed(self.id), update));
        };
        match tx.try_send(update) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(update)) => Err((ProcessorError::Closed(self.id), update)),
            Err(TrySendError::Full(update)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err((ProcessorError::QueueFull(self.id), update))
            }
        }
    }

    /// Close the inbound queue. Updates already queued are still processed; the loop then stops.
    /// Closing twice is an error.
    pub fn close(&self) -> Result<(), ProcessorError> {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        match tx {
            Some(_) => {
                log::debug!("chat[id:{}] queue closed", self.id);
                Ok(())
            }
            None => Err(ProcessorError::AlreadyClosed(self.id)),
        }
    }

    /// State machine loop. Returns when `cancel` fires, the queue is closed and drained, or the
    /// conversation stayed idle past the idle timeout. Can run only once per processor.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), ProcessorError> {
        let mut rx = self
            .rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(ProcessorError::AlreadyRunning(self.id))?;
        let _finished = self.finished.clone().drop_guard();
        log::info!("chat[id:{}] processor started", self.id);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Next::Cancelled,
                update = rx.recv() => match update {
                    Some(u) => Next::Update(u),
                    None => Next::Closed,
                },
                _ = idle_wait(self.options.idle_timeout) => Next::IdleTimeout,
            };
            match next {
                Next::Cancelled => {
                    log::info!("context canceled, chat[id:{}] is closed", self.id);
                    if self.options.notify_on_shutdown {
                        self.send_notice(CLOSED_NOTICE).await;
                    }
                    break;
                }
                Next::Closed => {
                    log::info!("queue closed, chat[id:{}] is closed", self.id);
                    break;
                }
                // Refuse new updates but still drain what got in before the close.
                Next::IdleTimeout => {
                    log::debug!("chat[id:{}] idle, stopping processor", self.id);
                    rx.close();
                }
                Next::Update(update) => self.process_update(&cancel, &mut rx, update).await,
            }
        }
        Ok(())
    }

    async fn process_update(
        &self,
        cancel: &CancellationToken,
        rx: &mut mpsc::Receiver<Update>,
        update: Update,
    ) {
        if update.conversation_id != self.id {
            log::error!(
                "chat[id:{}] received an update for chat {}, dropping it",
                self.id,
                update.conversation_id
            );
            return;
        }
        let state = update.routing_key().to_string();
        match self.handlers.get(&state) {
            Some(handler) => {
                let ctx = cancel.child_token();
                let _cancel_on_return = ctx.clone().drop_guard();
                let mut stream = UpdateStream::new(update, rx, ctx.clone());
                let call = handler.process(ctx, self.client.clone(), self.id, &mut stream);
                let result = match AssertUnwindSafe(call).catch_unwind().await {
                    Ok(r) => r,
                    Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
                };
                match result {
                    Ok(()) => {}
                    Err(HandlerError::Cancelled) if cancel.is_cancelled() => {
                        log::debug!("chat[id:{}] state {} cancelled", self.id, state);
                    }
                    Err(e) => {
                        self.stats.record_handler_failure();
                        let msg = format!(
                            "failed to process an update for chat[id:{}]: process the state {}: {}",
                            self.id, state, e
                        );
                        log::error!("{}", msg);
                        self.send_notice(&msg).await;
                    }
                }
            }
            None => self.send_notice(UNKNOWN_COMMAND_NOTICE).await,
        }

        // Shutting down: the conversation is not going back to Idle.
        if cancel.is_cancelled() {
            return;
        }
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            self.send_notice(&overflow_notice(dropped)).await;
        }
        self.send_notice(IDLE_NOTICE).await;
    }

    /// Best-effort send: failures are logged, never escalated.
    async fn send_notice(&self, text: &str) {
        if let Err(e) = self.client.send(self.id, text).await {
            log::error!("send the message [{}] to the chat [ID:{}]: {}", text, self.id, e);
        }
    }
}

async fn idle_wait(timeout: Option<Duration>) {
    match timeout {
        Some(t) => tokio::time::sleep(t).await,
        None => std::future::pending().await,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
