//! In-memory messaging client and test handlers shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchboard::channels::{
    ClientError, ConversationId, MessagingClient, ParseMode, Update, UpdateReceiver,
};
use switchboard::{HandlerError, StateHandler, UpdateStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Records every send; the update stream is fed by the test through the returned sender.
pub struct MockClient {
    sent: Mutex<Vec<(ConversationId, String)>>,
    stream: Mutex<Option<UpdateReceiver>>,
    fail_sends: AtomicBool,
    send_attempts: AtomicUsize,
    panic_on: Mutex<Option<String>>,
}

impl MockClient {
    pub fn new() -> (Arc<Self>, mpsc::Sender<Update>) {
        let (tx, rx) = mpsc::channel(256);
        let client = Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            stream: Mutex::new(Some(rx)),
            fail_sends: AtomicBool::new(false),
            send_attempts: AtomicUsize::new(0),
            panic_on: Mutex::new(None),
        });
        (client, tx)
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// The next send of exactly `text` panics; later sends of it go through.
    pub fn panic_once_on(&self, text: &str) {
        *self.panic_on.lock().unwrap() = Some(text.to_string());
    }

    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    pub fn all_sent(&self) -> Vec<(ConversationId, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn messages_for(&self, id: ConversationId) -> Vec<String> {
        self.all_sent()
            .into_iter()
            .filter(|(c, _)| *c == id)
            .map(|(_, m)| m)
            .collect()
    }

    /// Poll until `id` has received at least `n` messages; panics after 5s.
    pub async fn wait_for_messages(&self, id: ConversationId, n: usize) -> Vec<String> {
        for _ in 0..500 {
            let msgs = self.messages_for(id);
            if msgs.len() >= n {
                return msgs;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "chat {} got {:?}, expected at least {} messages",
            id,
            self.messages_for(id),
            n
        );
    }
}

#[async_trait]
impl MessagingClient for MockClient {
    async fn send(&self, conversation_id: ConversationId, text: &str) -> Result<(), ClientError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        let trip = {
            let mut panic_on = self.panic_on.lock().unwrap();
            if panic_on.as_deref() == Some(text) {
                panic_on.take()
            } else {
                None
            }
        };
        if let Some(text) = trip {
            panic!("send of {:?} blew up", text);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ClientError::Api("send refused".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((conversation_id, text.to_string()));
        Ok(())
    }

    async fn send_with_parse_mode(
        &self,
        conversation_id: ConversationId,
        text: &str,
        _mode: ParseMode,
    ) -> Result<(), ClientError> {
        self.send(conversation_id, text).await
    }

    async fn send_audio(
        &self,
        conversation_id: ConversationId,
        name: &str,
        _bytes: Vec<u8>,
    ) -> Result<(), ClientError> {
        self.send(conversation_id, &format!("audio:{}", name)).await
    }

    async fn download_attachment(
        &self,
        _ctx: &CancellationToken,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ClientError> {
        Ok(attachment_id.as_bytes().to_vec())
    }

    fn update_stream(
        &self,
        _offset: i64,
        _limit: u32,
        _timeout_secs: u64,
    ) -> Result<UpdateReceiver, ClientError> {
        self.stream
            .lock()
            .unwrap()
            .take()
            .ok_or(ClientError::StreamClosed)
    }
}

/// Replies `handled:<command>:<trigger text>` and counts calls.
pub struct RecordingHandler {
    command: String,
    pub calls: AtomicUsize,
}

impl RecordingHandler {
    pub fn new(command: &str) -> Arc<Self> {
        Arc::new(Self {
            command: command.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateHandler for RecordingHandler {
    fn command(&self) -> &str {
        &self.command
    }

    fn description(&self) -> &str {
        "records calls"
    }

    async fn process(
        &self,
        _ctx: CancellationToken,
        client: Arc<dyn MessagingClient>,
        conversation_id: ConversationId,
        updates: &mut UpdateStream<'_>,
    ) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = format!("handled:{}:{}", self.command, updates.trigger().text);
        // Send failures are not the handler's concern in these tests.
        let _ = client.send(conversation_id, &reply).await;
        Ok(())
    }
}

/// Reads `count` further updates and echoes each text back, in order.
pub struct CollectHandler {
    pub count: usize,
}

#[async_trait]
impl StateHandler for CollectHandler {
    fn command(&self) -> &str {
        "/collect"
    }

    fn description(&self) -> &str {
        "collects updates"
    }

    async fn process(
        &self,
        _ctx: CancellationToken,
        client: Arc<dyn MessagingClient>,
        conversation_id: ConversationId,
        updates: &mut UpdateStream<'_>,
    ) -> Result<(), HandlerError> {
        for _ in 0..self.count {
            let Some(u) = updates.next_or_cancelled().await? else {
                return Ok(());
            };
            assert_eq!(u.conversation_id, conversation_id);
            client.send(conversation_id, &u.text).await?;
        }
        Ok(())
    }
}

pub struct FailingHandler;

#[async_trait]
impl StateHandler for FailingHandler {
    fn command(&self) -> &str {
        "/fail"
    }

    fn description(&self) -> &str {
        "always fails"
    }

    async fn process(
        &self,
        _ctx: CancellationToken,
        _client: Arc<dyn MessagingClient>,
        _conversation_id: ConversationId,
        _updates: &mut UpdateStream<'_>,
    ) -> Result<(), HandlerError> {
        Err(HandlerError::failed("boom"))
    }
}

pub struct PanickingHandler;

#[async_trait]
impl StateHandler for PanickingHandler {
    fn command(&self) -> &str {
        "/panic"
    }

    fn description(&self) -> &str {
        "panics"
    }

    async fn process(
        &self,
        _ctx: CancellationToken,
        _client: Arc<dyn MessagingClient>,
        _conversation_id: ConversationId,
        _updates: &mut UpdateStream<'_>,
    ) -> Result<(), HandlerError> {
        panic!("kaboom");
    }
}

/// Waits until cancelled; `entered`/`cancelled` let the test observe both ends.
pub struct BlockingHandler {
    pub entered: AtomicBool,
    pub cancelled: AtomicBool,
}

impl BlockingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        })
    }

    pub async fn wait_entered(&self) {
        for _ in 0..500 {
            if self.entered.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("blocking handler was never entered");
    }
}

#[async_trait]
impl StateHandler for BlockingHandler {
    fn command(&self) -> &str {
        "/block"
    }

    fn description(&self) -> &str {
        "blocks until cancelled"
    }

    async fn process(
        &self,
        ctx: CancellationToken,
        _client: Arc<dyn MessagingClient>,
        _conversation_id: ConversationId,
        _updates: &mut UpdateStream<'_>,
    ) -> Result<(), HandlerError> {
        self.entered.store(true, Ordering::SeqCst);
        ctx.cancelled().await;
        self.cancelled.store(true, Ordering::SeqCst);
        Err(HandlerError::Cancelled)
    }
}

/// Holds the conversation until `release` fires, then replies `released`.
pub struct GateHandler {
    pub entered: AtomicBool,
    pub release: CancellationToken,
}

impl GateHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: AtomicBool::new(false),
            release: CancellationToken::new(),
        })
    }

    pub async fn wait_entered(&self) {
        for _ in 0..500 {
            if self.entered.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("gate handler was never entered");
    }
}

#[async_trait]
impl StateHandler for GateHandler {
    fn command(&self) -> &str {
        "/wait"
    }

    fn description(&self) -> &str {
        "waits for the test to release it"
    }

    async fn process(
        &self,
        ctx: CancellationToken,
        client: Arc<dyn MessagingClient>,
        conversation_id: ConversationId,
        _updates: &mut UpdateStream<'_>,
    ) -> Result<(), HandlerError> {
        self.entered.store(true, Ordering::SeqCst);
        tokio::select! {
            _ = ctx.cancelled() => return Err(HandlerError::Cancelled),
            _ = self.release.cancelled() => {}
        }
        client.send(conversation_id, "released").await?;
        Ok(())
    }
}
