//! Telegram channel: long-poll getUpdates, sendMessage/sendAudio and file download via Bot API.

use crate::channels::client::{
    chunk_text, ClientError, MessagingClient, ParseMode, TELEGRAM_MAX_MESSAGE_LEN,
};
use crate::channels::update::{ConversationId, Update, UpdateReceiver};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Extra time on top of the long-poll timeout before the HTTP request itself gives up.
const POLL_REQUEST_GRACE: Duration = Duration::from_secs(15);
const POLL_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram update payload (getUpdates result item).
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub chat: TelegramChat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub document: Option<TelegramFileRef>,
    #[serde(default)]
    pub audio: Option<TelegramFileRef>,
    #[serde(default)]
    pub voice: Option<TelegramFileRef>,
    #[serde(default)]
    pub photo: Vec<TelegramPhotoSize>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TelegramFileRef {
    pub file_id: String,
}

#[derive(Debug, Deserialize)]
pub struct TelegramPhotoSize {
    pub file_id: String,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TelegramFile {
    #[serde(default)]
    file_path: Option<String>,
}

impl TelegramUpdate {
    /// Convert into a routed [`Update`], keeping `raw` as the payload. None when there is no message.
    pub fn into_update(self, raw: serde_json::Value) -> Option<Update> {
        let msg = self.message?;
        let attachment_id = msg
            .document
            .map(|f| f.file_id)
            .or_else(|| msg.audio.map(|f| f.file_id))
            .or_else(|| msg.voice.map(|f| f.file_id))
            .or_else(|| {
                msg.photo
                    .into_iter()
                    .max_by_key(|p| p.file_size.unwrap_or(0))
                    .map(|p| p.file_id)
            });
        Some(Update {
            update_id: self.update_id,
            conversation_id: msg.chat.id,
            text: msg.text.or(msg.caption).unwrap_or_default(),
            attachment_id,
            raw,
        })
    }
}

/// Telegram Bot API client. Cheap to clone; clones share the HTTP pool and the running flag.
#[derive(Clone)]
pub struct TelegramClient {
    token: Option<String>,
    api_base: String,
    running: Arc<AtomicBool>,
    client: reqwest::Client,
}

impl TelegramClient {
    pub fn new(token: Option<String>, api_base: Option<String>) -> Self {
        let api_base = api_base
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| TELEGRAM_API_BASE.to_string());
        Self {
            token,
            api_base,
            running: Arc::new(AtomicBool::new(false)),
            client: reqwest::Client::new(),
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the getUpdates loop; the update stream closes once the current poll returns.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn method_url(&self, method: &str) -> Result<String, ClientError> {
        let token = self.token.as_ref().ok_or(ClientError::NotConfigured)?;
        Ok(format!("{}/bot{}/{}", self.api_base, token, method))
    }

    async fn decode<T: DeserializeOwned>(
        method: &str,
        res: reqwest::Response,
    ) -> Result<T, ClientError> {
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ClientError::Api(format!("{} failed: {} {}", method, status, body)));
        }
        let data: ApiResponse<T> = res.json().await?;
        if !data.ok {
            return Err(ClientError::Api(format!(
                "{} returned ok: false ({})",
                method,
                data.description.unwrap_or_default()
            )));
        }
        data.result
            .ok_or_else(|| ClientError::Api(format!("{} returned no result", method)))
    }

    /// POST a JSON body to a Bot API method and decode `result`.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, ClientError> {
        let url = self.method_url(method)?;
        let res = self.client.post(&url).json(&body).send().await?;
        Self::decode(method, res).await
    }

    /// Call Telegram getUpdates (long poll). Returns (raw updates, next_offset).
    async fn get_updates(
        &self,
        offset: i64,
        limit: u32,
        timeout_secs: u64,
    ) -> Result<(Vec<serde_json::Value>, Option<i64>), ClientError> {
        let url = self.method_url("getUpdates")?;
        let res = self
            .client
            .get(&url)
            .query(&[
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
                ("timeout", timeout_secs.to_string()),
            ])
            .timeout(Duration::from_secs(timeout_secs) + POLL_REQUEST_GRACE)
            .send()
            .await?;
        let result: Vec<serde_json::Value> = Self::decode("getUpdates", res).await?;
        let next_offset = result
            .iter()
            .filter_map(|u| u.get("update_id").and_then(|id| id.as_i64()))
            .max()
            .map(|id| id + 1);
        Ok((result, next_offset))
    }

    async fn send_text(
        &self,
        conversation_id: ConversationId,
        text: &str,
        mode: Option<ParseMode>,
    ) -> Result<(), ClientError> {
        for chunk in chunk_text(text, TELEGRAM_MAX_MESSAGE_LEN) {
            let mut body = serde_json::json!({ "chat_id": conversation_id, "text": chunk });
            if let Some(mode) = mode {
                body["parse_mode"] = serde_json::Value::String(mode.as_api_str().to_string());
            }
            let _: serde_json::Value = self.call("sendMessage", body).await?;
        }
        Ok(())
    }

    async fn fetch_file(&self, attachment_id: &str) -> Result<Vec<u8>, ClientError> {
        let token = self.token.as_ref().ok_or(ClientError::NotConfigured)?;
        let file: TelegramFile = self
            .call("getFile", serde_json::json!({ "file_id": attachment_id }))
            .await?;
        let path = file
            .file_path
            .ok_or_else(|| ClientError::Api(format!("getFile returned no path for {}", attachment_id)))?;
        let url = format!("{}/file/bot{}/{}", self.api_base, token, path);
        let res = self
            .client
            .get(&url)
            .header("Cache-Control", "no-cache")
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ClientError::Api(format!("file download failed: {} {}", status, body)));
        }
        Ok(res.bytes().await?.to_vec())
    }
}

async fn run_get_updates_loop(
    client: TelegramClient,
    tx: mpsc::Sender<Update>,
    mut offset: i64,
    limit: u32,
    timeout_secs: u64,
) {
    while client.running() {
        let polled = tokio::select! {
            _ = tx.closed() => break,
            polled = client.get_updates(offset, limit, timeout_secs) => polled,
        };
        match polled {
            Ok((updates, next)) => {
                if let Some(next) = next {
                    offset = next;
                }
                for raw in updates {
                    let decoded = match serde_json::from_value::<TelegramUpdate>(raw.clone()) {
                        Ok(u) => u.into_update(raw),
                        Err(e) => {
                            log::warn!("telegram: skipping undecodable update: {}", e);
                            continue;
                        }
                    };
                    let Some(update) = decoded else { continue };
                    if tx.send(update).await.is_err() {
                        log::debug!("telegram: update stream receiver dropped, stopping loop");
                        return;
                    }
                }
            }
            Err(ClientError::NotConfigured) => {
                log::error!("telegram: bot token not configured, stopping getUpdates loop");
                break;
            }
            Err(e) => {
                log::warn!("telegram getUpdates error: {}", e);
                tokio::time::sleep(POLL_RETRY_DELAY).await;
            }
        }
    }
    log::info!("telegram channel: getUpdates loop stopped");
}

#[async_trait]
impl MessagingClient for TelegramClient {
    async fn send(&self, conversation_id: ConversationId, text: &str) -> Result<(), ClientError> {
        self.send_text(conversation_id, text, None).await
    }

    async fn send_with_parse_mode(
        &self,
        conversation_id: ConversationId,
        text: &str,
        mode: ParseMode,
    ) -> Result<(), ClientError> {
        self.send_text(conversation_id, text, Some(mode)).await
    }

    async fn send_audio(
        &self,
        conversation_id: ConversationId,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), ClientError> {
        let url = self.method_url("sendAudio")?;
        let part = reqwest::multipart::Part::bytes(bytes).file_name(name.to_string());
        let form = reqwest::multipart::Form::new()
            .text("chat_id", conversation_id.to_string())
            .part("audio", part);
        let res = self.client.post(&url).multipart(form).send().await?;
        let _: serde_json::Value = Self::decode("sendAudio", res).await?;
        Ok(())
    }

    async fn download_attachment(
        &self,
        ctx: &CancellationToken,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ClientError> {
        tokio::select! {
            _ = ctx.cancelled() => Err(ClientError::Cancelled),
            res = self.fetch_file(attachment_id) => res,
        }
    }

    fn update_stream(
        &self,
        offset: i64,
        limit: u32,
        timeout_secs: u64,
    ) -> Result<UpdateReceiver, ClientError> {
        if self.token.is_none() {
            return Err(ClientError::NotConfigured);
        }
        let (tx, rx) = mpsc::channel(limit.max(1) as usize);
        self.running.store(true, Ordering::SeqCst);
        log::info!(
            "telegram channel: starting getUpdates long-poll loop (offset {}, limit {}, timeout {}s)",
            offset,
            limit,
            timeout_secs
        );
        tokio::spawn(run_get_updates_loop(self.clone(), tx, offset, limit, timeout_secs));
        Ok(rx)
    }
}
