//! Messaging channels (e.g. Telegram).
//!
//! The dispatcher consumes a channel only through [`MessagingClient`]: an ordered update
//! stream in, and text/audio sends out. Handlers get the same client for their replies.

mod client;
mod telegram;
mod update;

pub use client::{chunk_text, ClientError, MessagingClient, ParseMode, TELEGRAM_MAX_MESSAGE_LEN};
pub use telegram::{TelegramClient, TelegramUpdate};
pub use update::{ConversationId, Update, UpdateReceiver};
