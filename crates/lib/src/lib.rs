//! Switchboard core library: routes a single long-poll update stream to isolated per-conversation
//! state machines driven by pluggable state handlers.

pub mod channels;
pub mod config;
pub mod debug;
pub mod dispatcher;
pub mod handler;
pub mod handlers;
pub mod init;
pub mod processor;
pub mod stats;

pub use dispatcher::{DispatchError, Dispatcher, DispatcherOptions};
pub use handler::{HandlerError, HandlerSet, StateHandler, UpdateStream};
pub use processor::{ConversationProcessor, ProcessorError, ProcessorOptions};
