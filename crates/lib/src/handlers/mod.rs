//! Built-in state handlers.

mod echo;
mod help;

pub use echo::{EchoHandler, ECHO_COMMAND, ECHO_PROMPT};
pub use help::{HelpHandler, HELP_COMMAND};
