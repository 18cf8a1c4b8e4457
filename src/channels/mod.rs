//! Chat Platform Transports
//!
//! Everything the pipeline needs from a platform sits behind
//! [`MessageTransport`]:
//! - Console (stdin/stdout, in-memory history)
//! - Discord (REST API, polling intake)

pub mod console;
pub mod discord;
pub mod traits;

pub use console::ConsoleTransport;
pub use discord::{DiscordConfig, DiscordTransport};
pub use traits::{ChannelError, HistoryMessage, IncomingMessage, MessageTransport, SendOptions};

/// Supported transport types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    Console,
    Discord,
}

impl TransportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Console => "console",
            Self::Discord => "discord",
        }
    }
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
