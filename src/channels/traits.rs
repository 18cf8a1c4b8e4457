//! Transport Trait Definitions
//!
//! The narrow interface the pipeline needs from a chat platform.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::budget::MessageText;

/// Error types for transport operations
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("History fetch failed: {0}")]
    FetchFailed(String),

    #[error("Rate limited: retry after {0} seconds")]
    RateLimited(u64),

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// A message entering the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Platform message ID
    pub id: String,
    /// Channel the message arrived on
    pub channel_id: String,
    /// Sender identifier
    pub author_id: String,
    /// Message text
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl IncomingMessage {
    /// Text message stamped now with a fresh ID
    pub fn text(channel_id: &str, author_id: &str, text: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.to_string(),
            author_id: author_id.to_string(),
            text: text.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// One entry of fetched channel history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub id: String,
    pub text: String,
    pub author_id: String,
    /// Whether the gateway's own bot wrote it
    pub from_bot: bool,
    pub timestamp: DateTime<Utc>,
}

impl MessageText for HistoryMessage {
    fn message_text(&self) -> &str {
        &self.text
    }
}

/// Per-send options
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Thread the reply against this message
    pub reply_to: Option<String>,
}

impl SendOptions {
    pub fn reply_to(message_id: impl Into<String>) -> Self {
        Self {
            reply_to: Some(message_id.into()),
        }
    }
}

/// Chat platform transport
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Transport name identifier
    fn name(&self) -> &str;

    /// Send text, returning the new message ID
    async fn send(&self, channel_id: &str, text: &str, options: SendOptions) -> Result<String, ChannelError>;

    /// Fetch up to `limit` recent messages, oldest first
    async fn fetch_history(&self, channel_id: &str, limit: usize) -> Result<Vec<HistoryMessage>, ChannelError>;

    /// Send typing indicator
    async fn send_typing(&self, channel_id: &str) -> Result<(), ChannelError>;
}
