//! Console Channel
//!
//! Terminal transport: stdin lines become messages, replies go to stdout.
//! History is kept in memory, bounded per channel.

use super::traits::*;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Default history kept per channel
const DEFAULT_MAX_HISTORY: usize = 200;

/// Console transport
pub struct ConsoleTransport {
    bot_id: String,
    max_history: usize,
    history: Mutex<HashMap<String, VecDeque<HistoryMessage>>>,
    /// Print replies to stdout
    echo: bool,
}

impl ConsoleTransport {
    pub fn new(bot_id: &str) -> Self {
        Self {
            bot_id: bot_id.to_string(),
            max_history: DEFAULT_MAX_HISTORY,
            history: Mutex::new(HashMap::new()),
            echo: true,
        }
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history.max(1);
        self
    }

    /// Keep replies off stdout
    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    /// Add a user message to channel history
    pub fn record_incoming(&self, message: &IncomingMessage) {
        self.push(
            &message.channel_id,
            HistoryMessage {
                id: message.id.clone(),
                text: message.text.clone(),
                author_id: message.author_id.clone(),
                from_bot: false,
                timestamp: message.timestamp,
            },
        );
    }

    fn push(&self, channel_id: &str, message: HistoryMessage) {
        let mut history = self.history.lock();
        let entries = history.entry(channel_id.to_string()).or_default();
        entries.push_back(message);
        while entries.len() > self.max_history {
            entries.pop_front();
        }
    }

    /// Number of messages held for a channel
    pub fn history_len(&self, channel_id: &str) -> usize {
        self.history.lock().get(channel_id).map(|h| h.len()).unwrap_or(0)
    }
}

#[async_trait]
impl MessageTransport for ConsoleTransport {
    fn name(&self) -> &str {
        "console"
    }

    async fn send(&self, channel_id: &str, text: &str, options: SendOptions) -> Result<String, ChannelError> {
        let id = uuid::Uuid::new_v4().to_string();

        if self.echo {
            match &options.reply_to {
                Some(reply_to) => println!("[{}] {} (re {}): {}", channel_id, self.bot_id, reply_to, text),
                None => println!("[{}] {}: {}", channel_id, self.bot_id, text),
            }
        }

        self.push(
            channel_id,
            HistoryMessage {
                id: id.clone(),
                text: text.to_string(),
                author_id: self.bot_id.clone(),
                from_bot: true,
                timestamp: Utc::now(),
            },
        );

        Ok(id)
    }

    async fn fetch_history(&self, channel_id: &str, limit: usize) -> Result<Vec<HistoryMessage>, ChannelError> {
        let history = self.history.lock();
        let Some(entries) = history.get(channel_id) else {
            return Ok(Vec::new());
        };

        let skip = entries.len().saturating_sub(limit);
        Ok(entries.iter().skip(skip).cloned().collect())
    }

    async fn send_typing(&self, channel_id: &str) -> Result<(), ChannelError> {
        debug!(channel_id, "typing");
        Ok(())
    }
}
