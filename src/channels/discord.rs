//! Discord Channel Implementation
//!
//! Discord REST API v10 over reqwest. Intake is by polling each configured
//! channel for messages newer than a cursor, so no gateway connection is
//! needed (the bot still needs the Message Content intent to read text).
//!
//! # Configuration
//!
//! Environment variables:
//! - `DISCORD_BOT_TOKEN`: Discord bot token
//! - `DISCORD_CHANNEL_IDS`: comma-separated channel IDs to poll
//! - `DISCORD_POLL_INTERVAL_MS`: poll interval (default: 2000)

use super::traits::*;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

const DISCORD_API_URL: &str = "https://discord.com/api/v10";

/// Discord caps history pages at 100 messages
const MAX_PAGE_SIZE: usize = 100;

/// Discord channel configuration
#[derive(Debug, Clone)]
pub struct DiscordConfig {
    /// Bot token
    pub bot_token: String,
    /// Channels polled for new messages
    pub channel_ids: Vec<String>,
    /// Delay between polls
    pub poll_interval: Duration,
    /// Maximum message length (Discord limit: 2000)
    pub max_message_length: usize,
}

impl DiscordConfig {
    /// Load from environment
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            bot_token: std::env::var("DISCORD_BOT_TOKEN")
                .map_err(|_| anyhow::anyhow!("DISCORD_BOT_TOKEN not set"))?,
            channel_ids: std::env::var("DISCORD_CHANNEL_IDS")
                .map(|s| {
                    s.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            poll_interval: Duration::from_millis(
                std::env::var("DISCORD_POLL_INTERVAL_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(2000),
            ),
            max_message_length: 2000,
        })
    }
}

/// Discord transport
pub struct DiscordTransport {
    config: DiscordConfig,
    client: reqwest::Client,
    /// Our own user ID, learned on connect
    bot_user_id: RwLock<Option<String>>,
}

impl DiscordTransport {
    pub fn new(config: DiscordConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            bot_user_id: RwLock::new(None),
        }
    }

    /// Create from environment
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(DiscordConfig::from_env()?))
    }

    pub fn config(&self) -> &DiscordConfig {
        &self.config
    }

    /// Bot user ID, once connected
    pub fn bot_user_id(&self) -> Option<String> {
        self.bot_user_id.read().clone()
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.config.bot_token)
    }

    /// Verify the token and learn our own user ID
    pub async fn connect(&self) -> Result<String, ChannelError> {
        let response = self
            .client
            .get(format!("{}/users/@me", DISCORD_API_URL))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ChannelError::AuthenticationFailed(
                "Invalid Discord bot token".to_string(),
            ));
        }

        let user: DiscordUser = response
            .json()
            .await
            .map_err(|e| ChannelError::Internal(e.to_string()))?;

        info!(user_id = %user.id, username = %user.username, "Discord transport connected");
        *self.bot_user_id.write() = Some(user.id.clone());
        Ok(user.id)
    }

    /// Map a non-success response onto a transport error
    async fn error_from(response: reqwest::Response, fallback: fn(String) -> ChannelError) -> ChannelError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        match status.as_u16() {
            429 => {
                let retry_after = serde_json::from_str::<DiscordRateLimit>(&body)
                    .map(|r| r.retry_after.ceil() as u64)
                    .unwrap_or(5);
                ChannelError::RateLimited(retry_after)
            }
            404 => ChannelError::UnknownChannel(body),
            401 | 403 => ChannelError::AuthenticationFailed(body),
            _ => fallback(format!("Discord error {}: {}", status, body)),
        }
    }

    async fn get_messages(&self, channel_id: &str, query: &[(&str, String)]) -> Result<Vec<DiscordMessage>, ChannelError> {
        let response = self
            .client
            .get(format!("{}/channels/{}/messages", DISCORD_API_URL, channel_id))
            .header("Authorization", self.auth_header())
            .query(query)
            .send()
            .await
            .map_err(|e| ChannelError::FetchFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response, ChannelError::FetchFailed).await);
        }

        response
            .json()
            .await
            .map_err(|e| ChannelError::Internal(e.to_string()))
    }

    /// Messages newer than `after` (or the latest page), oldest first.
    ///
    /// Messages written by bots are skipped.
    pub async fn poll_new_messages(&self, channel_id: &str, after: Option<&str>) -> Result<Vec<IncomingMessage>, ChannelError> {
        let mut query = vec![("limit", MAX_PAGE_SIZE.to_string())];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }

        let mut messages = self.get_messages(channel_id, &query).await?;
        // Discord returns newest first
        messages.reverse();

        Ok(messages
            .into_iter()
            .filter(|m| !m.author.bot)
            .map(|m| IncomingMessage {
                id: m.id,
                channel_id: channel_id.to_string(),
                author_id: m.author.id,
                text: m.content,
                timestamp: m.timestamp,
            })
            .collect())
    }

    /// Newest message ID in a channel, used to seed a poll cursor
    pub async fn latest_message_id(&self, channel_id: &str) -> Result<Option<String>, ChannelError> {
        let messages = self.get_messages(channel_id, &[("limit", "1".to_string())]).await?;
        Ok(messages.into_iter().next().map(|m| m.id))
    }

    /// Send message via Discord API
    async fn send_discord_message(
        &self,
        channel_id: &str,
        content: &str,
        reply_to: Option<&str>,
    ) -> Result<String, ChannelError> {
        let mut payload = serde_json::json!({
            "content": content,
        });

        if let Some(message_id) = reply_to {
            payload["message_reference"] = serde_json::json!({
                "message_id": message_id,
                "fail_if_not_exists": false,
            });
        }

        let response = self
            .client
            .post(format!("{}/channels/{}/messages", DISCORD_API_URL, channel_id))
            .header("Authorization", self.auth_header())
            .json(&payload)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response, ChannelError::SendFailed).await);
        }

        let result: DiscordMessageResponse = response
            .json()
            .await
            .map_err(|e| ChannelError::Internal(e.to_string()))?;

        Ok(result.id)
    }

    /// Split long messages, keeping code fences balanced across chunks
    pub fn split_message(&self, content: &str) -> Vec<String> {
        let max_len = self.config.max_message_length.max(16);
        if content.chars().count() <= max_len {
            return vec![content.to_string()];
        }

        // Room for a closing fence plus a reopened one
        let line_budget = max_len - 8;
        let code_block_pattern = "```";
        let mut chunks = Vec::new();
        let mut current = String::new();

        for line in content.lines().flat_map(|l| hard_wrap(l, line_budget)) {
            if current.chars().count() + line.chars().count() + 1 > line_budget {
                let open_blocks = current.matches(code_block_pattern).count();
                if open_blocks % 2 == 1 {
                    current.push_str("\n```");
                }

                if !current.is_empty() {
                    chunks.push(current);
                    current = String::new();
                }

                if open_blocks % 2 == 1 {
                    current.push_str("```\n");
                }

                current.push_str(&line);
            } else {
                if !current.is_empty() {
                    current.push('\n');
                }
                current.push_str(&line);
            }
        }

        if !current.is_empty() {
            chunks.push(current);
        }

        chunks
    }
}

/// Break a single line into pieces of at most `max_chars` characters
fn hard_wrap(line: &str, max_chars: usize) -> Vec<String> {
    if line.chars().count() <= max_chars {
        return vec![line.to_string()];
    }

    let chars: Vec<char> = line.chars().collect();
    chars.chunks(max_chars).map(|c| c.iter().collect()).collect()
}

#[async_trait]
impl MessageTransport for DiscordTransport {
    fn name(&self) -> &str {
        "discord"
    }

    async fn send(&self, channel_id: &str, text: &str, options: SendOptions) -> Result<String, ChannelError> {
        let chunks = self.split_message(text);
        let mut last_id = String::new();

        for (i, chunk) in chunks.iter().enumerate() {
            // Reply only on first message
            let reply_to = if i == 0 { options.reply_to.as_deref() } else { None };

            last_id = self.send_discord_message(channel_id, chunk, reply_to).await?;

            // Respect rate limits
            if i < chunks.len() - 1 {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }

        debug!(channel_id, chunks = chunks.len(), "Discord message sent");
        Ok(last_id)
    }

    async fn fetch_history(&self, channel_id: &str, limit: usize) -> Result<Vec<HistoryMessage>, ChannelError> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let mut messages = self
            .get_messages(channel_id, &[("limit", limit.to_string())])
            .await?;
        messages.reverse();

        let bot_id = self.bot_user_id();
        Ok(messages
            .into_iter()
            .map(|m| HistoryMessage {
                from_bot: bot_id.as_deref() == Some(m.author.id.as_str()),
                id: m.id,
                text: m.content,
                author_id: m.author.id,
                timestamp: m.timestamp,
            })
            .collect())
    }

    async fn send_typing(&self, channel_id: &str) -> Result<(), ChannelError> {
        let response = self
            .client
            .post(format!("{}/channels/{}/typing", DISCORD_API_URL, channel_id))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| ChannelError::Internal(e.to_string()))?;

        if !response.status().is_success() {
            warn!(channel_id, status = %response.status(), "Discord typing indicator rejected");
        }

        Ok(())
    }
}

/// Discord message object (subset)
#[derive(Debug, Deserialize, Serialize)]
pub struct DiscordMessage {
    pub id: String,
    pub author: DiscordUser,
    #[serde(default)]
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DiscordUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub bot: bool,
}

#[derive(Debug, Deserialize)]
struct DiscordMessageResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DiscordRateLimit {
    retry_after: f64,
}
