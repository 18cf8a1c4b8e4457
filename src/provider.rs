//! Completion Providers
//!
//! The pipeline only needs `prompt + history -> text`. Token usage is not
//! read back from providers; callers estimate it from the reply text.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::channels::HistoryMessage;

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// Error types for provider calls
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Empty completion")]
    EmptyCompletion,
}

/// Per-call context handed to a provider
#[derive(Debug, Clone, Default)]
pub struct CompletionMetadata {
    pub channel_id: String,
    /// Upper bound on reply length, already shaped by token velocity
    pub max_tokens: usize,
    pub system_prompt: Option<String>,
}

/// LLM backend
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider name identifier
    fn name(&self) -> &str;

    /// Generate a reply to `prompt` given oldest-first `history`
    async fn generate_chat_completion(
        &self,
        prompt: &str,
        history: &[HistoryMessage],
        metadata: &CompletionMetadata,
    ) -> Result<String, ProviderError>;
}

/// OpenAI-compatible provider configuration
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl OpenAiConfig {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            model: DEFAULT_OPENAI_MODEL.to_string(),
        }
    }
}

/// Chat message in an OpenAI request
#[derive(Debug, Serialize, PartialEq)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: usize,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` client
#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// System prompt, history as user/assistant turns, then the prompt
    fn build_messages(prompt: &str, history: &[HistoryMessage], system_prompt: Option<&str>) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);

        if let Some(system) = system_prompt.filter(|s| !s.is_empty()) {
            messages.push(ChatMessage {
                role: "system",
                content: system.to_string(),
            });
        }

        messages.extend(history.iter().map(|m| ChatMessage {
            role: if m.from_bot { "assistant" } else { "user" },
            content: m.text.clone(),
        }));

        messages.push(ChatMessage {
            role: "user",
            content: prompt.to_string(),
        });

        messages
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate_chat_completion(
        &self,
        prompt: &str,
        history: &[HistoryMessage],
        metadata: &CompletionMetadata,
    ) -> Result<String, ProviderError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderError::NotConfigured("OPENAI_API_KEY not set".to_string()));
        }

        let request = ChatRequest {
            model: self.config.model.clone(),
            max_tokens: metadata.max_tokens,
            messages: Self::build_messages(prompt, history, metadata.system_prompt.as_deref()),
        };

        debug!(
            model = %self.config.model,
            history = history.len(),
            max_tokens = metadata.max_tokens,
            "calling chat completions"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url.trim_end_matches('/')))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, body });
        }

        let result: ChatResponse = response.json().await?;
        let content = result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(ProviderError::EmptyCompletion)?;

        info!(model = %self.config.model, channel_id = %metadata.channel_id, chars = content.len(), "completion received");
        Ok(content)
    }
}

/// Offline provider that answers with the prompt it was given
#[derive(Debug, Clone, Default)]
pub struct EchoProvider;

#[async_trait]
impl CompletionProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn generate_chat_completion(
        &self,
        prompt: &str,
        history: &[HistoryMessage],
        metadata: &CompletionMetadata,
    ) -> Result<String, ProviderError> {
        let reply = format!("echo ({} in context): {}", history.len(), prompt);

        // Respect max_tokens under the 4-chars-per-token estimate
        let max_chars = metadata.max_tokens.max(1) * crate::tokens::CHARS_PER_TOKEN;
        Ok(reply.chars().take(max_chars).collect())
    }
}
