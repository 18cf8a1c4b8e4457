//! Message Pipeline
//!
//! Per-message control flow:
//!
//! ```text
//! incoming ──► BurstCoalescer ──(leader)──► wait ──► velocity gate
//!                   │                                     │
//!               (follower)                         typing + fetch history
//!                   ▼                            (HistoryLimitTuner limit)
//!               Coalesced                                 │
//!                                              HistoryBudgeter ──► tuner feedback
//!                                                         │
//!                                    provider (velocity-shaped max_tokens)
//!                                                         │
//!                                       send reply ──► record tokens
//! ```
//!
//! Each message is handled on its own task; the only suspension inside the
//! core is the burst wait. Transport and provider errors pass through as
//! [`PipelineError`].

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::budget::{trim_history_to_token_budget, BudgetOptions};
use crate::burst::{BurstCoalescer, ChannelBurstState, WaitOutcome};
use crate::channels::{ChannelError, IncomingMessage, MessageTransport, SendOptions};
use crate::config::Config;
use crate::history_tuner::{HistoryFeedback, HistoryLimitTuner};
use crate::provider::{CompletionMetadata, CompletionProvider, ProviderError};
use crate::velocity::TokenVelocityTracker;

/// Errors surfaced from collaborators
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("transport error: {0}")]
    Transport(#[from] ChannelError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// What happened to one incoming message
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// Folded into a burst that another leader answers
    Coalesced,
    /// Cancelled while waiting; burst state is left for a later message
    Cancelled,
    /// Token velocity hard limit reached
    Throttled,
    /// Lost the velocity-weighted probability draw
    Skipped { probability: f64 },
    /// A reply was sent
    Replied {
        message_id: String,
        reply_to: Option<String>,
        kept: usize,
        trimmed: usize,
        max_tokens: usize,
    },
}

/// Uniform draw in `[0, 1)` for the reply probability gate
pub type DrawFn = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Burst coalescing, history budgeting and velocity shaping around one
/// transport and one provider
pub struct MessagePipeline {
    config: Config,
    transport: Arc<dyn MessageTransport>,
    provider: Arc<dyn CompletionProvider>,
    coalescer: BurstCoalescer,
    tuner: HistoryLimitTuner,
    velocity: TokenVelocityTracker,
    draw: DrawFn,
}

impl MessagePipeline {
    pub fn new(
        config: Config,
        transport: Arc<dyn MessageTransport>,
        provider: Arc<dyn CompletionProvider>,
    ) -> Self {
        let tuner = HistoryLimitTuner::new(config.tuner.clone());
        let velocity = TokenVelocityTracker::new(config.velocity.clone());

        Self {
            config,
            transport,
            provider,
            coalescer: BurstCoalescer::new(),
            tuner,
            velocity,
            draw: Arc::new(rand::random::<f64>),
        }
    }

    /// Replace the random source behind the reply probability gate
    pub fn with_draw(mut self, draw: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        self.draw = Arc::new(draw);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn coalescer(&self) -> &BurstCoalescer {
        &self.coalescer
    }

    pub fn tuner(&self) -> &HistoryLimitTuner {
        &self.tuner
    }

    pub fn velocity(&self) -> &TokenVelocityTracker {
        &self.velocity
    }

    /// Coalescing base delay, stretched by recent token velocity
    fn scaled_base_delay(&self, channel_id: &str) -> Duration {
        let burst = &self.config.burst;
        let multiplier = self.velocity.delay_multiplier(channel_id);
        burst.base_delay.mul_f64(multiplier).min(burst.max_delay)
    }

    /// Run one incoming message through the pipeline
    pub async fn handle(
        &self,
        message: IncomingMessage,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        let channel_id = message.channel_id.as_str();
        let key = BurstCoalescer::get_key(channel_id, &self.config.bot_id);
        let burst = &self.config.burst;

        let registration = self.coalescer.register_message(
            &key,
            &message.id,
            &message.author_id,
            self.scaled_base_delay(channel_id),
            burst.max_delay,
        );
        if !registration.is_leader {
            debug!(key = %key, message_id = %message.id, "message coalesced into burst");
            return Ok(PipelineOutcome::Coalesced);
        }

        if !burst.min_delay.is_zero() {
            self.coalescer.ensure_minimum_delay(&key, burst.min_delay, burst.max_delay);
        }

        if self.coalescer.wait_for_delay(&key, cancel).await == WaitOutcome::Cancelled {
            return Ok(PipelineOutcome::Cancelled);
        }

        // Pin the burst before the next await; once the window has closed a
        // newer message may open a fresh one under the same key
        let Some(burst_state) = self
            .coalescer
            .state(&key)
            .filter(|s| s.leader_message_id == message.id)
        else {
            debug!(key = %key, message_id = %message.id, "burst window superseded before processing");
            return Ok(PipelineOutcome::Coalesced);
        };

        let result = self.process_leader(&burst_state, &message).await;
        self.coalescer.clear_leader(&key, &message.id);
        result
    }

    async fn process_leader(
        &self,
        burst_state: &ChannelBurstState,
        message: &IncomingMessage,
    ) -> Result<PipelineOutcome, PipelineError> {
        let channel_id = message.channel_id.as_str();
        let pending = &burst_state.pending_message_ids;
        let burst_size = pending.len();

        let probability = self.velocity.response_probability_modifier(channel_id);
        if probability <= 0.0 {
            info!(channel_id, burst_size, "reply throttled by token velocity");
            return Ok(PipelineOutcome::Throttled);
        }
        if probability < 1.0 && (self.draw)() >= probability {
            info!(channel_id, probability, "reply skipped by token velocity");
            return Ok(PipelineOutcome::Skipped { probability });
        }

        if let Err(e) = self.transport.send_typing(channel_id).await {
            warn!(channel_id, error = %e, "typing indicator failed");
        }

        let history_config = &self.config.history;
        // min_keep also floors the fetch
        let requested_limit = self
            .tuner
            .desired_limit(channel_id, history_config.base_limit)
            .max(history_config.min_keep_messages);
        let fetched = self.transport.fetch_history(channel_id, requested_limit).await?;
        let received_count = fetched.len();

        // Burst messages form the prompt; everything else is context
        let (burst_messages, history): (Vec<_>, Vec<_>) = fetched
            .into_iter()
            .partition(|m| m.id == message.id || pending.contains(&m.id));
        let prompt = if burst_messages.is_empty() {
            message.text.clone()
        } else {
            burst_messages
                .iter()
                .map(|m| m.text.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        };

        let system_prompt = self.config.system_prompt.as_deref();
        let mut options = BudgetOptions::new(history_config.input_budget_tokens, &prompt)
            .with_overhead(history_config.per_message_overhead_tokens)
            .with_min_keep(history_config.min_keep_messages);
        if let Some(system) = system_prompt {
            options = options.with_system_prompt(system);
        }
        let budgeted = trim_history_to_token_budget(&history, &options);

        self.tuner.record_result(
            channel_id,
            HistoryFeedback {
                requested_limit,
                received_count,
                kept_count: budgeted.meta.kept_count + burst_messages.len(),
                estimated_total_tokens: budgeted.meta.estimated_total_tokens,
                input_budget_tokens: budgeted.meta.input_budget_tokens,
            },
        );

        let max_tokens = self
            .velocity
            .adjusted_max_tokens(channel_id, self.config.default_max_tokens);
        let metadata = CompletionMetadata {
            channel_id: channel_id.to_string(),
            max_tokens,
            system_prompt: self.config.system_prompt.clone(),
        };

        let reply = self
            .provider
            .generate_chat_completion(&prompt, &budgeted.trimmed, &metadata)
            .await?;

        let reply_to = burst_state.reply_target();
        let options = match &reply_to {
            Some(id) => SendOptions::reply_to(id.clone()),
            None => SendOptions::default(),
        };
        let message_id = self.transport.send(channel_id, &reply, options).await?;

        let reply_tokens = self.velocity.estimate_tokens(&reply) as u64;
        self.velocity.record_tokens(channel_id, reply_tokens);

        info!(
            channel_id,
            burst_size,
            kept = budgeted.meta.kept_count,
            trimmed = budgeted.meta.trimmed_count,
            reply_tokens,
            max_tokens,
            provider = self.provider.name(),
            "reply sent"
        );

        Ok(PipelineOutcome::Replied {
            message_id,
            reply_to,
            kept: budgeted.meta.kept_count,
            trimmed: budgeted.meta.trimmed_count,
            max_tokens,
        })
    }
}
