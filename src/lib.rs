//! Chatgate
//!
//! Chat-bot gateway core: relays chat messages to an LLM backend and replies
//! in the originating channel, shaping traffic on the way.
//!
//! # Features
//!
//! - **Burst Coalescing**: rapid-fire messages collapse into one reply per burst
//! - **Adaptive History**: per-channel fetch limit tuned from budget feedback
//! - **History Budgeting**: most-recent suffix that fits the input-token budget
//! - **Token Velocity**: per-channel throttling and reply-length shaping
//! - **Transports**: Console, Discord (REST polling)
//! - **Providers**: OpenAI-compatible chat completions, offline echo
//!
//! # Architecture
//!
//! ```text
//! Transport ──► MessagePipeline ──► CompletionProvider
//!                   │
//!                   ├── BurstCoalescer       (leader election + delay)
//!                   ├── HistoryLimitTuner    (how much history to fetch)
//!                   ├── HistoryBudgeter      (what history to keep)
//!                   └── TokenVelocityTracker (whether and how long to reply)
//! ```

pub mod budget;
pub mod burst;
pub mod channels;
pub mod config;
pub mod history_tuner;
pub mod pipeline;
pub mod provider;
pub mod tokens;
pub mod velocity;

pub use budget::{trim_history_to_token_budget, BudgetOptions, HistoryBudgetMeta, HistoryBudgetResult, MessageText};
pub use burst::{BurstCoalescer, ChannelBurstState, Registration, WaitOutcome};
pub use channels::{ChannelError, HistoryMessage, IncomingMessage, MessageTransport, SendOptions};
pub use config::Config;
pub use history_tuner::{ChannelHistoryState, HistoryFeedback, HistoryLimitTuner, TunerConfig};
pub use pipeline::{DrawFn, MessagePipeline, PipelineError, PipelineOutcome};
pub use provider::{CompletionMetadata, CompletionProvider, EchoProvider, OpenAiConfig, OpenAiProvider, ProviderError};
pub use tokens::{estimate_tokens_from_text, CharHeuristic, TokenEstimator};
pub use velocity::{TokenRecord, TokenVelocityTracker, VelocityConfig};
