//! Token Velocity Tracking
//!
//! Per-channel sliding window of generated tokens, used to shape replies:
//!
//! - response probability drops linearly past the high-usage threshold,
//!   then hard-stops at the window maximum
//! - max tokens shrink with the usage ratio (floor of 50)
//! - coalescing delay grows up to 4x
//!
//! Records older than the window are pruned lazily on every read.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::tokens::estimate_tokens_from_text;

/// Smallest max-tokens value ever handed to a provider
const MIN_ADJUSTED_MAX_TOKENS: usize = 50;
/// Largest delay multiplier at full usage
const MAX_DELAY_MULTIPLIER: f64 = 4.0;
/// Probability floor below the hard block
const MIN_PROBABILITY_MODIFIER: f64 = 0.1;

/// Velocity tracker configuration
#[derive(Debug, Clone)]
pub struct VelocityConfig {
    /// Trailing window over which tokens are summed
    pub window: Duration,
    /// Tokens in window before shaping kicks in
    pub high_usage_threshold: u64,
    /// Tokens in window at which replies are blocked
    pub max_tokens_in_window: u64,
    /// Probability lost per 100 tokens above the threshold
    pub reduction_factor: f64,
}

impl Default for VelocityConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(60_000),
            high_usage_threshold: 1000,
            max_tokens_in_window: 3000,
            reduction_factor: 0.1,
        }
    }
}

impl VelocityConfig {
    fn sanitized(mut self) -> Self {
        self.max_tokens_in_window = self.max_tokens_in_window.max(1);
        self.high_usage_threshold = self.high_usage_threshold.min(self.max_tokens_in_window);
        if !self.reduction_factor.is_finite() || self.reduction_factor < 0.0 {
            self.reduction_factor = 0.1;
        }
        self
    }
}

/// One generation event
#[derive(Debug, Clone, Copy)]
pub struct TokenRecord {
    pub tokens: u64,
    pub timestamp: Instant,
}

/// Tracker statistics
#[derive(Debug, Clone, Default)]
pub struct VelocityStats {
    pub tracked_channels: usize,
    pub tokens_in_window: u64,
    pub busiest_channel: Option<(String, u64)>,
}

/// Per-channel token velocity tracker
pub struct TokenVelocityTracker {
    config: VelocityConfig,
    records: Mutex<HashMap<String, Vec<TokenRecord>>>,
}

impl Default for TokenVelocityTracker {
    fn default() -> Self {
        Self::new(VelocityConfig::default())
    }
}

impl TokenVelocityTracker {
    pub fn new(config: VelocityConfig) -> Self {
        Self {
            config: config.sanitized(),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &VelocityConfig {
        &self.config
    }

    /// Record tokens generated for a channel
    pub fn record_tokens(&self, channel_id: &str, token_count: u64) {
        let mut records = self.records.lock();
        records
            .entry(channel_id.to_string())
            .or_default()
            .push(TokenRecord {
                tokens: token_count,
                timestamp: Instant::now(),
            });

        debug!(channel_id, tokens = token_count, "tokens recorded");
    }

    /// Sum of tokens recorded within the trailing window
    pub fn tokens_in_window(&self, channel_id: &str) -> u64 {
        let mut records = self.records.lock();
        let Some(entries) = records.get_mut(channel_id) else {
            return 0;
        };

        let now = Instant::now();
        let window = self.config.window;
        entries.retain(|r| now.saturating_duration_since(r.timestamp) < window);

        entries.iter().map(|r| r.tokens).sum()
    }

    /// Chance multiplier for replying at all, in `[0, 1]`.
    ///
    /// Zero at or past the window maximum; otherwise never below 0.1.
    pub fn response_probability_modifier(&self, channel_id: &str) -> f64 {
        let tokens = self.tokens_in_window(channel_id);

        if tokens >= self.config.max_tokens_in_window {
            warn!(channel_id, tokens, "token velocity hard limit reached");
            return 0.0;
        }
        if tokens <= self.config.high_usage_threshold {
            return 1.0;
        }

        let excess = (tokens - self.config.high_usage_threshold) as f64;
        (1.0 - (excess / 100.0) * self.config.reduction_factor).max(MIN_PROBABILITY_MODIFIER)
    }

    /// Shrink `default_max_tokens` in proportion to window usage
    pub fn adjusted_max_tokens(&self, channel_id: &str, default_max_tokens: usize) -> usize {
        let tokens = self.tokens_in_window(channel_id);
        if tokens <= self.config.high_usage_threshold {
            return default_max_tokens;
        }

        let usage_ratio = tokens as f64 / self.config.max_tokens_in_window as f64;
        let scaled = (default_max_tokens as f64 * (1.0 - usage_ratio * 0.7)).floor();
        (scaled.max(0.0) as usize).max(MIN_ADJUSTED_MAX_TOKENS)
    }

    /// Multiplier for coalescing delays, in `[1, 4]`
    pub fn delay_multiplier(&self, channel_id: &str) -> f64 {
        let tokens = self.tokens_in_window(channel_id);
        if tokens <= self.config.high_usage_threshold {
            return 1.0;
        }

        let span = self
            .config
            .max_tokens_in_window
            .saturating_sub(self.config.high_usage_threshold)
            .max(1) as f64;
        let progress = (tokens - self.config.high_usage_threshold) as f64 / span;

        (1.0 + progress * (MAX_DELAY_MULTIPLIER - 1.0)).min(MAX_DELAY_MULTIPLIER)
    }

    /// Same heuristic as the history budgeter
    pub fn estimate_tokens(&self, text: &str) -> usize {
        estimate_tokens_from_text(text)
    }

    /// Forget one channel, or every channel when `None`
    pub fn clear(&self, channel_id: Option<&str>) {
        let mut records = self.records.lock();
        match channel_id {
            Some(id) => {
                records.remove(id);
            }
            None => records.clear(),
        }
    }

    pub fn stats(&self) -> VelocityStats {
        let now = Instant::now();
        let window = self.config.window;
        let mut records = self.records.lock();

        let mut stats = VelocityStats::default();
        records.retain(|channel, entries| {
            entries.retain(|r| now.saturating_duration_since(r.timestamp) < window);
            let total: u64 = entries.iter().map(|r| r.tokens).sum();

            stats.tokens_in_window += total;
            if stats.busiest_channel.as_ref().map(|(_, t)| total > *t).unwrap_or(total > 0) {
                stats.busiest_channel = Some((channel.clone(), total));
            }
            !entries.is_empty()
        });
        stats.tracked_channels = records.len();

        stats
    }
}
