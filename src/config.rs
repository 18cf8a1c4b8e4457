//! Configuration management
//!
//! Every tunable is read from the environment once at startup. Values that
//! fail to parse fall back to their defaults; nothing here is fatal.

use anyhow::Result;
use std::str::FromStr;
use std::time::Duration;

use crate::history_tuner::TunerConfig;
use crate::velocity::VelocityConfig;

/// Burst coalescing delays
#[derive(Debug, Clone)]
pub struct BurstConfig {
    /// Delay after a leader, and extension per follow-up message
    pub base_delay: Duration,
    /// Upper bound on any window, measured from now
    pub max_delay: Duration,
    /// Floor applied to every window (zero disables it)
    pub min_delay: Duration,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1500),
            max_delay: Duration::from_millis(8000),
            min_delay: Duration::ZERO,
        }
    }
}

/// History fetch and budget settings
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Fetch count handed to the tuner on first contact with a channel
    pub base_limit: usize,
    /// Model input budget in tokens
    pub input_budget_tokens: usize,
    pub per_message_overhead_tokens: usize,
    /// Recent messages always kept, and the floor on every fetch
    pub min_keep_messages: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            base_limit: 20,
            input_budget_tokens: 4096,
            per_message_overhead_tokens: crate::budget::DEFAULT_PER_MESSAGE_OVERHEAD_TOKENS,
            min_keep_messages: 0,
        }
    }
}

/// OpenAI-compatible backend settings
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    /// API key (echo provider is used when absent)
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub openai_model: Option<String>,
}

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Bot identity, half of every burst key
    pub bot_id: String,

    pub burst: BurstConfig,

    pub history: HistoryConfig,

    pub tuner: TunerConfig,

    pub velocity: VelocityConfig,

    /// Reply length before velocity shaping
    pub default_max_tokens: usize,

    /// System prompt sent with every completion
    pub system_prompt: Option<String>,

    pub provider: ProviderConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bot_id: "chatgate".to_string(),
            burst: BurstConfig::default(),
            history: HistoryConfig::default(),
            tuner: TunerConfig::default(),
            velocity: VelocityConfig::default(),
            default_max_tokens: 400,
            system_prompt: None,
            provider: ProviderConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let env = Lookup(lookup);

        let burst = BurstConfig {
            base_delay: env.millis("CHATGATE_BURST_BASE_DELAY_MS", defaults.burst.base_delay),
            max_delay: env.millis("CHATGATE_BURST_MAX_DELAY_MS", defaults.burst.max_delay),
            min_delay: env.millis("CHATGATE_BURST_MIN_DELAY_MS", defaults.burst.min_delay),
        };
        // a window can never be shorter than its own base delay
        let burst = BurstConfig {
            max_delay: burst.max_delay.max(burst.base_delay),
            ..burst
        };

        let history = HistoryConfig {
            base_limit: env.parse("CHATGATE_HISTORY_BASE_LIMIT", defaults.history.base_limit),
            input_budget_tokens: env.parse("CHATGATE_INPUT_BUDGET_TOKENS", defaults.history.input_budget_tokens),
            per_message_overhead_tokens: env.parse(
                "CHATGATE_PER_MESSAGE_OVERHEAD",
                defaults.history.per_message_overhead_tokens,
            ),
            min_keep_messages: env.parse("CHATGATE_MIN_KEEP_MESSAGES", defaults.history.min_keep_messages),
        };

        let tuner = TunerConfig {
            enabled: env.flag("CHATGATE_HISTORY_TUNER_ENABLED", defaults.tuner.enabled),
            min: env.parse("CHATGATE_HISTORY_TUNER_MIN", defaults.tuner.min),
            max: env.parse("CHATGATE_HISTORY_TUNER_MAX", defaults.tuner.max),
            step: env.parse("CHATGATE_HISTORY_TUNER_STEP", defaults.tuner.step),
            target_utilization: env.parse("CHATGATE_HISTORY_TUNER_TARGET", defaults.tuner.target_utilization),
        };

        let velocity = VelocityConfig {
            window: env.millis("CHATGATE_VELOCITY_WINDOW_MS", defaults.velocity.window),
            high_usage_threshold: env.parse("CHATGATE_VELOCITY_HIGH_USAGE", defaults.velocity.high_usage_threshold),
            max_tokens_in_window: env.parse("CHATGATE_VELOCITY_MAX_TOKENS", defaults.velocity.max_tokens_in_window),
            reduction_factor: env.parse("CHATGATE_VELOCITY_REDUCTION", defaults.velocity.reduction_factor),
        };

        Ok(Self {
            bot_id: env.string("CHATGATE_BOT_ID").unwrap_or(defaults.bot_id),
            burst,
            history,
            tuner,
            velocity,
            default_max_tokens: env.parse("CHATGATE_DEFAULT_MAX_TOKENS", defaults.default_max_tokens),
            system_prompt: env.string("CHATGATE_SYSTEM_PROMPT"),
            provider: ProviderConfig {
                openai_api_key: env.string("OPENAI_API_KEY"),
                openai_base_url: env.string("OPENAI_BASE_URL"),
                openai_model: env.string("OPENAI_MODEL"),
            },
        })
    }
}

/// Typed access over a raw lookup function
struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty trimmed value
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        self.string(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.string(key)
            .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
            .unwrap_or(default)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.string(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned()).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[]);
        assert_eq!(config.bot_id, "chatgate");
        assert_eq!(config.burst.base_delay, Duration::from_millis(1500));
        assert_eq!(config.tuner.min, 6);
        assert_eq!(config.tuner.max, 60);
        assert_eq!(config.velocity.max_tokens_in_window, 3000);
        assert_eq!(config.history.per_message_overhead_tokens, 6);
        assert!(config.provider.openai_api_key.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("CHATGATE_BOT_ID", "hive"),
            ("CHATGATE_HISTORY_TUNER_ENABLED", "false"),
            ("CHATGATE_VELOCITY_WINDOW_MS", "30000"),
            ("CHATGATE_HISTORY_TUNER_TARGET", "0.6"),
            ("CHATGATE_SYSTEM_PROMPT", "  be nice  "),
        ]);
        assert_eq!(config.bot_id, "hive");
        assert!(!config.tuner.enabled);
        assert_eq!(config.velocity.window, Duration::from_secs(30));
        assert!((config.tuner.target_utilization - 0.6).abs() < 1e-9);
        assert_eq!(config.system_prompt.as_deref(), Some("be nice"));
    }

    #[test]
    fn test_bad_values_fall_back() {
        let config = from_pairs(&[
            ("CHATGATE_INPUT_BUDGET_TOKENS", "-50"),
            ("CHATGATE_BURST_BASE_DELAY_MS", "soon"),
            ("CHATGATE_BOT_ID", "   "),
        ]);
        assert_eq!(config.history.input_budget_tokens, 4096);
        assert_eq!(config.burst.base_delay, Duration::from_millis(1500));
        assert_eq!(config.bot_id, "chatgate");
    }

    #[test]
    fn test_max_delay_never_below_base() {
        let config = from_pairs(&[
            ("CHATGATE_BURST_BASE_DELAY_MS", "5000"),
            ("CHATGATE_BURST_MAX_DELAY_MS", "1000"),
        ]);
        assert_eq!(config.burst.max_delay, Duration::from_millis(5000));
    }
}
