//! Adaptive History Limit
//!
//! Learns, per channel, how many history messages to fetch. Feedback from the
//! budgeter drives an additive-increase/additive-decrease controller:
//!
//! - trimmed messages or utilization >= 0.95: fetch fewer
//! - saturated fetch and utilization <= 0.55: fetch more
//! - anything in between is a dead zone and leaves the limit alone

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

/// Utilization at or above which the limit is always lowered
const OVERFLOW_UTILIZATION: f64 = 0.95;
/// Utilization at or below which a saturated fetch may grow the limit
const UNDERFLOW_UTILIZATION: f64 = 0.55;

/// Tuner configuration
#[derive(Debug, Clone)]
pub struct TunerConfig {
    /// Lowest limit the tuner will recommend
    pub min: usize,
    /// Highest limit the tuner will recommend
    pub max: usize,
    /// Base adjustment per feedback round
    pub step: usize,
    /// Utilization the controller aims for
    pub target_utilization: f64,
    /// When false, callers get their base limit back untouched
    pub enabled: bool,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            min: 6,
            max: 60,
            step: 5,
            target_utilization: 0.75,
            enabled: true,
        }
    }
}

impl TunerConfig {
    /// Repair nonsensical values instead of rejecting them
    fn sanitized(mut self) -> Self {
        self.min = self.min.max(1);
        self.max = self.max.max(self.min);
        self.step = self.step.max(1);
        self.target_utilization = if self.target_utilization.is_finite() {
            self.target_utilization.clamp(0.0, 1.0)
        } else {
            0.75
        };
        self
    }
}

/// Learned state for one channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelHistoryState {
    pub desired_limit: usize,
    pub last_seen_count: usize,
    pub last_utilization: f64,
}

/// Outcome of one fetch-and-trim round
#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryFeedback {
    pub requested_limit: usize,
    pub received_count: usize,
    pub kept_count: usize,
    pub estimated_total_tokens: usize,
    pub input_budget_tokens: usize,
}

/// Per-channel history limit tuner
pub struct HistoryLimitTuner {
    config: TunerConfig,
    states: Mutex<HashMap<String, ChannelHistoryState>>,
}

impl Default for HistoryLimitTuner {
    fn default() -> Self {
        Self::new(TunerConfig::default())
    }
}

impl HistoryLimitTuner {
    pub fn new(config: TunerConfig) -> Self {
        Self {
            config: config.sanitized(),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TunerConfig {
        &self.config
    }

    fn clamp(&self, value: usize) -> usize {
        value.clamp(self.config.min, self.config.max)
    }

    /// Current recommended fetch count for `key`.
    ///
    /// The first call for a key seeds it with `base_limit` clamped to `[min, max]`.
    pub fn desired_limit(&self, key: &str, base_limit: usize) -> usize {
        if !self.config.enabled {
            return base_limit.max(1);
        }

        let mut states = self.states.lock();
        states
            .entry(key.to_string())
            .or_insert_with(|| ChannelHistoryState {
                desired_limit: base_limit.clamp(self.config.min, self.config.max),
                last_seen_count: 0,
                last_utilization: 0.0,
            })
            .desired_limit
    }

    /// Feed back the result of a fetch-and-trim round
    pub fn record_result(&self, key: &str, feedback: HistoryFeedback) {
        if !self.config.enabled {
            return;
        }

        let utilization = if feedback.input_budget_tokens == 0 {
            1.0
        } else {
            feedback.estimated_total_tokens as f64 / feedback.input_budget_tokens as f64
        };
        let trimmed = feedback.received_count.saturating_sub(feedback.kept_count);
        let target = self.config.target_utilization;

        let mut states = self.states.lock();
        let current = states
            .get(key)
            .map(|s| s.desired_limit)
            .unwrap_or_else(|| self.clamp(feedback.requested_limit));

        let next = if trimmed > 0 || utilization >= OVERFLOW_UTILIZATION {
            let delta = self.config.step * Self::scale(utilization - target);
            current.saturating_sub(delta)
        } else if feedback.received_count >= feedback.requested_limit
            && utilization <= UNDERFLOW_UTILIZATION
        {
            let delta = self.config.step * Self::scale(target - utilization);
            current.saturating_add(delta)
        } else {
            current
        };
        let next = self.clamp(next);

        if next != current {
            debug!(
                key,
                from = current,
                to = next,
                utilization,
                trimmed,
                "history limit adjusted"
            );
        }

        states.insert(
            key.to_string(),
            ChannelHistoryState {
                desired_limit: next,
                last_seen_count: feedback.received_count,
                last_utilization: utilization,
            },
        );
    }

    /// Step multiplier for a distance from target
    fn scale(distance: f64) -> usize {
        if distance >= 0.35 {
            3
        } else if distance >= 0.2 {
            2
        } else {
            1
        }
    }

    pub fn snapshot(&self, key: &str) -> Option<ChannelHistoryState> {
        self.states.lock().get(key).cloned()
    }

    /// Forget every learned limit
    pub fn reset(&self) {
        self.states.lock().clear();
    }
}
