//! Burst Coalescing
//!
//! Folds rapid-fire messages in one channel into a single processing pass.
//! The first message of a burst becomes the leader; later messages extend the
//! leader's delay (bounded by a maximum) and are answered by its single reply.
//!
//! Keys are `channel_id:bot_id`, so several bots sharing a channel each get
//! their own window.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Per-key burst window
#[derive(Debug, Clone)]
pub struct ChannelBurstState {
    /// When the leader should fire
    pub delay_until: Instant,
    /// First message of the burst
    pub leader_message_id: String,
    /// Most recent message of the burst
    pub latest_message_id: String,
    /// Every message absorbed into this burst, leader included
    pub pending_message_ids: HashSet<String>,
    /// User whose message opened the window
    pub trigger_user_id: String,
    /// Latest message sent by the triggering user
    pub last_message_id_from_trigger: String,
}

impl ChannelBurstState {
    fn open(message_id: &str, user_id: &str, delay_until: Instant) -> Self {
        let mut pending = HashSet::new();
        pending.insert(message_id.to_string());

        Self {
            delay_until,
            leader_message_id: message_id.to_string(),
            latest_message_id: message_id.to_string(),
            pending_message_ids: pending,
            trigger_user_id: user_id.to_string(),
            last_message_id_from_trigger: message_id.to_string(),
        }
    }

    fn is_open(&self, now: Instant) -> bool {
        now < self.delay_until
    }

    /// Message a reply to this burst should thread against.
    ///
    /// `None` for a single-message burst (a direct reply is implied), otherwise
    /// the most recent message of the burst.
    pub fn reply_target(&self) -> Option<String> {
        if self.pending_message_ids.len() <= 1 {
            return None;
        }

        if self.latest_message_id.is_empty() {
            Some(self.leader_message_id.clone())
        } else {
            Some(self.latest_message_id.clone())
        }
    }
}

/// Result of registering a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub is_leader: bool,
}

/// How a wait on a burst window ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The window closed; the leader may process
    Elapsed,
    /// The caller was cancelled mid-wait; state is left in place
    Cancelled,
}

/// Coalescer statistics
#[derive(Debug, Clone, Default)]
pub struct BurstStats {
    /// Keys with a window still accepting messages
    pub open_windows: usize,
    /// Keys tracked, including windows awaiting `clear`
    pub tracked_keys: usize,
    /// Messages held across all tracked windows
    pub pending_messages: usize,
}

/// Per-channel burst coalescer
#[derive(Default)]
pub struct BurstCoalescer {
    states: Mutex<HashMap<String, ChannelBurstState>>,
}

impl BurstCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Composite key for a channel and bot
    pub fn get_key(channel_id: &str, bot_id: &str) -> String {
        format!("{}:{}", channel_id, bot_id)
    }

    /// Register an incoming message against `key`.
    ///
    /// Opens a new window (and makes this message the leader) when no open
    /// window exists. Otherwise the message joins the burst and the window is
    /// pushed out by up to `base_delay`, never further than `max_delay` from now.
    pub fn register_message(
        &self,
        key: &str,
        message_id: &str,
        user_id: &str,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Registration {
        let now = Instant::now();
        let mut states = self.states.lock();

        let state = match states.get_mut(key) {
            Some(state) if state.is_open(now) => state,
            _ => {
                states.insert(
                    key.to_string(),
                    ChannelBurstState::open(message_id, user_id, now + base_delay),
                );
                debug!(key, message_id, delay_ms = base_delay.as_millis() as u64, "burst window opened");
                return Registration { is_leader: true };
            }
        };

        state.pending_message_ids.insert(message_id.to_string());
        state.latest_message_id = message_id.to_string();
        if state.trigger_user_id == user_id {
            state.last_message_id_from_trigger = message_id.to_string();
        }

        let remaining = state.delay_until.saturating_duration_since(now);
        if remaining < max_delay {
            let extension = base_delay.min(max_delay - remaining);
            state.delay_until += extension;

            info!(
                key,
                message_count = state.pending_message_ids.len(),
                extension_ms = extension.as_millis() as u64,
                remaining_ms = (remaining + extension).as_millis() as u64,
                "burst window extended"
            );
        }

        Registration { is_leader: false }
    }

    /// Push the window out to at least `min_delay` from now, capped at `max_delay`.
    /// Never pulls an existing deadline closer.
    pub fn ensure_minimum_delay(&self, key: &str, min_delay: Duration, max_delay: Duration) {
        let now = Instant::now();
        let mut states = self.states.lock();

        if let Some(state) = states.get_mut(key) {
            let target = (now + min_delay).min(now + max_delay);
            if state.delay_until < target {
                state.delay_until = target;
                debug!(key, delay_ms = target.duration_since(now).as_millis() as u64, "burst window raised to minimum");
            }
        }
    }

    /// Time left before the leader should fire (zero if absent or elapsed)
    pub fn remaining_delay(&self, key: &str) -> Duration {
        let states = self.states.lock();
        states
            .get(key)
            .map(|s| s.delay_until.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Reply target for the current window of `key`, see [`ChannelBurstState::reply_target`]
    pub fn reply_to_message_id(&self, key: &str) -> Option<String> {
        self.states.lock().get(key).and_then(|s| s.reply_target())
    }

    /// Number of messages absorbed into the burst for `key`
    pub fn pending_count(&self, key: &str) -> usize {
        self.states
            .lock()
            .get(key)
            .map(|s| s.pending_message_ids.len())
            .unwrap_or(0)
    }

    /// Snapshot of the state for `key`
    pub fn state(&self, key: &str) -> Option<ChannelBurstState> {
        self.states.lock().get(key).cloned()
    }

    /// Suspend until the window for `key` closes.
    ///
    /// Re-checks after every sleep so extensions made by later messages are
    /// honoured. Returns immediately for absent keys.
    pub async fn wait_for_delay(&self, key: &str, cancel: &CancellationToken) -> WaitOutcome {
        loop {
            let remaining = self.remaining_delay(key);
            if remaining.is_zero() {
                return WaitOutcome::Elapsed;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(key, "burst wait cancelled");
                    return WaitOutcome::Cancelled;
                }
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }

    /// Drop the window for `key`
    pub fn clear(&self, key: &str) {
        self.states.lock().remove(key);
    }

    /// Drop the window for `key` only if `leader_message_id` still leads it.
    ///
    /// A leader that finishes after its window was superseded must not wipe the
    /// newer window.
    pub fn clear_leader(&self, key: &str, leader_message_id: &str) -> bool {
        let mut states = self.states.lock();
        match states.get(key) {
            Some(state) if state.leader_message_id == leader_message_id => {
                states.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn stats(&self) -> BurstStats {
        let now = Instant::now();
        let states = self.states.lock();

        BurstStats {
            open_windows: states.values().filter(|s| s.is_open(now)).count(),
            tracked_keys: states.len(),
            pending_messages: states.values().map(|s| s.pending_message_ids.len()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const BASE: Duration = Duration::from_millis(1000);
    const MAX: Duration = Duration::from_millis(3000);

    #[test]
    fn test_key_format() {
        assert_eq!(BurstCoalescer::get_key("chan", "bot"), "chan:bot");
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_leader_per_burst() {
        let coalescer = BurstCoalescer::new();
        let key = BurstCoalescer::get_key("c1", "b1");

        let first = coalescer.register_message(&key, "m1", "u1", BASE, MAX);
        assert!(first.is_leader);

        for i in 2..6 {
            tokio::time::advance(Duration::from_millis(100)).await;
            let r = coalescer.register_message(&key, &format!("m{}", i), "u2", BASE, MAX);
            assert!(!r.is_leader, "message {} should join the burst", i);
        }

        assert_eq!(coalescer.pending_count(&key), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_never_moves_backward() {
        let coalescer = BurstCoalescer::new();
        let key = "c:b";

        coalescer.register_message(key, "m1", "u1", BASE, MAX);
        let mut last = coalescer.state(key).unwrap().delay_until;

        for i in 0..10 {
            tokio::time::advance(Duration::from_millis(150)).await;
            if i % 3 == 0 {
                coalescer.ensure_minimum_delay(key, Duration::from_millis(10), MAX);
            } else {
                coalescer.register_message(key, &format!("x{}", i), "u1", BASE, MAX);
            }
            let current = coalescer.state(key).unwrap().delay_until;
            assert!(current >= last);
            last = current;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_extension_bounded_by_max_delay() {
        let coalescer = BurstCoalescer::new();
        let key = "c:b";

        coalescer.register_message(key, "m1", "u1", BASE, MAX);
        for i in 0..10 {
            coalescer.register_message(key, &format!("m{}", i + 2), "u1", BASE, MAX);
        }

        assert_eq!(coalescer.remaining_delay(key), MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_target_rule() {
        let coalescer = BurstCoalescer::new();

        coalescer.register_message("solo", "m1", "u1", BASE, MAX);
        assert_eq!(coalescer.reply_to_message_id("solo"), None);

        coalescer.register_message("burst", "m1", "u1", BASE, MAX);
        coalescer.register_message("burst", "m2", "u2", BASE, MAX);
        coalescer.register_message("burst", "m3", "u1", BASE, MAX);
        assert_eq!(coalescer.reply_to_message_id("burst"), Some("m3".to_string()));

        let state = coalescer.state("burst").unwrap();
        assert_eq!(state.leader_message_id, "m1");
        assert_eq!(state.last_message_id_from_trigger, "m3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_key_defaults() {
        let coalescer = BurstCoalescer::new();

        assert_eq!(coalescer.remaining_delay("nope"), Duration::ZERO);
        assert_eq!(coalescer.reply_to_message_id("nope"), None);
        coalescer.ensure_minimum_delay("nope", BASE, MAX);
        assert!(coalescer.state("nope").is_none());

        let outcome = coalescer.wait_for_delay("nope", &CancellationToken::new()).await;
        assert_eq!(outcome, WaitOutcome::Elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_minimum_delay_caps_at_max() {
        let coalescer = BurstCoalescer::new();
        coalescer.register_message("k", "m1", "u1", Duration::from_millis(100), MAX);

        coalescer.ensure_minimum_delay("k", Duration::from_secs(60), MAX);
        assert_eq!(coalescer.remaining_delay("k"), MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_window_is_superseded() {
        let coalescer = BurstCoalescer::new();

        assert!(coalescer.register_message("k", "m1", "u1", BASE, MAX).is_leader);
        tokio::time::advance(BASE + Duration::from_millis(1)).await;

        // leader never cleared, next message opens a fresh window
        assert!(coalescer.register_message("k", "m2", "u2", BASE, MAX).is_leader);
        assert_eq!(coalescer.pending_count("k"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_honours_extensions() {
        let coalescer = Arc::new(BurstCoalescer::new());
        coalescer.register_message("k", "m1", "u1", BASE, MAX);

        let waiter = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                coalescer.wait_for_delay("k", &CancellationToken::new()).await;
                start.elapsed()
            })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        coalescer.register_message("k", "m2", "u1", BASE, MAX);

        let waited = waiter.await.unwrap();
        assert!(waited >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_cancellation_keeps_state() {
        let coalescer = BurstCoalescer::new();
        coalescer.register_message("k", "m1", "u1", BASE, MAX);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = coalescer.wait_for_delay("k", &cancel).await;
        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert!(coalescer.state("k").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_leader_only_matches_owner() {
        let coalescer = BurstCoalescer::new();
        coalescer.register_message("k", "m1", "u1", BASE, MAX);

        assert!(!coalescer.clear_leader("k", "other"));
        assert!(coalescer.state("k").is_some());

        assert!(coalescer.clear_leader("k", "m1"));
        assert!(coalescer.state("k").is_none());

        coalescer.register_message("k", "m9", "u1", BASE, MAX);
        coalescer.clear("k");
        assert_eq!(coalescer.stats().tracked_keys, 0);
    }
}
