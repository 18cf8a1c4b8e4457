//! History Budgeting
//!
//! Fits an oldest-first history into a model's input-token budget by keeping
//! the longest most-recent suffix that fits. Order is never changed and a
//! configurable number of recent messages is always kept, even over budget.

use crate::tokens::{CharHeuristic, TokenEstimator};

/// Default per-message framing overhead (role markers, separators)
pub const DEFAULT_PER_MESSAGE_OVERHEAD_TOKENS: usize = 6;

/// Text a history entry contributes to the prompt
pub trait MessageText {
    fn message_text(&self) -> &str;
}

impl MessageText for String {
    fn message_text(&self) -> &str {
        self
    }
}

impl MessageText for &str {
    fn message_text(&self) -> &str {
        self
    }
}

/// Budgeting inputs
#[derive(Debug, Clone)]
pub struct BudgetOptions<'a> {
    /// Total input tokens the model accepts
    pub input_budget_tokens: usize,
    /// The user prompt being answered
    pub prompt_text: &'a str,
    /// System prompt, if any
    pub system_prompt_text: Option<&'a str>,
    /// Framing cost added to every history message
    pub per_message_overhead_tokens: usize,
    /// Recent messages kept regardless of budget
    pub min_keep_messages: usize,
}

impl<'a> BudgetOptions<'a> {
    pub fn new(input_budget_tokens: usize, prompt_text: &'a str) -> Self {
        Self {
            input_budget_tokens,
            prompt_text,
            system_prompt_text: None,
            per_message_overhead_tokens: DEFAULT_PER_MESSAGE_OVERHEAD_TOKENS,
            min_keep_messages: 0,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: &'a str) -> Self {
        self.system_prompt_text = Some(system_prompt);
        self
    }

    pub fn with_min_keep(mut self, min_keep_messages: usize) -> Self {
        self.min_keep_messages = min_keep_messages;
        self
    }

    pub fn with_overhead(mut self, per_message_overhead_tokens: usize) -> Self {
        self.per_message_overhead_tokens = per_message_overhead_tokens;
        self
    }
}

/// Accounting for one budgeting pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryBudgetMeta {
    pub input_budget_tokens: usize,
    pub prompt_tokens: usize,
    pub system_tokens: usize,
    pub estimated_history_tokens: usize,
    pub estimated_total_tokens: usize,
    pub kept_count: usize,
    pub trimmed_count: usize,
}

/// Trimmed history, oldest-first, plus accounting
#[derive(Debug, Clone)]
pub struct HistoryBudgetResult<M> {
    pub trimmed: Vec<M>,
    pub meta: HistoryBudgetMeta,
}

/// Trim with the shared character heuristic
pub fn trim_history_to_token_budget<M>(
    history_oldest_first: &[M],
    options: &BudgetOptions<'_>,
) -> HistoryBudgetResult<M>
where
    M: MessageText + Clone,
{
    trim_history_with_estimator(&CharHeuristic, history_oldest_first, options)
}

/// Trim with a caller-supplied estimator
pub fn trim_history_with_estimator<M>(
    estimator: &dyn TokenEstimator,
    history_oldest_first: &[M],
    options: &BudgetOptions<'_>,
) -> HistoryBudgetResult<M>
where
    M: MessageText + Clone,
{
    let prompt_tokens = estimator.estimate(options.prompt_text);
    let system_tokens = options
        .system_prompt_text
        .map(|s| estimator.estimate(s))
        .unwrap_or(0);
    let non_history_tokens = prompt_tokens + system_tokens;

    let mut meta = HistoryBudgetMeta {
        input_budget_tokens: options.input_budget_tokens,
        prompt_tokens,
        system_tokens,
        ..Default::default()
    };

    // Nothing left for history; keep the floor as best effort
    if options.input_budget_tokens <= non_history_tokens {
        let keep = options.min_keep_messages.min(history_oldest_first.len());
        let trimmed = history_oldest_first[history_oldest_first.len() - keep..].to_vec();

        meta.estimated_history_tokens = 0;
        meta.estimated_total_tokens = non_history_tokens;
        meta.kept_count = trimmed.len();
        meta.trimmed_count = history_oldest_first.len() - trimmed.len();
        return HistoryBudgetResult { trimmed, meta };
    }

    let remaining_for_history = options.input_budget_tokens - non_history_tokens;
    let mut history_tokens = 0usize;
    let mut kept: Vec<M> = Vec::new();

    for message in history_oldest_first.iter().rev() {
        let cost = estimator.estimate(message.message_text()) + options.per_message_overhead_tokens;

        if kept.len() >= options.min_keep_messages && history_tokens + cost > remaining_for_history {
            break;
        }

        history_tokens += cost;
        kept.push(message.clone());
    }

    kept.reverse();

    meta.estimated_history_tokens = history_tokens;
    meta.estimated_total_tokens = non_history_tokens + history_tokens;
    meta.kept_count = kept.len();
    meta.trimmed_count = history_oldest_first.len() - kept.len();

    HistoryBudgetResult { trimmed: kept, meta }
}
