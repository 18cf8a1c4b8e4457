//! Token Estimation
//!
//! One character-count heuristic shared by every component that needs a
//! token cost: the history budgeter, the velocity tracker and the pipeline.
//!
//! The estimate is 4 characters per token with ceiling rounding. Swap in a real tokenizer by implementing [`TokenEstimator`].

/// Characters per token for the heuristic estimator
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimate tokens in `text` as `ceil(chars / 4)`.
///
/// Counts Unicode scalar values, not bytes or UTF-16 units.
pub fn estimate_tokens_from_text(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }

    let char_count = text.chars().count();
    char_count.div_ceil(CHARS_PER_TOKEN)
}

/// Anything that can put a token cost on a piece of text
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// Default estimator backed by [`estimate_tokens_from_text`]
#[derive(Debug, Clone, Copy, Default)]
pub struct CharHeuristic;

impl TokenEstimator for CharHeuristic {
    fn estimate(&self, text: &str) -> usize {
        estimate_tokens_from_text(text)
    }
}

/// Format token count for display (e.g., 1.5M, 500K)
pub fn format_tokens(tokens: u64) -> String {
    if tokens >= 1_000_000 {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    } else if tokens >= 1_000 {
        format!("{:.1}K", tokens as f64 / 1_000.0)
    } else {
        tokens.to_string()
    }
}
