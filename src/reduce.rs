//! History reduction: shrink a conversation so the next request fits the budget.
//!
//! Two policies are available. [`truncate_to_target`] drops the oldest messages
//! until the estimate fits a fraction of the soft limit. [`optimize`] keeps the
//! most recent messages and replaces the older ones with a fixed placeholder
//! note. The placeholder is a scripted marker; nothing is summarized.

use async_trait::async_trait;
use thiserror::Error;

use crate::context::{
    REPLY_PRIMING, RESERVED_COMPLETION, UsageLevel, estimate_tokens, message_cost, usage,
};
use crate::models::ModelProfile;
use crate::providers::ChatMessage;

pub const DEFAULT_TRUNCATE_TARGET: f64 = 0.7;
pub const DEFAULT_KEEP_RECENT: usize = 6;

/// Percentage above which optimization kicks in even below the danger band.
const OPTIMIZE_ABOVE: f64 = 0.85;

#[derive(Debug, Error)]
pub enum ReduceError {
    #[error("optimizer failed: {0}")]
    Optimizer(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReductionResult {
    pub messages: Vec<ChatMessage>,
    /// Number of input messages not carried over verbatim.
    pub elided: usize,
}

impl ReductionResult {
    pub fn unchanged(messages: &[ChatMessage]) -> Self {
        Self { messages: messages.to_vec(), elided: 0 }
    }

    pub fn is_reduced(&self) -> bool {
        self.elided > 0
    }
}

/// Reduced messages standing in for the first `covered` history messages.
/// Retained after the provider rejects a request for length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReductionWindow {
    pub messages: Vec<ChatMessage>,
    pub covered: usize,
}

impl ReductionWindow {
    /// The window followed by whatever history was appended after it was taken.
    pub fn apply(&self, history: &[ChatMessage]) -> Vec<ChatMessage> {
        let rest = history.get(self.covered..).unwrap_or(&[]);
        self.messages.iter().chain(rest).cloned().collect()
    }
}

pub fn placeholder_text(elided: usize) -> String {
    format!(
        "[Earlier conversation optimized: {elided} older messages were condensed to save context space. Recent messages follow.]"
    )
}

/// Newest-first walk keeping messages while the running estimate stays within
/// `limit * target`. Never returns an empty result for nonempty input.
pub fn truncate_to_target(
    messages: &[ChatMessage],
    system: &str,
    model: &ModelProfile,
    target: f64,
) -> ReductionResult {
    let Some(newest) = messages.last() else {
        return ReductionResult::unchanged(messages);
    };
    let budget = f64::from(model.soft_limit) * target;
    let mut used = u64::from(estimate_tokens(system) + REPLY_PRIMING + RESERVED_COMPLETION);

    let mut kept = 0usize;
    for m in messages.iter().rev() {
        let next = used + u64::from(message_cost(m));
        if next as f64 > budget {
            break;
        }
        used = next;
        kept += 1;
    }

    if kept == 0 {
        tracing::debug!("newest message alone exceeds the target; keeping it anyway");
        return ReductionResult {
            messages: vec![newest.clone()],
            elided: messages.len() - 1,
        };
    }
    let start = messages.len() - kept;
    ReductionResult { messages: messages[start..].to_vec(), elided: start }
}

/// Keeps the last `keep_recent` messages; if more than two older ones would be
/// dropped, prefixes a placeholder noting how many.
pub fn optimize(messages: &[ChatMessage], keep_recent: usize) -> ReductionResult {
    if messages.len() <= keep_recent {
        return ReductionResult::unchanged(messages);
    }
    let split = messages.len() - keep_recent;
    let (older, recent) = messages.split_at(split);
    if older.len() <= 2 {
        return ReductionResult { messages: recent.to_vec(), elided: older.len() };
    }
    let mut out = Vec::with_capacity(keep_recent + 1);
    out.push(ChatMessage::assistant(placeholder_text(older.len())));
    out.extend_from_slice(recent);
    ReductionResult { messages: out, elided: older.len() }
}

pub fn should_optimize(messages: &[ChatMessage], system: &str, model: &ModelProfile) -> bool {
    let snap = usage(messages, system, None, model);
    snap.level == UsageLevel::Danger || snap.percentage > OPTIMIZE_ABOVE
}

#[async_trait]
pub trait HistoryOptimizer: Send + Sync {
    async fn optimize(&self, messages: &[ChatMessage]) -> Result<ReductionResult, ReduceError>;
}

/// The default optimizer: [`optimize`] with a fixed recent-window size.
#[derive(Debug, Clone)]
pub struct PlaceholderOptimizer {
    pub keep_recent: usize,
}

impl Default for PlaceholderOptimizer {
    fn default() -> Self {
        Self { keep_recent: DEFAULT_KEEP_RECENT }
    }
}

#[async_trait]
impl HistoryOptimizer for PlaceholderOptimizer {
    async fn optimize(&self, messages: &[ChatMessage]) -> Result<ReductionResult, ReduceError> {
        Ok(optimize(messages, self.keep_recent))
    }
}

/// Pre-submission reduction. Runs the optimizer when the budget calls for it and
/// falls back to truncation when it fails, changes nothing, or still does not fit.
pub async fn reduce_history(
    optimizer: &dyn HistoryOptimizer,
    messages: &[ChatMessage],
    system: &str,
    model: &ModelProfile,
    target: f64,
) -> ReductionResult {
    if !should_optimize(messages, system, model) {
        return ReductionResult::unchanged(messages);
    }
    match optimizer.optimize(messages).await {
        Ok(r) if r.is_reduced() && !should_optimize(&r.messages, system, model) => {
            tracing::info!(elided = r.elided, kept = r.messages.len(), "history optimized");
            r
        }
        Ok(_) => {
            let r = truncate_to_target(messages, system, model, target);
            tracing::info!(elided = r.elided, "optimizer insufficient, history truncated");
            r
        }
        Err(e) => {
            tracing::warn!(error = %e, "optimizer failed, falling back to truncation");
            truncate_to_target(messages, system, model, target)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msgs(n: usize, tokens: usize) -> Vec<ChatMessage> {
        (0..n)
            .map(|i| {
                let body = format!("{i:03}{}", "a".repeat(tokens * 4 - 3));
                if i % 2 == 0 { ChatMessage::user(body) } else { ChatMessage::assistant(body) }
            })
            .collect()
    }

    struct Failing;

    #[async_trait]
    impl HistoryOptimizer for Failing {
        async fn optimize(&self, _: &[ChatMessage]) -> Result<ReductionResult, ReduceError> {
            Err(ReduceError::Optimizer("boom".into()))
        }
    }

    #[test]
    fn truncate_is_identity_when_history_fits() {
        let h = msgs(4, 10);
        let model = ModelProfile::with_soft_limit("m", 100_000);
        let r = truncate_to_target(&h, "sys", &model, 0.7);
        assert_eq!(r.messages, h);
        assert_eq!(r.elided, 0);
    }

    #[test]
    fn truncate_keeps_newest_suffix_in_order() {
        // base = 0 + 10 + 1000; each message 16; budget 2000 * 0.7 = 1400
        // -> (1400 - 1010) / 16 = 24 messages fit
        let h = msgs(40, 10);
        let model = ModelProfile::with_soft_limit("m", 2000);
        let r = truncate_to_target(&h, "", &model, 0.7);
        assert_eq!(r.messages.len(), 24);
        assert_eq!(r.elided, 16);
        assert_eq!(r.messages[..], h[16..]);
    }

    #[test]
    fn truncate_stops_at_first_overflow() {
        let mut h = msgs(3, 10);
        // A huge message in the middle blocks everything older than it.
        h.insert(1, ChatMessage::user("b".repeat(40_000)));
        let model = ModelProfile::with_soft_limit("m", 2000);
        let r = truncate_to_target(&h, "", &model, 0.7);
        assert_eq!(r.messages[..], h[2..]);
    }

    #[test]
    fn truncate_returns_newest_alone_when_nothing_fits() {
        let h = vec![
            ChatMessage::user("older"),
            ChatMessage::assistant("c".repeat(100_000)),
        ];
        let model = ModelProfile::with_soft_limit("m", 1000);
        let r = truncate_to_target(&h, "", &model, 0.7);
        assert_eq!(r.messages, vec![h[1].clone()]);
        assert_eq!(r.elided, 1);
    }

    #[test]
    fn truncate_of_empty_history_is_empty() {
        let model = ModelProfile::with_soft_limit("m", 1000);
        let r = truncate_to_target(&[], "", &model, 0.7);
        assert!(r.messages.is_empty());
    }

    #[test]
    fn window_is_followed_by_newer_history() {
        let h = msgs(6, 5);
        let w = ReductionWindow { messages: h[3..4].to_vec(), covered: 4 };
        assert_eq!(w.apply(&h), vec![h[3].clone(), h[4].clone(), h[5].clone()]);
        assert_eq!(w.apply(&h[..2]), vec![h[3].clone()]);
    }

    #[test]
    fn optimize_short_history_unchanged() {
        let h = msgs(6, 5);
        assert_eq!(optimize(&h, 6), ReductionResult::unchanged(&h));
    }

    #[test]
    fn optimize_with_few_older_returns_tail() {
        let h = msgs(8, 5);
        let r = optimize(&h, 6);
        assert_eq!(r.messages[..], h[2..]);
        assert_eq!(r.elided, 2);
    }

    #[test]
    fn optimize_prefixes_placeholder() {
        let h = msgs(10, 5);
        let r = optimize(&h, 6);
        assert_eq!(r.messages.len(), 7);
        assert_eq!(r.messages[0], ChatMessage::assistant(placeholder_text(4)));
        assert!(r.messages[0].content.contains('4'));
        assert_eq!(r.messages[1..], h[4..]);
    }

    #[test]
    fn should_optimize_thresholds() {
        let model = ModelProfile::with_soft_limit("m", 2000);
        // base cost 6 + 10 + 1000 = 1016 -> 0.508
        assert!(!should_optimize(&[], "", &model));
        // 1016 + 44 * 16 = 1720 -> 0.86 (warning band, but above 0.85)
        assert!(should_optimize(&msgs(44, 10), "", &model));
        // 1016 + 43 * 16 = 1704 -> 0.852
        assert!(should_optimize(&msgs(43, 10), "", &model));
        // 1016 + 42 * 16 = 1688 -> 0.844
        assert!(!should_optimize(&msgs(42, 10), "", &model));
    }

    #[tokio::test]
    async fn worked_example_falls_through_to_truncation() {
        let model = ModelProfile::with_soft_limit("m", 1000);
        let system = "a".repeat(80);
        let h = msgs(5, 50);
        assert!(should_optimize(&h, &system, &model));
        assert_eq!(optimize(&h, 6), ReductionResult::unchanged(&h));

        let r = reduce_history(&PlaceholderOptimizer::default(), &h, &system, &model, 0.7).await;
        assert_eq!(r, truncate_to_target(&h, &system, &model, 0.7));
        assert_eq!(r.messages, vec![h[4].clone()]);
    }

    #[tokio::test]
    async fn optimizer_failure_degrades_to_truncation() {
        let model = ModelProfile::with_soft_limit("m", 2000);
        let h = msgs(60, 10);
        let r = reduce_history(&Failing, &h, "", &model, 0.7).await;
        assert_eq!(r, truncate_to_target(&h, "", &model, 0.7));
        assert!(!r.messages.is_empty());
    }

    #[tokio::test]
    async fn optimizer_result_used_when_it_fits() {
        let model = ModelProfile::with_soft_limit("m", 2000);
        let h = msgs(60, 10);
        let r = reduce_history(&PlaceholderOptimizer::default(), &h, "", &model, 0.7).await;
        assert_eq!(r.messages.len(), 7);
        assert_eq!(r.elided, 54);
    }

    #[tokio::test]
    async fn no_reduction_below_threshold() {
        let model = ModelProfile::with_soft_limit("m", 100_000);
        let h = msgs(10, 10);
        let r = reduce_history(&Failing, &h, "", &model, 0.7).await;
        assert_eq!(r, ReductionResult::unchanged(&h));
    }
}
