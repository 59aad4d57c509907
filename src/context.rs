use serde::Serialize;

use crate::models::ModelProfile;
use crate::providers::ChatMessage;

/// Framing overhead charged for every message (role markers, separators).
pub const MESSAGE_OVERHEAD: u32 = 6;
/// Fixed cost of priming the reply.
pub const REPLY_PRIMING: u32 = 10;
/// Headroom reserved for the completion itself.
pub const RESERVED_COMPLETION: u32 = 1000;

fn is_markdown_control(c: char) -> bool {
    matches!(c, '`' | '*' | '#' | '[' | ']' | '(' | ')')
}

// Length after collapsing whitespace runs to single spaces and trimming.
fn normalized_len(text: &str) -> usize {
    let mut len = 0;
    let mut words = 0usize;
    for w in text.split_whitespace() {
        len += w.chars().count();
        words += 1;
    }
    len + words.saturating_sub(1)
}

// Rough token estimator: ~4 chars per token on whitespace-normalized text,
// plus surcharges for markdown punctuation and line breaks.
pub fn estimate_tokens(text: &str) -> u32 {
    let base = normalized_len(text).div_ceil(4);
    let markdown = text.chars().filter(|c| is_markdown_control(*c)).count();
    let newlines = text.chars().filter(|c| *c == '\n').count();
    (base + markdown.div_ceil(2) + newlines.div_ceil(5)) as u32
}

pub fn message_cost(m: &ChatMessage) -> u32 {
    estimate_tokens(&m.content) + MESSAGE_OVERHEAD
}

pub fn estimate_messages_tokens(messages: &[ChatMessage]) -> u32 {
    messages.iter().map(message_cost).sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageLevel {
    Safe,
    Info,
    Warning,
    Danger,
}

impl UsageLevel {
    /// Half-open bands: [0, 0.6) safe, [0.6, 0.8) info, [0.8, 0.9) warning, >= 0.9 danger.
    pub fn from_percentage(p: f64) -> Self {
        if p >= 0.9 {
            UsageLevel::Danger
        } else if p >= 0.8 {
            UsageLevel::Warning
        } else if p >= 0.6 {
            UsageLevel::Info
        } else {
            UsageLevel::Safe
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UsageLevel::Safe => "safe",
            UsageLevel::Info => "info",
            UsageLevel::Warning => "warning",
            UsageLevel::Danger => "danger",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSnapshot {
    pub estimated: u32,
    pub limit: u32,
    /// `estimated / limit`, not scaled to 100.
    pub percentage: f64,
    pub level: UsageLevel,
    pub remaining: u32,
}

/// Estimated cost of sending `history` (plus an optional draft) under `system`.
pub fn usage(
    history: &[ChatMessage],
    system: &str,
    draft: Option<&str>,
    model: &ModelProfile,
) -> UsageSnapshot {
    let mut estimated = estimate_tokens(system) + MESSAGE_OVERHEAD;
    estimated += estimate_messages_tokens(history);
    estimated += REPLY_PRIMING;
    if let Some(d) = draft.filter(|d| !d.trim().is_empty()) {
        estimated += estimate_tokens(d) + MESSAGE_OVERHEAD;
    }
    estimated += RESERVED_COMPLETION;

    let limit = model.soft_limit;
    let percentage = if limit == 0 {
        f64::INFINITY
    } else {
        f64::from(estimated) / f64::from(limit)
    };
    UsageSnapshot {
        estimated,
        limit,
        percentage,
        level: UsageLevel::from_percentage(percentage),
        remaining: limit.saturating_sub(estimated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_of_cost(tokens: usize) -> String {
        "a".repeat(tokens * 4)
    }

    #[test]
    fn plain_text_is_quarter_of_length_rounded_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn whitespace_runs_collapse() {
        assert_eq!(estimate_tokens("ab    cd"), estimate_tokens("ab cd"));
        assert_eq!(estimate_tokens("  ab\t\tcd  "), 2);
    }

    #[test]
    fn markdown_and_newlines_add_surcharge() {
        // "# hi" -> 4 chars (1) + one hash (1)
        assert_eq!(estimate_tokens("# hi"), 2);
        // six markdown chars -> 3; "`a` **b**" is 9 chars -> 3
        assert_eq!(estimate_tokens("`a` **b**"), 6);
        // newline collapses to a space: "a b" -> 1, plus ceil(0.2) = 1
        assert_eq!(estimate_tokens("a\nb"), 2);
        // six newlines -> ceil(1.2) = 2
        assert_eq!(estimate_tokens("a\n\n\n\n\n\nb"), 3);
    }

    #[test]
    fn estimate_never_below_normalized_quarter() {
        let samples = [
            "",
            "x",
            "hello world",
            "   lots   of\n\n spaces\t",
            "```rust\nfn main() {}\n```",
            "[link](http://example.com) and *emph*",
            "ünïcödé  text",
        ];
        for s in samples {
            let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ");
            let floor = normalized.chars().count().div_ceil(4) as u32;
            assert!(estimate_tokens(s) >= floor, "{s:?}");
        }
    }

    #[test]
    fn worked_example_is_danger() {
        let model = ModelProfile::with_soft_limit("m", 1000);
        let system = text_of_cost(20);
        let history: Vec<_> = (0..5).map(|_| ChatMessage::user(text_of_cost(50))).collect();
        let snap = usage(&history, &system, None, &model);
        assert_eq!(snap.estimated, 20 + 6 + 5 * (50 + 6) + 10 + 1000);
        assert_eq!(snap.estimated, 1316);
        assert!((snap.percentage - 1.316).abs() < 1e-9);
        assert_eq!(snap.level, UsageLevel::Danger);
        assert_eq!(snap.remaining, 0);
    }

    #[test]
    fn draft_counts_only_when_present() {
        let model = ModelProfile::with_soft_limit("m", 100_000);
        let base = usage(&[], "", None, &model);
        assert_eq!(base.estimated, 6 + 10 + 1000);
        assert_eq!(usage(&[], "", Some("   "), &model).estimated, base.estimated);
        let with = usage(&[], "", Some("abcdefgh"), &model);
        assert_eq!(with.estimated, base.estimated + 2 + 6);
        assert_eq!(with.remaining, 100_000 - with.estimated);
    }

    #[test]
    fn level_boundaries_are_half_open() {
        assert_eq!(UsageLevel::from_percentage(0.0), UsageLevel::Safe);
        assert_eq!(UsageLevel::from_percentage(0.599_999), UsageLevel::Safe);
        assert_eq!(UsageLevel::from_percentage(0.6), UsageLevel::Info);
        assert_eq!(UsageLevel::from_percentage(0.799_999), UsageLevel::Info);
        assert_eq!(UsageLevel::from_percentage(0.8), UsageLevel::Warning);
        assert_eq!(UsageLevel::from_percentage(0.899_999), UsageLevel::Warning);
        assert_eq!(UsageLevel::from_percentage(0.9), UsageLevel::Danger);
        assert_eq!(UsageLevel::from_percentage(3.0), UsageLevel::Danger);
    }

    #[test]
    fn zero_limit_is_danger() {
        let snap = usage(&[], "", None, &ModelProfile::with_soft_limit("m", 0));
        assert_eq!(snap.level, UsageLevel::Danger);
        assert_eq!(snap.remaining, 0);
    }
}
