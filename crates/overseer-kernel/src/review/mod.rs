//! Risk Review
//!
//! Two independent reviewers guard an action before it runs:
//! - [`RiskReviewer`] is advisory. It classifies action text into
//!   approve / escalate / reject and explains why.
//! - [`StaticGate`] is the hard execution-time gate. Its rejections have no
//!   escalation path and cannot be overridden by a human approval.

mod gate;

pub use gate::{
    GateViolation, StaticGate, DEFAULT_BLOCKED_PATTERNS, DEFAULT_MAX_SCRIPT_CHARS,
    DEFAULT_PROTECTED_RESOURCE,
};

use serde::{Deserialize, Serialize};

/// Risk reported for networking vocabulary
pub const RISK_NETWORK: &str = "External network usage detected";
/// Risk reported for timed or scheduled execution
pub const RISK_TIMED: &str = "Timed or scheduled execution present";
/// Risk reported for bulk / multi-target operations
pub const RISK_BULK: &str = "Potential multi-user or multi-channel impact";
/// Risk reported when the script is too long to auto-approve
pub const RISK_LENGTH: &str = "Large script length exceeds auto-approval threshold";
/// Sentinel risk for blank action text
pub const RISK_NOOP: &str = "No-op";

/// Maximum summary length in characters
pub const SUMMARY_MAX_CHARS: usize = 280;
/// Number of leading lines used for a summary
pub const SUMMARY_LINES: usize = 6;

const SUMMARY_EMPTY_SCRIPT: &str = "Empty script provided; nothing to execute";
const SUMMARY_UNREADABLE: &str = "Script with no readable content";

const NETWORK_TERMS: &[&str] = &["http", "requests", "webhook"];
const TIMED_TERMS: &[&str] = &["sleep(", "schedule", "delay_seconds"];
const BULK_TERMS: &[&str] = &["for channel", "for user", "for member", "mass"];

/// Three-way classification of a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Safe to run without a human
    Approve,
    /// Needs a human decision
    Escalate,
    /// Must not run
    Reject,
}

/// Result of reviewing one action
///
/// Exactly one of approved-without-escalation, escalate, rejected holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskVerdict {
    /// Approved without escalation
    pub approved: bool,
    /// Routed to a human approver
    pub escalate: bool,
    /// Short human-readable summary (at most 280 characters)
    pub summary: String,
    /// Ordered list of detected risks
    pub risks: Vec<String>,
}

impl RiskVerdict {
    /// Collapse the flags into a single decision
    #[inline]
    #[must_use]
    pub fn decision(&self) -> ReviewDecision {
        match (self.approved, self.escalate) {
            (true, _) => ReviewDecision::Approve,
            (false, true) => ReviewDecision::Escalate,
            (false, false) => ReviewDecision::Reject,
        }
    }

    /// Check if the verdict rejected the action
    #[inline]
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        self.decision() == ReviewDecision::Reject
    }
}

/// Advisory reviewer
///
/// Deterministic and pure: identical input always yields an identical
/// verdict. Rules are evaluated independently and all applicable risks are
/// collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskReviewer {
    max_lines_before_escalation: usize,
}

impl RiskReviewer {
    /// Create a reviewer with a custom line threshold
    #[inline]
    #[must_use]
    pub fn new(max_lines_before_escalation: usize) -> Self {
        Self {
            max_lines_before_escalation,
        }
    }

    /// Line threshold above which a script always escalates
    #[inline]
    #[must_use]
    pub fn max_lines(&self) -> usize {
        self.max_lines_before_escalation
    }

    /// Review action text
    #[must_use]
    pub fn review(&self, script: &str) -> RiskVerdict {
        if script.trim().is_empty() {
            return RiskVerdict {
                approved: false,
                escalate: false,
                summary: SUMMARY_EMPTY_SCRIPT.to_string(),
                risks: vec![RISK_NOOP.to_string()],
            };
        }

        let normalized = script.to_lowercase();
        let mut risks = Vec::new();

        if contains_any(&normalized, NETWORK_TERMS) {
            risks.push(RISK_NETWORK.to_string());
        }
        if contains_any(&normalized, TIMED_TERMS) {
            risks.push(RISK_TIMED.to_string());
        }
        if contains_any(&normalized, BULK_TERMS) {
            risks.push(RISK_BULK.to_string());
        }
        if script.matches('\n').count() > self.max_lines_before_escalation {
            risks.push(RISK_LENGTH.to_string());
        }

        let escalate = !risks.is_empty();
        let verdict = RiskVerdict {
            approved: !escalate,
            escalate,
            summary: summarize_script(script),
            risks,
        };
        tracing::debug!(decision = ?verdict.decision(), risks = verdict.risks.len(), "reviewed action");
        verdict
    }
}

impl Default for RiskReviewer {
    fn default() -> Self {
        Self::new(60)
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Summarize action text for a human
///
/// Takes the first six non-blank lines of the dedented text, joins them with
/// `" | "` and truncates to 280 characters.
#[must_use]
pub fn summarize_script(script: &str) -> String {
    let dedented = dedent(script);
    let summary = dedented
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(SUMMARY_LINES)
        .collect::<Vec<_>>()
        .join(" | ");

    if summary.is_empty() {
        return SUMMARY_UNREADABLE.to_string();
    }
    truncate_chars(&summary, SUMMARY_MAX_CHARS).to_string()
}

/// Remove the common leading whitespace of all non-blank lines
#[must_use]
pub fn dedent(text: &str) -> String {
    let margin = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start_matches([' ', '\t']).len())
        .min()
        .unwrap_or(0);

    text.lines()
        .map(|line| {
            if line.trim().is_empty() {
                ""
            } else {
                &line[margin..]
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Truncate to at most `max_chars` characters, respecting UTF-8 boundaries
#[must_use]
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn blank_script_is_rejected_as_noop() {
        let reviewer = RiskReviewer::default();
        for blank in ["", "   ", "\n\t\n"] {
            let verdict = reviewer.review(blank);
            assert!(!verdict.approved);
            assert!(!verdict.escalate);
            assert_eq!(verdict.risks, vec![RISK_NOOP.to_string()]);
            assert_eq!(verdict.decision(), ReviewDecision::Reject);
        }
    }

    #[test]
    fn harmless_script_is_auto_approved() {
        let verdict = RiskReviewer::default().review("async fn main() {\n    create_role(\"helpers\");\n}");
        assert_eq!(verdict.decision(), ReviewDecision::Approve);
        assert!(verdict.risks.is_empty());
    }

    #[test]
    fn rules_are_collected_independently() {
        let script = "async fn main() {\n  http_get(\"https://example.com\");\n  for channel in channels() { schedule_message(channel, \"hi\", 5); }\n}";
        let verdict = RiskReviewer::default().review(script);
        assert!(verdict.escalate);
        assert_eq!(
            verdict.risks,
            vec![RISK_NETWORK.to_string(), RISK_TIMED.to_string(), RISK_BULK.to_string()]
        );
    }

    #[test]
    fn matching_is_case_insensitive() {
        let verdict = RiskReviewer::default().review("async fn main() { HTTP_POST(\"x\"); }");
        assert!(verdict.risks.contains(&RISK_NETWORK.to_string()));
    }

    #[test]
    fn long_script_escalates_without_keywords() {
        let reviewer = RiskReviewer::new(60);
        let script = "let x = 1;\n".repeat(61);
        let verdict = reviewer.review(&script);
        assert!(verdict.escalate);
        assert_eq!(verdict.risks, vec![RISK_LENGTH.to_string()]);

        let short = "let x = 1;\n".repeat(60);
        assert!(reviewer.review(&short).approved);
    }

    #[test]
    fn summary_uses_first_six_nonblank_lines() {
        let script = "\n    a\n\n    b\n    c\n    d\n    e\n    f\n    g\n";
        assert_eq!(summarize_script(script), "a | b | c | d | e | f");
    }

    #[test]
    fn summary_is_truncated_on_char_boundary() {
        let script = "é".repeat(400);
        let summary = summarize_script(&script);
        assert_eq!(summary.chars().count(), SUMMARY_MAX_CHARS);
    }

    #[test]
    fn dedent_strips_common_margin() {
        assert_eq!(dedent("    a\n      b\n\n    c"), "a\n  b\n\nc");
    }

    proptest! {
        #[test]
        fn whitespace_only_always_rejected(ws in "[ \t\r\n]{0,40}") {
            let verdict = RiskReviewer::default().review(&ws);
            prop_assert!(!verdict.approved);
            prop_assert!(!verdict.escalate);
            prop_assert_eq!(verdict.risks, vec![RISK_NOOP.to_string()]);
        }

        #[test]
        fn review_is_deterministic(text in ".{0,200}") {
            let reviewer = RiskReviewer::default();
            prop_assert_eq!(reviewer.review(&text), reviewer.review(&text));
        }

        #[test]
        fn networking_vocabulary_always_flagged(prefix in "[a-z ]{0,20}", suffix in "[a-z ]{0,20}") {
            let text = format!("{prefix}Http{suffix}");
            let verdict = RiskReviewer::default().review(&text);
            prop_assert!(verdict.risks.contains(&RISK_NETWORK.to_string()));
        }

        #[test]
        fn exactly_one_classification_holds(text in ".{0,200}") {
            let verdict = RiskReviewer::default().review(&text);
            let approved_only = verdict.approved && !verdict.escalate;
            let escalated = !verdict.approved && verdict.escalate;
            let rejected = !verdict.approved && !verdict.escalate;
            prop_assert_eq!(
                u8::from(approved_only) + u8::from(escalated) + u8::from(rejected),
                1
            );
        }
    }
}
