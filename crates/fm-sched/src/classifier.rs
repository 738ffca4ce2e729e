//! Terminal-output failure classification and failure diagnosis.
//!
//! The classifier runs on the captured output of a dispatch that exited 0 and
//! can override the verdict to failed. The diagnoser runs on already-failed
//! output and attaches a category + summary; it never overwrites a category
//! the supervisor has already assigned.

pub const CAT_CONTEXT_LIMIT: &str = "context_limit_rejected";
pub const CAT_LLM_REJECTED: &str = "llm_request_rejected";
pub const CAT_RATE_LIMITED: &str = "rate_limited";
pub const CAT_AUTH_FAILED: &str = "auth_failed";
pub const CAT_OOM: &str = "out_of_memory";
pub const CAT_TIMEOUT: &str = "timed_out";
pub const CAT_SESSION_DISAPPEARED: &str = "session_disappeared";
pub const CAT_UNKNOWN_EXIT: &str = "unknown_exit_state";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureFlag {
    pub category: String,
    pub summary: String,
}

/// Flags a nominally successful dispatch whose output shows the worker's LLM
/// request was rejected. The summary is the first non-empty line containing
/// the match.
pub fn classify_terminal_output(output: &str) -> Option<FailureFlag> {
    let lower = output.to_lowercase();
    if !lower.contains("llm request rejected") {
        return None;
    }
    let category = if lower.contains("context limit") {
        CAT_CONTEXT_LIMIT
    } else {
        CAT_LLM_REJECTED
    };
    Some(FailureFlag {
        category: category.to_string(),
        summary: matching_line(output, "llm request rejected"),
    })
}

/// Pattern-based diagnosis of failed output. First match wins.
pub fn diagnose_failure(output: &str) -> Option<FailureFlag> {
    const PATTERNS: &[(&str, &str)] = &[
        ("llm request rejected", CAT_LLM_REJECTED),
        ("rate limit", CAT_RATE_LIMITED),
        ("too many requests", CAT_RATE_LIMITED),
        ("unauthorized", CAT_AUTH_FAILED),
        ("authentication failed", CAT_AUTH_FAILED),
        ("invalid api key", CAT_AUTH_FAILED),
        ("out of memory", CAT_OOM),
        ("cannot allocate memory", CAT_OOM),
        ("timed out", CAT_TIMEOUT),
        ("deadline exceeded", CAT_TIMEOUT),
    ];

    let lower = output.to_lowercase();
    for (needle, category) in PATTERNS {
        if lower.contains(needle) {
            let category = if *category == CAT_LLM_REJECTED && lower.contains("context limit") {
                CAT_CONTEXT_LIMIT
            } else {
                category
            };
            return Some(FailureFlag {
                category: category.to_string(),
                summary: matching_line(output, needle),
            });
        }
    }
    None
}

/// First non-empty line whose lowercase form contains `needle`.
fn matching_line(output: &str, needle: &str) -> String {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .find(|l| l.to_lowercase().contains(needle))
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_output_passes() {
        assert_eq!(classify_terminal_output("all tests green\ndone"), None);
    }

    #[test]
    fn rejected_request_flags_failed() {
        let out = "working...\nERROR: LLM request rejected by provider\n";
        let flag = classify_terminal_output(out).unwrap();
        assert_eq!(flag.category, CAT_LLM_REJECTED);
        assert_eq!(flag.summary, "ERROR: LLM request rejected by provider");
    }

    #[test]
    fn context_limit_refines_category() {
        let out = "LLM request rejected: context limit exceeded";
        let flag = classify_terminal_output(out).unwrap();
        assert_eq!(flag.category, CAT_CONTEXT_LIMIT);
    }

    #[test]
    fn diagnoser_matches_rate_limits() {
        let out = "retrying\nupstream rate limit hit, giving up";
        let flag = diagnose_failure(out).unwrap();
        assert_eq!(flag.category, CAT_RATE_LIMITED);
        assert_eq!(flag.summary, "upstream rate limit hit, giving up");
    }

    #[test]
    fn diagnoser_returns_none_without_signal() {
        assert_eq!(diagnose_failure("exit status 1"), None);
    }
}
