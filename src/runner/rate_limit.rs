//! Rate-limit detection and backoff computation.
//!
//! Detection is two-tier: an explicit structured status field in the
//! executor response is authoritative when present; free-text phrase
//! matching runs only for responses already flagged as errors. The
//! ordering prevents false positives when legitimate output merely
//! discusses rate limiting as a topic.

use regex::Regex;
use std::sync::LazyLock;

/// Sleep applied when a rate-limited response names no wait time.
pub const DEFAULT_RATE_LIMIT_WAIT_SECS: u64 = 300;
/// Safety margin added on top of any extracted or default wait.
pub const RATE_LIMIT_BUFFER_SECS: u64 = 30;

/// Structured status values that mean "rate limited".
const RATE_LIMIT_STATUSES: &[&str] = &["rate_limited", "rate_limit"];

/// Free-text markers, matched case-insensitively in error bodies.
const RATE_LIMIT_PHRASES: &[&str] = &[
    "rate limit",
    "rate-limited",
    "rate_limit",
    "too many requests",
    "usage limit reached",
    "quota exceeded",
    "overloaded_error",
    "429",
];

static RETRY_AFTER_SECS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)retry[\s_-]*after[:\s]+(\d+)").unwrap());

static WAIT_MINUTES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)wait[:\s]+(\d+)\s*minutes?").unwrap());

/// Decide whether a response is rate limited.
///
/// `structured_status` is the response envelope's status field when one
/// was present; `is_error` says whether the response was flagged as a
/// failure (non-zero exit or an error envelope).
pub fn is_rate_limited(structured_status: Option<&str>, is_error: bool, body: &str) -> bool {
    if let Some(status) = structured_status {
        return RATE_LIMIT_STATUSES.contains(&status);
    }
    if !is_error {
        return false;
    }
    let lower = body.to_lowercase();
    RATE_LIMIT_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

/// Pull a wait duration out of the response text: an explicit
/// `retry after N` (seconds) marker wins, then `wait N minutes`.
pub fn extract_wait_secs(body: &str) -> Option<u64> {
    if let Some(caps) = RETRY_AFTER_SECS.captures(body) {
        return caps[1].parse().ok();
    }
    if let Some(caps) = WAIT_MINUTES.captures(body) {
        return caps[1].parse::<u64>().ok().map(|m| m * 60);
    }
    None
}

/// The full sleep to apply before the single retry: extracted wait (or
/// the default) plus the safety buffer.
pub fn backoff_secs(body: &str) -> u64 {
    extract_wait_secs(body).unwrap_or(DEFAULT_RATE_LIMIT_WAIT_SECS) + RATE_LIMIT_BUFFER_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Detection ordering
    // =========================================================================

    #[test]
    fn test_structured_status_is_authoritative() {
        assert!(is_rate_limited(Some("rate_limited"), false, ""));
        assert!(is_rate_limited(Some("rate_limit"), true, ""));
        // a structured status that is not a limit wins over matching text
        assert!(!is_rate_limited(
            Some("success"),
            true,
            "we hit the rate limit earlier"
        ));
    }

    #[test]
    fn test_text_matching_requires_error_flag() {
        let body = "Error: too many requests, rate limit exceeded";
        assert!(is_rate_limited(None, true, body));
        // the same text in a successful response is just prose
        assert!(!is_rate_limited(None, false, body));
    }

    #[test]
    fn test_discussing_rate_limits_is_not_a_limit() {
        let body = "Added a rate limit section to the API docs as requested.";
        assert!(!is_rate_limited(None, false, body));
    }

    #[test]
    fn test_error_without_limit_phrases_is_not_a_limit() {
        assert!(!is_rate_limited(None, true, "Error: compilation failed"));
    }

    #[test]
    fn test_known_phrases_match_case_insensitively() {
        assert!(is_rate_limited(None, true, "HTTP 429 Too Many Requests"));
        assert!(is_rate_limited(None, true, "Usage limit reached for today"));
        assert!(is_rate_limited(None, true, "upstream QUOTA EXCEEDED"));
    }

    // =========================================================================
    // Wait extraction
    // =========================================================================

    #[test]
    fn test_retry_after_marker_gives_seconds_plus_buffer() {
        let body = "rate limited, retry after 45 seconds";
        assert_eq!(extract_wait_secs(body), Some(45));
        assert_eq!(backoff_secs(body), 45 + RATE_LIMIT_BUFFER_SECS);
    }

    #[test]
    fn test_wait_minutes_marker_converts_to_seconds() {
        let body = "please wait 10 minutes before trying again";
        assert_eq!(extract_wait_secs(body), Some(600));
        assert_eq!(backoff_secs(body), 600 + RATE_LIMIT_BUFFER_SECS);
    }

    #[test]
    fn test_retry_after_wins_over_wait_minutes() {
        let body = "wait 10 minutes, or retry after 90";
        assert_eq!(extract_wait_secs(body), Some(90));
    }

    #[test]
    fn test_no_marker_falls_back_to_default_plus_buffer() {
        let body = "rate limit exceeded";
        assert_eq!(extract_wait_secs(body), None);
        assert_eq!(
            backoff_secs(body),
            DEFAULT_RATE_LIMIT_WAIT_SECS + RATE_LIMIT_BUFFER_SECS
        );
    }

    #[test]
    fn test_marker_variants() {
        assert_eq!(extract_wait_secs("Retry-After: 120"), Some(120));
        assert_eq!(extract_wait_secs("retry_after 60"), Some(60));
        assert_eq!(extract_wait_secs("wait 1 minute"), Some(60));
    }
}
