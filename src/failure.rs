//! Failure normalization.
//!
//! The source probes several casings of a status-code field on an arbitrary
//! thrown value and pattern-matches its message against a transient-signals
//! regex. In a strongly-typed Rust port the executor already returns a
//! [`ToolCallError`], so there is nothing to probe — normalization instead
//! upgrades the catch-all [`ToolCallError::Unknown`] variant (the landing
//! spot for executors that only have a message, no structured code) into
//! `NETWORK_ERROR` when its text matches the same transient-signals pattern
//! the source uses, and leaves every other variant untouched.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::ToolCallError;

static TRANSIENT: OnceLock<Regex> = OnceLock::new();

fn transient_regex() -> &'static Regex {
    TRANSIENT.get_or_init(|| {
        Regex::new(r"(?i)timeout|timed out|econnreset|eai_again|enotfound|network|socket|rate limit|temporar")
            .expect("transient-signals regex is a constant and always compiles")
    })
}

/// True if `message` matches the transient-failure signal patterns used to
/// upgrade an otherwise-unclassified error into `NETWORK_ERROR`.
pub fn looks_transient(message: &str) -> bool {
    transient_regex().is_match(message)
}

/// Upgrade an [`ToolCallError::Unknown`] to `NETWORK_ERROR` when its message
/// matches a transient-failure signal. Every other variant already carries
/// an authoritative code and is returned unchanged.
pub fn normalize_failure(error: ToolCallError) -> ToolCallError {
    match &error {
        ToolCallError::Unknown {
            message,
            status_code,
        } if looks_transient(message) => ToolCallError::NetworkError {
            message: message.clone(),
            status_code: *status_code,
            cancelled_by_caller: false,
        },
        _ => error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_regex_matches_documented_signals() {
        for signal in [
            "connection timeout",
            "request timed out",
            "ECONNRESET",
            "EAI_AGAIN",
            "ENOTFOUND host",
            "network unreachable",
            "socket hang up",
            "rate limit exceeded",
            "temporary failure",
        ] {
            assert!(looks_transient(signal), "expected {signal} to be transient");
        }
        assert!(!looks_transient("invalid argument"));
    }

    #[test]
    fn unknown_error_with_transient_message_upgrades_to_network_error() {
        let err = ToolCallError::unknown("socket hang up");
        let normalized = normalize_failure(err);
        assert_eq!(normalized.code(), crate::error::ErrorCode::NetworkError);
    }

    #[test]
    fn unknown_error_with_non_transient_message_is_unchanged() {
        let err = ToolCallError::unknown("totally unexpected");
        let normalized = normalize_failure(err);
        assert_eq!(normalized.code(), crate::error::ErrorCode::UnknownError);
    }

    #[test]
    fn typed_errors_pass_through_untouched() {
        let err = ToolCallError::validation("bad args");
        let normalized = normalize_failure(err.clone());
        assert_eq!(normalized.code(), err.code());
    }
}
