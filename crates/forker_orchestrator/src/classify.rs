//! The Retry & Classifier (C7, §4.7): categorize a failed attempt and decide
//! whether, and how long, to wait before retrying.

use std::time::Duration;

use forker_protocol::ForkerError;

/// The error category assigned to a failed copy attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    Transient,
    Permanent,
    Integrity,
    Configuration,
    Unknown,
}

/// Classify `err` per §4.7's heuristics.
pub fn classify(err: &ForkerError) -> FailureCategory {
    match err {
        ForkerError::Integrity { .. } => FailureCategory::Integrity,
        ForkerError::InvariantViolation { .. } | ForkerError::InvalidTransition { .. } => {
            FailureCategory::Permanent
        }
        ForkerError::Configuration { .. } => FailureCategory::Configuration,
        ForkerError::NotFound { .. } => FailureCategory::Permanent,
        ForkerError::Concurrency { .. } => FailureCategory::Transient,
        ForkerError::Io { kind, source, .. } => classify_io(kind, &source.to_string()),
    }
}

fn classify_io(kind: &str, message: &str) -> FailureCategory {
    let lowered_kind = kind.to_ascii_lowercase();
    let lowered_message = message.to_ascii_lowercase();

    let transient_kinds = [
        "wouldblock",
        "timedout",
        "interrupted",
        "addrnotavailable",
        "resourcebusy",
    ];
    let transient_text = ["sharing violation", "in use by another process", "temporarily unavailable"];
    let permanent_kinds = ["notfound", "permissiondenied", "isadirectory", "invalidinput"];

    if permanent_kinds.iter().any(|k| lowered_kind.contains(k)) {
        return FailureCategory::Permanent;
    }
    if transient_kinds.iter().any(|k| lowered_kind.contains(k)) {
        return FailureCategory::Transient;
    }
    if transient_text.iter().any(|t| lowered_message.contains(t)) {
        return FailureCategory::Transient;
    }
    FailureCategory::Unknown
}

/// What the orchestrator should do about a failed, still-`FailedRetryable`
/// target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration, reason: String },
    PermanentFailure { reason: String },
    MaxAttemptsReached { reason: String },
    NonRetryable { reason: String },
}

/// Retry policy knobs, mirroring `forker_protocol::TargetConfig`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

/// Exponential backoff, `base * 2^(attempts-1)` capped at `max`. Monotonic
/// non-decreasing in `attempts` (I13) by construction: no jitter subtracts
/// from the base.
pub fn backoff_delay(attempts: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempts.saturating_sub(1).min(32);
    let scaled = base.saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX));
    scaled.min(max)
}

/// Decide the fate of a target that just landed in `FailedRetryable` with
/// `attempts` attempts recorded so far. Integrity failures never reach this
/// function in practice (the worker lands them straight in
/// `FailedPermanent`), but classifying one here is still treated as
/// non-retryable for defense in depth.
pub fn retry_decision(attempts: u32, err: &ForkerError, policy: &RetryPolicy) -> RetryDecision {
    let category = classify(err);

    if category == FailureCategory::Integrity {
        return RetryDecision::NonRetryable {
            reason: err.to_string(),
        };
    }

    if attempts >= policy.max_attempts {
        return RetryDecision::MaxAttemptsReached {
            reason: format!("attempts {attempts} reached max_attempts {}", policy.max_attempts),
        };
    }

    match category {
        FailureCategory::Permanent => RetryDecision::PermanentFailure {
            reason: err.to_string(),
        },
        FailureCategory::Configuration => RetryDecision::PermanentFailure {
            reason: err.to_string(),
        },
        FailureCategory::Transient | FailureCategory::Unknown => RetryDecision::Retry {
            delay: backoff_delay(attempts, policy.backoff_base, policy.backoff_max),
            reason: err.to_string(),
        },
        FailureCategory::Integrity => unreachable!("handled above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io_err(kind: &str) -> ForkerError {
        ForkerError::Io {
            kind: kind.to_string(),
            path: "/dest/x.svs".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "boom"),
        }
    }

    #[test]
    fn classifies_permanent_io_kinds() {
        assert_eq!(classify(&io_err("NotFound")), FailureCategory::Permanent);
        assert_eq!(classify(&io_err("PermissionDenied")), FailureCategory::Permanent);
    }

    #[test]
    fn classifies_transient_text_from_the_error_message_not_the_path() {
        let err = ForkerError::Io {
            kind: "Other".to_string(),
            path: "/dest/x.svs".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "sharing violation"),
        };
        assert_eq!(classify(&err), FailureCategory::Transient);
    }

    #[test]
    fn classifies_transient_io_kinds() {
        assert_eq!(classify(&io_err("WouldBlock")), FailureCategory::Transient);
        assert_eq!(classify(&io_err("TimedOut")), FailureCategory::Transient);
    }

    #[test]
    fn classifies_integrity_and_configuration() {
        let integrity = ForkerError::Integrity {
            expected: "a".into(),
            actual: "b".into(),
            path: "/x".into(),
        };
        assert_eq!(classify(&integrity), FailureCategory::Integrity);

        let config = ForkerError::Configuration {
            key: "target.maxAttempts".into(),
            reason: "not a number".into(),
        };
        assert_eq!(classify(&config), FailureCategory::Configuration);
    }

    #[test]
    fn backoff_is_monotonic_non_decreasing_and_capped() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(30);
        let mut previous = Duration::from_secs(0);
        for attempts in 1..=10 {
            let delay = backoff_delay(attempts, base, max);
            assert!(delay >= previous);
            assert!(delay <= max);
            previous = delay;
        }
        assert_eq!(backoff_delay(1, base, max), base);
    }

    #[test]
    fn integrity_failures_are_never_retried() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        };
        let integrity = ForkerError::Integrity {
            expected: "a".into(),
            actual: "b".into(),
            path: "/x".into(),
        };
        assert_eq!(
            retry_decision(1, &integrity, &policy),
            RetryDecision::NonRetryable {
                reason: integrity.to_string()
            }
        );
    }

    #[test]
    fn max_attempts_reached_overrides_transient_category() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        };
        let decision = retry_decision(3, &io_err("WouldBlock"), &policy);
        assert!(matches!(decision, RetryDecision::MaxAttemptsReached { .. }));
    }

    #[test]
    fn transient_failure_below_max_attempts_retries() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(60),
        };
        let decision = retry_decision(2, &io_err("TimedOut"), &policy);
        match decision {
            RetryDecision::Retry { delay, .. } => assert_eq!(delay, Duration::from_secs(4)),
            other => panic!("expected Retry, got {other:?}"),
        }
    }
}
