//! The TargetOutcome entity and its copy-state machine (§3, §4.5, §4.6).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use forker_ids::{IdParseError, JobId, TargetId};
use serde::{Deserialize, Serialize};

use crate::error::ForkerError;

/// Per-target copy progress. See §4.6 for the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum CopyState {
    Pending,
    Copying,
    Copied,
    Verifying,
    Verified,
    FailedRetryable,
    FailedPermanent,
}

impl CopyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyState::Pending => "Pending",
            CopyState::Copying => "Copying",
            CopyState::Copied => "Copied",
            CopyState::Verifying => "Verifying",
            CopyState::Verified => "Verified",
            CopyState::FailedRetryable => "FailedRetryable",
            CopyState::FailedPermanent => "FailedPermanent",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CopyState::Verified | CopyState::FailedPermanent)
    }

    /// True for any state still capable of reaching `Verified` without an
    /// operator action — used by the orchestrator's `Partial` aggregation
    /// rule (§4.6).
    pub fn is_in_flight(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for CopyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CopyState {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(CopyState::Pending),
            "Copying" => Ok(CopyState::Copying),
            "Copied" => Ok(CopyState::Copied),
            "Verifying" => Ok(CopyState::Verifying),
            "Verified" => Ok(CopyState::Verified),
            "FailedRetryable" => Ok(CopyState::FailedRetryable),
            "FailedPermanent" => Ok(CopyState::FailedPermanent),
            other => Err(IdParseError::from(format!("unknown copy state '{other}'"))),
        }
    }
}

/// Allowed `from -> to` edges of the per-target copy state graph (§4.6,
/// including I1: Verifying only reachable from Copied).
pub fn copy_transition_allowed(from: CopyState, to: CopyState) -> bool {
    use CopyState::*;
    matches!(
        (from, to),
        (Pending, Copying)
            | (Pending, FailedRetryable)
            | (Pending, FailedPermanent)
            | (Copying, Copied)
            | (Copying, FailedRetryable)
            | (Copying, FailedPermanent)
            | (Copied, Verifying)
            | (Copied, FailedRetryable)
            | (Copied, FailedPermanent)
            | (Verifying, Verified)
            | (Verifying, FailedRetryable)
            | (Verifying, FailedPermanent)
            | (FailedRetryable, Pending)
    )
}

/// The per-destination subtask of a Job, keyed by (job-id, target-id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetOutcome {
    pub job_id: JobId,
    pub target_id: TargetId,
    pub copy_state: CopyState,
    pub attempts: u32,
    pub hash: Option<String>,
    pub temp_path: Option<String>,
    pub final_path: Option<String>,
    pub last_error: Option<String>,
    pub last_transition_at: DateTime<Utc>,
}

impl TargetOutcome {
    pub fn new(job_id: JobId, target_id: TargetId) -> Self {
        Self {
            job_id,
            target_id,
            copy_state: CopyState::Pending,
            attempts: 0,
            hash: None,
            temp_path: None,
            final_path: None,
            last_error: None,
            last_transition_at: Utc::now(),
        }
    }

    /// Apply a copy-state transition, validating against the edge table.
    /// Re-applying the current state is a no-op so the orchestrator can
    /// safely re-drive the same completion event (§8).
    pub fn transition_to(&mut self, to: CopyState) -> Result<(), ForkerError> {
        if self.copy_state == to {
            return Ok(());
        }
        if !copy_transition_allowed(self.copy_state, to) {
            return Err(ForkerError::invalid_transition(
                "TargetOutcome",
                self.copy_state,
                to,
            ));
        }
        self.copy_state = to;
        self.last_transition_at = Utc::now();
        Ok(())
    }

    /// Begin a new attempt: Pending -> Copying, recording the temp path and
    /// incrementing the attempt counter.
    pub fn begin_copy(&mut self, temp_path: impl Into<String>) -> Result<(), ForkerError> {
        self.transition_to(CopyState::Copying)?;
        self.temp_path = Some(temp_path.into());
        self.attempts += 1;
        Ok(())
    }

    /// FailedRetryable -> Pending: resets temp_path, preserves attempts,
    /// hash, final_path, last_error (§4.6).
    pub fn retry_reset(&mut self) -> Result<(), ForkerError> {
        self.transition_to(CopyState::Pending)?;
        self.temp_path = None;
        Ok(())
    }

    /// Reaching `max_attempts` forces FailedPermanent regardless of cause
    /// classification (I6).
    pub fn attempts_exhausted(&self, max_attempts: u32) -> bool {
        self.attempts >= max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome() -> TargetOutcome {
        TargetOutcome::new(JobId::new(), TargetId::parse("TargetA").unwrap())
    }

    #[test]
    fn verifying_only_reachable_from_copied() {
        let mut t = outcome();
        assert!(t.transition_to(CopyState::Verifying).is_err());
        t.transition_to(CopyState::Copying).unwrap();
        assert!(t.transition_to(CopyState::Verifying).is_err());
        t.transition_to(CopyState::Copied).unwrap();
        t.transition_to(CopyState::Verifying).unwrap();
    }

    #[test]
    fn retry_reset_preserves_attempts_and_hash() {
        let mut t = outcome();
        t.begin_copy("/dest/x.part-1").unwrap();
        t.hash = Some("deadbeef".into());
        t.transition_to(CopyState::FailedRetryable).unwrap();
        t.last_error = Some("disk full".into());
        t.retry_reset().unwrap();
        assert_eq!(t.copy_state, CopyState::Pending);
        assert_eq!(t.attempts, 1);
        assert_eq!(t.temp_path, None);
        assert_eq!(t.hash.as_deref(), Some("deadbeef"));
        assert_eq!(t.last_error.as_deref(), Some("disk full"));
    }

    #[test]
    fn terminal_states_accept_no_further_transition() {
        let mut t = outcome();
        t.begin_copy("/dest/x.part-1").unwrap();
        t.transition_to(CopyState::Copied).unwrap();
        t.transition_to(CopyState::Verifying).unwrap();
        t.transition_to(CopyState::Verified).unwrap();
        assert!(t.transition_to(CopyState::Pending).is_err());
    }
}
