//! The Job entity and its state machine (§3, §4.6).

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use forker_ids::{IdParseError, JobId, TargetId};
use serde::{Deserialize, Serialize};

use crate::error::ForkerError;

/// Job lifecycle states. Transitions are monotonic except the single
/// explicit `Quarantined -> Queued` admin edge (I8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum JobState {
    Discovered,
    Queued,
    InProgress,
    Partial,
    Verified,
    Failed,
    Quarantined,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Discovered => "Discovered",
            JobState::Queued => "Queued",
            JobState::InProgress => "InProgress",
            JobState::Partial => "Partial",
            JobState::Verified => "Verified",
            JobState::Failed => "Failed",
            JobState::Quarantined => "Quarantined",
        }
    }

    /// `Verified` and `Failed` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Verified | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobState {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Discovered" => Ok(JobState::Discovered),
            "Queued" => Ok(JobState::Queued),
            "InProgress" => Ok(JobState::InProgress),
            "Partial" => Ok(JobState::Partial),
            "Verified" => Ok(JobState::Verified),
            "Failed" => Ok(JobState::Failed),
            "Quarantined" => Ok(JobState::Quarantined),
            other => Err(IdParseError::from(format!("unknown job state '{other}'"))),
        }
    }
}

/// Whether `from -> to` is one of the allowed edges in §4.6's job state
/// graph. Self-transitions are not listed here; callers treat them as a
/// no-op so that re-applying the same completion event is idempotent (§8).
pub fn job_transition_allowed(from: JobState, to: JobState) -> bool {
    use JobState::*;
    matches!(
        (from, to),
        (Discovered, Queued)
            | (Discovered, Failed)
            | (Queued, InProgress)
            | (Queued, Failed)
            | (InProgress, Partial)
            | (InProgress, Verified)
            | (InProgress, Failed)
            | (InProgress, Quarantined)
            | (Partial, Verified)
            | (Partial, Failed)
            | (Partial, Quarantined)
            | (Quarantined, Queued)
    )
}

/// The unit of work to replicate one source file to all required targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub source_path: String,
    pub initial_size: u64,
    pub source_hash: Option<String>,
    pub state: JobState,
    pub required_targets: Vec<TargetId>,
    pub created_at: DateTime<Utc>,
    pub version_token: i64,
}

impl Job {
    /// Construct a freshly-discovered job. `required_targets` must be
    /// non-empty; duplicates are dropped while preserving first-seen order
    /// ("ordered-but-set-semantic", §3).
    pub fn new(
        source_path: impl Into<String>,
        initial_size: u64,
        required_targets: Vec<TargetId>,
    ) -> Result<Self, ForkerError> {
        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(required_targets.len());
        for target in required_targets {
            if seen.insert(target.clone()) {
                targets.push(target);
            }
        }
        if targets.is_empty() {
            return Err(ForkerError::invariant(
                "I-required-targets",
                "Job",
                "required_targets must be non-empty",
            ));
        }
        Ok(Self {
            id: JobId::new(),
            source_path: source_path.into(),
            initial_size,
            source_hash: None,
            state: JobState::Discovered,
            required_targets: targets,
            created_at: Utc::now(),
            version_token: 1,
        })
    }

    /// Apply a job state transition, validating against §4.6's edge list.
    /// Re-applying the current state is a no-op (idempotent re-delivery).
    pub fn transition_to(&mut self, to: JobState) -> Result<(), ForkerError> {
        if self.state == to {
            return Ok(());
        }
        if !job_transition_allowed(self.state, to) {
            return Err(ForkerError::invalid_transition("Job", self.state, to));
        }
        self.state = to;
        Ok(())
    }

    /// Publish the source hash exactly once (I10). Setting the same value a
    /// second time is a no-op; setting a different value is a hard error.
    pub fn set_source_hash(&mut self, hash: impl Into<String>) -> Result<(), ForkerError> {
        let hash = hash.into();
        match &self.source_hash {
            None => {
                self.source_hash = Some(hash);
                Ok(())
            }
            Some(existing) if existing == &hash => Ok(()),
            Some(existing) => Err(ForkerError::invariant(
                "I10",
                "Job",
                format!("source hash already set to {existing}, refusing {hash}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str) -> TargetId {
        TargetId::parse(name).unwrap()
    }

    #[test]
    fn new_job_dedupes_targets_preserving_order() {
        let job = Job::new(
            "/input/x.svs",
            10,
            vec![target("TargetA"), target("TargetB"), target("TargetA")],
        )
        .unwrap();
        assert_eq!(job.required_targets, vec![target("TargetA"), target("TargetB")]);
    }

    #[test]
    fn new_job_rejects_empty_targets() {
        assert!(Job::new("/input/x.svs", 10, vec![]).is_err());
    }

    #[test]
    fn valid_edges_succeed_and_self_transition_is_noop() {
        let mut job = Job::new("/input/x.svs", 10, vec![target("TargetA")]).unwrap();
        job.transition_to(JobState::Discovered).unwrap();
        assert_eq!(job.state, JobState::Discovered);
        job.transition_to(JobState::Queued).unwrap();
        assert_eq!(job.state, JobState::Queued);
    }

    #[test]
    fn invalid_edge_is_rejected() {
        let mut job = Job::new("/input/x.svs", 10, vec![target("TargetA")]).unwrap();
        assert!(job.transition_to(JobState::Verified).is_err());
    }

    #[test]
    fn requeue_from_quarantine_is_the_only_reverse_edge() {
        let mut job = Job::new("/input/x.svs", 10, vec![target("TargetA")]).unwrap();
        job.state = JobState::Quarantined;
        job.transition_to(JobState::Queued).unwrap();
        assert_eq!(job.state, JobState::Queued);
    }

    #[test]
    fn source_hash_is_write_once() {
        let mut job = Job::new("/input/x.svs", 10, vec![target("TargetA")]).unwrap();
        job.set_source_hash("abc").unwrap();
        job.set_source_hash("abc").unwrap();
        assert!(job.set_source_hash("def").is_err());
        assert_eq!(job.source_hash.as_deref(), Some("abc"));
    }
}
