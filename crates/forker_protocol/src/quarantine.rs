//! The QuarantineEntry entity (§4.8, §9 — promoted from logging stub to a
//! first-class persisted record).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use forker_ids::{IdParseError, JobId, QuarantineEntryId, TargetId};
use serde::{Deserialize, Serialize};

use crate::error::ForkerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum QuarantineStatus {
    Active,
    Released,
    Purged,
}

impl QuarantineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuarantineStatus::Active => "Active",
            QuarantineStatus::Released => "Released",
            QuarantineStatus::Purged => "Purged",
        }
    }
}

impl fmt::Display for QuarantineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for QuarantineStatus {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Active" => Ok(QuarantineStatus::Active),
            "Released" => Ok(QuarantineStatus::Released),
            "Purged" => Ok(QuarantineStatus::Purged),
            other => Err(IdParseError::from(format!(
                "unknown quarantine status '{other}'"
            ))),
        }
    }
}

/// A record of an integrity failure. Exit requires an explicit
/// administrative action (`release`), which triggers
/// `RequeueFromQuarantine` on the underlying job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub id: QuarantineEntryId,
    pub job_id: JobId,
    pub source_path: String,
    pub expected_hash: Option<String>,
    pub reason: String,
    pub affected_targets: Vec<TargetId>,
    pub quarantined_at: DateTime<Utc>,
    pub status: QuarantineStatus,
    pub release_reason: Option<String>,
    pub released_by: Option<String>,
    pub released_at: Option<DateTime<Utc>>,
}

impl QuarantineEntry {
    pub fn new(
        job_id: JobId,
        source_path: impl Into<String>,
        expected_hash: Option<String>,
        reason: impl Into<String>,
        affected_targets: Vec<TargetId>,
    ) -> Self {
        Self {
            id: QuarantineEntryId::new(),
            job_id,
            source_path: source_path.into(),
            expected_hash,
            reason: reason.into(),
            affected_targets,
            quarantined_at: Utc::now(),
            status: QuarantineStatus::Active,
            release_reason: None,
            released_by: None,
            released_at: None,
        }
    }

    /// Active -> Released. The caller is responsible for invoking
    /// `RequeueFromQuarantine` on the job afterward.
    pub fn release(
        &mut self,
        reason: impl Into<String>,
        released_by: impl Into<String>,
    ) -> Result<(), ForkerError> {
        if self.status != QuarantineStatus::Active {
            return Err(ForkerError::invalid_transition(
                "QuarantineEntry",
                self.status,
                QuarantineStatus::Released,
            ));
        }
        self.status = QuarantineStatus::Released;
        self.release_reason = Some(reason.into());
        self.released_by = Some(released_by.into());
        self.released_at = Some(Utc::now());
        Ok(())
    }

    /// Active -> Purged. Distinct from release: no requeue follows.
    pub fn purge(&mut self) -> Result<(), ForkerError> {
        if self.status != QuarantineStatus::Active {
            return Err(ForkerError::invalid_transition(
                "QuarantineEntry",
                self.status,
                QuarantineStatus::Purged,
            ));
        }
        self.status = QuarantineStatus::Purged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_then_purge_is_rejected() {
        let mut entry = QuarantineEntry::new(
            JobId::new(),
            "/input/y.svs",
            Some("abc".into()),
            "hash mismatch on TargetA",
            vec![TargetId::parse("TargetA").unwrap()],
        );
        entry.release("corrected copy verified by hand", "operator@example.com").unwrap();
        assert_eq!(entry.status, QuarantineStatus::Released);
        assert!(entry.purge().is_err());
    }
}
