//! The Quarantine Manager (C8, §4.8): records integrity failures as
//! first-class persisted entries and exposes the one manual-requeue
//! interface an operator may invoke.

use tracing::warn;

use forker_db::Store;
use forker_ids::{JobId, QuarantineEntryId, TargetId};
use forker_protocol::{ForkerResult, JobState, QuarantineEntry, QuarantineStatus};

/// Thin wrapper around `Store` for quarantine-specific operations. Holds no
/// state of its own; every call is a transaction against the durable store.
pub struct QuarantineManager<'a> {
    store: &'a Store,
}

impl<'a> QuarantineManager<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Record a new quarantine entry for an integrity failure. Idempotent in
    /// the sense the caller is expected to check `job.state` first; calling
    /// this twice for the same job creates two entries, which is acceptable
    /// audit behavior (each capture of new evidence is its own record) but
    /// callers in `Orchestrator` guard against it by checking job state.
    pub fn quarantine(
        &self,
        job_id: JobId,
        source_path: impl Into<String>,
        expected_hash: Option<String>,
        reason: impl Into<String>,
        affected_targets: Vec<TargetId>,
    ) -> ForkerResult<QuarantineEntry> {
        let entry = QuarantineEntry::new(job_id, source_path, expected_hash, reason, affected_targets);
        self.store.save_quarantine_entry(&entry)?;
        warn!(entry_id = %entry.id, job_id = %entry.job_id, reason = %entry.reason, "job quarantined");
        Ok(entry)
    }

    /// `Active -> Released`, followed by the job's explicit
    /// `RequeueFromQuarantine` edge (`Quarantined -> Queued`). This is the
    /// engine's sole reverse transition (I8); both halves happen or neither
    /// does, enforced by a CAS retry loop on the job's version token.
    pub fn release_and_requeue(
        &self,
        entry_id: &QuarantineEntryId,
        release_reason: impl Into<String>,
        released_by: impl Into<String>,
    ) -> ForkerResult<()> {
        let mut entry = self.store.get_quarantine_entry(entry_id)?;
        entry.release(release_reason, released_by)?;
        self.store.update_quarantine_entry(&entry)?;

        for _ in 0..5 {
            let mut job = self.store.get_job(&entry.job_id)?;
            job.transition_to(JobState::Queued)?;
            match self.store.update_job(&job) {
                Ok(_) => return Ok(()),
                Err(forker_protocol::ForkerError::Concurrency { .. }) => continue,
                Err(other) => return Err(other),
            }
        }
        Err(forker_protocol::ForkerError::Concurrency {
            expected: -1,
            actual: -1,
        })
    }

    pub fn purge(&self, entry_id: &QuarantineEntryId) -> ForkerResult<()> {
        let mut entry = self.store.get_quarantine_entry(entry_id)?;
        entry.purge()?;
        self.store.update_quarantine_entry(&entry)
    }

    pub fn list(&self, status: Option<QuarantineStatus>) -> ForkerResult<Vec<QuarantineEntry>> {
        self.store.list_quarantine_entries(status)
    }

    pub fn stats(&self) -> ForkerResult<std::collections::HashMap<QuarantineStatus, i64>> {
        self.store.quarantine_stats()
    }
}
