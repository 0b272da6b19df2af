//! The Job Orchestrator (C6, §4.6): records newly-stable files as jobs,
//! dispatches copy attempts, and reacts to worker completions by driving the
//! retry classifier (C7) and re-aggregating job state, escalating to the
//! Quarantine Manager (C8) on integrity failure.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use forker_db::Store;
use forker_ids::{JobId, TargetId};
use forker_protocol::{CopyState, ForkerError, ForkerResult, Job, JobState, TargetOutcome};
use forker_worker::{CopyCompletion, CopyRequest, WorkerPool};

use crate::aggregate::{aggregate_job_state, AggregationInput};
use crate::classify::{retry_decision, RetryDecision, RetryPolicy};
use crate::quarantine::QuarantineManager;

/// A configured destination: a stable target id plus the filesystem root it
/// writes into.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub id: TargetId,
    pub dest_root: PathBuf,
}

/// Drives the job lifecycle end to end. Cheap to wrap in `Arc` and share
/// across the discovery-handling and completion-handling call sites.
pub struct Orchestrator {
    store: Arc<Store>,
    pool: WorkerPool,
    targets: Vec<TargetSpec>,
    retry_policy: RetryPolicy,
    verification_delay: Option<std::time::Duration>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        pool: WorkerPool,
        targets: Vec<TargetSpec>,
        retry_policy: RetryPolicy,
        verification_delay: Option<std::time::Duration>,
    ) -> Self {
        Self {
            store,
            pool,
            targets,
            retry_policy,
            verification_delay,
        }
    }

    /// Record a file the stability detector just cleared as a new job and
    /// dispatch the initial attempt against every required target.
    /// Duplicate stability events for the same path (e.g. a rescan racing a
    /// watcher event) are absorbed: if a non-terminal job already exists for
    /// this source path, no second job is created.
    pub fn on_file_stable(&self, source_path: PathBuf, initial_size: u64) -> ForkerResult<JobId> {
        let path_str = source_path.display().to_string();
        if let Some(existing) = self
            .store
            .list_by_source_path(&path_str)?
            .into_iter()
            .find(|j| !j.state.is_terminal())
        {
            return Ok(existing.id);
        }

        let required: Vec<TargetId> = self.targets.iter().map(|t| t.id.clone()).collect();
        let job = Job::new(path_str, initial_size, required)?;
        self.store.save_new_job(&job)?;
        for target in &self.targets {
            let outcome = TargetOutcome::new(job.id.clone(), target.id.clone());
            self.store.save_target_outcome(&outcome)?;
        }

        let mut queued = job.clone();
        queued.transition_to(JobState::Queued)?;
        let queued = self.store.update_job(&queued)?;
        let mut in_progress = queued;
        in_progress.transition_to(JobState::InProgress)?;
        self.store.update_job(&in_progress)?;

        info!(job_id = %job.id, source = %source_path.display(), "job discovered and queued");
        for target in &self.targets {
            self.dispatch(&job.id, &target.id, &source_path, &target.dest_root);
        }
        Ok(job.id)
    }

    fn dispatch(&self, job_id: &JobId, target_id: &TargetId, source_path: &Path, dest_root: &Path) {
        self.pool.dispatch(CopyRequest {
            job_id: job_id.clone(),
            target_id: target_id.clone(),
            source_path: source_path.to_path_buf(),
            dest_root: dest_root.to_path_buf(),
            verification_delay: self.verification_delay,
        });
    }

    /// React to a finished copy attempt: classify any failure, decide retry
    /// vs. permanent, then re-aggregate the job. Safe to invoke twice for the
    /// same completion — the second call observes the already-advanced
    /// persisted state and the match arms below become no-ops (§8).
    pub async fn handle_completion(&self, completion: CopyCompletion) -> ForkerResult<()> {
        let CopyCompletion { request, result } = completion;
        let outcome = self.store.get_target_outcome(&request.job_id, &request.target_id)?;

        if let (Err(err), CopyState::FailedRetryable) = (&result, outcome.copy_state) {
            self.handle_retryable_failure(&request, &outcome, err).await?;
        }
        // Ok(()) landing in Verified, or Err(()) already landed in
        // FailedPermanent (integrity or otherwise), need no further action on
        // the target itself; any other observed state means a stale/duplicate
        // notification and is likewise a no-op here.

        self.reaggregate(&request.job_id).await
    }

    async fn handle_retryable_failure(
        &self,
        request: &CopyRequest,
        outcome: &TargetOutcome,
        err: &ForkerError,
    ) -> ForkerResult<()> {
        match retry_decision(outcome.attempts, err, &self.retry_policy) {
            RetryDecision::Retry { delay, reason } => {
                info!(job_id = %request.job_id, target_id = %request.target_id, ?delay, reason, "scheduling retry");
                let store = Arc::clone(&self.store);
                let pool = self.pool.clone();
                let request = request.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let Ok(mut outcome) = store.get_target_outcome(&request.job_id, &request.target_id) else {
                        return;
                    };
                    if outcome.copy_state != CopyState::FailedRetryable {
                        return; // state moved on since the completion fired
                    }
                    if outcome.retry_reset().is_err() {
                        return;
                    }
                    if store.update_target_outcome(&outcome).is_err() {
                        return;
                    }
                    pool.dispatch(request);
                });
                Ok(())
            }
            RetryDecision::PermanentFailure { reason }
            | RetryDecision::MaxAttemptsReached { reason }
            | RetryDecision::NonRetryable { reason } => {
                let mut outcome = outcome.clone();
                outcome.last_error = Some(reason);
                outcome.transition_to(CopyState::FailedPermanent)?;
                self.store.update_target_outcome(&outcome)
            }
        }
    }

    /// Recompute and persist the job's state from its current targets,
    /// retrying on version-token contention up to a small bound (§7);
    /// abandoning after that bound is intentional, since the next event that
    /// touches this job re-drives aggregation from scratch.
    async fn reaggregate(&self, job_id: &JobId) -> ForkerResult<()> {
        for _ in 0..5 {
            let job = self.store.get_job(job_id)?;
            if job.state.is_terminal() {
                return Ok(());
            }
            let outcomes = self.store.list_target_outcomes_for_job(job_id)?;
            let integrity_failed = integrity_failed_targets(&outcomes);
            let new_state = aggregate_job_state(&AggregationInput {
                outcomes: &outcomes,
                max_attempts: self.retry_policy.max_attempts,
                integrity_failed: &integrity_failed,
            });
            if new_state == job.state {
                return Ok(());
            }

            let mut updated = job.clone();
            updated.transition_to(new_state)?;
            match self.store.update_job(&updated) {
                Ok(saved) => {
                    info!(job_id = %job_id, from = %job.state, to = %saved.state, "job state advanced");
                    if saved.state == JobState::Quarantined {
                        self.record_quarantine(&saved, &outcomes, &integrity_failed)?;
                    }
                    return Ok(());
                }
                Err(ForkerError::Concurrency { .. }) => continue,
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    fn record_quarantine(
        &self,
        job: &Job,
        outcomes: &[TargetOutcome],
        integrity_failed: &[TargetId],
    ) -> ForkerResult<()> {
        let manager = QuarantineManager::new(&self.store);
        let already_recorded = manager.list(None)?.iter().any(|e| e.job_id == job.id);
        if already_recorded {
            return Ok(());
        }
        let reason = outcomes
            .iter()
            .filter(|o| integrity_failed.contains(&o.target_id))
            .filter_map(|o| o.last_error.clone())
            .collect::<Vec<_>>()
            .join("; ");
        manager.quarantine(
            job.id.clone(),
            job.source_path.clone(),
            job.source_hash.clone(),
            reason,
            integrity_failed.to_vec(),
        )?;
        Ok(())
    }

    /// Resume targets left mid-flight by a crash (§4.5's crash-safety rules,
    /// already applied to the store by `forker_worker::recover_in_flight`);
    /// redispatch each to the pool so copying/verification continues.
    pub fn recover_and_redispatch(&self) -> ForkerResult<()> {
        for (job_id, target_id) in forker_worker::recover_in_flight(&self.store)? {
            let job = self.store.get_job(&job_id)?;
            if let Some(spec) = self.targets.iter().find(|t| t.id == target_id) {
                self.dispatch(&job_id, &target_id, Path::new(&job.source_path), &spec.dest_root);
            }
        }
        Ok(())
    }

    /// Main event loop: react to newly-stable files and worker completions
    /// until `shutdown` fires. Discovery and stability detection run on
    /// their own tasks upstream and feed `stable_files`; nothing here blocks
    /// on I/O directly (§5).
    pub async fn run(
        self: Arc<Self>,
        mut stable_files: mpsc::Receiver<(PathBuf, u64)>,
        mut completions: mpsc::Receiver<CopyCompletion>,
        mut shutdown: tokio::sync::oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                Some((path, size)) = stable_files.recv() => {
                    if let Err(e) = self.on_file_stable(path, size) {
                        error!(error = %e, "failed to record newly stable file");
                    }
                }
                Some(completion) = completions.recv() => {
                    if let Err(e) = self.handle_completion(completion).await {
                        error!(error = %e, "failed to process copy completion");
                    }
                }
                _ = &mut shutdown => {
                    info!("orchestrator shutdown requested");
                    break;
                }
                else => break,
            }
        }
    }
}

fn integrity_failed_targets(outcomes: &[TargetOutcome]) -> Vec<TargetId> {
    outcomes
        .iter()
        .filter(|o| {
            o.copy_state == CopyState::FailedPermanent
                && o.last_error
                    .as_deref()
                    .is_some_and(|e| e.contains("integrity check failed"))
        })
        .map(|o| o.target_id.clone())
        .collect()
}
