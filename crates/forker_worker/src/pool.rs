//! Bounded copy-worker pool (§5): one worker task per dispatched copy
//! attempt, gated by a semaphore so at most `worker_pool_size` attempts run
//! concurrently across all jobs. Blocking I/O always runs inside
//! `spawn_blocking`; nothing here blocks the runtime's worker threads.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::error;

use forker_db::Store;
use forker_protocol::ForkerError;

use crate::protocol::{execute_copy_attempt, CopyRequest};

/// Reported back to the orchestrator once a dispatched attempt finishes,
/// successfully or not. The orchestrator re-reads the persisted
/// `TargetOutcome` rather than trusting fields here, so redelivering the
/// same completion twice is a no-op (§8).
pub struct CopyCompletion {
    pub request: CopyRequest,
    pub result: Result<(), ForkerError>,
}

/// A bounded pool of copy workers. Cheap to clone (holds only `Arc`s); every
/// clone shares the same concurrency limit and completion channel.
#[derive(Clone)]
pub struct WorkerPool {
    store: Arc<Store>,
    semaphore: Arc<Semaphore>,
    completions: mpsc::Sender<CopyCompletion>,
}

impl WorkerPool {
    pub fn new(store: Arc<Store>, pool_size: usize, completions: mpsc::Sender<CopyCompletion>) -> Self {
        Self {
            store,
            semaphore: Arc::new(Semaphore::new(pool_size.max(1))),
            completions,
        }
    }

    /// Spawn a task to run `request`. Returns immediately; the outcome
    /// arrives later on the completion channel. Backpressure comes from the
    /// semaphore: a dispatch beyond `pool_size` in-flight attempts simply
    /// waits for a permit before doing any I/O.
    pub fn dispatch(&self, request: CopyRequest) {
        let store = Arc::clone(&self.store);
        let semaphore = Arc::clone(&self.semaphore);
        let completions = self.completions.clone();

        tokio::spawn(async move {
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return, // semaphore closed at shutdown
            };

            let job_id = request.job_id.clone();
            let target_id = request.target_id.clone();
            let task_request = request.clone();
            let result = tokio::task::spawn_blocking(move || execute_copy_attempt(&store, &task_request))
                .await
                .unwrap_or_else(|join_err| {
                    Err(ForkerError::invariant(
                        "I-worker-panic",
                        "TargetOutcome",
                        format!("copy worker task panicked: {join_err}"),
                    ))
                });
            drop(permit);

            if let Err(e) = &result {
                error!(%job_id, %target_id, error = %e, "copy attempt did not reach Verified");
            }
            let _ = completions
                .send(CopyCompletion { request, result })
                .await;
        });
    }
}
