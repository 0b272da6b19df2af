//! The Copy Protocol (C5, §4.5): per-target staged copy, fully synchronous so
//! it can run inside `spawn_blocking`. Every transition is persisted before
//! the next step proceeds (crash safety, §4.5/§5).

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use forker_db::Store;
use forker_hashing::{copy_and_hash, verify_file};
use forker_ids::{JobId, TargetId};
use forker_protocol::{CopyState, ForkerError, ForkerResult, JobState};

/// Everything a single copy attempt needs; owned (not borrowed) so it can
/// cross a `spawn_blocking` boundary.
#[derive(Debug, Clone)]
pub struct CopyRequest {
    pub job_id: JobId,
    pub target_id: TargetId,
    pub source_path: PathBuf,
    pub dest_root: PathBuf,
    /// Honored only when the engine's `Environment` allows destructive test
    /// hooks (§6); the caller is responsible for that gate.
    pub verification_delay: Option<Duration>,
}

fn temp_path(dest_root: &Path, basename: &str, job_id: &JobId) -> PathBuf {
    dest_root.join(format!("{basename}.part-{job_id}"))
}

fn final_path(dest_root: &Path, basename: &str) -> PathBuf {
    dest_root.join(basename)
}

fn basename_of(source_path: &Path) -> ForkerResult<String> {
    source_path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            ForkerError::Configuration {
                key: "source_path".into(),
                reason: format!("no file name component in {}", source_path.display()),
            }
        })
}

/// fsync a directory so the rename itself is durable. Not meaningful on
/// Windows filesystems; skipped there.
#[cfg(unix)]
fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn fsync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

fn remove_temp_best_effort(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "failed to remove partial temp file");
        }
    }
}

/// Attempt to publish the job's source hash (write-once, I10). The first
/// target to finish copying wins; every subsequent target simply confirms
/// its own computed hash against the already-published value (§9's resolved
/// open question).
fn publish_or_check_source_hash(store: &Store, job_id: &JobId, computed: &str) -> ForkerResult<()> {
    for _ in 0..5 {
        let job = store.get_job(job_id)?;
        if let Some(existing) = &job.source_hash {
            if existing != computed {
                return Err(ForkerError::Integrity {
                    expected: existing.clone(),
                    actual: computed.to_string(),
                    path: job.source_path,
                });
            }
            return Ok(());
        }
        let mut updated = job;
        updated.set_source_hash(computed)?;
        match store.update_job(&updated) {
            Ok(_) => return Ok(()),
            Err(ForkerError::Concurrency { .. }) => continue,
            Err(other) => return Err(other),
        }
    }
    Err(ForkerError::Concurrency {
        expected: -1,
        actual: -1,
    })
}

/// Run one attempt of the Copy Protocol for a single target, persisting each
/// transition as it happens. Returns `Ok(())` when the target reaches
/// `Verified`. Any failure has already been persisted as `FailedRetryable`
/// (I/O error) or `FailedPermanent` (integrity mismatch, I5) before this
/// returns `Err`; the caller (the orchestrator's completion handler) decides
/// whether to retry.
pub fn execute_copy_attempt(store: &Store, request: &CopyRequest) -> ForkerResult<()> {
    let CopyRequest {
        job_id,
        target_id,
        source_path,
        dest_root,
        verification_delay,
    } = request;

    let mut outcome = store.get_target_outcome(job_id, target_id)?;

    // Resolving the basename is part of step 1's "compute target temp path"
    // (§4.5): it happens before `Copying` is ever persisted, since no temp
    // path — and so no attempt — can be formed without it. A malformed
    // source path is not a transient condition, so it goes straight to
    // `FailedRetryable` from `Pending` without incrementing `attempts`; the
    // classifier (Configuration category) will carry it to `FailedPermanent`
    // without waiting on retries.
    let basename = match basename_of(source_path) {
        Ok(b) => b,
        Err(err) => return fail_retryable(store, &mut outcome, err),
    };
    let temp = temp_path(dest_root, &basename, job_id);
    let dest = final_path(dest_root, &basename);

    // Step 1: Pending -> Copying, persisted before any further I/O so a
    // failure creating the destination directory still counts as an
    // attempt (I6) and leaves an audit trail instead of stranding the
    // outcome at `Pending` behind a bare `?`.
    outcome.begin_copy(temp.to_string_lossy().into_owned())?;
    store.update_target_outcome(&outcome)?;

    if let Err(e) = std::fs::create_dir_all(dest_root) {
        let err = ForkerError::io(e, dest_root.display().to_string());
        remove_temp_best_effort(&temp);
        return fail_retryable(store, &mut outcome, err);
    }

    let copy_result = run_copy_and_flush(source_path, &temp);
    let (bytes, computed_hash) = match copy_result {
        Ok(pair) => pair,
        Err(err) => {
            remove_temp_best_effort(&temp);
            return fail_retryable(store, &mut outcome, err);
        }
    };
    info!(%job_id, %target_id, bytes, "copy+hash complete");

    // Step 5: first target to finish publishes SourceHash (write-once).
    if let Err(err) = publish_or_check_source_hash(store, job_id, &computed_hash) {
        remove_temp_best_effort(&temp);
        return match err {
            ForkerError::Integrity { .. } => fail_permanent(store, &mut outcome, err),
            other => fail_retryable(store, &mut outcome, other),
        };
    }

    // Step 6: atomic rename temp -> final, persist Copied.
    if let Err(e) = std::fs::rename(&temp, &dest) {
        let err = ForkerError::io(e, dest.display().to_string());
        remove_temp_best_effort(&temp);
        return fail_retryable(store, &mut outcome, err);
    }
    outcome.hash = Some(computed_hash);
    outcome.final_path = Some(dest.to_string_lossy().into_owned());
    outcome.temp_path = None;
    outcome.transition_to(CopyState::Copied)?;
    store.update_target_outcome(&outcome)?;

    // Step 7: artificial verification delay (test hook only).
    if let Some(delay) = verification_delay {
        std::thread::sleep(*delay);
    }

    // Step 8: Copied -> Verifying -> independent re-read verification.
    outcome.transition_to(CopyState::Verifying)?;
    store.update_target_outcome(&outcome)?;

    let job = store.get_job(job_id)?;
    let expected = job.source_hash.clone().ok_or_else(|| {
        ForkerError::invariant("I10", "Job", "source hash missing at verification time")
    })?;

    let verification = verify_file(&dest, &expected)?;
    if verification.matched {
        outcome.transition_to(CopyState::Verified)?;
        store.update_target_outcome(&outcome)?;
        info!(%job_id, %target_id, "target verified");
        Ok(())
    } else {
        warn!(%job_id, %target_id, expected, computed = %verification.computed, "verification mismatch");
        let err = ForkerError::Integrity {
            expected,
            actual: verification.computed,
            path: dest.display().to_string(),
        };
        fail_permanent(store, &mut outcome, err)
    }
}

fn run_copy_and_flush(source_path: &Path, temp: &Path) -> ForkerResult<(u64, String)> {
    let src = File::open(source_path).map_err(|e| ForkerError::io(e, source_path.display().to_string()))?;
    let dst = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(temp)
        .map_err(|e| ForkerError::io(e, temp.display().to_string()))?;

    let (bytes, hash) = copy_and_hash(src, &dst, &temp.display().to_string())?;

    dst.sync_all().map_err(|e| ForkerError::io(e, temp.display().to_string()))?;
    if let Some(parent) = temp.parent() {
        fsync_dir(parent).map_err(|e| ForkerError::io(e, parent.display().to_string()))?;
    }
    Ok((bytes, hash))
}

fn fail_retryable(store: &Store, outcome: &mut forker_protocol::TargetOutcome, err: ForkerError) -> ForkerResult<()> {
    outcome.last_error = Some(err.to_string());
    outcome.temp_path = None;
    outcome.transition_to(CopyState::FailedRetryable)?;
    store.update_target_outcome(outcome)?;
    Err(err)
}

fn fail_permanent(store: &Store, outcome: &mut forker_protocol::TargetOutcome, err: ForkerError) -> ForkerResult<()> {
    outcome.last_error = Some(err.to_string());
    outcome.temp_path = None;
    outcome.transition_to(CopyState::FailedPermanent)?;
    store.update_target_outcome(outcome)?;
    Err(err)
}

/// Reconcile every non-terminal `TargetOutcome` with the crash-safety rules
/// of §4.5: a target caught mid-`Copying` loses its temp file and returns to
/// `Pending`; `Copied` and `Verifying` both re-enter at `Verifying`, which is
/// idempotent (re-read and compare). Returns the targets that need
/// redispatch to the worker pool (i.e. landed back in `Pending`).
pub fn recover_in_flight(store: &Store) -> ForkerResult<Vec<(JobId, TargetId)>> {
    let mut to_redispatch = Vec::new();

    for mut outcome in store.list_target_outcomes_by_copy_state(CopyState::Copying)? {
        if let Some(temp) = outcome.temp_path.clone() {
            remove_temp_best_effort(Path::new(&temp));
        }
        outcome.copy_state = CopyState::Pending;
        outcome.temp_path = None;
        outcome.last_transition_at = chrono::Utc::now();
        store.update_target_outcome(&outcome)?;
        to_redispatch.push((outcome.job_id, outcome.target_id));
    }

    for mut outcome in store.list_target_outcomes_by_copy_state(CopyState::Copied)? {
        outcome.copy_state = CopyState::Verifying;
        outcome.last_transition_at = chrono::Utc::now();
        store.update_target_outcome(&outcome)?;
        to_redispatch.push((outcome.job_id, outcome.target_id));
    }

    // Targets already in Verifying at crash time stay there; the orchestrator
    // re-drives verification for them on the same redispatch path.
    for outcome in store.list_target_outcomes_by_copy_state(CopyState::Verifying)? {
        to_redispatch.push((outcome.job_id, outcome.target_id));
    }

    Ok(to_redispatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forker_protocol::{Job, TargetOutcome};

    fn target(name: &str) -> TargetId {
        TargetId::parse(name).unwrap()
    }

    fn setup(store: &Store, data: &[u8]) -> (JobId, PathBuf, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("slide.svs");
        std::fs::write(&source, data).unwrap();

        let job = Job::new(source.display().to_string(), data.len() as u64, vec![target("TargetA")]).unwrap();
        store.save_new_job(&job).unwrap();
        let outcome = TargetOutcome::new(job.id.clone(), target("TargetA"));
        store.save_target_outcome(&outcome).unwrap();
        (job.id, source, dir)
    }

    #[test]
    fn happy_path_copies_and_verifies() {
        let store = Store::open_in_memory().unwrap();
        let (job_id, source, dir) = setup(&store, b"the quick brown fox");
        let dest_root = dir.path().join("DestinationA");

        let request = CopyRequest {
            job_id: job_id.clone(),
            target_id: target("TargetA"),
            source_path: source.clone(),
            dest_root: dest_root.clone(),
            verification_delay: None,
        };
        execute_copy_attempt(&store, &request).unwrap();

        let outcome = store.get_target_outcome(&job_id, &target("TargetA")).unwrap();
        assert_eq!(outcome.copy_state, CopyState::Verified);
        assert_eq!(
            std::fs::read(dest_root.join("slide.svs")).unwrap(),
            b"the quick brown fox"
        );

        let job = store.get_job(&job_id).unwrap();
        assert!(job.source_hash.is_some());
        assert_eq!(job.source_hash, outcome.hash);
    }

    #[test]
    fn missing_source_fails_retryable() {
        let store = Store::open_in_memory().unwrap();
        let (job_id, source, dir) = setup(&store, b"data");
        std::fs::remove_file(&source).unwrap();
        let dest_root = dir.path().join("DestinationA");

        let request = CopyRequest {
            job_id: job_id.clone(),
            target_id: target("TargetA"),
            source_path: source,
            dest_root,
            verification_delay: None,
        };
        assert!(execute_copy_attempt(&store, &request).is_err());

        let outcome = store.get_target_outcome(&job_id, &target("TargetA")).unwrap();
        assert_eq!(outcome.copy_state, CopyState::FailedRetryable);
    }

    #[test]
    fn dest_root_blocked_by_a_file_fails_retryable_with_an_incremented_attempt() {
        let store = Store::open_in_memory().unwrap();
        let (job_id, source, dir) = setup(&store, b"data");
        let dest_root = dir.path().join("blocked");
        std::fs::write(&dest_root, b"occupies the path as a plain file").unwrap();

        let request = CopyRequest {
            job_id: job_id.clone(),
            target_id: target("TargetA"),
            source_path: source,
            dest_root,
            verification_delay: None,
        };
        assert!(execute_copy_attempt(&store, &request).is_err());

        let outcome = store.get_target_outcome(&job_id, &target("TargetA")).unwrap();
        assert_eq!(outcome.copy_state, CopyState::FailedRetryable);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.temp_path.is_none());
    }

    #[test]
    fn corruption_after_copy_is_permanent_integrity_failure() {
        let store = Store::open_in_memory().unwrap();
        let (job_id, source, dir) = setup(&store, b"0123456789");
        let dest_root = dir.path().join("DestinationA");
        std::fs::create_dir_all(&dest_root).unwrap();

        // Pre-seed a wrong SourceHash via a failed first attempt isn't
        // realistic; instead corrupt the destination copy between rename and
        // verification using the artificial delay hook, mutating the file
        // from a second thread.
        let dest_clone = dest_root.clone();
        let corrupt_after = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            let path = dest_clone.join("slide.svs");
            if path.exists() {
                let mut bytes = std::fs::read(&path).unwrap();
                bytes[0] ^= 0xFF;
                std::fs::write(&path, bytes).unwrap();
            }
        });

        let request = CopyRequest {
            job_id: job_id.clone(),
            target_id: target("TargetA"),
            source_path: source,
            dest_root,
            verification_delay: Some(Duration::from_millis(100)),
        };
        let result = execute_copy_attempt(&store, &request);
        corrupt_after.join().unwrap();
        assert!(result.is_err());

        let outcome = store.get_target_outcome(&job_id, &target("TargetA")).unwrap();
        assert_eq!(outcome.copy_state, CopyState::FailedPermanent);
        assert!(outcome.last_error.as_ref().unwrap().contains("integrity"));
    }

    #[test]
    fn recover_in_flight_resets_copying_and_redrives_copied() {
        let store = Store::open_in_memory().unwrap();
        let job = Job::new("/input/z.svs", 100, vec![target("TargetA"), target("TargetB")]).unwrap();
        store.save_new_job(&job).unwrap();

        let mut copying = TargetOutcome::new(job.id.clone(), target("TargetA"));
        copying.begin_copy("/dest/z.part-1").unwrap();
        store.save_target_outcome(&copying).unwrap();

        let mut copied = TargetOutcome::new(job.id.clone(), target("TargetB"));
        copied.begin_copy("/dest/z.part-1").unwrap();
        copied.transition_to(CopyState::Copied).unwrap();
        store.save_target_outcome(&copied).unwrap();

        let redispatch = recover_in_flight(&store).unwrap();
        assert_eq!(redispatch.len(), 2);

        let a = store.get_target_outcome(&job.id, &target("TargetA")).unwrap();
        assert_eq!(a.copy_state, CopyState::Pending);
        assert_eq!(a.attempts, 1);
        assert!(a.temp_path.is_none());

        let b = store.get_target_outcome(&job.id, &target("TargetB")).unwrap();
        assert_eq!(b.copy_state, CopyState::Verifying);
    }
}
