//! The Stability Detector (C2, §4.2): decide when a newly observed file has
//! stopped growing and may be handed to the copy pipeline.
//!
//! Only `stat` is used to inspect the subject file — no open handle is ever
//! held on it, so the detector never impedes whatever clinical-side process
//! may still be appending to it.

use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::{debug, trace};

/// Outcome of a stability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stability {
    /// Size and mtime held steady across `max_checks` observations and the
    /// file's age clears `minimum_file_age`.
    Stable { size: u64 },
    /// Still within the observation window; keep polling.
    StillGrowing,
    /// The path no longer exists.
    Gone,
    /// `stat` failed for a reason other than not-found.
    Error(String),
}

/// Configuration for a single stability run (§6's
/// `monitoring.minimumFileAgeSeconds` / `stabilityCheckIntervalSeconds` /
/// `maxStabilityChecks`).
#[derive(Debug, Clone, Copy)]
pub struct StabilityConfig {
    pub minimum_file_age: Duration,
    pub check_interval: Duration,
    pub max_checks: u32,
}

/// One `stat` against `path`, compared to the last observed `(size, mtime)`.
/// Does not sleep; callers drive the interval themselves, since the
/// discovery source runs this concurrently against many candidate paths.
fn stat(path: &Path) -> Result<(u64, SystemTime), Stability> {
    match std::fs::metadata(path) {
        Ok(meta) => {
            let mtime = meta.modified().map_err(|e| Stability::Error(e.to_string()))?;
            Ok((meta.len(), mtime))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Stability::Gone),
        Err(e) => Err(Stability::Error(e.to_string())),
    }
}

/// Poll `path` until it is judged [`Stability::Stable`], goes
/// [`Stability::Gone`], or a `stat` call errors. Blocks the calling task for
/// up to `max_checks * check_interval` via `tokio::time::sleep` between
/// observations; run one of these per candidate path as its own task.
pub async fn watch_until_stable(path: &Path, config: StabilityConfig) -> Stability {
    let mut last: Option<(u64, SystemTime)> = None;
    let mut unchanged_checks: u32 = 0;
    let mut first_seen: Option<SystemTime> = None;

    loop {
        let current = match stat(path) {
            Ok(v) => v,
            Err(terminal) => return terminal,
        };

        if first_seen.is_none() {
            first_seen = Some(SystemTime::now());
        }

        match last {
            Some(prev) if prev == current => {
                unchanged_checks += 1;
                trace!(?path, unchanged_checks, "stability check unchanged");
            }
            _ => {
                unchanged_checks = 1;
                trace!(?path, "stability counter reset: size or mtime changed");
            }
        }
        last = Some(current);

        let age_ok = first_seen
            .and_then(|t| SystemTime::now().duration_since(t).ok())
            .is_some_and(|age| age >= config.minimum_file_age);

        if unchanged_checks >= config.max_checks && age_ok {
            debug!(?path, size = current.0, "file judged stable");
            return Stability::Stable { size: current.0 };
        }

        tokio::time::sleep(config.check_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config(max_checks: u32) -> StabilityConfig {
        config_with_interval(max_checks, Duration::from_millis(5))
    }

    fn config_with_interval(max_checks: u32, check_interval: Duration) -> StabilityConfig {
        StabilityConfig {
            minimum_file_age: Duration::from_millis(0),
            check_interval,
            max_checks,
        }
    }

    #[tokio::test]
    async fn stable_file_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.svs");
        std::fs::write(&path, b"hello").unwrap();

        let result = watch_until_stable(&path, config(3)).await;
        assert_eq!(result, Stability::Stable { size: 5 });
    }

    #[tokio::test]
    async fn missing_file_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.svs");
        let result = watch_until_stable(&path, config(3)).await;
        assert_eq!(result, Stability::Gone);
    }

    #[tokio::test]
    async fn growing_file_resets_the_counter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.svs");
        std::fs::write(&path, b"a").unwrap();

        // With a 20ms check_interval and max_checks=3, three unchanged
        // checks in a row take ~40-60ms. Mutate at 30ms — inside that
        // window, after at least one unchanged check has already landed —
        // so the detector's counter must actually reset rather than
        // reaching `max_checks` on size/mtime it never re-observed.
        let path_clone = path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(&path_clone)
                .unwrap();
            f.write_all(b"bb").unwrap();
        });

        let result = watch_until_stable(&path, config_with_interval(3, Duration::from_millis(20))).await;
        writer.await.unwrap();
        assert_eq!(result, Stability::Stable { size: 3 });
    }
}
