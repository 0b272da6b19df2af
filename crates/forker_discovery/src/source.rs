//! The Discovery Source (C3, §4.3): a hybrid filesystem watcher + periodic
//! rescan that surfaces candidate absolute paths, filtered and deduplicated.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use forker_protocol::ForkerError;

/// Filtering rules applied to every candidate path before it is emitted.
#[derive(Debug, Clone)]
pub struct DiscoveryFilter {
    /// Glob patterns (matched against the file name) that a path must match
    /// at least one of, e.g. `*.svs`.
    pub include_globs: Vec<glob::Pattern>,
    /// Extensions (without the leading dot, case-insensitive) that
    /// disqualify a path even if it matches an include glob.
    pub exclude_extensions: Vec<String>,
}

impl DiscoveryFilter {
    pub fn new(
        include_globs: &[String],
        exclude_extensions: &[String],
    ) -> Result<Self, ForkerError> {
        let include_globs = include_globs
            .iter()
            .map(|raw| {
                glob::Pattern::new(raw).map_err(|e| ForkerError::Configuration {
                    key: "monitoring.fileFilters".into(),
                    reason: format!("invalid glob '{raw}': {e}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let exclude_extensions = exclude_extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        Ok(Self {
            include_globs,
            exclude_extensions,
        })
    }

    fn accepts(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if self
                .exclude_extensions
                .iter()
                .any(|excluded| excluded.eq_ignore_ascii_case(ext))
            {
                return false;
            }
        }
        if self.include_globs.is_empty() {
            return true;
        }
        self.include_globs.iter().any(|pattern| pattern.matches(name))
    }
}

/// Bounded recently-seen cache. Persistent "already processed" tracking is
/// C1's job (`list_by_source_path`); this only suppresses duplicate events
/// for the same path arriving in quick succession from the watcher and the
/// rescan within the same process lifetime.
struct SeenCache {
    order: VecDeque<PathBuf>,
    set: HashSet<PathBuf>,
    capacity: usize,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            set: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns true if `path` had not been seen before (and records it).
    fn insert(&mut self, path: PathBuf) -> bool {
        if !self.set.insert(path.clone()) {
            return false;
        }
        self.order.push_back(path);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

const DEFAULT_SEEN_CACHE_CAPACITY: usize = 10_000;

/// Watches `root` for new/modified files, supplemented by a full rescan
/// every `rescan_interval`. Emits every path accepted by `filter` and not
/// already present in the recently-seen cache onto `tx`.
pub struct DiscoverySource {
    root: PathBuf,
    filter: DiscoveryFilter,
    rescan_interval: Duration,
    seen: Mutex<SeenCache>,
}

impl DiscoverySource {
    pub fn new(root: impl Into<PathBuf>, filter: DiscoveryFilter, rescan_interval: Duration) -> Self {
        Self {
            root: root.into(),
            filter,
            rescan_interval,
            seen: Mutex::new(SeenCache::new(DEFAULT_SEEN_CACHE_CAPACITY)),
        }
    }

    fn offer(&self, path: PathBuf, tx: &mpsc::Sender<PathBuf>) {
        if !path.is_file() || !self.filter.accepts(&path) {
            return;
        }
        let is_new = self.seen.lock().expect("seen cache poisoned").insert(path.clone());
        if is_new {
            trace!(path = %path.display(), "discovery candidate emitted");
            let _ = tx.try_send(path);
        }
    }

    fn rescan(&self, tx: &mpsc::Sender<PathBuf>) {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "rescan failed to read source directory");
                return;
            }
        };
        for entry in entries.filter_map(|e| e.ok()) {
            self.offer(entry.path(), tx);
        }
    }

    /// Run the hybrid watch+rescan loop until `shutdown` resolves. Runs an
    /// initial rescan immediately so files already present at startup are
    /// not missed.
    pub async fn run(
        &self,
        tx: mpsc::Sender<PathBuf>,
        mut shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<(), ForkerError> {
        let (watch_tx, mut watch_rx) = mpsc::channel::<PathBuf>(256);
        let _watcher = self.start_watcher(watch_tx)?;

        self.rescan(&tx);
        let mut rescan_tick = tokio::time::interval(self.rescan_interval);
        rescan_tick.tick().await; // first tick fires immediately; already rescanned above

        loop {
            tokio::select! {
                Some(path) = watch_rx.recv() => {
                    self.offer(path, &tx);
                }
                _ = rescan_tick.tick() => {
                    debug!(root = %self.root.display(), "periodic rescan");
                    self.rescan(&tx);
                }
                _ = &mut shutdown => {
                    debug!("discovery source shutdown requested");
                    break;
                }
            }
        }
        Ok(())
    }

    fn start_watcher(&self, tx: mpsc::Sender<PathBuf>) -> Result<RecommendedWatcher, ForkerError> {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<NotifyEvent>| {
            let Ok(event) = res else { return };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                return;
            }
            for path in event.paths {
                let _ = tx.try_send(path);
            }
        })
        .map_err(|e| ForkerError::io(std::io::Error::other(e.to_string()), self.root.display().to_string()))?;

        watcher
            .watch(&self.root, RecursiveMode::NonRecursive)
            .map_err(|e| ForkerError::io(std::io::Error::other(e.to_string()), self.root.display().to_string()))?;

        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_honors_include_glob_and_exclude_extension() {
        let filter = DiscoveryFilter::new(&["*.svs".into()], &["tmp".into()]).unwrap();
        assert!(filter.accepts(Path::new("/data/input/slide.svs")));
        assert!(!filter.accepts(Path::new("/data/input/slide.tmp")));
        assert!(!filter.accepts(Path::new("/data/input/notes.txt")));
    }

    #[test]
    fn empty_include_globs_accepts_everything_not_excluded() {
        let filter = DiscoveryFilter::new(&[], &["tmp".into()]).unwrap();
        assert!(filter.accepts(Path::new("/data/input/anything.bin")));
        assert!(!filter.accepts(Path::new("/data/input/anything.tmp")));
    }

    #[test]
    fn seen_cache_deduplicates_and_evicts_oldest() {
        let mut cache = SeenCache::new(2);
        assert!(cache.insert(PathBuf::from("/a")));
        assert!(!cache.insert(PathBuf::from("/a")));
        assert!(cache.insert(PathBuf::from("/b")));
        assert!(cache.insert(PathBuf::from("/c")));
        // "/a" was evicted to make room for "/c"; re-offering it looks new again.
        assert!(cache.insert(PathBuf::from("/a")));
    }

    #[tokio::test]
    async fn rescan_emits_existing_files_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("slide.svs"), b"data").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"skip me").unwrap();

        let filter = DiscoveryFilter::new(&["*.svs".into()], &[]).unwrap();
        let source = DiscoverySource::new(dir.path(), filter, Duration::from_secs(3600));
        let (tx, mut rx) = mpsc::channel(8);
        source.rescan(&tx);
        drop(tx);

        let mut found = Vec::new();
        while let Some(path) = rx.recv().await {
            found.push(path);
        }
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].file_name().unwrap(), "slide.svs");

        // A second rescan offers the same file again but the cache suppresses it.
        let (tx2, mut rx2) = mpsc::channel(8);
        source.rescan(&tx2);
        drop(tx2);
        assert!(rx2.recv().await.is_none());
    }
}
