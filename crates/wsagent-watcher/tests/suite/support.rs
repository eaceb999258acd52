use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::TempDir;
use wsagent_config::WatcherConfig;
use wsagent_watcher::{
    Callbacks, FileChange, FileWatcherManager, ManualFileWatcher, ManualFileWatcherHandle,
    WatchOperation,
};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Collects every callback invocation as `(operation, internal path)`.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<(WatchOperation, String)>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callbacks(&self) -> Callbacks {
        let create = Arc::clone(&self.events);
        let modify = Arc::clone(&self.events);
        let delete = Arc::clone(&self.events);
        Callbacks::new()
            .on_create(move |path: &str| create.lock().push((WatchOperation::Create, path.to_owned())))
            .on_modify(move |path: &str| modify.lock().push((WatchOperation::Modify, path.to_owned())))
            .on_delete(move |path: &str| delete.lock().push((WatchOperation::Delete, path.to_owned())))
    }

    pub fn events(&self) -> Vec<(WatchOperation, String)> {
        self.events.lock().clone()
    }

    pub fn contains(&self, op: WatchOperation, path: &str) -> bool {
        self.events
            .lock()
            .iter()
            .any(|(seen_op, seen_path)| *seen_op == op && seen_path == path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.events.lock().iter().map(|(_, path)| path.clone()).collect()
    }
}

/// A manager over a [`ManualFileWatcher`] rooted in a scratch directory.
pub struct Harness {
    _tmp: TempDir,
    pub root: PathBuf,
    pub manager: FileWatcherManager,
    pub handle: ManualFileWatcherHandle,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(&WatcherConfig::default())
    }

    pub fn with_config(config: &WatcherConfig) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let watcher = ManualFileWatcher::new();
        let handle = watcher.handle();
        let manager = FileWatcherManager::new(&root, watcher, config).unwrap();
        Self {
            _tmp: tmp,
            root,
            manager,
            handle,
        }
    }

    pub fn abs(&self, internal: &str) -> PathBuf {
        self.root.join(internal.trim_start_matches('/'))
    }

    /// Injects one batch and waits until the loop has fully processed it.
    pub fn push(&self, changes: Vec<FileChange>) {
        let before = self.manager.events_drained();
        self.handle.push_changes(changes).unwrap();
        assert!(
            wait_until(TIMEOUT, || self.manager.events_drained() > before),
            "consumption loop did not process the batch"
        );
    }

    pub fn created(&self, internal: &str) -> FileChange {
        FileChange::created(self.abs(internal))
    }

    pub fn modified(&self, internal: &str) -> FileChange {
        FileChange::modified(self.abs(internal))
    }

    pub fn deleted(&self, internal: &str) -> FileChange {
        FileChange::deleted(self.abs(internal))
    }

    pub fn reference_count(&self, dir: &Path) -> usize {
        self.manager
            .watched_directories()
            .into_iter()
            .find(|(path, _)| path == dir)
            .map(|(_, count)| count)
            .unwrap_or(0)
    }
}
