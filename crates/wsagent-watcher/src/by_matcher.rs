use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use walkdir::WalkDir;

use crate::callbacks::{invoke, isolate, Callbacks, SubscriptionId};
use crate::error::{Result, WatcherError};
use crate::matcher::{ExcludeSet, PathMatcher};
use crate::service::FileWatcherService;
use crate::WatchOperation;

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    matcher: Arc<dyn PathMatcher>,
    callbacks: Callbacks,
}

/// Predicate-based subscriptions.
///
/// While at least one subscription is live, every non-excluded directory under the root is
/// registered with the service on behalf of this registry, and the set is kept current as
/// directories are created and deleted.
///
/// Lock order: `tree` before `subscriptions`.
pub struct FileWatcherByPathMatcher {
    root: PathBuf,
    service: Arc<FileWatcherService>,
    excludes: Arc<ExcludeSet>,
    subscriptions: RwLock<Vec<Subscription>>,
    tree: Mutex<BTreeSet<PathBuf>>,
}

impl std::fmt::Debug for FileWatcherByPathMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcherByPathMatcher")
            .field("root", &self.root)
            .field("subscriptions", &self.len())
            .finish_non_exhaustive()
    }
}

impl FileWatcherByPathMatcher {
    pub fn new(root: PathBuf, service: Arc<FileWatcherService>, excludes: Arc<ExcludeSet>) -> Self {
        Self {
            root,
            service,
            excludes,
            subscriptions: RwLock::new(Vec::new()),
            tree: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn watch(
        &self,
        matcher: impl PathMatcher + 'static,
        callbacks: Callbacks,
    ) -> Result<SubscriptionId> {
        let mut tree = self.tree.lock();
        if self.subscriptions.read().is_empty() {
            self.cover(&mut tree, &self.root)?;
        }

        let id = SubscriptionId::next();
        self.subscriptions.write().push(Subscription {
            id,
            matcher: Arc::new(matcher),
            callbacks,
        });
        tracing::debug!(
            target: "wsagent.watcher",
            id = id.0,
            directories = tree.len(),
            "matcher subscription added"
        );
        Ok(id)
    }

    /// Removes the subscription `id`. Unknown ids are a no-op.
    ///
    /// Removing the last subscription releases every directory registered for the tree; the
    /// first release failure is returned after all releases were attempted.
    pub fn unwatch(&self, id: SubscriptionId) -> Result<()> {
        let mut tree = self.tree.lock();
        let now_empty = {
            let mut subscriptions = self.subscriptions.write();
            let Some(index) = subscriptions.iter().position(|s| s.id == id) else {
                return Ok(());
            };
            subscriptions.remove(index);
            subscriptions.is_empty()
        };
        tracing::debug!(target: "wsagent.watcher", id = id.0, "matcher subscription removed");

        if !now_empty {
            return Ok(());
        }
        let dirs = std::mem::take(&mut *tree);
        self.release(dirs)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Directories currently registered on behalf of this registry.
    pub fn covered_directories(&self) -> Vec<PathBuf> {
        self.tree.lock().iter().cloned().collect()
    }

    /// Evaluates every live matcher against `normal` and invokes the `op` consumer of each match.
    ///
    /// Coverage is not touched here; see [`track`](Self::track).
    pub fn dispatch(&self, normal: &Path, internal: &str, op: WatchOperation) {
        let snapshot: Vec<Subscription> = self.subscriptions.read().clone();
        for subscription in &snapshot {
            let matched = isolate(subscription.id, internal, || {
                subscription.matcher.matches(normal)
            })
            .unwrap_or(false);
            if matched {
                invoke(subscription.id, &subscription.callbacks, op, internal);
            }
        }
    }

    /// Keeps the covered directories in step with a structural change under the root.
    ///
    /// Runs for every change the service drains, whether or not delivery is suspended. A created
    /// directory is walked even when it is already covered, so directories that appeared below it
    /// in the meantime are picked up.
    pub fn track(&self, normal: &Path, op: WatchOperation) {
        match op {
            WatchOperation::Create => {
                if !normal.is_dir() {
                    return;
                }
                let mut tree = self.tree.lock();
                if self.subscriptions.read().is_empty() {
                    return;
                }
                if let Err(err) = self.cover(&mut tree, normal) {
                    tracing::warn!(
                        target: "wsagent.watcher",
                        path = %normal.display(),
                        error = %err,
                        "failed to watch created directory"
                    );
                }
            }
            WatchOperation::Delete => {
                let mut tree = self.tree.lock();
                if !tree.contains(normal) {
                    return;
                }
                // Descendants sort directly after their ancestor.
                let doomed: Vec<PathBuf> = tree
                    .range(normal.to_path_buf()..)
                    .take_while(|dir| dir.starts_with(normal))
                    .cloned()
                    .collect();
                for dir in &doomed {
                    tree.remove(dir);
                }
                if let Err(err) = self.release(doomed) {
                    tracing::warn!(
                        target: "wsagent.watcher",
                        path = %normal.display(),
                        error = %err,
                        "failed to release deleted directory"
                    );
                }
            }
            WatchOperation::Modify => {}
        }
    }

    /// Registers `start` and every non-excluded directory below it that is not yet covered.
    ///
    /// Failing to register `start` itself is an error; failures below it are logged and skipped
    /// since those directories may vanish during the walk.
    fn cover(&self, tree: &mut BTreeSet<PathBuf>, start: &Path) -> Result<()> {
        if self.excludes.is_excluded(start) {
            return Ok(());
        }

        let walker = WalkDir::new(start)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                entry.file_type().is_dir() && !self.excludes.is_excluded(entry.path())
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    if err.depth() == 0 {
                        let source = err
                            .into_io_error()
                            .unwrap_or_else(|| std::io::Error::other("walk failed"));
                        return Err(WatcherError::Register {
                            path: start.to_path_buf(),
                            source,
                        });
                    }
                    tracing::debug!(target: "wsagent.watcher", error = %err, "skipping unreadable entry");
                    continue;
                }
            };

            let dir = entry.path();
            if tree.contains(dir) {
                continue;
            }
            match self.service.register(dir) {
                Ok(()) => {
                    tree.insert(dir.to_path_buf());
                }
                Err(err) if entry.depth() == 0 => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        target: "wsagent.watcher",
                        path = %dir.display(),
                        error = %err,
                        "skipping directory that could not be watched"
                    );
                }
            }
        }
        Ok(())
    }

    fn release(&self, dirs: impl IntoIterator<Item = PathBuf>) -> Result<()> {
        let mut first_error = None;
        for dir in dirs {
            if let Err(err) = self.service.unregister(&dir) {
                tracing::warn!(
                    target: "wsagent.watcher",
                    path = %dir.display(),
                    error = %err,
                    "failed to release directory"
                );
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
