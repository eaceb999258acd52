use std::path::{Path, PathBuf};
use std::sync::Arc;

use wsagent_config::WatcherConfig;
use wsagent_vfs::FileWatcher;

use crate::by_matcher::FileWatcherByPathMatcher;
use crate::by_path::FileWatcherByPathValue;
use crate::callbacks::{Callbacks, SubscriptionId};
use crate::error::Result;
use crate::matcher::{ExcludeId, ExcludeSet, GlobMatcher, PathMatcher};
use crate::path::{to_internal_path, to_normal_path, validate_internal_path};
use crate::service::{DeliveryState, EventHandler, FileWatcherService, StopPolicy};

/// Public entry point: one watched root, two subscription registries and the service that feeds
/// them.
///
/// Consumers address files by internal path (`/src/Foo.java`) and receive internal paths in
/// their callbacks. Dropping the manager stops the consumption loop.
pub struct FileWatcherManager {
    root: PathBuf,
    service: Arc<FileWatcherService>,
    by_path: Arc<FileWatcherByPathValue>,
    by_matcher: Arc<FileWatcherByPathMatcher>,
    excludes: Arc<ExcludeSet>,
    tracker: EventHandler,
    handler: EventHandler,
    stop_policy: StopPolicy,
}

impl std::fmt::Debug for FileWatcherManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcherManager")
            .field("root", &self.root)
            .field("service", &self.service)
            .field("by_path", &self.by_path)
            .field("by_matcher", &self.by_matcher)
            .finish_non_exhaustive()
    }
}

fn canonical_root(root: &Path) -> PathBuf {
    // OS watchers report resolved paths (e.g. `/private/var/...` on macOS).
    root.canonicalize()
        .unwrap_or_else(|_| wsagent_vfs::normalize_local_path(root))
}

fn dispatch_handler(
    root: PathBuf,
    by_path: Arc<FileWatcherByPathValue>,
    by_matcher: Arc<FileWatcherByPathMatcher>,
) -> EventHandler {
    Arc::new(move |normal: &Path, op| {
        let internal = match to_internal_path(&root, normal) {
            Ok(internal) => internal,
            Err(err) => {
                tracing::debug!(target: "wsagent.watcher", error = %err, "skipping event without an internal path");
                return;
            }
        };
        by_path.dispatch(normal, &internal, op);
        by_matcher.dispatch(normal, &internal, op);
    })
}

fn coverage_tracker(by_matcher: Arc<FileWatcherByPathMatcher>) -> EventHandler {
    Arc::new(move |normal: &Path, op| by_matcher.track(normal, op))
}

impl FileWatcherManager {
    /// Builds the manager over `watcher` and starts the consumption loop.
    pub fn new(
        root: impl AsRef<Path>,
        watcher: impl FileWatcher + 'static,
        config: &WatcherConfig,
    ) -> Result<Self> {
        let root = canonical_root(root.as_ref());

        let excludes = Arc::new(ExcludeSet::new());
        let patterns: Vec<&str> = config
            .watcher
            .excludes
            .iter()
            .map(|pattern| pattern.trim())
            .filter(|pattern| !pattern.is_empty())
            .collect();
        if !patterns.is_empty() {
            excludes.add(GlobMatcher::new(&patterns)?);
        }

        let service = Arc::new(FileWatcherService::new(watcher, Arc::clone(&excludes)));
        let by_path = Arc::new(FileWatcherByPathValue::new(Arc::clone(&service)));
        let by_matcher = Arc::new(FileWatcherByPathMatcher::new(
            root.clone(),
            Arc::clone(&service),
            Arc::clone(&excludes),
        ));
        let handler = dispatch_handler(root.clone(), Arc::clone(&by_path), Arc::clone(&by_matcher));
        let tracker = coverage_tracker(Arc::clone(&by_matcher));

        service.start_with_tracker(Arc::clone(&tracker), Arc::clone(&handler))?;
        tracing::info!(target: "wsagent.watcher", root = %root.display(), "file watcher manager ready");

        Ok(Self {
            root,
            service,
            by_path,
            by_matcher,
            excludes,
            tracker,
            handler,
            stop_policy: StopPolicy::from(&config.watcher),
        })
    }

    /// Builds the manager over the OS watcher.
    #[cfg(feature = "watch-notify")]
    pub fn with_notify(root: impl AsRef<Path>, config: &WatcherConfig) -> Result<Self> {
        let watcher =
            wsagent_vfs::NotifyFileWatcher::with_events_capacity(config.watcher.events_queue_capacity)
                .map_err(crate::error::WatcherError::Backend)?;
        Self::new(root, watcher, config)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn register_by_path(&self, internal: &str, callbacks: Callbacks) -> Result<SubscriptionId> {
        validate_internal_path(internal)?;
        let normal = to_normal_path(&self.root, internal);
        self.by_path.watch(&normal, callbacks)
    }

    pub fn unregister_by_path(&self, id: SubscriptionId) -> Result<()> {
        self.by_path.unwatch(id)
    }

    /// Subscribes `callbacks` to every path (absolute, under the root) that `matcher` accepts.
    pub fn register_by_matcher(
        &self,
        matcher: impl PathMatcher + 'static,
        callbacks: Callbacks,
    ) -> Result<SubscriptionId> {
        self.by_matcher.watch(matcher, callbacks)
    }

    pub fn unregister_by_matcher(&self, id: SubscriptionId) -> Result<()> {
        self.by_matcher.unwatch(id)
    }

    pub fn suspend(&self) {
        self.service.suspend();
    }

    pub fn resume(&self) {
        self.service.resume();
    }

    pub fn delivery_state(&self) -> DeliveryState {
        self.service.delivery_state()
    }

    /// Drops events (and skips directories during tree walks) whose normal path `matcher` accepts.
    pub fn add_exclude_matcher(&self, matcher: impl PathMatcher + 'static) -> ExcludeId {
        self.excludes.add(matcher)
    }

    /// Returns `false` for unknown ids.
    pub fn remove_exclude_matcher(&self, id: ExcludeId) -> bool {
        self.excludes.remove(id)
    }

    /// Restarts the consumption loop after [`stop`](Self::stop). Subscriptions are kept.
    pub fn start(&self) -> Result<()> {
        self.service
            .start_with_tracker(Arc::clone(&self.tracker), Arc::clone(&self.handler))
    }

    pub fn stop(&self) {
        self.service.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.service.is_stopped()
    }

    /// Polls for the loop to finish using the configured stop policy.
    pub fn wait_until_stopped(&self) -> bool {
        self.service.wait_until_stopped(self.stop_policy)
    }

    pub fn events_drained(&self) -> u64 {
        self.service.events_drained()
    }

    pub fn watched_directories(&self) -> Vec<(PathBuf, usize)> {
        self.service.watched_directories()
    }
}

impl Drop for FileWatcherManager {
    fn drop(&mut self) {
        self.service.stop();
    }
}
