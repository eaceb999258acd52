use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::callbacks::{invoke, Callbacks, SubscriptionId};
use crate::error::Result;
use crate::service::FileWatcherService;
use crate::WatchOperation;

struct Subscription {
    path: PathBuf,
    // Directory registered with the service on behalf of this subscription.
    dir: PathBuf,
    callbacks: Callbacks,
}

#[derive(Default)]
struct State {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    // Ids per path, in registration order.
    by_path: HashMap<PathBuf, Vec<SubscriptionId>>,
}

/// Exact-path subscriptions keyed by normal path.
pub struct FileWatcherByPathValue {
    service: Arc<FileWatcherService>,
    state: RwLock<State>,
}

impl std::fmt::Debug for FileWatcherByPathValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcherByPathValue")
            .field("subscriptions", &self.len())
            .finish_non_exhaustive()
    }
}

/// The directory whose native watch reports changes to `path`.
fn watched_dir_for(path: &Path) -> PathBuf {
    if path.is_dir() {
        return path.to_path_buf();
    }
    path.parent().unwrap_or(path).to_path_buf()
}

impl FileWatcherByPathValue {
    pub fn new(service: Arc<FileWatcherService>) -> Self {
        Self {
            service,
            state: RwLock::new(State::default()),
        }
    }

    /// Subscribes to changes of exactly `path`.
    ///
    /// The directory observing `path` is registered with the service first; a failed registration
    /// leaves no subscription behind.
    pub fn watch(&self, path: &Path, callbacks: Callbacks) -> Result<SubscriptionId> {
        let dir = watched_dir_for(path);
        self.service.register(&dir)?;

        let id = SubscriptionId::next();
        let mut state = self.state.write();
        state
            .by_path
            .entry(path.to_path_buf())
            .or_default()
            .push(id);
        state.subscriptions.insert(
            id,
            Subscription {
                path: path.to_path_buf(),
                dir,
                callbacks,
            },
        );
        tracing::debug!(
            target: "wsagent.watcher",
            id = id.0,
            path = %path.display(),
            "path subscription added"
        );
        Ok(id)
    }

    /// Removes exactly the subscription `id`. Unknown ids are a no-op.
    pub fn unwatch(&self, id: SubscriptionId) -> Result<()> {
        let removed = {
            let mut state = self.state.write();
            let Some(subscription) = state.subscriptions.remove(&id) else {
                return Ok(());
            };
            if let Some(ids) = state.by_path.get_mut(&subscription.path) {
                ids.retain(|candidate| *candidate != id);
                if ids.is_empty() {
                    state.by_path.remove(&subscription.path);
                }
            }
            subscription
        };

        tracing::debug!(
            target: "wsagent.watcher",
            id = id.0,
            path = %removed.path.display(),
            "path subscription removed"
        );
        self.service.unregister(&removed.dir)
    }

    pub fn len(&self) -> usize {
        self.state.read().subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes the `op` consumer of every subscription on `normal`, in registration order.
    pub fn dispatch(&self, normal: &Path, internal: &str, op: WatchOperation) {
        let targets: Vec<(SubscriptionId, Callbacks)> = {
            let state = self.state.read();
            let Some(ids) = state.by_path.get(normal) else {
                return;
            };
            ids.iter()
                .filter_map(|id| {
                    state
                        .subscriptions
                        .get(id)
                        .map(|subscription| (*id, subscription.callbacks.clone()))
                })
                .collect()
        };

        for (id, callbacks) in &targets {
            invoke(*id, callbacks, op, internal);
        }
    }
}
