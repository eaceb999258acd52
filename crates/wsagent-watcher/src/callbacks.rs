use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use wsagent_vfs::FileChangeKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchOperation {
    Create,
    Modify,
    Delete,
}

impl fmt::Display for WatchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WatchOperation::Create => "CREATE",
            WatchOperation::Modify => "MODIFY",
            WatchOperation::Delete => "DELETE",
        })
    }
}

impl From<FileChangeKind> for WatchOperation {
    fn from(kind: FileChangeKind) -> Self {
        match kind {
            FileChangeKind::Created => WatchOperation::Create,
            FileChangeKind::Modified => WatchOperation::Modify,
            FileChangeKind::Deleted => WatchOperation::Delete,
        }
    }
}

/// Identifies one subscription in either registry.
///
/// Ids come from a single process-wide counter and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

impl SubscriptionId {
    pub(crate) fn next() -> Self {
        SubscriptionId(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type PathCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// The create/modify/delete consumers of one subscription. Absent consumers are no-ops.
#[derive(Clone, Default)]
pub struct Callbacks {
    on_create: Option<PathCallback>,
    on_modify: Option<PathCallback>,
    on_delete: Option<PathCallback>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_create", &self.on_create.is_some())
            .field("on_modify", &self.on_modify.is_some())
            .field("on_delete", &self.on_delete.is_some())
            .finish()
    }
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_create(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_create = Some(Arc::new(f));
        self
    }

    pub fn on_modify(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_modify = Some(Arc::new(f));
        self
    }

    pub fn on_delete(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_delete = Some(Arc::new(f));
        self
    }

    pub fn get(&self, op: WatchOperation) -> Option<&PathCallback> {
        match op {
            WatchOperation::Create => self.on_create.as_ref(),
            WatchOperation::Modify => self.on_modify.as_ref(),
            WatchOperation::Delete => self.on_delete.as_ref(),
        }
    }
}

pub(crate) fn panic_payload_to_string(payload: &(dyn Any + Send)) -> Option<String> {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return Some((*message).to_string());
    }
    payload.downcast_ref::<String>().cloned()
}

/// Runs `f`, logging instead of propagating a panic. Returns `None` if `f` panicked.
pub(crate) fn isolate<R>(id: SubscriptionId, internal: &str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            let message = panic_payload_to_string(payload.as_ref());
            tracing::error!(
                target: "wsagent.watcher",
                id = id.0,
                path = internal,
                panic = message.as_deref().unwrap_or("<non-string panic>"),
                "watch callback panicked; continuing with remaining subscriptions"
            );
            None
        }
    }
}

/// Invokes the consumer for `op` (if any) under panic isolation.
pub(crate) fn invoke(id: SubscriptionId, callbacks: &Callbacks, op: WatchOperation, internal: &str) {
    if let Some(callback) = callbacks.get(op) {
        isolate(id, internal, || callback(internal));
    }
}
