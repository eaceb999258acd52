//! Native directory registration and the event consumption loop.
//!
//! [`FileWatcherService`] wraps a [`FileWatcher`] backend with:
//!
//! - reference-counted directory registration (N `register` calls need N `unregister` calls
//!   before the native watch is removed),
//! - a single consumption thread that drains the backend and forwards every `(path, operation)`
//!   pair to one handler,
//! - suspend/resume of delivery, which never touches the registrations,
//! - re-arming of native watches: a deleted directory keeps its references but loses its native
//!   watch, which is created again when the directory reappears or is registered again.
//!
//! The directory table and the backend share one mutex so deciding to create or destroy a native
//! watch and doing it are a single step.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel as channel;
use parking_lot::Mutex;
use wsagent_config::WatchSettings;
use wsagent_vfs::{FileChange, FileChangeKind, FileWatcher, WatchEvent, WatchMessage};

use crate::callbacks::{panic_payload_to_string, WatchOperation};
use crate::error::{Result, WatcherError};
use crate::matcher::ExcludeSet;

/// Receives every delivered event as `(normal path, operation)`.
pub type EventHandler = Arc<dyn Fn(&Path, WatchOperation) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Running,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    NotStarted = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LoopState::NotStarted,
            1 => LoopState::Running,
            2 => LoopState::Stopping,
            _ => LoopState::Stopped,
        }
    }
}

/// Bounded polling used by [`FileWatcherService::wait_until_stopped`].
///
/// The n-th check (1-based) is preceded by a sleep of `n * interval`, saturating at
/// [`Duration::MAX`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self::from(&WatchSettings::default())
    }
}

impl From<&WatchSettings> for StopPolicy {
    fn from(settings: &WatchSettings) -> Self {
        Self {
            attempts: settings.stop_poll_attempts,
            interval: settings.stop_poll_interval(),
        }
    }
}

impl StopPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.interval.saturating_mul(attempt)
    }
}

#[derive(Debug)]
struct WatchedDir {
    references: usize,
    // False once the directory was deleted; the OS dropped its native watch.
    attached: bool,
}

struct Registry {
    watcher: Box<dyn FileWatcher>,
    directories: HashMap<PathBuf, WatchedDir>,
}

impl Registry {
    fn detach(&mut self, dir: &Path) {
        let Some(entry) = self.directories.get_mut(dir) else {
            return;
        };
        if !entry.attached {
            return;
        }
        entry.attached = false;
        if let Err(err) = self.watcher.unwatch_path(dir) {
            tracing::debug!(
                target: "wsagent.watcher",
                path = %dir.display(),
                error = %err,
                "stale native watch could not be removed"
            );
        }
        tracing::debug!(
            target: "wsagent.watcher",
            path = %dir.display(),
            references = entry.references,
            "watched directory deleted; native watch detached"
        );
    }

    fn reattach(&mut self, dir: &Path) {
        let Some(entry) = self.directories.get_mut(dir) else {
            return;
        };
        if entry.attached || !dir.is_dir() {
            return;
        }
        match self.watcher.watch_path(dir) {
            Ok(()) => {
                entry.attached = true;
                tracing::debug!(
                    target: "wsagent.watcher",
                    path = %dir.display(),
                    "watched directory recreated; native watch restored"
                );
            }
            Err(err) => tracing::warn!(
                target: "wsagent.watcher",
                path = %dir.display(),
                error = %err,
                "failed to restore native watch for recreated directory"
            ),
        }
    }
}

struct Shared {
    registry: Mutex<Registry>,
    suspended: AtomicBool,
    state: AtomicU8,
    drained: AtomicU64,
    excludes: Arc<ExcludeSet>,
}

impl Shared {
    fn loop_state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_loop_state(&self, state: LoopState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

#[derive(Clone)]
struct LoopHandlers {
    tracker: Option<EventHandler>,
    handler: EventHandler,
}

struct LoopControl {
    stop_tx: channel::Sender<()>,
    thread: JoinHandle<()>,
}

pub struct FileWatcherService {
    shared: Arc<Shared>,
    events: channel::Receiver<WatchMessage>,
    control: Mutex<Option<LoopControl>>,
}

impl std::fmt::Debug for FileWatcherService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcherService")
            .field("loop_state", &self.loop_state())
            .field("delivery_state", &self.delivery_state())
            .field("directories", &self.shared.registry.lock().directories.len())
            .finish_non_exhaustive()
    }
}

impl FileWatcherService {
    pub fn new(watcher: impl FileWatcher + 'static, excludes: Arc<ExcludeSet>) -> Self {
        let events = watcher.receiver().clone();
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry {
                    watcher: Box::new(watcher),
                    directories: HashMap::new(),
                }),
                suspended: AtomicBool::new(false),
                state: AtomicU8::new(LoopState::NotStarted as u8),
                drained: AtomicU64::new(0),
                excludes,
            }),
            events,
            control: Mutex::new(None),
        }
    }

    /// Starts the consumption loop, delivering events to `handler`.
    ///
    /// A no-op while a loop is running or stopping. After the loop stopped, this starts a new one;
    /// registrations survive the restart.
    pub fn start(&self, handler: EventHandler) -> Result<()> {
        self.spawn_loop(LoopHandlers {
            tracker: None,
            handler,
        })
    }

    /// Like [`start`](Self::start), with a `tracker` that sees every non-excluded change before
    /// `handler`, including changes drained while delivery is suspended.
    ///
    /// Registries use it to keep their directory coverage in step with the tree.
    pub fn start_with_tracker(&self, tracker: EventHandler, handler: EventHandler) -> Result<()> {
        self.spawn_loop(LoopHandlers {
            tracker: Some(tracker),
            handler,
        })
    }

    fn spawn_loop(&self, handlers: LoopHandlers) -> Result<()> {
        let mut control = self.control.lock();
        if matches!(
            self.shared.loop_state(),
            LoopState::Running | LoopState::Stopping
        ) {
            return Ok(());
        }

        if let Some(previous) = control.take() {
            if previous.thread.join().is_err() {
                tracing::debug!(
                    target: "wsagent.watcher",
                    "previous consumption loop panicked (best effort join)"
                );
            }
        }

        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let events = self.events.clone();

        self.shared.set_loop_state(LoopState::Running);
        let thread = thread::Builder::new()
            .name("wsagent-file-watcher".to_string())
            .spawn(move || run_consumption_loop(shared, events, stop_rx, handlers))
            .map_err(|err| {
                self.shared.set_loop_state(LoopState::Stopped);
                WatcherError::Spawn(err)
            })?;

        *control = Some(LoopControl { stop_tx, thread });
        tracing::info!(target: "wsagent.watcher", "file watcher started");
        Ok(())
    }

    /// Signals the loop to terminate without waiting for it.
    ///
    /// Use [`is_stopped`](Self::is_stopped) or [`wait_until_stopped`](Self::wait_until_stopped) to
    /// observe completion.
    pub fn stop(&self) {
        let control = self.control.lock();
        let transitioned = self
            .shared
            .state
            .compare_exchange(
                LoopState::Running as u8,
                LoopState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !transitioned {
            if self.shared.loop_state() == LoopState::NotStarted {
                self.shared.set_loop_state(LoopState::Stopped);
            }
            return;
        }

        if let Some(control) = control.as_ref() {
            // Capacity 1: a pending stop signal is as good as a new one.
            let _ = control.stop_tx.try_send(());
        }
        tracing::info!(target: "wsagent.watcher", "file watcher stopping");
    }

    pub fn loop_state(&self) -> LoopState {
        self.shared.loop_state()
    }

    /// `true` when no consumption loop is running.
    pub fn is_stopped(&self) -> bool {
        matches!(
            self.shared.loop_state(),
            LoopState::Stopped | LoopState::NotStarted
        )
    }

    /// Polls [`is_stopped`](Self::is_stopped) with linear backoff; returns the final answer.
    pub fn wait_until_stopped(&self, policy: StopPolicy) -> bool {
        for attempt in 1..=policy.attempts {
            if self.is_stopped() {
                return true;
            }
            thread::sleep(policy.backoff(attempt));
        }
        self.is_stopped()
    }

    /// Adds one reference to `dir`, creating the native watch for the first one.
    ///
    /// A directory whose native watch was lost to a deletion is watched again; if that fails the
    /// reference is not added.
    pub fn register(&self, dir: &Path) -> Result<()> {
        let mut guard = self.shared.registry.lock();
        let registry = &mut *guard;
        if let Some(entry) = registry.directories.get_mut(dir) {
            if !entry.attached {
                registry
                    .watcher
                    .watch_path(dir)
                    .map_err(|source| WatcherError::Register {
                        path: dir.to_path_buf(),
                        source,
                    })?;
                entry.attached = true;
            }
            entry.references += 1;
            tracing::debug!(
                target: "wsagent.watcher",
                path = %dir.display(),
                references = entry.references,
                "directory already watched"
            );
            return Ok(());
        }

        registry
            .watcher
            .watch_path(dir)
            .map_err(|source| WatcherError::Register {
                path: dir.to_path_buf(),
                source,
            })?;
        registry.directories.insert(
            dir.to_path_buf(),
            WatchedDir {
                references: 1,
                attached: true,
            },
        );
        tracing::debug!(target: "wsagent.watcher", path = %dir.display(), "directory watch registered");
        Ok(())
    }

    /// Drops one reference to `dir`; the last one removes the native watch.
    ///
    /// Unknown directories are a no-op.
    pub fn unregister(&self, dir: &Path) -> Result<()> {
        let mut guard = self.shared.registry.lock();
        let registry = &mut *guard;
        let Some(entry) = registry.directories.get_mut(dir) else {
            return Ok(());
        };
        entry.references -= 1;
        if entry.references > 0 {
            tracing::debug!(
                target: "wsagent.watcher",
                path = %dir.display(),
                references = entry.references,
                "directory reference released"
            );
            return Ok(());
        }

        let attached = entry.attached;
        registry.directories.remove(dir);
        if !attached {
            tracing::debug!(target: "wsagent.watcher", path = %dir.display(), "detached directory released");
            return Ok(());
        }
        registry
            .watcher
            .unwatch_path(dir)
            .map_err(|source| WatcherError::Unregister {
                path: dir.to_path_buf(),
                source,
            })?;
        tracing::debug!(target: "wsagent.watcher", path = %dir.display(), "directory watch removed");
        Ok(())
    }

    /// Pauses delivery. Events drained while suspended are discarded.
    pub fn suspend(&self) {
        if !self.shared.suspended.swap(true, Ordering::AcqRel) {
            tracing::info!(target: "wsagent.watcher", "file watcher suspended");
        }
    }

    pub fn resume(&self) {
        if self.shared.suspended.swap(false, Ordering::AcqRel) {
            tracing::info!(target: "wsagent.watcher", "file watcher resumed");
        }
    }

    pub fn delivery_state(&self) -> DeliveryState {
        if self.shared.suspended.load(Ordering::Acquire) {
            DeliveryState::Suspended
        } else {
            DeliveryState::Running
        }
    }

    /// Number of backend messages the loop has fully processed (suspended ones included).
    pub fn events_drained(&self) -> u64 {
        self.shared.drained.load(Ordering::Acquire)
    }

    /// Snapshot of the directory table, sorted by path.
    pub fn watched_directories(&self) -> Vec<(PathBuf, usize)> {
        let mut out: Vec<_> = self
            .shared
            .registry
            .lock()
            .directories
            .iter()
            .map(|(path, entry)| (path.clone(), entry.references))
            .collect();
        out.sort();
        out
    }

    pub fn reference_count(&self, dir: &Path) -> usize {
        self.shared
            .registry
            .lock()
            .directories
            .get(dir)
            .map_or(0, |entry| entry.references)
    }

    /// `true` when `dir` is registered and its native watch is live.
    pub fn is_watching(&self, dir: &Path) -> bool {
        self.shared
            .registry
            .lock()
            .directories
            .get(dir)
            .is_some_and(|entry| entry.attached)
    }
}

impl Drop for FileWatcherService {
    fn drop(&mut self) {
        self.stop();
        if let Some(control) = self.control.get_mut().take() {
            // The loop thread can hold the last reference to the service through its handler.
            if control.thread.thread().id() != thread::current().id() {
                let _ = control.thread.join();
            }
        }
    }
}

fn run_consumption_loop(
    shared: Arc<Shared>,
    events: channel::Receiver<WatchMessage>,
    stop_rx: channel::Receiver<()>,
    handlers: LoopHandlers,
) {
    loop {
        channel::select! {
            recv(stop_rx) -> _ => break,
            recv(events) -> msg => {
                let Ok(msg) = msg else {
                    tracing::error!(
                        target: "wsagent.watcher",
                        "native event source disconnected; file watcher stopped"
                    );
                    break;
                };
                deliver(&shared, &handlers, msg);
                shared.drained.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
    shared.set_loop_state(LoopState::Stopped);
    tracing::info!(target: "wsagent.watcher", "file watcher stopped");
}

fn deliver(shared: &Shared, handlers: &LoopHandlers, msg: WatchMessage) {
    let changes = match msg {
        Ok(WatchEvent::Changes { changes }) => changes,
        Ok(WatchEvent::Rescan) => {
            tracing::warn!(
                target: "wsagent.watcher",
                "native watcher dropped events; some changes were not delivered"
            );
            return;
        }
        Err(err) => {
            tracing::warn!(
                target: "wsagent.watcher",
                error = %err,
                "native watcher reported an error"
            );
            return;
        }
    };

    for change in changes {
        sync_native_watch(shared, &change);
        if shared.excludes.is_excluded(&change.path) {
            tracing::trace!(target: "wsagent.watcher", path = %change.path.display(), "event excluded");
            continue;
        }

        let op = WatchOperation::from(change.kind);
        if let Some(tracker) = &handlers.tracker {
            run_isolated(tracker, &change.path, op, "directory tracker panicked");
        }
        // Checked per change so a suspend takes effect mid-batch.
        if shared.suspended.load(Ordering::Acquire) {
            continue;
        }
        tracing::trace!(
            target: "wsagent.watcher",
            path = %change.path.display(),
            operation = %op,
            "delivering event"
        );
        run_isolated(&handlers.handler, &change.path, op, "event handler panicked");
    }
}

/// Keeps the native watch of a registered directory in step with its existence.
fn sync_native_watch(shared: &Shared, change: &FileChange) {
    match change.kind {
        FileChangeKind::Deleted => shared.registry.lock().detach(&change.path),
        FileChangeKind::Created => shared.registry.lock().reattach(&change.path),
        FileChangeKind::Modified => {}
    }
}

fn run_isolated(f: &EventHandler, path: &Path, op: WatchOperation, what: &'static str) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(path, op))) {
        let message = panic_payload_to_string(payload.as_ref());
        tracing::error!(
            target: "wsagent.watcher",
            path = %path.display(),
            panic = message.as_deref().unwrap_or("<non-string panic>"),
            "{what}"
        );
    }
}
