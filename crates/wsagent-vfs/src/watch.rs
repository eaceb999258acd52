//! File watching.
//!
//! This module defines [`FileWatcher`], the native event source the workspace agent's watcher
//! service is built on.
//!
//! # Ownership / layering
//!
//! `wsagent-vfs` owns *all* operating-system integration for file watching. Higher layers (the
//! `wsagent-watcher` service and its registries) depend only on the [`FileWatcher`] trait and the
//! [`WatchEvent`] / [`crate::change::FileChange`] model.
//!
//! - The OS backend (a Notify-based implementation) lives behind the `watch-notify` feature so
//!   `notify` and its platform-specific dependencies stay out of the default build.
//! - Watches are **non-recursive**: registering a directory reports changes to the directory's
//!   direct children. Callers that need a whole tree register every directory themselves, which
//!   lets them reference-count directories individually.
//!
//! # Event delivery
//!
//! The OS watcher is push-based internally (a background thread invokes a callback when the OS
//! reports a change). The Notify callback only enqueues the raw event; a drain thread normalizes
//! it and forwards it on the stream returned by [`FileWatcher::receiver`] (`crossbeam_channel`).
//! Asynchronous errors are delivered on the same stream (see [`WatchMessage`]).
//!
//! # Semantics
//!
//! Backend events are normalized into three operations: **Created**, **Modified** and
//! **Deleted**. A rename is reported as a deletion of the old path followed by a creation of the
//! new one.
//!
//! Platform notes:
//!
//! - Some platforms additionally report the *parent directory* as modified when a child is created
//!   or removed. That event is surfaced as-is; suppressing it would also hide real directory
//!   metadata changes.
//! - The OS can legitimately coalesce or reorder events across directories.
//!
//! ## Backpressure / overflow (Notify backend)
//!
//! Both internal queues are bounded. If either overflows, the watcher drops events and emits
//! [`WatchEvent::Rescan`] so consumers know some changes were lost.
//!
//! Queue sizes can be tuned via environment variables:
//!
//! - `WSAGENT_WATCH_NOTIFY_RAW_QUEUE_CAPACITY` (notify callback → drain thread)
//! - `WSAGENT_WATCH_EVENTS_QUEUE_CAPACITY` (drain thread → consumer)
//!
//! # Testing
//!
//! Prefer the deterministic [`ManualFileWatcher`] over tests that depend on OS watcher timing.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel as channel;
use parking_lot::Mutex;

use crate::change::FileChange;

/// An event produced by a file watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// One or more normalized file changes.
    Changes { changes: Vec<FileChange> },
    /// The watcher dropped events due to overflow/backpressure.
    Rescan,
}

impl WatchEvent {
    /// Returns the normalized file changes contained in this event (empty for `Rescan`).
    pub fn changes(&self) -> &[FileChange] {
        match self {
            WatchEvent::Changes { changes } => changes,
            WatchEvent::Rescan => &[],
        }
    }
}

/// Message type delivered by a [`FileWatcher`].
///
/// OS watcher backends may surface errors asynchronously; these are delivered as `Err(io::Error)`
/// values via the same event stream. A disconnected stream means the native source is gone.
pub type WatchMessage = io::Result<WatchEvent>;

/// Native directory watching.
///
/// Consumers are expected to:
///
/// 1. Register directories with [`watch_path`](FileWatcher::watch_path).
/// 2. Consume events from [`receiver`](FileWatcher::receiver).
///
/// Watching a directory that is already watched is a no-op; reference counting belongs to the
/// caller.
pub trait FileWatcher: Send {
    /// Begin watching the direct children of `dir`.
    fn watch_path(&mut self, dir: &Path) -> io::Result<()>;

    /// Stop watching `dir`. Unknown paths are a no-op.
    fn unwatch_path(&mut self, dir: &Path) -> io::Result<()>;

    /// Returns the receiver used to consume watcher events.
    fn receiver(&self) -> &channel::Receiver<WatchMessage>;

    /// Retrieves all currently pending events, if any, without blocking.
    fn poll(&mut self) -> io::Result<Vec<WatchEvent>> {
        let mut out = Vec::new();
        for msg in self.receiver().try_iter() {
            out.push(msg?);
        }
        Ok(out)
    }
}

impl<W: ?Sized + FileWatcher> FileWatcher for Box<W> {
    fn watch_path(&mut self, dir: &Path) -> io::Result<()> {
        self.as_mut().watch_path(dir)
    }

    fn unwatch_path(&mut self, dir: &Path) -> io::Result<()> {
        self.as_mut().unwatch_path(dir)
    }

    fn receiver(&self) -> &channel::Receiver<WatchMessage> {
        self.as_ref().receiver()
    }
}

const MANUAL_WATCH_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct ManualState {
    tx: Option<channel::Sender<WatchMessage>>,
    watch_calls: Vec<PathBuf>,
    unwatch_calls: Vec<PathBuf>,
    watched: BTreeSet<PathBuf>,
    failing: HashMap<PathBuf, io::ErrorKind>,
}

/// Deterministic watcher implementation for tests.
///
/// This watcher does not interact with the OS. Callers inject events via
/// [`ManualFileWatcherHandle`], which stays usable after the watcher itself has been moved into a
/// service.
///
/// Event delivery uses a bounded in-memory queue. Injection is non-blocking and returns
/// `io::ErrorKind::WouldBlock` if the queue is full.
#[derive(Debug)]
pub struct ManualFileWatcher {
    rx: channel::Receiver<WatchMessage>,
    state: Arc<Mutex<ManualState>>,
}

/// Cloneable handle for driving a [`ManualFileWatcher`] from a test.
#[derive(Debug, Clone)]
pub struct ManualFileWatcherHandle {
    state: Arc<Mutex<ManualState>>,
}

impl ManualFileWatcherHandle {
    /// Inject a synthetic watcher event.
    pub fn push(&self, event: WatchEvent) -> io::Result<()> {
        self.send(Ok(event))
    }

    /// Inject a batch of changes as one [`WatchEvent::Changes`].
    pub fn push_changes(&self, changes: Vec<FileChange>) -> io::Result<()> {
        self.push(WatchEvent::Changes { changes })
    }

    /// Inject an asynchronous watcher error.
    pub fn push_error(&self, error: io::Error) -> io::Result<()> {
        self.send(Err(error))
    }

    /// Drops the sending side of the event stream, simulating a native source that went away.
    pub fn disconnect(&self) {
        self.state.lock().tx = None;
    }

    /// Makes every subsequent `watch_path(path)` call fail with `kind`.
    pub fn fail_watch(&self, path: impl Into<PathBuf>, kind: io::ErrorKind) {
        self.state.lock().failing.insert(path.into(), kind);
    }

    /// Paths passed to [`FileWatcher::watch_path`] (in call order).
    pub fn watch_calls(&self) -> Vec<PathBuf> {
        self.state.lock().watch_calls.clone()
    }

    /// Paths passed to [`FileWatcher::unwatch_path`] (in call order).
    pub fn unwatch_calls(&self) -> Vec<PathBuf> {
        self.state.lock().unwatch_calls.clone()
    }

    /// Currently watched directories (sorted for determinism).
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.state.lock().watched.iter().cloned().collect()
    }

    fn send(&self, msg: WatchMessage) -> io::Result<()> {
        let state = self.state.lock();
        let Some(tx) = state.tx.as_ref() else {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "watch source disconnected",
            ));
        };
        match tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(channel::TrySendError::Full(_)) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "watch queue is full",
            )),
            Err(channel::TrySendError::Disconnected(_)) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "watch receiver dropped",
            )),
        }
    }
}

impl Default for ManualFileWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualFileWatcher {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(MANUAL_WATCH_QUEUE_CAPACITY);
        let state = ManualState {
            tx: Some(tx),
            ..ManualState::default()
        };
        Self {
            rx,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Returns a cloneable handle that keeps working after the watcher has been moved.
    pub fn handle(&self) -> ManualFileWatcherHandle {
        ManualFileWatcherHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Inject a synthetic watcher event.
    pub fn push(&self, event: WatchEvent) -> io::Result<()> {
        self.handle().push(event)
    }

    /// Inject an asynchronous watcher error.
    pub fn push_error(&self, error: io::Error) -> io::Result<()> {
        self.handle().push_error(error)
    }
}

impl FileWatcher for ManualFileWatcher {
    fn watch_path(&mut self, dir: &Path) -> io::Result<()> {
        let mut state = self.state.lock();
        state.watch_calls.push(dir.to_path_buf());
        if let Some(kind) = state.failing.get(dir).copied() {
            return Err(io::Error::new(
                kind,
                format!("failed to watch {}", dir.display()),
            ));
        }
        state.watched.insert(dir.to_path_buf());
        Ok(())
    }

    fn unwatch_path(&mut self, dir: &Path) -> io::Result<()> {
        let mut state = self.state.lock();
        state.unwatch_calls.push(dir.to_path_buf());
        state.watched.remove(dir);
        Ok(())
    }

    fn receiver(&self) -> &channel::Receiver<WatchMessage> {
        &self.rx
    }
}

#[cfg(any(test, feature = "watch-notify"))]
mod notify_impl {
    use super::*;

    use notify::event::{ModifyKind, RenameMode};
    use notify::EventKind;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[cfg(feature = "watch-notify")]
    use notify::{RecursiveMode, Watcher};
    #[cfg(feature = "watch-notify")]
    use std::collections::HashSet;

    fn notify_event_requests_rescan(event: &notify::Event) -> bool {
        // `notify` signals dropped events / overflows by marking the event with `Flag::Rescan`.
        // Some backends also emit a path-less `EventKind::Other`.
        matches!(event.attrs.flag(), Some(notify::event::Flag::Rescan))
            || (matches!(event.kind, EventKind::Other) && event.paths.is_empty())
    }

    /// Maps one backend event onto create/modify/delete changes.
    pub(super) fn normalize_event(event: notify::Event) -> Vec<FileChange> {
        let paths = event.paths;
        match event.kind {
            EventKind::Create(_) => paths.into_iter().map(FileChange::created).collect(),
            EventKind::Remove(_) => paths.into_iter().map(FileChange::deleted).collect(),
            EventKind::Modify(ModifyKind::Name(mode)) => match mode {
                RenameMode::From => paths.into_iter().map(FileChange::deleted).collect(),
                RenameMode::To => paths.into_iter().map(FileChange::created).collect(),
                RenameMode::Both => {
                    let mut out = Vec::with_capacity(paths.len());
                    let mut it = paths.into_iter();
                    while let Some(from) = it.next() {
                        match it.next() {
                            Some(to) => {
                                out.push(FileChange::deleted(from));
                                out.push(FileChange::created(to));
                            }
                            None => out.push(FileChange::modified(from)),
                        }
                    }
                    out
                }
                // FSEvents reports both sides of a rename with the same kind; the only reliable
                // signal is whether the path still exists.
                RenameMode::Any | RenameMode::Other => paths
                    .into_iter()
                    .map(|path| {
                        if path.exists() {
                            FileChange::created(path)
                        } else {
                            FileChange::deleted(path)
                        }
                    })
                    .collect(),
            },
            EventKind::Modify(_) => paths.into_iter().map(FileChange::modified).collect(),
            // Reads (and inotify's close-after-write) are not changes; the write itself already
            // produced a modify event.
            EventKind::Access(_) => Vec::new(),
            EventKind::Any | EventKind::Other => {
                paths.into_iter().map(FileChange::modified).collect()
            }
        }
    }

    #[cfg(feature = "watch-notify")]
    const RAW_QUEUE_CAPACITY: usize = 4096;
    #[cfg(feature = "watch-notify")]
    const EVENTS_QUEUE_CAPACITY: usize = 1024;
    const OVERFLOW_RETRY_INTERVAL: Duration = Duration::from_millis(50);
    #[cfg(feature = "watch-notify")]
    const ENV_RAW_QUEUE_CAPACITY: &str = "WSAGENT_WATCH_NOTIFY_RAW_QUEUE_CAPACITY";
    #[cfg(feature = "watch-notify")]
    const ENV_EVENTS_QUEUE_CAPACITY: &str = "WSAGENT_WATCH_EVENTS_QUEUE_CAPACITY";

    pub(super) fn notify_error_to_io(err: notify::Error) -> io::Error {
        match err.kind {
            notify::ErrorKind::Io(io_err) => io_err,
            notify::ErrorKind::PathNotFound => {
                io::Error::new(io::ErrorKind::NotFound, "path not found")
            }
            kind => io::Error::other(notify::Error::new(kind)),
        }
    }

    pub(super) fn queue_capacity_from_env(var: &str) -> io::Result<Option<usize>> {
        let raw = match std::env::var(var) {
            Ok(value) => value,
            Err(std::env::VarError::NotPresent) => return Ok(None),
            Err(err) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("failed to read env var {var}: {err}"),
                ))
            }
        };
        parse_queue_capacity(var, &raw)
    }

    pub(super) fn parse_queue_capacity(var: &str, raw: &str) -> io::Result<Option<usize>> {
        let raw = raw.trim();
        if raw.is_empty() || raw == "0" {
            return Ok(None);
        }

        let parsed = raw.parse::<usize>().map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid {var}={raw:?}: {err}"),
            )
        })?;

        const MAX_CAPACITY: usize = 1_000_000;
        Ok(Some(parsed.clamp(1, MAX_CAPACITY)))
    }

    pub(super) fn try_send_or_overflow<T>(
        tx: &channel::Sender<T>,
        overflowed: &AtomicBool,
        msg: T,
    ) {
        match tx.try_send(msg) {
            Ok(()) => {}
            Err(channel::TrySendError::Full(_)) => {
                overflowed.store(true, Ordering::Release);
            }
            // The watcher is shutting down; dropping the message is fine.
            Err(channel::TrySendError::Disconnected(_)) => {}
        }
    }

    /// Returns `false` when the consumer is gone and the loop should exit.
    fn forward(
        events_tx: &channel::Sender<WatchMessage>,
        overflowed: &AtomicBool,
        msg: WatchMessage,
    ) -> bool {
        match events_tx.try_send(msg) {
            Ok(()) => true,
            Err(channel::TrySendError::Full(_)) => {
                overflowed.store(true, Ordering::Release);
                true
            }
            Err(channel::TrySendError::Disconnected(_)) => false,
        }
    }

    pub(super) fn run_notify_drain_loop(
        raw_rx: channel::Receiver<notify::Result<notify::Event>>,
        events_tx: channel::Sender<WatchMessage>,
        stop_rx: channel::Receiver<()>,
        overflowed: Arc<AtomicBool>,
    ) {
        loop {
            // Once anything was dropped the only honest signal left is a rescan marker.
            if overflowed.load(Ordering::Acquire) {
                while raw_rx.try_recv().is_ok() {}

                match events_tx.try_send(Ok(WatchEvent::Rescan)) {
                    Ok(()) => overflowed.store(false, Ordering::Release),
                    // Keep the flag set so we retry once consumers catch up.
                    Err(channel::TrySendError::Full(_)) => {}
                    Err(channel::TrySendError::Disconnected(_)) => break,
                }
            }

            let tick = if overflowed.load(Ordering::Acquire) {
                channel::after(OVERFLOW_RETRY_INTERVAL)
            } else {
                channel::never()
            };

            channel::select! {
                recv(stop_rx) -> _ => break,
                recv(raw_rx) -> msg => {
                    let Ok(res) = msg else {
                        // The notify callback is gone; closing `events_tx` tells the consumer.
                        break;
                    };
                    let keep_going = match res {
                        Ok(event) => {
                            if notify_event_requests_rescan(&event) {
                                overflowed.store(true, Ordering::Release);
                                continue;
                            }
                            let changes = normalize_event(event);
                            if changes.is_empty() {
                                true
                            } else {
                                forward(&events_tx, &overflowed, Ok(WatchEvent::Changes { changes }))
                            }
                        }
                        Err(err) => {
                            // Forward the error, but also request a rescan: many notify backends
                            // use errors to signal lost events.
                            overflowed.store(true, Ordering::Release);
                            forward(&events_tx, &overflowed, Err(notify_error_to_io(err)))
                        }
                    };
                    if !keep_going {
                        break;
                    }
                }
                recv(tick) -> _ => {}
            }
        }
    }

    /// `notify`-backed [`FileWatcher`].
    #[cfg(feature = "watch-notify")]
    pub struct NotifyFileWatcher {
        watcher: notify::RecommendedWatcher,
        events_rx: channel::Receiver<WatchMessage>,
        stop_tx: channel::Sender<()>,
        thread: Option<std::thread::JoinHandle<()>>,
        watched: HashSet<PathBuf>,
    }

    #[cfg(feature = "watch-notify")]
    impl std::fmt::Debug for NotifyFileWatcher {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("NotifyFileWatcher")
                .field("watched", &self.watched)
                .finish_non_exhaustive()
        }
    }

    #[cfg(feature = "watch-notify")]
    impl NotifyFileWatcher {
        /// Creates a watcher with queue sizes taken from the environment (or defaults).
        pub fn new() -> io::Result<Self> {
            let events_queue_capacity = queue_capacity_from_env(ENV_EVENTS_QUEUE_CAPACITY)?
                .unwrap_or(EVENTS_QUEUE_CAPACITY);
            Self::with_events_capacity(events_queue_capacity)
        }

        /// Creates a watcher with an explicit consumer-facing queue size.
        ///
        /// `0` falls back to the environment/default capacity.
        pub fn with_events_capacity(events_queue_capacity: usize) -> io::Result<Self> {
            let events_queue_capacity = if events_queue_capacity == 0 {
                queue_capacity_from_env(ENV_EVENTS_QUEUE_CAPACITY)?
                    .unwrap_or(EVENTS_QUEUE_CAPACITY)
            } else {
                events_queue_capacity
            };
            let raw_queue_capacity =
                queue_capacity_from_env(ENV_RAW_QUEUE_CAPACITY)?.unwrap_or(RAW_QUEUE_CAPACITY);

            let (raw_tx, raw_rx) =
                channel::bounded::<notify::Result<notify::Event>>(raw_queue_capacity);
            let (events_tx, events_rx) = channel::bounded::<WatchMessage>(events_queue_capacity);
            let (stop_tx, stop_rx) = channel::bounded::<()>(0);

            let overflowed = Arc::new(AtomicBool::new(false));

            let overflowed_cb = Arc::clone(&overflowed);
            let watcher = notify::recommended_watcher(move |res| {
                try_send_or_overflow(&raw_tx, overflowed_cb.as_ref(), res);
            })
            .map_err(notify_error_to_io)?;

            let thread = std::thread::Builder::new()
                .name("wsagent-notify-drain".to_string())
                .spawn(move || run_notify_drain_loop(raw_rx, events_tx, stop_rx, overflowed))?;

            Ok(Self {
                watcher,
                events_rx,
                stop_tx,
                thread: Some(thread),
                watched: HashSet::new(),
            })
        }
    }

    #[cfg(feature = "watch-notify")]
    impl Drop for NotifyFileWatcher {
        fn drop(&mut self) {
            let _ = self.stop_tx.send(());
            if let Some(thread) = self.thread.take() {
                if thread.join().is_err() {
                    tracing::debug!(
                        target: "wsagent.vfs",
                        "file watcher drain thread panicked (best effort join)"
                    );
                }
            }
        }
    }

    #[cfg(feature = "watch-notify")]
    impl FileWatcher for NotifyFileWatcher {
        fn watch_path(&mut self, dir: &Path) -> io::Result<()> {
            if self.watched.contains(dir) {
                return Ok(());
            }
            self.watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .map_err(notify_error_to_io)?;
            self.watched.insert(dir.to_path_buf());
            tracing::debug!(target: "wsagent.vfs", path = %dir.display(), "native watch added");
            Ok(())
        }

        fn unwatch_path(&mut self, dir: &Path) -> io::Result<()> {
            if !self.watched.remove(dir) {
                return Ok(());
            }
            match self.watcher.unwatch(dir) {
                Ok(()) => {}
                // The OS already dropped the watch (typically because the directory was deleted).
                Err(err) if matches!(err.kind, notify::ErrorKind::WatchNotFound) => {}
                Err(err) => return Err(notify_error_to_io(err)),
            }
            tracing::debug!(target: "wsagent.vfs", path = %dir.display(), "native watch removed");
            Ok(())
        }

        fn receiver(&self) -> &channel::Receiver<WatchMessage> {
            &self.events_rx
        }
    }

}

#[cfg(feature = "watch-notify")]
pub use notify_impl::NotifyFileWatcher;
