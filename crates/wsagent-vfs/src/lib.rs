//! Native file-system event source for the workspace agent.
//!
//! This crate is responsible for:
//! - Representing file change events (`FileChange`) with exactly one operation each.
//! - The pluggable [`FileWatcher`] interface that higher layers register directories with.
//! - The `notify`-backed OS implementation (feature `watch-notify`).
//! - A deterministic [`ManualFileWatcher`] for tests.

mod change;
mod path;
mod watch;

pub use change::{FileChange, FileChangeKind};
pub use watch::{
    FileWatcher, ManualFileWatcher, ManualFileWatcherHandle, WatchEvent, WatchMessage,
};

#[cfg(feature = "watch-notify")]
pub use watch::NotifyFileWatcher;

/// Lexically normalizes a local filesystem path.
///
/// This does not hit the filesystem and does not resolve symlinks.
pub fn normalize_local_path(path: &std::path::Path) -> std::path::PathBuf {
    crate::path::normalize_local_path(path)
}
