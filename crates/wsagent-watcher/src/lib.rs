//! File watching for the workspace agent.
//!
//! Consumers subscribe through [`FileWatcherManager`], either to one exact path
//! ([`FileWatcherManager::register_by_path`]) or to every path a predicate accepts
//! ([`FileWatcherManager::register_by_matcher`]). Events come from a [`FileWatcherService`] that
//! reference-counts native directory watches and drains the backend on a single thread.
//!
//! ```no_run
//! use wsagent_config::WatcherConfig;
//! use wsagent_watcher::{Callbacks, FileWatcherManager};
//!
//! # fn main() -> wsagent_watcher::Result<()> {
//! let manager = FileWatcherManager::with_notify("/projects/demo", &WatcherConfig::default())?;
//! let id = manager.register_by_path(
//!     "/pom.xml",
//!     Callbacks::new().on_modify(|path| println!("{path} changed")),
//! )?;
//! manager.unregister_by_path(id)?;
//! # Ok(())
//! # }
//! ```
//!
//! Platform note: some operating systems also report the parent directory as modified when a
//! child is created or removed. That event is delivered like any other; consumers that need
//! identical behavior everywhere must tolerate it.

mod by_matcher;
mod by_path;
mod callbacks;
mod error;
mod manager;
mod matcher;
pub mod path;
mod service;

pub use by_matcher::FileWatcherByPathMatcher;
pub use by_path::FileWatcherByPathValue;
pub use callbacks::{Callbacks, PathCallback, SubscriptionId, WatchOperation};
pub use error::{Result, WatcherError};
pub use manager::FileWatcherManager;
pub use matcher::{ExcludeId, ExcludeSet, GlobMatcher, PathMatcher};
pub use service::{DeliveryState, EventHandler, FileWatcherService, LoopState, StopPolicy};

pub use wsagent_vfs::{
    FileChange, FileChangeKind, FileWatcher, ManualFileWatcher, ManualFileWatcherHandle,
    WatchEvent,
};

#[cfg(feature = "watch-notify")]
pub use wsagent_vfs::NotifyFileWatcher;
