use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WatcherError>;

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("failed to watch directory {}: {source}", path.display())]
    Register {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to stop watching directory {}: {source}", path.display())]
    Unregister {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("path {} is not under watched root {}", path.display(), root.display())]
    PathNotUnderRoot { path: PathBuf, root: PathBuf },
    #[error("path {} is not valid UTF-8 and has no internal path", path.display())]
    NonUtf8Path { path: PathBuf },
    #[error("invalid internal path {path:?}: expected `/`-rooted segments without `.` or `..`")]
    InvalidInternalPath { path: String },
    #[error("invalid glob pattern {pattern:?}: {source}")]
    InvalidGlob {
        pattern: String,
        #[source]
        source: globset::Error,
    },
    #[error("failed to spawn file watcher thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("file watcher backend error: {0}")]
    Backend(#[source] io::Error),
}
