use std::fmt;
use std::path::{Path, PathBuf};

use crate::path::normalize_local_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileChangeKind {
    Created,
    Modified,
    Deleted,
}

impl fmt::Display for FileChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileChangeKind::Created => "created",
            FileChangeKind::Modified => "modified",
            FileChangeKind::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// A single observed change. Every change carries exactly one operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: FileChangeKind,
}

impl FileChange {
    pub fn new(path: impl AsRef<Path>, kind: FileChangeKind) -> Self {
        Self {
            path: normalize_local_path(path.as_ref()),
            kind,
        }
    }

    pub fn created(path: impl AsRef<Path>) -> Self {
        Self::new(path, FileChangeKind::Created)
    }

    pub fn modified(path: impl AsRef<Path>) -> Self {
        Self::new(path, FileChangeKind::Modified)
    }

    pub fn deleted(path: impl AsRef<Path>) -> Self {
        Self::new(path, FileChangeKind::Deleted)
    }
}
