//! Translation between internal paths and normal paths.
//!
//! An *internal path* is the root-relative identity consumers use (`/src/Foo.java`, with `/`
//! standing for the root itself). A *normal path* is the absolute filesystem path under the
//! watched root. All functions here are pure.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, WatcherError};
use crate::matcher::PathMatcher;

/// Joins `internal` onto `root`.
///
/// Inverse of [`to_internal_path`] for every internal path accepted by
/// [`validate_internal_path`].
pub fn to_normal_path(root: &Path, internal: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    out.extend(internal.split('/').filter(|segment| !segment.is_empty()));
    out
}

/// Strips `root` from `normal` and renders the remainder with `/` separators.
///
/// Segments that are not valid UTF-8 have no internal path and are rejected with
/// [`WatcherError::NonUtf8Path`].
pub fn to_internal_path(root: &Path, normal: &Path) -> Result<String> {
    let not_under_root = || WatcherError::PathNotUnderRoot {
        path: normal.to_path_buf(),
        root: root.to_path_buf(),
    };
    let relative = normal.strip_prefix(root).map_err(|_| not_under_root())?;

    let mut out = String::new();
    for component in relative.components() {
        match component {
            Component::Normal(segment) => {
                let segment = segment.to_str().ok_or_else(|| WatcherError::NonUtf8Path {
                    path: normal.to_path_buf(),
                })?;
                out.push('/');
                out.push_str(segment);
            }
            _ => return Err(not_under_root()),
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// True iff any matcher in `excludes` matches `path`.
pub fn is_excluded(excludes: &[Arc<dyn PathMatcher>], path: &Path) -> bool {
    excludes.iter().any(|matcher| matcher.matches(path))
}

/// Internal paths start with `/` and consist of non-empty segments other than `.` and `..`.
pub fn validate_internal_path(internal: &str) -> Result<()> {
    let invalid = || WatcherError::InvalidInternalPath {
        path: internal.to_owned(),
    };
    let Some(rest) = internal.strip_prefix('/') else {
        return Err(invalid());
    };
    if rest.is_empty() {
        return Ok(());
    }
    for segment in rest.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
            return Err(invalid());
        }
    }
    Ok(())
}
