use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use parking_lot::RwLock;

use crate::error::{Result, WatcherError};
use crate::path::is_excluded;

/// A predicate over normal (absolute) paths.
///
/// Implemented for any `Fn(&Path) -> bool`, so closures can be registered directly.
pub trait PathMatcher: Send + Sync {
    fn matches(&self, path: &Path) -> bool;
}

impl<F> PathMatcher for F
where
    F: Fn(&Path) -> bool + Send + Sync,
{
    fn matches(&self, path: &Path) -> bool {
        self(path)
    }
}

/// Matches paths against a set of glob patterns (any pattern matching is a match).
#[derive(Clone)]
pub struct GlobMatcher {
    patterns: Vec<String>,
    set: GlobSet,
}

impl GlobMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut kept = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = Glob::new(pattern).map_err(|source| WatcherError::InvalidGlob {
                pattern: pattern.to_owned(),
                source,
            })?;
            builder.add(glob);
            kept.push(pattern.to_owned());
        }
        let set = builder.build().map_err(|source| WatcherError::InvalidGlob {
            pattern: kept.join(", "),
            source,
        })?;
        Ok(Self {
            patterns: kept,
            set,
        })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

impl fmt::Debug for GlobMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobMatcher")
            .field("patterns", &self.patterns)
            .finish()
    }
}

impl PathMatcher for GlobMatcher {
    fn matches(&self, path: &Path) -> bool {
        self.set.is_match(path)
    }
}

/// Handle for a runtime exclusion added with [`ExcludeSet::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExcludeId(pub u64);

struct ExcludeState {
    ids: Vec<ExcludeId>,
    entries: Vec<Arc<dyn PathMatcher>>,
    // Rebuilt on every change so readers never hold the lock while running user predicates.
    snapshot: Arc<[Arc<dyn PathMatcher>]>,
}

impl Default for ExcludeState {
    fn default() -> Self {
        Self {
            ids: Vec::new(),
            entries: Vec::new(),
            snapshot: Arc::from(Vec::new()),
        }
    }
}

impl ExcludeState {
    fn rebuild(&mut self) {
        self.snapshot = self.entries.iter().cloned().collect();
    }
}

/// Mutable set of exclusion predicates shared by the service and the matcher registry.
#[derive(Default)]
pub struct ExcludeSet {
    next_id: AtomicU64,
    state: RwLock<ExcludeState>,
}

impl fmt::Debug for ExcludeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExcludeSet")
            .field("ids", &self.state.read().ids)
            .finish_non_exhaustive()
    }
}

impl ExcludeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, matcher: impl PathMatcher + 'static) -> ExcludeId {
        let id = ExcludeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut state = self.state.write();
        state.ids.push(id);
        state.entries.push(Arc::new(matcher));
        state.rebuild();
        id
    }

    /// Removes the exclusion; returns `false` for unknown ids.
    pub fn remove(&self, id: ExcludeId) -> bool {
        let mut state = self.state.write();
        let Some(index) = state.ids.iter().position(|candidate| *candidate == id) else {
            return false;
        };
        state.ids.remove(index);
        state.entries.remove(index);
        state.rebuild();
        true
    }

    pub fn len(&self) -> usize {
        self.state.read().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        let snapshot = Arc::clone(&self.state.read().snapshot);
        is_excluded(&snapshot, path)
    }
}
