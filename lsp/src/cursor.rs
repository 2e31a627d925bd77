//! Ordered navigation over [`DiagnosticsStorage`].
//!
//! A cursor holds no reference into the storage. Every step walks the live
//! storage again, so a cursor stays valid across updates and simply loses its
//! position when the diagnostic it pointed at disappears.

use std::path::{Path, PathBuf};

use tether_types::{Diagnostic, DiagnosticSeverity, Point};

use crate::diagnostics::DiagnosticsStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticsCursor {
    value: Option<Current>,
    max_severity: DiagnosticSeverity,
}

/// The diagnostic under the cursor. `occurrence` tells identical copies in
/// the same file apart: it counts earlier equal entries in walk order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Current {
    path: PathBuf,
    diagnostic: Diagnostic,
    occurrence: usize,
}

impl Current {
    fn is(&self, path: &Path, diagnostic: &Diagnostic) -> bool {
        path == self.path.as_path() && *diagnostic == self.diagnostic
    }
}

type Walk<'a> = [(&'a Path, &'a Diagnostic)];

impl Default for DiagnosticsCursor {
    fn default() -> Self {
        Self::new(DiagnosticSeverity::Warning)
    }
}

impl DiagnosticsCursor {
    /// An empty cursor visiting diagnostics at or above `max_severity`.
    #[must_use]
    pub fn new(max_severity: DiagnosticSeverity) -> Self {
        Self {
            value: None,
            max_severity,
        }
    }

    #[must_use]
    pub fn value(&self) -> Option<(&Path, &Diagnostic)> {
        self.value
            .as_ref()
            .map(|current| (current.path.as_path(), &current.diagnostic))
    }

    #[must_use]
    pub fn max_severity(&self) -> DiagnosticSeverity {
        self.max_severity
    }

    fn at(&self, walk: &Walk<'_>, index: Option<usize>) -> Self {
        let value = index.and_then(|index| {
            let (path, diagnostic) = *walk.get(index)?;
            let occurrence = walk[..index]
                .iter()
                .filter(|&&(p, d)| p == path && d == diagnostic)
                .count();
            Some(Current {
                path: path.to_path_buf(),
                diagnostic: diagnostic.clone(),
                occurrence,
            })
        });
        Self {
            value,
            max_severity: self.max_severity,
        }
    }

    /// Index of `current` in `walk`. If fewer copies remain than its
    /// occurrence, the last remaining copy.
    fn locate(walk: &Walk<'_>, current: &Current) -> Option<usize> {
        let mut last = None;
        let mut seen = 0;
        for (index, &(path, diagnostic)) in walk.iter().enumerate() {
            if !current.is(path, diagnostic) {
                continue;
            }
            if seen == current.occurrence {
                return Some(index);
            }
            seen += 1;
            last = Some(index);
        }
        last
    }

    /// First diagnostic strictly after (or before) `position`, wrapping
    /// around. Without a position, the first (or last) diagnostic.
    #[must_use]
    pub fn from_position(
        &self,
        storage: &DiagnosticsStorage,
        direction: Direction,
        position: Option<(&Path, Point)>,
    ) -> Self {
        let walk = storage.walk(self.max_severity);
        let file_index = |path: &Path| storage.get().get_index_of(path);
        let key = |path: &Path, d: &Diagnostic| (file_index(path).unwrap_or(usize::MAX), d.start());
        let first = (!walk.is_empty()).then_some(0);
        let last = walk.len().checked_sub(1);

        let anchor = position.and_then(|(path, point)| Some((file_index(path)?, point)));
        let found = match (direction, anchor) {
            (Direction::Forward, Some(anchor)) => walk
                .iter()
                .position(|&(path, d)| key(path, d) > anchor)
                .or(first),
            (Direction::Backward, Some(anchor)) => walk
                .iter()
                .rposition(|&(path, d)| key(path, d) < anchor)
                .or(last),
            (Direction::Forward, None) => first,
            (Direction::Backward, None) => last,
        };
        self.at(&walk, found)
    }

    /// Step from the current diagnostic, wrapping around.
    #[must_use]
    pub fn from_diagnostic(&self, storage: &DiagnosticsStorage, direction: Direction) -> Self {
        let Some(current) = &self.value else {
            return self.from_position(storage, direction, None);
        };
        let walk = storage.walk(self.max_severity);
        let Some(index) = Self::locate(&walk, current) else {
            let start = current.diagnostic.start();
            return self.from_position(storage, direction, Some((current.path.as_path(), start)));
        };

        let len = walk.len();
        let next = match direction {
            Direction::Forward => (index + 1) % len,
            Direction::Backward => (index + len - 1) % len,
        };
        self.at(&walk, Some(next))
    }

    /// Re-resolve against the storage; empty if the diagnostic is gone.
    #[must_use]
    pub fn update(&self, storage: &DiagnosticsStorage) -> Self {
        let Some(current) = &self.value else {
            return self.clone();
        };
        let walk = storage.walk(self.max_severity);
        let index = Self::locate(&walk, current);
        self.at(&walk, index)
    }
}
