//! Diagnostics storage: current diagnostics per file per server.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tether_types::{Diagnostic, DiagnosticSeverity};

use crate::types::DiagnosticsSnapshot;

/// Index of diagnostics keyed by file, then by reporting server.
///
/// Files and servers keep insertion order. A `(file, server)` entry never
/// holds an empty list, and a file with no entries is removed.
#[derive(Debug, Default)]
pub struct DiagnosticsStorage {
    files: IndexMap<PathBuf, IndexMap<String, Vec<Diagnostic>>>,
}

impl DiagnosticsStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything `server` reported for `path`.
    pub fn receive(&mut self, server: &str, path: PathBuf, diagnostics: Vec<Diagnostic>) {
        if diagnostics.is_empty() {
            self.remove(&path, server);
            return;
        }
        self.files
            .entry(path)
            .or_default()
            .insert(server.to_string(), diagnostics);
    }

    pub fn remove(&mut self, path: &Path, server: &str) {
        let Some(by_server) = self.files.get_mut(path) else {
            return;
        };
        by_server.shift_remove(server);
        if by_server.is_empty() {
            self.files.shift_remove(path);
        }
    }

    /// Drop everything a server reported. Returns the files that changed.
    pub fn remove_server(&mut self, server: &str) -> Vec<PathBuf> {
        let mut changed = Vec::new();
        self.files.retain(|path, by_server| {
            if by_server.shift_remove(server).is_some() {
                changed.push(path.clone());
            }
            !by_server.is_empty()
        });
        changed
    }

    /// Drop a file for every server. Returns whether anything was removed.
    pub fn remove_file(&mut self, path: &Path) -> bool {
        self.files.shift_remove(path).is_some()
    }

    #[must_use]
    pub fn has_diagnostics(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Per-server diagnostics for one file.
    #[must_use]
    pub fn get_by_file(&self, path: &Path) -> Option<&IndexMap<String, Vec<Diagnostic>>> {
        self.files.get(path)
    }

    #[must_use]
    pub fn get(&self) -> &IndexMap<PathBuf, IndexMap<String, Vec<Diagnostic>>> {
        &self.files
    }

    /// Diagnostics at or above `max_severity` in navigation order: files in
    /// insertion order, then by start position. Ties keep server insertion
    /// order and then the server's own order.
    #[must_use]
    pub fn walk(&self, max_severity: DiagnosticSeverity) -> Vec<(&Path, &Diagnostic)> {
        let mut out = Vec::new();
        for (path, by_server) in &self.files {
            let mut in_file: Vec<&Diagnostic> = by_server
                .values()
                .flatten()
                .filter(|d| d.severity().at_least(max_severity))
                .collect();
            in_file.sort_by_key(|d| d.start());
            out.extend(in_file.into_iter().map(|d| (path.as_path(), d)));
        }
        out
    }

    /// Read-only copy for presentation, with error-containing files first.
    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let mut files: Vec<(PathBuf, Vec<Diagnostic>)> = self
            .files
            .iter()
            .map(|(path, by_server)| {
                let mut items: Vec<Diagnostic> = by_server.values().flatten().cloned().collect();
                items.sort_by_key(|d| (d.severity(), d.start()));
                (path.clone(), items)
            })
            .collect();

        files.sort_by(|a, b| {
            let a_has_errors = a.1.iter().any(|d| d.severity().is_error());
            let b_has_errors = b.1.iter().any(|d| d.severity().is_error());
            b_has_errors.cmp(&a_has_errors).then_with(|| a.0.cmp(&b.0))
        });

        DiagnosticsSnapshot::new(files)
    }

    /// Only error-level diagnostics for the given files.
    #[must_use]
    pub fn errors_for_files(&self, paths: &[PathBuf]) -> Vec<(PathBuf, Vec<Diagnostic>)> {
        paths
            .iter()
            .filter_map(|path| {
                let errors: Vec<Diagnostic> = self
                    .files
                    .get(path)?
                    .values()
                    .flatten()
                    .filter(|d| d.severity().is_error())
                    .cloned()
                    .collect();
                (!errors.is_empty()).then(|| (path.clone(), errors))
            })
            .collect()
    }
}
