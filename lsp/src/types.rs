//! Public configuration and snapshot types.
//!
//! The host constructs [`LspConfig`] (usually from the `[lsp]` table of the
//! config file), reads [`DiagnosticsSnapshot`]s for display, and reads
//! [`ServerStatus`] for a status line.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::Value;
use tether_types::{Diagnostic, DiagnosticSeverity};

const DEFAULT_INITIALIZE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_CHANGE_DEBOUNCE_MS: u64 = 300;

/// Configuration for the LSP client subsystem.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LspConfig {
    /// Whether the client is enabled. Default: false.
    pub enabled: bool,
    /// Server configurations keyed by name (e.g. "rust").
    pub servers: BTreeMap<String, ServerConfig>,
    pub initialize_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// Quiet period before coalesced edits are sent as one `didChange`.
    pub change_debounce_ms: u64,
    /// Least severe level the diagnostics cursor visits.
    pub diagnostics_max_severity: DiagnosticSeverity,
}

impl Default for LspConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            servers: BTreeMap::new(),
            initialize_timeout_ms: DEFAULT_INITIALIZE_TIMEOUT_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            change_debounce_ms: DEFAULT_CHANGE_DEBOUNCE_MS,
            diagnostics_max_severity: DiagnosticSeverity::Warning,
        }
    }
}

impl LspConfig {
    #[must_use]
    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_millis(self.initialize_timeout_ms)
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    #[must_use]
    pub fn change_debounce(&self) -> Duration {
        Duration::from_millis(self.change_debounce_ms)
    }

    /// Enabled servers whose document selector matches, in name order.
    pub fn servers_for<'a>(
        &'a self,
        path: &'a Path,
        language: Option<&'a str>,
    ) -> impl Iterator<Item = (&'a str, &'a ServerConfig)> + 'a {
        self.servers
            .iter()
            .filter(move |(_, config)| config.enabled && config.matches(path, language))
            .map(|(name, config)| (name.as_str(), config))
    }
}

/// Address of a server that speaks over TCP instead of stdio.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TcpEndpoint {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ServerConfigError {
    #[error("invalid file pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
    #[error("a server needs a command or a tcp endpoint")]
    MissingCommand,
}

#[derive(Deserialize)]
struct RawServerConfig {
    #[serde(default)]
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    language_id: String,
    #[serde(default)]
    languages: Vec<String>,
    #[serde(default)]
    file_extensions: Vec<String>,
    #[serde(default)]
    file_patterns: Vec<String>,
    #[serde(default)]
    root_markers: Vec<String>,
    #[serde(default)]
    tcp: Option<TcpEndpoint>,
    #[serde(default)]
    initialization_options: Option<Value>,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

/// Configuration for a single language server.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawServerConfig")]
pub struct ServerConfig {
    /// Executable (e.g. "rust-analyzer"). May be empty for a TCP server that
    /// is already running.
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment for the spawned process.
    pub env: BTreeMap<String, String>,
    /// Language identifier sent in `didOpen` (e.g. "rust").
    pub language_id: String,
    /// Editor language ids that also select this server.
    pub languages: Vec<String>,
    /// File extensions without the dot (e.g. `["rs"]`).
    pub file_extensions: Vec<String>,
    /// Files that mark a project root (e.g. `["Cargo.toml"]`).
    pub root_markers: Vec<String>,
    pub tcp: Option<TcpEndpoint>,
    pub initialization_options: Option<Value>,
    pub enabled: bool,
    file_patterns: Vec<String>,
    file_globs: GlobSet,
}

impl TryFrom<RawServerConfig> for ServerConfig {
    type Error = ServerConfigError;

    fn try_from(raw: RawServerConfig) -> Result<Self, Self::Error> {
        if raw.command.is_empty() && raw.tcp.is_none() {
            return Err(ServerConfigError::MissingCommand);
        }
        let file_globs = compile_patterns(&raw.file_patterns)?;
        Ok(Self {
            command: raw.command,
            args: raw.args,
            env: raw.env,
            language_id: raw.language_id,
            languages: raw.languages,
            file_extensions: raw.file_extensions,
            root_markers: raw.root_markers,
            tcp: raw.tcp,
            initialization_options: raw.initialization_options,
            enabled: raw.enabled,
            file_patterns: raw.file_patterns,
            file_globs,
        })
    }
}

fn compile_patterns(patterns: &[String]) -> Result<GlobSet, ServerConfigError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| ServerConfigError::InvalidPattern {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| ServerConfigError::InvalidPattern {
        pattern: patterns.join(", "),
        source,
    })
}

impl ServerConfig {
    /// A stdio server with no document selector yet.
    #[must_use]
    pub fn new(command: impl Into<String>, language_id: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            language_id: language_id.into(),
            languages: Vec::new(),
            file_extensions: Vec::new(),
            root_markers: Vec::new(),
            tcp: None,
            initialization_options: None,
            enabled: true,
            file_patterns: Vec::new(),
            file_globs: GlobSet::empty(),
        }
    }

    #[must_use]
    pub fn with_file_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.file_extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_root_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.root_markers = markers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_file_patterns<I, S>(mut self, patterns: I) -> Result<Self, ServerConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.file_patterns = patterns.into_iter().map(Into::into).collect();
        self.file_globs = compile_patterns(&self.file_patterns)?;
        Ok(self)
    }

    #[must_use]
    pub fn file_patterns(&self) -> &[String] {
        &self.file_patterns
    }

    /// Document selector: extension, glob pattern, or editor language id.
    #[must_use]
    pub fn matches(&self, path: &Path, language: Option<&str>) -> bool {
        let by_extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.file_extensions.iter().any(|e| e == ext));
        let by_language = language.is_some_and(|language| {
            language == self.language_id || self.languages.iter().any(|l| l == language)
        });
        by_extension || by_language || self.file_globs.is_match(path)
    }

    /// Language id for `didOpen`: the editor's, if this server claims it.
    #[must_use]
    pub fn language_for<'a>(&'a self, language: Option<&'a str>) -> &'a str {
        match language {
            Some(language) if self.languages.iter().any(|l| l == language) => language,
            _ => &self.language_id,
        }
    }

    /// Nearest ancestor of `file` containing a root marker, or the file's
    /// directory when no marker is found.
    #[must_use]
    pub fn find_root(&self, file: &Path) -> Option<PathBuf> {
        let start = file.parent()?;
        let found = start
            .ancestors()
            .find(|dir| self.root_markers.iter().any(|marker| dir.join(marker).exists()));
        Some(found.unwrap_or(start).to_path_buf())
    }
}

/// Lifecycle state of one configuration within a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Ready,
    Stopping,
    /// Restart was declined after a crash.
    Disabled,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub name: String,
    pub state: ServerState,
}

/// Immutable snapshot of all diagnostics, suitable for UI rendering.
///
/// Counts are computed from `files`, so they can never disagree with it.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSnapshot {
    /// Per-file diagnostics, sorted with error-containing files first.
    files: Vec<(PathBuf, Vec<Diagnostic>)>,
}

impl DiagnosticsSnapshot {
    pub(crate) fn new(files: Vec<(PathBuf, Vec<Diagnostic>)>) -> Self {
        Self { files }
    }

    /// Per-file diagnostics, sorted with error-containing files first.
    #[must_use]
    pub fn files(&self) -> &[(PathBuf, Vec<Diagnostic>)] {
        &self.files
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn count_by_severity(&self, severity: DiagnosticSeverity) -> usize {
        self.files
            .iter()
            .flat_map(|(_, items)| items)
            .filter(|d| d.severity() == severity)
            .count()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Error)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Warning)
    }

    #[must_use]
    pub fn info_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Information)
    }

    #[must_use]
    pub fn hint_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Hint)
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.files.iter().map(|(_, items)| items.len()).sum()
    }

    /// Compact status string like "E:3 W:5"; empty when there is nothing.
    #[must_use]
    pub fn status_string(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("E:{} W:{}", self.error_count(), self.warning_count())
    }
}
