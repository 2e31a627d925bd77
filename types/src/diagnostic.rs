//! Diagnostics reported by language servers.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::position::{Point, Range};

/// Severity level for a diagnostic.
///
/// Ordered so that `Error < Warning < Information < Hint`: a smaller value is
/// more severe, which makes "at least as severe as X" a `<=` comparison.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    Error = 1,
    #[default]
    Warning = 2,
    #[serde(rename = "info", alias = "information")]
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from the wire's numeric severity (1=Error, 2=Warning, 3=Info, 4=Hint).
    ///
    /// Returns `None` for values outside the protocol-defined range.
    /// Callers (boundary code) decide the fallback policy.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    /// Whether `self` is at least as severe as `threshold`.
    #[must_use]
    pub fn at_least(self, threshold: Self) -> bool {
        self <= threshold
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown diagnostic severity: {0:?}")]
pub struct ParseSeverityError(String);

impl FromStr for DiagnosticSeverity {
    type Err = ParseSeverityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warning" => Ok(Self::Warning),
            "info" | "information" => Ok(Self::Information),
            "hint" => Ok(Self::Hint),
            _ => Err(ParseSeverityError(s.to_string())),
        }
    }
}

impl fmt::Display for DiagnosticSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Extra rendering hints attached to a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticTag {
    Unnecessary,
    Deprecated,
}

impl DiagnosticTag {
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Unnecessary),
            2 => Some(Self::Deprecated),
            _ => None,
        }
    }
}

/// A single diagnostic from a language server.
///
/// Fields are private; values are fixed at construction. Consumers read via
/// accessors.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Diagnostic {
    severity: DiagnosticSeverity,
    message: String,
    range: Range,
    /// Source of the diagnostic (e.g. "rustc", "clippy").
    /// Resolved to a concrete string at the boundary.
    source: String,
    code: Option<String>,
    tags: Vec<DiagnosticTag>,
}

impl Diagnostic {
    #[must_use]
    pub fn new(
        severity: DiagnosticSeverity,
        message: impl Into<String>,
        range: Range,
        source: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            message: message.into(),
            range,
            source: source.into(),
            code: None,
            tags: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: Vec<DiagnosticTag>) -> Self {
        self.tags = tags;
        self
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn range(&self) -> Range {
        self.range
    }

    /// Start of the range; the sort key for navigation.
    #[must_use]
    pub fn start(&self) -> Point {
        self.range.start
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    #[must_use]
    pub fn tags(&self) -> &[DiagnosticTag] {
        &self.tags
    }

    /// Format as `path:line:col: severity: [source] message` (1-indexed for display).
    #[must_use]
    pub fn display_with_path(&self, path: &Path) -> String {
        format!(
            "{}:{}: {}: [{}] {}",
            path.display(),
            self.range.start,
            self.severity.label(),
            self.source,
            self.message,
        )
    }
}
