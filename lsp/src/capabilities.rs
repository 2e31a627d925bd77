//! Server capabilities negotiated during the `initialize` handshake.
//!
//! The server's capability document is kept as semi-structured JSON and
//! queried by dotted path. The public surface only accepts the closed set of
//! keys in [`Capability`].

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

/// Capability keys the client knows how to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    TextDocumentSync,
    TextDocumentSyncChange,
    TextDocumentSyncSave,
    TextDocumentSyncSaveIncludeText,
    HoverProvider,
    CompletionProvider,
    CompletionTriggerCharacters,
    CompletionResolveProvider,
    SignatureHelpProvider,
    SignatureHelpTriggerCharacters,
    DefinitionProvider,
    TypeDefinitionProvider,
    ImplementationProvider,
    ReferencesProvider,
    DocumentHighlightProvider,
    DocumentSymbolProvider,
    WorkspaceSymbolProvider,
    CodeActionProvider,
    CodeLensProvider,
    DocumentFormattingProvider,
    DocumentRangeFormattingProvider,
    RenameProvider,
    ColorProvider,
    ExecuteCommandProvider,
    WorkspaceFolders,
}

impl Capability {
    pub const ALL: [Self; 25] = [
        Self::TextDocumentSync,
        Self::TextDocumentSyncChange,
        Self::TextDocumentSyncSave,
        Self::TextDocumentSyncSaveIncludeText,
        Self::HoverProvider,
        Self::CompletionProvider,
        Self::CompletionTriggerCharacters,
        Self::CompletionResolveProvider,
        Self::SignatureHelpProvider,
        Self::SignatureHelpTriggerCharacters,
        Self::DefinitionProvider,
        Self::TypeDefinitionProvider,
        Self::ImplementationProvider,
        Self::ReferencesProvider,
        Self::DocumentHighlightProvider,
        Self::DocumentSymbolProvider,
        Self::WorkspaceSymbolProvider,
        Self::CodeActionProvider,
        Self::CodeLensProvider,
        Self::DocumentFormattingProvider,
        Self::DocumentRangeFormattingProvider,
        Self::RenameProvider,
        Self::ColorProvider,
        Self::ExecuteCommandProvider,
        Self::WorkspaceFolders,
    ];

    /// Dotted path into the server's capability document.
    #[must_use]
    pub fn path(self) -> &'static str {
        match self {
            Self::TextDocumentSync => "textDocumentSync",
            Self::TextDocumentSyncChange => "textDocumentSync.change",
            Self::TextDocumentSyncSave => "textDocumentSync.save",
            Self::TextDocumentSyncSaveIncludeText => "textDocumentSync.save.includeText",
            Self::HoverProvider => "hoverProvider",
            Self::CompletionProvider => "completionProvider",
            Self::CompletionTriggerCharacters => "completionProvider.triggerCharacters",
            Self::CompletionResolveProvider => "completionProvider.resolveProvider",
            Self::SignatureHelpProvider => "signatureHelpProvider",
            Self::SignatureHelpTriggerCharacters => "signatureHelpProvider.triggerCharacters",
            Self::DefinitionProvider => "definitionProvider",
            Self::TypeDefinitionProvider => "typeDefinitionProvider",
            Self::ImplementationProvider => "implementationProvider",
            Self::ReferencesProvider => "referencesProvider",
            Self::DocumentHighlightProvider => "documentHighlightProvider",
            Self::DocumentSymbolProvider => "documentSymbolProvider",
            Self::WorkspaceSymbolProvider => "workspaceSymbolProvider",
            Self::CodeActionProvider => "codeActionProvider",
            Self::CodeLensProvider => "codeLensProvider",
            Self::DocumentFormattingProvider => "documentFormattingProvider",
            Self::DocumentRangeFormattingProvider => "documentRangeFormattingProvider",
            Self::RenameProvider => "renameProvider",
            Self::ColorProvider => "colorProvider",
            Self::ExecuteCommandProvider => "executeCommandProvider",
            Self::WorkspaceFolders => "workspace.workspaceFolders",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown capability: {0:?}")]
pub struct UnknownCapability(String);

impl FromStr for Capability {
    type Err = UnknownCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|capability| capability.path() == s)
            .ok_or_else(|| UnknownCapability(s.to_string()))
    }
}

/// Text synchronization mode declared by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextDocumentSyncKind {
    None,
    Full,
    Incremental,
}

/// Read-only capability document. Absence of a key means "not supported".
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    raw: Value,
}

impl Capabilities {
    #[must_use]
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    /// Dotted-path lookup (`"completionProvider.triggerCharacters"`).
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.raw, |node, key| node.as_object()?.get(key))
    }

    /// A capability is present when its value exists and is neither `false`
    /// nor `null`.
    #[must_use]
    pub fn has(&self, capability: Capability) -> bool {
        self.get(capability.path())
            .is_some_and(|value| !matches!(value, Value::Null | Value::Bool(false)))
    }

    #[must_use]
    pub fn value(&self, capability: Capability) -> Option<&Value> {
        self.get(capability.path())
    }

    /// `textDocumentSync` may be a bare kind number or an options object.
    #[must_use]
    pub fn text_sync_kind(&self) -> TextDocumentSyncKind {
        let kind = match self.value(Capability::TextDocumentSync) {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::Object(_)) => self
                .value(Capability::TextDocumentSyncChange)
                .and_then(Value::as_u64),
            _ => None,
        };
        match kind {
            Some(0) => TextDocumentSyncKind::None,
            Some(2) => TextDocumentSyncKind::Incremental,
            // Servers that omit the kind still get full-content updates.
            _ => TextDocumentSyncKind::Full,
        }
    }

    /// Whether the server wants `didSave`, and whether it wants the text.
    #[must_use]
    pub fn save_notification(&self) -> Option<bool> {
        match self.value(Capability::TextDocumentSyncSave)? {
            Value::Bool(true) => Some(false),
            Value::Object(_) => Some(
                self.value(Capability::TextDocumentSyncSaveIncludeText)
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            ),
            _ => None,
        }
    }

    #[must_use]
    pub fn raw(&self) -> &Value {
        &self.raw
    }
}
