//! JSON-RPC envelope and LSP message serde types.

use std::path::{Path, PathBuf};
use std::process;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_types::{Diagnostic, DiagnosticSeverity, DiagnosticTag, Point, Range};

pub(crate) const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC and LSP error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SERVER_NOT_INITIALIZED: i64 = -32002;
    pub const REQUEST_CANCELLED: i64 = -32800;
}

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

/// The `error` member of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message)
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

/// Reply to a server-initiated request. Carries exactly one of
/// `result`/`error`.
#[derive(Debug, Serialize)]
pub(crate) struct Response {
    pub jsonrpc: &'static str,
    /// Echoed verbatim; servers may use numbers or strings.
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, error: ResponseError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug)]
pub(crate) enum ResponseOutcome {
    Result(Value),
    Error(ResponseError),
    /// Both or neither of `result`/`error`, or an unparseable `error`.
    Malformed,
}

#[derive(Debug)]
pub(crate) enum Incoming {
    Response {
        id: Value,
        outcome: ResponseOutcome,
    },
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

/// Classify a decoded message. Returns `None` for messages that are neither
/// a response nor carry a method.
pub(crate) fn parse_incoming(mut message: Value) -> Option<Incoming> {
    let object = message.as_object_mut()?;
    let id = object.remove("id");
    let method = object
        .get("method")
        .and_then(Value::as_str)
        .map(String::from);
    let params = object.remove("params");

    match (id, method) {
        (Some(id), None) => {
            let result = object.remove("result");
            let error = object.remove("error");
            let outcome = match (result, error) {
                (Some(result), None) => ResponseOutcome::Result(result),
                (None, Some(error)) => serde_json::from_value(error)
                    .map(ResponseOutcome::Error)
                    .unwrap_or(ResponseOutcome::Malformed),
                _ => ResponseOutcome::Malformed,
            };
            Some(Incoming::Response { id, outcome })
        }
        (Some(id), Some(method)) => Some(Incoming::Request { id, method, params }),
        (None, Some(method)) => Some(Incoming::Notification { method, params }),
        (None, None) => None,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InitializeResult {
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
}

pub(crate) fn initialize_params(
    root_uri: &str,
    workspace_name: &str,
    initialization_options: Option<&Value>,
) -> Value {
    let mut params = serde_json::json!({
        "processId": process::id(),
        "clientInfo": {
            "name": "tether",
            "version": env!("CARGO_PKG_VERSION")
        },
        "rootUri": root_uri,
        "capabilities": {
            "general": {
                "positionEncodings": ["utf-16"]
            },
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": true
                },
                "publishDiagnostics": {
                    "relatedInformation": false,
                    "tagSupport": { "valueSet": [1, 2] }
                }
            },
            "workspace": {
                "applyEdit": true,
                "workspaceFolders": true,
                "configuration": true
            },
            "window": {
                "showMessage": {
                    "messageActionItem": { "additionalPropertiesSupport": false }
                },
                "workDoneProgress": true
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": workspace_name
        }]
    });
    if let Some(options) = initialization_options {
        params["initializationOptions"] = options.clone();
    }
    params
}

pub(crate) fn did_open_params(uri: &str, language_id: &str, version: i32, text: &str) -> Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_change_params(uri: &str, version: i32, text: &str) -> Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "version": version
        },
        "contentChanges": [{
            "text": text
        }]
    })
}

pub(crate) fn did_save_params(uri: &str, text: Option<&str>) -> Value {
    let mut params = serde_json::json!({
        "textDocument": { "uri": uri }
    });
    if let Some(text) = text {
        params["text"] = Value::from(text);
    }
    params
}

pub(crate) fn did_close_params(uri: &str) -> Value {
    serde_json::json!({
        "textDocument": { "uri": uri }
    })
}

pub(crate) fn cancel_params(id: u64) -> Value {
    serde_json::json!({ "id": id })
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    pub diagnostics: Vec<LspDiagnostic>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspDiagnostic {
    pub range: LspRange,
    pub severity: Option<u64>,
    pub source: Option<String>,
    pub message: String,
    #[serde(default)]
    pub code: Option<Value>,
    #[serde(default)]
    pub tags: Vec<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspRange {
    pub start: LspPosition,
    pub end: LspPosition,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspPosition {
    pub line: u32,
    pub character: u32,
}

impl From<&LspPosition> for Point {
    fn from(position: &LspPosition) -> Self {
        Point::new(position.line, position.character)
    }
}

impl LspDiagnostic {
    /// Convert at the wire boundary. A missing `source` falls back to the
    /// reporting server's name.
    pub fn to_diagnostic(&self, server_name: &str) -> Diagnostic {
        let severity = self
            .severity
            .and_then(DiagnosticSeverity::from_lsp)
            .unwrap_or(DiagnosticSeverity::Error);
        let range = Range::new((&self.range.start).into(), (&self.range.end).into());
        let source = self
            .source
            .clone()
            .unwrap_or_else(|| server_name.to_string());
        let tags = self
            .tags
            .iter()
            .copied()
            .filter_map(DiagnosticTag::from_lsp)
            .collect();

        let diagnostic = Diagnostic::new(severity, self.message.clone(), range, source).with_tags(tags);
        match &self.code {
            Some(Value::String(code)) => diagnostic.with_code(code.clone()),
            Some(Value::Number(code)) => diagnostic.with_code(code.to_string()),
            _ => diagnostic,
        }
    }
}

/// Severity of a `window/showMessage` or `window/logMessage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Error,
    Warning,
    Info,
    Log,
}

impl MessageType {
    #[must_use]
    pub fn from_lsp(value: u64) -> Self {
        match value {
            1 => Self::Error,
            2 => Self::Warning,
            3 => Self::Info,
            _ => Self::Log,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ShowMessageParams {
    #[serde(rename = "type")]
    pub kind: u64,
    pub message: String,
    #[serde(default)]
    pub actions: Vec<MessageActionItem>,
}

/// A button offered by `window/showMessageRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageActionItem {
    pub title: String,
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

pub(crate) fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}
