//! One session per language server: handshake, document sync, shutdown.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tokio::process::Child;
use tokio::time;

use crate::capabilities::{Capabilities, Capability, TextDocumentSyncKind};
use crate::protocol::{self, InitializeResult, MessageType, PathToUriError, ResponseError, ServerInfo};
use crate::rpc::{PendingResponse, RequestError, RpcClient};
use crate::transport::TransportError;
use crate::types::ServerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// `initialize` sent, no answer yet.
    Starting,
    Ready,
    /// `shutdown` requested; capabilities are gone.
    Stopping,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum InitializeError {
    #[error("no initialize response within {0:?}")]
    Timeout(Duration),
    #[error("server rejected initialize: {0}")]
    Rejected(ResponseError),
    #[error("connection closed during initialize")]
    TransportClosed,
    #[error("invalid initialize response: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    InvalidRoot(#[from] PathToUriError),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session '{name}' is not ready ({state:?})")]
    NotReady { name: String, state: SessionState },
    #[error("{} is not open in session '{name}'", .path.display())]
    NotOpen { name: String, path: PathBuf },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Uri(#[from] PathToUriError),
}

/// Server-side view of one open document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentState {
    path: PathBuf,
    uri: String,
    language_id: String,
    version: i32,
}

impl DocumentState {
    fn new(path: PathBuf, uri: String, language_id: String) -> Self {
        Self {
            path,
            uri,
            language_id,
            version: 0,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    #[must_use]
    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    #[must_use]
    pub fn version(&self) -> i32 {
        self.version
    }

    /// Bump and return the version.
    pub fn inc_version(&mut self) -> i32 {
        self.version += 1;
        self.version
    }
}

/// What the server answered to `initialize`.
#[derive(Debug, Clone)]
pub struct InitializeOutcome {
    pub capabilities: Capabilities,
    pub server_info: Option<ServerInfo>,
}

/// The in-flight `initialize` request.
#[must_use = "the session stays in Starting until the handshake completes"]
pub struct InitializeHandshake {
    response: PendingResponse,
    timeout: Duration,
}

impl InitializeHandshake {
    pub async fn wait(self) -> Result<InitializeOutcome, InitializeError> {
        let Self { response, timeout } = self;
        let value = response.recv_timeout(timeout).await.map_err(|e| match e {
            RequestError::TimedOut => InitializeError::Timeout(timeout),
            RequestError::Server(error) => InitializeError::Rejected(error),
            RequestError::NoResponse => {
                InitializeError::InvalidResponse("malformed response".to_string())
            }
            RequestError::TransportClosed
            | RequestError::SessionEnded
            | RequestError::Serialize(_) => InitializeError::TransportClosed,
        })?;
        let result: InitializeResult = serde_json::from_value(value)
            .map_err(|e| InitializeError::InvalidResponse(e.to_string()))?;
        Ok(InitializeOutcome {
            capabilities: Capabilities::new(result.capabilities),
            server_info: result.server_info,
        })
    }
}

pub struct Session {
    name: String,
    config: ServerConfig,
    root: PathBuf,
    state: SessionState,
    capabilities: Capabilities,
    server_info: Option<ServerInfo>,
    client: RpcClient,
    documents: HashMap<PathBuf, DocumentState>,
    process: Option<Child>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("root", &self.root)
            .field("documents", &self.documents.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Register session-level handlers and send `initialize`.
    ///
    /// The session stays in [`SessionState::Starting`] until
    /// [`complete_initialize`](Self::complete_initialize) is called with the
    /// handshake's outcome.
    pub fn start(
        name: impl Into<String>,
        config: ServerConfig,
        client: RpcClient,
        root: &Path,
        initialize_timeout: Duration,
    ) -> Result<(Self, InitializeHandshake), InitializeError> {
        let name = name.into();
        let root_uri = protocol::path_to_file_uri(root)?;
        let workspace_name = root
            .file_name()
            .map_or_else(|| root.display().to_string(), |n| n.to_string_lossy().into_owned());

        register_session_handlers(&client, &name);

        let params = protocol::initialize_params(
            root_uri.as_str(),
            &workspace_name,
            config.initialization_options.as_ref(),
        );
        tracing::info!(server = %name, root = %root.display(), "Initializing");
        let response = client.request("initialize", Some(params));

        let session = Self {
            name,
            config,
            root: root.to_path_buf(),
            state: SessionState::Starting,
            capabilities: Capabilities::default(),
            server_info: None,
            client,
            documents: HashMap::new(),
            process: None,
        };
        let handshake = InitializeHandshake {
            response,
            timeout: initialize_timeout,
        };
        Ok((session, handshake))
    }

    /// Attach the server process so `end` can reap it.
    pub fn set_process(&mut self, child: Child) {
        self.process = Some(child);
    }

    /// Store capabilities, send `initialized`, enter READY.
    pub fn complete_initialize(&mut self, outcome: InitializeOutcome) -> Result<(), SessionError> {
        if self.state != SessionState::Starting {
            return Err(self.not_ready());
        }
        self.client
            .notify("initialized", Some(serde_json::json!({})))?;
        self.capabilities = outcome.capabilities;
        self.server_info = outcome.server_info;
        self.state = SessionState::Ready;
        tracing::info!(
            server = %self.name,
            server_name = self.server_info.as_ref().map(|i| i.name.as_str()),
            "Ready"
        );
        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    #[must_use]
    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    /// Capabilities are only visible while READY.
    #[must_use]
    pub fn capabilities(&self) -> Option<&Capabilities> {
        (self.state == SessionState::Ready).then_some(&self.capabilities)
    }

    #[must_use]
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities().is_some_and(|c| c.has(capability))
    }

    #[must_use]
    pub fn get_capability(&self, capability: Capability) -> Option<&Value> {
        self.capabilities()?.value(capability)
    }

    #[must_use]
    pub fn document_state(&self, path: &Path) -> Option<&DocumentState> {
        self.documents.get(path)
    }

    #[must_use]
    pub fn is_open(&self, path: &Path) -> bool {
        self.documents.contains_key(path)
    }

    fn not_ready(&self) -> SessionError {
        SessionError::NotReady {
            name: self.name.clone(),
            state: self.state,
        }
    }

    fn ensure_ready(&self) -> Result<(), SessionError> {
        if self.state == SessionState::Ready {
            Ok(())
        } else {
            Err(self.not_ready())
        }
    }

    /// Send an arbitrary request (hover, completion, ...).
    pub fn request(&self, method: &str, params: Option<Value>) -> Result<PendingResponse, SessionError> {
        self.ensure_ready()?;
        Ok(self.client.request(method, params))
    }

    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), SessionError> {
        self.ensure_ready()?;
        Ok(self.client.notify(method, params)?)
    }

    /// Send `didOpen` at version 0. Opening an open document is a no-op.
    pub fn did_open(&mut self, path: &Path, language_id: &str, text: &str) -> Result<(), SessionError> {
        self.ensure_ready()?;
        if self.documents.contains_key(path) {
            return Ok(());
        }
        let uri = protocol::path_to_file_uri(path)?.to_string();
        let document = DocumentState::new(path.to_path_buf(), uri, language_id.to_string());
        let params = protocol::did_open_params(document.uri(), language_id, document.version(), text);
        self.client.notify("textDocument/didOpen", Some(params))?;
        tracing::debug!(server = %self.name, path = %path.display(), "didOpen");
        self.documents.insert(path.to_path_buf(), document);
        Ok(())
    }

    /// Send the full text as `didChange`. Returns the new version, or `None`
    /// when the server asked for no sync.
    pub fn did_change(&mut self, path: &Path, text: &str) -> Result<Option<i32>, SessionError> {
        self.ensure_ready()?;
        if self.capabilities.text_sync_kind() == TextDocumentSyncKind::None {
            return Ok(None);
        }
        let name = &self.name;
        let document = self
            .documents
            .get_mut(path)
            .ok_or_else(|| SessionError::NotOpen {
                name: name.clone(),
                path: path.to_path_buf(),
            })?;
        let version = document.version() + 1;
        let params = protocol::did_change_params(document.uri(), version, text);
        self.client.notify("textDocument/didChange", Some(params))?;
        document.inc_version();
        tracing::trace!(server = %self.name, path = %path.display(), version, "didChange");
        Ok(Some(version))
    }

    /// Send `didSave` if the server wants it. Returns whether it was sent.
    pub fn did_save(&mut self, path: &Path, text: &str) -> Result<bool, SessionError> {
        self.ensure_ready()?;
        let Some(include_text) = self.capabilities.save_notification() else {
            return Ok(false);
        };
        let document = self.documents.get(path).ok_or_else(|| SessionError::NotOpen {
            name: self.name.clone(),
            path: path.to_path_buf(),
        })?;
        let params = protocol::did_save_params(document.uri(), include_text.then_some(text));
        self.client.notify("textDocument/didSave", Some(params))?;
        Ok(true)
    }

    /// Send `didClose` and forget the document. Closing an unknown document
    /// is a no-op.
    pub fn did_close(&mut self, path: &Path) -> Result<(), SessionError> {
        self.ensure_ready()?;
        let Some(document) = self.documents.remove(path) else {
            return Ok(());
        };
        self.client
            .notify("textDocument/didClose", Some(protocol::did_close_params(document.uri())))?;
        tracing::debug!(server = %self.name, path = %path.display(), "didClose");
        Ok(())
    }

    /// Shut the server down and reach the terminal state.
    ///
    /// Pending requests fail with [`RequestError::SessionEnded`] as soon as
    /// STOPPING is entered. `exit` follows `shutdown` whether it succeeded or
    /// timed out. The process gets `timeout` to exit before it is killed.
    pub async fn end(&mut self, timeout: Duration) {
        if matches!(self.state, SessionState::Stopping | SessionState::Stopped) {
            return;
        }
        self.state = SessionState::Stopping;
        self.documents.clear();
        let failed = self.client.fail_pending(&RequestError::SessionEnded);
        tracing::info!(server = %self.name, failed, "Shutting down");

        if !self.client.is_closed() {
            match self.client.request("shutdown", None).recv_timeout(timeout).await {
                Ok(_) => {}
                Err(e) => tracing::debug!(server = %self.name, "shutdown request: {e}"),
            }
            if let Err(e) = self.client.notify_exit() {
                tracing::debug!(server = %self.name, "exit notification: {e}");
            }
            self.client.close();
        }

        if let Some(mut child) = self.process.take() {
            match time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!(server = %self.name, %status, "Process exited"),
                Ok(Err(e)) => tracing::warn!(server = %self.name, "Waiting for process: {e}"),
                Err(_) => {
                    tracing::debug!(server = %self.name, "Process didn't exit in time, killing");
                    let _ = child.kill().await;
                }
            }
        }
        self.state = SessionState::Stopped;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state != SessionState::Stopped {
            self.client.close();
        }
    }
}

fn register_session_handlers(client: &RpcClient, name: &str) {
    let server = name.to_string();
    client.on_notification("window/logMessage", move |params| {
        let params: LogMessageParams = serde_json::from_value(params.unwrap_or_default())?;
        match MessageType::from_lsp(params.kind) {
            MessageType::Error => tracing::error!(server = %server, "{}", params.message),
            MessageType::Warning => tracing::warn!(server = %server, "{}", params.message),
            MessageType::Info => tracing::info!(server = %server, "{}", params.message),
            MessageType::Log => tracing::debug!(server = %server, "{}", params.message),
        }
        Ok(())
    });
    client.on_notification("$/progress", |_| Ok(()));
    client.on_request("window/workDoneProgress/create", |_| Ok(Value::Null));
}

#[derive(serde::Deserialize)]
struct LogMessageParams {
    #[serde(rename = "type")]
    kind: u64,
    message: String,
}
