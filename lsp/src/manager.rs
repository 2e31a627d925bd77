//! Window manager: every language server session for one editor window.
//!
//! The host drives the manager from its own loop: document events go in
//! through `open_view`/`change_document`/`save_document`/`close_view`, and
//! `poll_events` drains what the servers sent since the last tick. Server
//! tasks never touch manager state directly; they forward into the window
//! event channel.
//!
//! A configuration occupies at most one slot per window. A slot is created
//! when a matching document opens and removed when its session ends, crashes
//! or fails to start.

use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use indexmap::IndexMap;
use serde_json::Value;
use tether_types::Diagnostic;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};

use crate::cursor::DiagnosticsCursor;
use crate::diagnostics::DiagnosticsStorage;
use crate::launcher::{LaunchError, ServerLauncher};
use crate::protocol::{self, MessageActionItem, MessageType, PublishDiagnosticsParams, ResponseError, ShowMessageParams};
use crate::rpc::RpcClient;
use crate::session::{InitializeError, InitializeOutcome, Session, SessionState};
use crate::transport::CloseReason;
use crate::types::{DiagnosticsSnapshot, LspConfig, ServerConfig, ServerState, ServerStatus};

/// Applies `workspace/applyEdit` requests to the editor's buffers.
pub trait EditApplier: Send + Sync {
    /// Returns whether the edit was applied.
    fn apply_edit(&self, edit: &Value, label: Option<&str>) -> bool;
}

/// Shows server messages and prompts to the user.
///
/// Every method is called from [`WindowManager::poll_events`] or
/// [`WindowManager::wait_for_activity`] on the host's own task.
pub trait MessagePresenter: Send + Sync {
    fn show_message(&self, server: &str, kind: MessageType, message: &str);

    /// Present a prompt. The server gets its answer when `reply` is used,
    /// which may be long after this returns.
    fn show_message_request(
        &self,
        server: &str,
        kind: MessageType,
        message: &str,
        actions: &[MessageActionItem],
        reply: MessageReply,
    );

    /// Asked after a server dies unexpectedly. `true` restarts every
    /// session in the window.
    fn confirm_restart(&self, server: &str, reason: &CloseReason) -> bool;

    fn diagnostics_changed(&self, _path: &Path) {}
}

/// Collaborators for hosts without a UI: edits are refused, messages go to
/// the log and restarts are declined.
#[derive(Debug, Default, Clone, Copy)]
pub struct Headless;

impl EditApplier for Headless {
    fn apply_edit(&self, _edit: &Value, label: Option<&str>) -> bool {
        tracing::debug!(label, "Refusing workspace edit");
        false
    }
}

impl MessagePresenter for Headless {
    fn show_message(&self, server: &str, kind: MessageType, message: &str) {
        match kind {
            MessageType::Error => tracing::error!(server, "{message}"),
            MessageType::Warning => tracing::warn!(server, "{message}"),
            MessageType::Info | MessageType::Log => tracing::info!(server, "{message}"),
        }
    }

    fn show_message_request(
        &self,
        server: &str,
        kind: MessageType,
        message: &str,
        _actions: &[MessageActionItem],
        reply: MessageReply,
    ) {
        self.show_message(server, kind, message);
        reply.choose(None);
    }

    fn confirm_restart(&self, _server: &str, _reason: &CloseReason) -> bool {
        false
    }
}

/// The pending answer to a `window/showMessageRequest`. Dropping it answers
/// with no choice.
#[derive(Debug)]
pub struct MessageReply {
    tx: oneshot::Sender<Option<MessageActionItem>>,
}

impl MessageReply {
    fn channel() -> (Self, oneshot::Receiver<Option<MessageActionItem>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn choose(self, action: Option<MessageActionItem>) {
        let _ = self.tx.send(action);
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub edits: Arc<dyn EditApplier>,
    pub presenter: Arc<dyn MessagePresenter>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            edits: Arc::new(Headless),
            presenter: Arc::new(Headless),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Initialize(#[from] InitializeError),
}

#[derive(Debug, thiserror::Error)]
pub enum WindowError {
    #[error("{} is not open", .0.display())]
    NotOpen(PathBuf),
    #[error("window is closing")]
    Closing,
}

enum WindowEvent {
    Started {
        name: String,
        generation: u64,
        result: Result<(Session, InitializeOutcome), StartError>,
    },
    Diagnostics {
        name: String,
        generation: u64,
        path: PathBuf,
        diagnostics: Vec<Diagnostic>,
    },
    ShowMessage {
        name: String,
        kind: MessageType,
        message: String,
    },
    ShowMessageRequest {
        name: String,
        kind: MessageType,
        message: String,
        actions: Vec<MessageActionItem>,
        reply: MessageReply,
    },
    Crashed {
        name: String,
        generation: u64,
        reason: CloseReason,
    },
    Ended {
        name: String,
        generation: u64,
    },
}

enum Slot {
    Starting { generation: u64 },
    Running { generation: u64, session: Session },
}

impl Slot {
    fn generation(&self) -> u64 {
        match self {
            Self::Starting { generation } | Self::Running { generation, .. } => *generation,
        }
    }
}

struct OpenDocument {
    language: Option<String>,
    text: String,
    views: usize,
}

pub struct WindowManager {
    config: LspConfig,
    launcher: Arc<dyn ServerLauncher>,
    collaborators: Collaborators,
    folders: Vec<PathBuf>,
    slots: BTreeMap<String, Slot>,
    /// Generations being torn down, including starts whose result has not
    /// arrived yet.
    ending: HashMap<u64, String>,
    /// Configurations that must not start until the next restart or root
    /// change (`Disabled` or `Failed`).
    blocked: BTreeMap<String, ServerState>,
    documents: IndexMap<PathBuf, OpenDocument>,
    /// Per-buffer debounce deadlines; the text lives in `documents`.
    pending_changes: HashMap<PathBuf, Instant>,
    diagnostics: DiagnosticsStorage,
    next_generation: u64,
    event_tx: mpsc::UnboundedSender<WindowEvent>,
    event_rx: mpsc::UnboundedReceiver<WindowEvent>,
    closing: bool,
}

impl WindowManager {
    #[must_use]
    pub fn new(config: LspConfig, launcher: Arc<dyn ServerLauncher>, collaborators: Collaborators) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            config,
            launcher,
            collaborators,
            folders: Vec::new(),
            slots: BTreeMap::new(),
            ending: HashMap::new(),
            blocked: BTreeMap::new(),
            documents: IndexMap::new(),
            pending_changes: HashMap::new(),
            diagnostics: DiagnosticsStorage::new(),
            next_generation: 1,
            event_tx,
            event_rx,
            closing: false,
        }
    }

    #[must_use]
    pub fn config(&self) -> &LspConfig {
        &self.config
    }

    #[must_use]
    pub fn folders(&self) -> &[PathBuf] {
        &self.folders
    }

    /// Replace the window's folders. The first one is the workspace root; if
    /// it changes while sessions exist, they are all ended and restarted
    /// against the new root once they have stopped.
    pub fn set_folders(&mut self, folders: Vec<PathBuf>) {
        let root_changed = self.folders.first() != folders.first();
        self.folders = folders;
        if !root_changed || self.closing {
            return;
        }
        self.blocked.clear();
        if !self.slots.is_empty() {
            tracing::info!(root = ?self.folders.first(), "Workspace root changed, restarting servers");
            self.end_all_sessions();
        }
        self.start_active_views();
    }

    // ── documents ───────────────────────────────────────────────────────

    /// A view of `path` became visible. The first view opens the document
    /// and starts any matching servers.
    pub fn open_view(
        &mut self,
        path: impl Into<PathBuf>,
        language: Option<&str>,
        text: impl Into<String>,
    ) -> Result<(), WindowError> {
        if self.closing {
            return Err(WindowError::Closing);
        }
        let path = path.into();
        if let Some(document) = self.documents.get_mut(&path) {
            document.views += 1;
            return Ok(());
        }
        self.documents.insert(
            path.clone(),
            OpenDocument {
                language: language.map(str::to_string),
                text: text.into(),
                views: 1,
            },
        );
        self.activate_view(&path);
        Ok(())
    }

    /// Record an edit. The text reaches servers after the quiet period.
    pub fn change_document(&mut self, path: &Path, text: impl Into<String>) -> Result<(), WindowError> {
        let document = self
            .documents
            .get_mut(path)
            .ok_or_else(|| WindowError::NotOpen(path.to_path_buf()))?;
        document.text = text.into();
        let deadline = Instant::now() + self.config.change_debounce();
        self.pending_changes.insert(path.to_path_buf(), deadline);
        Ok(())
    }

    /// Flush any pending edit, then send `didSave` to servers that want it.
    pub fn save_document(&mut self, path: &Path) -> Result<(), WindowError> {
        if !self.documents.contains_key(path) {
            return Err(WindowError::NotOpen(path.to_path_buf()));
        }
        if self.pending_changes.remove(path).is_some() {
            self.send_change(path);
        }
        let Some(document) = self.documents.get(path) else {
            return Ok(());
        };
        for session in running_sessions(&mut self.slots) {
            if !session.is_open(path) {
                continue;
            }
            if let Err(e) = session.did_save(path, &document.text) {
                tracing::warn!(server = %session.name(), path = %path.display(), "didSave failed: {e}");
            }
        }
        Ok(())
    }

    /// A view of `path` closed. The last view closes the document in every
    /// session and clears its diagnostics.
    pub fn close_view(&mut self, path: &Path) -> Result<(), WindowError> {
        let document = self
            .documents
            .get_mut(path)
            .ok_or_else(|| WindowError::NotOpen(path.to_path_buf()))?;
        document.views -= 1;
        if document.views > 0 {
            return Ok(());
        }
        self.documents.shift_remove(path);
        self.pending_changes.remove(path);
        for session in running_sessions(&mut self.slots) {
            if let Err(e) = session.did_close(path) {
                tracing::warn!(server = %session.name(), path = %path.display(), "didClose failed: {e}");
            }
        }
        if self.diagnostics.remove_file(path) {
            self.collaborators.presenter.diagnostics_changed(path);
        }
        Ok(())
    }

    #[must_use]
    pub fn is_open(&self, path: &Path) -> bool {
        self.documents.contains_key(path)
    }

    /// Start matching servers for every open document.
    pub fn start_active_views(&mut self) {
        let paths: Vec<PathBuf> = self.documents.keys().cloned().collect();
        for path in paths {
            self.activate_view(&path);
        }
    }

    /// Make sure every configuration matching `path` has a session: open the
    /// document in ready sessions, start missing ones.
    pub fn activate_view(&mut self, path: &Path) {
        if self.closing || !self.config.enabled {
            return;
        }
        let Some(language) = self.documents.get(path).map(|d| d.language.clone()) else {
            return;
        };
        let language = language.as_deref();
        let matching: Vec<(String, ServerConfig)> = self
            .config
            .servers_for(path, language)
            .map(|(name, config)| (name.to_string(), config.clone()))
            .collect();

        for (name, config) in matching {
            match self.slots.get_mut(&name) {
                Some(Slot::Running { session, .. }) => {
                    let Some(document) = self.documents.get(path) else {
                        continue;
                    };
                    if session.state() == SessionState::Ready && !session.is_open(path) {
                        let language_id = config.language_for(language);
                        if let Err(e) = session.did_open(path, language_id, &document.text) {
                            tracing::warn!(server = %name, path = %path.display(), "didOpen failed: {e}");
                        }
                    }
                }
                Some(Slot::Starting { .. }) => {}
                None => {
                    if self.blocked.contains_key(&name) || self.ending.values().any(|n| *n == name) {
                        continue;
                    }
                    let root = self
                        .folders
                        .first()
                        .cloned()
                        .or_else(|| config.find_root(path));
                    match root {
                        Some(root) => self.start_session(name, config, root),
                        None => tracing::warn!(server = %name, path = %path.display(), "No workspace root"),
                    }
                }
            }
        }
    }

    fn start_session(&mut self, name: String, config: ServerConfig, root: PathBuf) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.slots.insert(name.clone(), Slot::Starting { generation });
        tracing::info!(server = %name, generation, root = %root.display(), "Starting server");

        let launcher = self.launcher.clone();
        let collaborators = self.collaborators.clone();
        let event_tx = self.event_tx.clone();
        let initialize_timeout = self.config.initialize_timeout();
        let shutdown_timeout = self.config.shutdown_timeout();
        tokio::spawn(async move {
            let handlers = WindowHandlers {
                name: &name,
                generation,
                root: &root,
                event_tx: &event_tx,
                collaborators: &collaborators,
            };
            let result = launch_session(
                launcher.as_ref(),
                config,
                handlers,
                initialize_timeout,
                shutdown_timeout,
            )
            .await;
            let _ = event_tx.send(WindowEvent::Started {
                name,
                generation,
                result,
            });
        });
    }

    fn end_session(&mut self, name: String, generation: u64, mut session: Session) {
        for path in self.diagnostics.remove_server(&name) {
            self.collaborators.presenter.diagnostics_changed(&path);
        }
        self.ending.insert(generation, name.clone());
        let timeout = self.config.shutdown_timeout();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            session.end(timeout).await;
            let _ = event_tx.send(WindowEvent::Ended { name, generation });
        });
    }

    fn end_all_sessions(&mut self) {
        let slots = mem::take(&mut self.slots);
        for (name, slot) in slots {
            match slot {
                Slot::Starting { generation } => {
                    for path in self.diagnostics.remove_server(&name) {
                        self.collaborators.presenter.diagnostics_changed(&path);
                    }
                    self.ending.insert(generation, name);
                }
                Slot::Running { generation, session } => self.end_session(name, generation, session),
            }
        }
    }

    // ── events ──────────────────────────────────────────────────────────

    /// Drain up to `budget` pending events without blocking, then send
    /// debounced changes whose quiet period has elapsed. Returns the number
    /// of events handled.
    pub fn poll_events(&mut self, budget: usize) -> usize {
        let mut count = 0;
        while count < budget {
            match self.event_rx.try_recv() {
                Ok(event) => {
                    self.handle_event(event);
                    count += 1;
                }
                Err(mpsc::error::TryRecvError::Empty | mpsc::error::TryRecvError::Disconnected) => {
                    break;
                }
            }
        }
        self.flush_due_changes(Instant::now());
        count
    }

    /// Wait for the next event or debounce deadline and handle it.
    pub async fn wait_for_activity(&mut self) {
        let deadline = self.next_change_deadline();
        let event = match deadline {
            Some(deadline) => tokio::select! {
                event = self.event_rx.recv() => event,
                () = sleep_until(deadline) => None,
            },
            None => self.event_rx.recv().await,
        };
        if let Some(event) = event {
            self.handle_event(event);
        }
        self.flush_due_changes(Instant::now());
    }

    /// When the earliest pending edit becomes due.
    #[must_use]
    pub fn next_change_deadline(&self) -> Option<Instant> {
        self.pending_changes.values().min().copied()
    }

    /// Send every pending edit now.
    pub fn flush_changes(&mut self) {
        let paths: Vec<PathBuf> = self.pending_changes.drain().map(|(path, _)| path).collect();
        for path in paths {
            self.send_change(&path);
        }
    }

    fn flush_due_changes(&mut self, now: Instant) {
        let due: Vec<PathBuf> = self
            .pending_changes
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in due {
            self.pending_changes.remove(&path);
            self.send_change(&path);
        }
    }

    fn send_change(&mut self, path: &Path) {
        let Some(document) = self.documents.get(path) else {
            return;
        };
        for session in running_sessions(&mut self.slots) {
            if !session.is_open(path) {
                continue;
            }
            if let Err(e) = session.did_change(path, &document.text) {
                tracing::warn!(server = %session.name(), path = %path.display(), "didChange failed: {e}");
            }
        }
    }

    fn is_current(&self, name: &str, generation: u64) -> bool {
        self.slots
            .get(name)
            .is_some_and(|slot| slot.generation() == generation)
    }

    fn handle_event(&mut self, event: WindowEvent) {
        match event {
            WindowEvent::Started {
                name,
                generation,
                result,
            } => self.handle_started(name, generation, result),
            WindowEvent::Diagnostics {
                name,
                generation,
                path,
                diagnostics,
            } => {
                if !self.is_current(&name, generation) {
                    tracing::trace!(server = %name, generation, "Dropping diagnostics from stale session");
                    return;
                }
                tracing::debug!(
                    server = %name,
                    path = %path.display(),
                    count = diagnostics.len(),
                    "Diagnostics updated"
                );
                self.diagnostics.receive(&name, path.clone(), diagnostics);
                self.collaborators.presenter.diagnostics_changed(&path);
            }
            WindowEvent::ShowMessage {
                name,
                kind,
                message,
            } => self.collaborators.presenter.show_message(&name, kind, &message),
            WindowEvent::ShowMessageRequest {
                name,
                kind,
                message,
                actions,
                reply,
            } => self
                .collaborators
                .presenter
                .show_message_request(&name, kind, &message, &actions, reply),
            WindowEvent::Crashed {
                name,
                generation,
                reason,
            } => self.handle_crashed(name, generation, &reason),
            WindowEvent::Ended { name, generation } => {
                self.ending.remove(&generation);
                tracing::debug!(server = %name, generation, "Session ended");
                self.after_ended(&name);
            }
        }
    }

    fn handle_started(
        &mut self,
        name: String,
        generation: u64,
        result: Result<(Session, InitializeOutcome), StartError>,
    ) {
        if self.ending.contains_key(&generation) || !self.is_current(&name, generation) {
            // Abandoned while starting.
            match result {
                Ok((session, _)) => self.end_session(name, generation, session),
                Err(_) => {
                    self.ending.remove(&generation);
                    self.after_ended(&name);
                }
            }
            return;
        }

        let (mut session, outcome) = match result {
            Ok(started) => started,
            Err(e) => {
                tracing::warn!(server = %name, "Failed to start: {e}");
                self.slots.remove(&name);
                self.blocked.insert(name, ServerState::Failed(e.to_string()));
                return;
            }
        };
        if let Err(e) = session.complete_initialize(outcome) {
            tracing::warn!(server = %name, "Failed to finish initialize: {e}");
            self.slots.remove(&name);
            self.blocked.insert(name.clone(), ServerState::Failed(e.to_string()));
            self.end_session(name, generation, session);
            return;
        }

        for (path, document) in &self.documents {
            if !session.config().matches(path, document.language.as_deref()) {
                continue;
            }
            let language_id = session.config().language_for(document.language.as_deref()).to_string();
            if let Err(e) = session.did_open(path, &language_id, &document.text) {
                tracing::warn!(server = %name, path = %path.display(), "didOpen failed: {e}");
            }
        }
        self.slots.insert(name, Slot::Running { generation, session });
    }

    fn handle_crashed(&mut self, name: String, generation: u64, reason: &CloseReason) {
        if !matches!(self.slots.get(&name), Some(Slot::Running { generation: g, .. }) if *g == generation) {
            return;
        }
        let Some(Slot::Running { session, .. }) = self.slots.remove(&name) else {
            return;
        };
        tracing::warn!(server = %name, %reason, "Server crashed");
        self.end_session(name.clone(), generation, session);

        if self.closing {
            return;
        }
        if self.collaborators.presenter.confirm_restart(&name, reason) {
            tracing::info!(server = %name, "Restarting all servers in window");
            self.blocked.clear();
            self.end_all_sessions();
            self.start_active_views();
        } else {
            self.blocked.insert(name, ServerState::Disabled);
        }
    }

    /// Once the last generation of `name` is gone, its configuration may
    /// start again.
    fn after_ended(&mut self, name: &str) {
        if self.closing || self.ending.values().any(|n| n == name) {
            return;
        }
        self.start_active_views();
    }

    // ── teardown ────────────────────────────────────────────────────────

    /// End every session. The manager is finished once they all stopped.
    pub fn close_window(&mut self) {
        if self.closing {
            return;
        }
        tracing::info!(sessions = self.slots.len(), "Closing window");
        self.closing = true;
        self.pending_changes.clear();
        self.end_all_sessions();
    }

    /// All sessions reached their terminal state after `close_window`.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.closing && self.slots.is_empty() && self.ending.is_empty()
    }

    /// `close_window` and wait until every session has stopped.
    pub async fn shutdown(&mut self) {
        self.close_window();
        while !self.is_finished() {
            match self.event_rx.recv().await {
                Some(event) => self.handle_event(event),
                None => break,
            }
        }
    }

    // ── queries ─────────────────────────────────────────────────────────

    #[must_use]
    pub fn diagnostics(&self) -> &DiagnosticsStorage {
        &self.diagnostics
    }

    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// An empty cursor using the configured severity threshold.
    #[must_use]
    pub fn cursor(&self) -> DiagnosticsCursor {
        DiagnosticsCursor::new(self.config.diagnostics_max_severity)
    }

    /// The ready (or stopping) session for a configuration.
    #[must_use]
    pub fn session(&self, name: &str) -> Option<&Session> {
        match self.slots.get(name)? {
            Slot::Running { session, .. } => Some(session),
            Slot::Starting { .. } => None,
        }
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.slots.values().filter_map(|slot| match slot {
            Slot::Running { session, .. } => Some(session),
            Slot::Starting { .. } => None,
        })
    }

    /// State of every configuration the window knows about, by name.
    #[must_use]
    pub fn status(&self) -> Vec<ServerStatus> {
        let mut states = self.blocked.clone();
        for name in self.ending.values() {
            states.insert(name.clone(), ServerState::Stopping);
        }
        for (name, slot) in &self.slots {
            let state = match slot {
                Slot::Starting { .. } => ServerState::Starting,
                Slot::Running { session, .. } => match session.state() {
                    SessionState::Starting => ServerState::Starting,
                    SessionState::Ready => ServerState::Ready,
                    SessionState::Stopping | SessionState::Stopped => ServerState::Stopping,
                },
            };
            states.insert(name.clone(), state);
        }
        states
            .into_iter()
            .map(|(name, state)| ServerStatus { name, state })
            .collect()
    }
}

fn running_sessions(slots: &mut BTreeMap<String, Slot>) -> impl Iterator<Item = &mut Session> {
    slots.values_mut().filter_map(|slot| match slot {
        Slot::Running { session, .. } => Some(session),
        Slot::Starting { .. } => None,
    })
}

/// Spawn or attach, handshake, and hand back a session ready for
/// `complete_initialize`.
async fn launch_session(
    launcher: &dyn ServerLauncher,
    config: ServerConfig,
    handlers: WindowHandlers<'_>,
    initialize_timeout: Duration,
    shutdown_timeout: Duration,
) -> Result<(Session, InitializeOutcome), StartError> {
    let io = launcher.launch(handlers.name, &config, handlers.root).await?;
    let (client, child) = io.connect(handlers.name);
    handlers.register(&client);
    let (mut session, handshake) =
        Session::start(handlers.name, config, client, handlers.root, initialize_timeout)?;
    if let Some(child) = child {
        session.set_process(child);
    }
    match handshake.wait().await {
        Ok(outcome) => Ok((session, outcome)),
        Err(e) => {
            session.end(shutdown_timeout).await;
            Err(e.into())
        }
    }
}

#[derive(serde::Deserialize)]
struct ApplyEditParams {
    #[serde(default)]
    label: Option<String>,
    edit: Value,
}

/// Handlers for server messages that are addressed to the window rather
/// than to one document.
struct WindowHandlers<'a> {
    name: &'a str,
    generation: u64,
    root: &'a Path,
    event_tx: &'a mpsc::UnboundedSender<WindowEvent>,
    collaborators: &'a Collaborators,
}

impl WindowHandlers<'_> {
    fn register(&self, client: &RpcClient) {
        let Self {
            name,
            generation,
            root,
            event_tx,
            collaborators,
        } = *self;
        let server = name.to_string();
        let tx = event_tx.clone();
        client.on_notification("textDocument/publishDiagnostics", move |params| {
            let params: PublishDiagnosticsParams = serde_json::from_value(params.unwrap_or_default())?;
            let path = protocol::file_uri_to_path(&params.uri)
                .with_context(|| format!("not a file URI: {}", params.uri))?;
            let diagnostics = params
                .diagnostics
                .iter()
                .map(|d| d.to_diagnostic(&server))
                .collect();
            let _ = tx.send(WindowEvent::Diagnostics {
                name: server.clone(),
                generation,
                path,
                diagnostics,
            });
            Ok(())
        });

        let server = name.to_string();
        let tx = event_tx.clone();
        client.on_notification("window/showMessage", move |params| {
            let params: ShowMessageParams = serde_json::from_value(params.unwrap_or_default())?;
            let _ = tx.send(WindowEvent::ShowMessage {
                name: server.clone(),
                kind: MessageType::from_lsp(params.kind),
                message: params.message,
            });
            Ok(())
        });

        // Prompts wait for the user, so they are answered from the window.
        let server = name.to_string();
        let tx = event_tx.clone();
        client.on_request_deferred("window/showMessageRequest", move |params| {
            let answer = serde_json::from_value::<ShowMessageParams>(params.unwrap_or_default())
                .map_err(|e| ResponseError::invalid_params(e.to_string()))
                .map(|params| {
                    let (reply, answer) = MessageReply::channel();
                    let _ = tx.send(WindowEvent::ShowMessageRequest {
                        name: server.clone(),
                        kind: MessageType::from_lsp(params.kind),
                        message: params.message,
                        actions: params.actions,
                        reply,
                    });
                    answer
                });
            async move {
                let choice = answer?.await.unwrap_or(None);
                serde_json::to_value(choice).map_err(|e| ResponseError::internal_error(e.to_string()))
            }
        });

        let edits = collaborators.edits.clone();
        client.on_request("workspace/applyEdit", move |params| {
            let params: ApplyEditParams = serde_json::from_value(params.unwrap_or_default())
                .map_err(|e| ResponseError::invalid_params(e.to_string()))?;
            let applied = edits.apply_edit(&params.edit, params.label.as_deref());
            Ok(serde_json::json!({ "applied": applied }))
        });

        client.on_request("workspace/configuration", |params| {
            let items = params
                .as_ref()
                .and_then(|p| p.get("items"))
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            Ok(Value::Array(vec![Value::Null; items]))
        });

        let folders = workspace_folders(root);
        client.on_request("workspace/workspaceFolders", move |_| Ok(folders.clone()));
        client.on_request("client/registerCapability", |_| Ok(Value::Null));
        client.on_request("client/unregisterCapability", |_| Ok(Value::Null));

        let server = name.to_string();
        let tx = event_tx.clone();
        client.set_crash_handler(move |reason| {
            let _ = tx.send(WindowEvent::Crashed {
                name: server,
                generation,
                reason,
            });
        });
    }
}

fn workspace_folders(root: &Path) -> Value {
    let Ok(uri) = protocol::path_to_file_uri(root) else {
        return Value::Null;
    };
    let name = root
        .file_name()
        .map_or_else(|| root.display().to_string(), |n| n.to_string_lossy().into_owned());
    serde_json::json!([{ "uri": uri.as_str(), "name": name }])
}
