//! Window manager behavior against scripted servers.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tether_lsp::{
    CloseReason, Collaborators, DiagnosticSeverity, Direction, EditApplier, LspConfig,
    MessageActionItem, MessagePresenter, MessageReply, MessageType, ServerState, ServerStatus,
    WindowManager, WindowRegistry,
};
use tokio::sync::mpsc;

use crate::common::{FakeLauncher, FakeServer, drive, drive_until, file_uri, next_server};

type Servers = mpsc::UnboundedReceiver<(String, FakeServer)>;

#[derive(Default)]
struct Recorder {
    restart: bool,
    /// Keep prompts unanswered instead of picking the first action.
    hold_prompts: bool,
    held: Mutex<Vec<(Vec<MessageActionItem>, MessageReply)>>,
    restarts_asked: AtomicUsize,
    messages: Mutex<Vec<(String, MessageType, String)>>,
    changed: Mutex<Vec<PathBuf>>,
    edits: Mutex<Vec<Option<String>>>,
}

impl Recorder {
    fn restarting() -> Self {
        Self {
            restart: true,
            ..Self::default()
        }
    }
}

impl EditApplier for Recorder {
    fn apply_edit(&self, _edit: &Value, label: Option<&str>) -> bool {
        self.edits.lock().unwrap().push(label.map(str::to_string));
        true
    }
}

impl MessagePresenter for Recorder {
    fn show_message(&self, server: &str, kind: MessageType, message: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((server.to_string(), kind, message.to_string()));
    }

    fn show_message_request(
        &self,
        server: &str,
        kind: MessageType,
        message: &str,
        actions: &[MessageActionItem],
        reply: MessageReply,
    ) {
        self.show_message(server, kind, message);
        if self.hold_prompts {
            self.held.lock().unwrap().push((actions.to_vec(), reply));
        } else {
            reply.choose(actions.first().cloned());
        }
    }

    fn confirm_restart(&self, _server: &str, _reason: &CloseReason) -> bool {
        self.restarts_asked.fetch_add(1, Ordering::SeqCst);
        self.restart
    }

    fn diagnostics_changed(&self, path: &Path) {
        self.changed.lock().unwrap().push(path.to_path_buf());
    }
}

fn config() -> LspConfig {
    serde_json::from_value(json!({
        "enabled": true,
        "servers": {
            "rust": {
                "command": "fake-rust",
                "language_id": "rust",
                "file_extensions": ["rs"]
            }
        }
    }))
    .unwrap()
}

fn manager_with(recorder: &Arc<Recorder>) -> (WindowManager, Servers) {
    let (launcher, servers) = FakeLauncher::new();
    let collaborators = Collaborators {
        edits: recorder.clone(),
        presenter: recorder.clone(),
    };
    (WindowManager::new(config(), Arc::new(launcher), collaborators), servers)
}

/// A window with `main.rs` open and its server READY.
async fn running_window(
    recorder: &Arc<Recorder>,
    root: &Path,
    capabilities: Value,
) -> (WindowManager, Servers, FakeServer, PathBuf) {
    let (mut manager, mut servers) = manager_with(recorder);
    manager.set_folders(vec![root.to_path_buf()]);
    let path = root.join("main.rs");
    manager.open_view(&path, None, "fn main() {}").unwrap();

    let (name, mut server) = next_server(&mut manager, &mut servers).await;
    assert_eq!(name, "rust");
    drive(&mut manager, server.accept_initialize(capabilities)).await;
    let open = drive(&mut manager, server.expect("textDocument/didOpen")).await;
    assert_eq!(open["params"]["textDocument"]["uri"], file_uri(&path));
    assert_eq!(open["params"]["textDocument"]["text"], "fn main() {}");
    (manager, servers, server, path)
}

fn state_of(manager: &WindowManager, name: &str) -> Option<ServerState> {
    manager
        .status()
        .into_iter()
        .find(|s| s.name == name)
        .map(|s| s.state)
}

#[tokio::test]
async fn matching_document_starts_server_and_opens() {
    let root = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let (mut manager, _servers, mut server, path) =
        running_window(&recorder, root.path(), json!({ "textDocumentSync": 1 })).await;

    assert_eq!(
        manager.status(),
        vec![ServerStatus {
            name: "rust".into(),
            state: ServerState::Ready
        }]
    );
    let session = manager.session("rust").unwrap();
    assert!(session.is_open(&path));
    assert_eq!(session.root(), root.path());

    // A second matching document opens in the same session.
    let other = root.path().join("lib.rs");
    manager.open_view(&other, Some("rust"), "pub fn f() {}").unwrap();
    let open = drive(&mut manager, server.expect("textDocument/didOpen")).await;
    assert_eq!(open["params"]["textDocument"]["uri"], file_uri(&other));
}

#[tokio::test(start_paused = true)]
async fn rapid_edits_are_debounced_into_one_change() {
    let root = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let (mut manager, _servers, mut server, path) =
        running_window(&recorder, root.path(), json!({ "textDocumentSync": 1 })).await;

    manager.change_document(&path, "a").unwrap();
    tokio::time::advance(Duration::from_millis(200)).await;
    manager.change_document(&path, "ab").unwrap();
    tokio::time::advance(Duration::from_millis(200)).await;
    manager.poll_events(16);
    manager.change_document(&path, "abc").unwrap();

    let change = drive(&mut manager, server.recv()).await;
    assert_eq!(change["method"], "textDocument/didChange");
    assert_eq!(change["params"]["textDocument"]["version"], 1);
    assert_eq!(change["params"]["contentChanges"][0]["text"], "abc");
    assert!(manager.next_change_deadline().is_none());

    // Nothing else follows: the next message is the reply to a later request.
    tokio::time::advance(Duration::from_secs(1)).await;
    manager.poll_events(16);
    server
        .send(json!({
            "jsonrpc": "2.0", "id": 77, "method": "workspace/configuration",
            "params": { "items": [] }
        }))
        .await;
    let next = drive(&mut manager, server.recv()).await;
    assert_eq!(next["id"], 77, "unexpected message: {next}");
    assert!(next.get("method").is_none());
}

#[tokio::test]
async fn save_flushes_pending_change_first() {
    let root = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let (mut manager, _servers, mut server, path) = running_window(
        &recorder,
        root.path(),
        json!({ "textDocumentSync": { "change": 1, "save": true } }),
    )
    .await;

    manager.change_document(&path, "fn main() { x }").unwrap();
    manager.save_document(&path).unwrap();

    let change = server.expect("textDocument/didChange").await;
    assert_eq!(change["params"]["contentChanges"][0]["text"], "fn main() { x }");
    let save = server.expect("textDocument/didSave").await;
    assert!(save["params"].get("text").is_none());
}

#[tokio::test]
async fn diagnostics_flow_into_storage() {
    let root = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let (mut manager, _servers, mut server, path) =
        running_window(&recorder, root.path(), json!({})).await;

    let range = |line: u32| json!({ "start": { "line": line, "character": 0 }, "end": { "line": line, "character": 3 } });
    server
        .publish_diagnostics(
            &file_uri(&path),
            json!([
                { "range": range(4), "severity": 2, "message": "unused" },
                { "range": range(1), "severity": 1, "message": "mismatched types" }
            ]),
        )
        .await;
    // Not a file; dropped by the handler.
    server
        .publish_diagnostics("untitled:Untitled-1", json!([{ "range": range(0), "message": "x" }]))
        .await;
    drive_until(&mut manager, |m| !m.snapshot().is_empty()).await;

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.error_count(), 1);
    assert_eq!(snapshot.warning_count(), 1);
    assert_eq!(snapshot.files().len(), 1);
    assert_eq!(recorder.changed.lock().unwrap().as_slice(), [path.clone()]);

    let cursor = manager
        .cursor()
        .from_position(manager.diagnostics(), Direction::Forward, None);
    let (at, diagnostic) = cursor.value().unwrap();
    assert_eq!(at, path.as_path());
    assert_eq!(diagnostic.message(), "mismatched types");
    assert_eq!(diagnostic.severity(), DiagnosticSeverity::Error);
    assert_eq!(diagnostic.source(), "rust");

    server.publish_diagnostics(&file_uri(&path), json!([])).await;
    drive_until(&mut manager, |m| m.snapshot().is_empty()).await;
    assert!(cursor.update(manager.diagnostics()).value().is_none());
}

#[tokio::test]
async fn closing_last_view_closes_document_and_clears_diagnostics() {
    let root = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let (mut manager, _servers, mut server, path) =
        running_window(&recorder, root.path(), json!({})).await;
    manager.open_view(&path, None, "fn main() {}").unwrap();

    server
        .publish_diagnostics(
            &file_uri(&path),
            json!([{ "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 1 } }, "message": "e" }]),
        )
        .await;
    drive_until(&mut manager, |m| !m.snapshot().is_empty()).await;

    manager.close_view(&path).unwrap();
    assert!(manager.is_open(&path));
    manager.close_view(&path).unwrap();
    assert!(!manager.is_open(&path));
    assert!(manager.snapshot().is_empty());

    let close = server.expect("textDocument/didClose").await;
    assert_eq!(close["params"]["textDocument"]["uri"], file_uri(&path));
}

#[tokio::test]
async fn server_requests_are_answered() {
    let root = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let (mut manager, _servers, mut server, _path) =
        running_window(&recorder, root.path(), json!({})).await;

    server
        .send(json!({
            "jsonrpc": "2.0", "id": 10, "method": "workspace/configuration",
            "params": { "items": [{ "section": "a" }, { "section": "b" }] }
        }))
        .await;
    let reply = drive(&mut manager, server.recv()).await;
    assert_eq!(reply["id"], 10);
    assert_eq!(reply["result"], json!([null, null]));

    server
        .send(json!({
            "jsonrpc": "2.0", "id": 11, "method": "workspace/applyEdit",
            "params": { "label": "rename", "edit": { "changes": {} } }
        }))
        .await;
    let reply = drive(&mut manager, server.recv()).await;
    assert_eq!(reply["result"]["applied"], true);
    assert_eq!(recorder.edits.lock().unwrap().as_slice(), [Some("rename".to_string())]);

    server
        .send(json!({
            "jsonrpc": "2.0", "id": 12, "method": "window/showMessageRequest",
            "params": { "type": 2, "message": "Reload?", "actions": [{ "title": "Yes" }, { "title": "No" }] }
        }))
        .await;
    let reply = drive(&mut manager, server.recv()).await;
    assert_eq!(reply["result"]["title"], "Yes");

    server
        .send(json!({ "jsonrpc": "2.0", "id": 13, "method": "workspace/workspaceFolders" }))
        .await;
    let reply = drive(&mut manager, server.recv()).await;
    assert_eq!(reply["result"][0]["uri"], file_uri(root.path()));

    server
        .send(json!({ "jsonrpc": "2.0", "id": 14, "method": "custom/unknown" }))
        .await;
    let reply = drive(&mut manager, server.recv()).await;
    assert_eq!(reply["error"]["code"], -32601);
}

#[tokio::test]
async fn pending_prompt_does_not_hold_up_other_requests() {
    let root = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder {
        hold_prompts: true,
        ..Recorder::default()
    });
    let (mut manager, _servers, mut server, _path) =
        running_window(&recorder, root.path(), json!({})).await;

    server
        .send(json!({
            "jsonrpc": "2.0", "id": 20, "method": "window/showMessageRequest",
            "params": { "type": 3, "message": "Reload?", "actions": [{ "title": "Yes" }, { "title": "No" }] }
        }))
        .await;
    server
        .send(json!({
            "jsonrpc": "2.0", "id": 21, "method": "workspace/configuration",
            "params": { "items": [{ "section": "a" }] }
        }))
        .await;
    let reply = drive(&mut manager, server.recv()).await;
    assert_eq!(reply["id"], 21);

    drive_until(&mut manager, |_| !recorder.held.lock().unwrap().is_empty()).await;
    let (actions, prompt) = recorder.held.lock().unwrap().pop().unwrap();
    assert_eq!(actions.len(), 2);
    prompt.choose(Some(actions[1].clone()));

    let reply = server.recv().await;
    assert_eq!(reply["id"], 20);
    assert_eq!(reply["result"]["title"], "No");
}

#[tokio::test]
async fn dropped_prompt_answers_null() {
    let root = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder {
        hold_prompts: true,
        ..Recorder::default()
    });
    let (mut manager, _servers, mut server, _path) =
        running_window(&recorder, root.path(), json!({})).await;

    server
        .send(json!({
            "jsonrpc": "2.0", "id": 30, "method": "window/showMessageRequest",
            "params": { "type": 1, "message": "Broken", "actions": [{ "title": "Ok" }] }
        }))
        .await;
    drive_until(&mut manager, |_| !recorder.held.lock().unwrap().is_empty()).await;
    recorder.held.lock().unwrap().clear();

    let reply = server.recv().await;
    assert_eq!(reply["id"], 30);
    assert_eq!(reply["result"], Value::Null);
}

#[tokio::test]
async fn show_message_reaches_presenter() {
    let root = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let (mut manager, _servers, mut server, _path) =
        running_window(&recorder, root.path(), json!({})).await;

    server
        .notify("window/showMessage", json!({ "type": 1, "message": "indexing failed" }))
        .await;
    drive_until(&mut manager, |_| !recorder.messages.lock().unwrap().is_empty()).await;
    assert_eq!(
        recorder.messages.lock().unwrap()[0],
        ("rust".to_string(), MessageType::Error, "indexing failed".to_string())
    );
}

#[tokio::test]
async fn crash_with_confirmed_restart_starts_a_new_session() {
    let root = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::restarting());
    let (mut manager, mut servers, mut server, path) =
        running_window(&recorder, root.path(), json!({})).await;

    server
        .publish_diagnostics(
            &file_uri(&path),
            json!([{ "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 1 } }, "message": "e" }]),
        )
        .await;
    drive_until(&mut manager, |m| !m.snapshot().is_empty()).await;

    server.hang_up().await;
    let (name, mut restarted) = next_server(&mut manager, &mut servers).await;
    assert_eq!(name, "rust");
    assert_eq!(recorder.restarts_asked.load(Ordering::SeqCst), 1);
    assert!(manager.snapshot().is_empty());

    drive(&mut manager, restarted.accept_initialize(json!({}))).await;
    let open = drive(&mut manager, restarted.expect("textDocument/didOpen")).await;
    assert_eq!(open["params"]["textDocument"]["version"], 0);
    assert_eq!(state_of(&manager, "rust"), Some(ServerState::Ready));
}

#[tokio::test]
async fn crash_with_declined_restart_disables_the_server() {
    let root = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let (mut manager, mut servers, mut server, _path) =
        running_window(&recorder, root.path(), json!({})).await;

    server.hang_up().await;
    drive_until(&mut manager, |m| state_of(m, "rust") == Some(ServerState::Disabled)).await;
    assert_eq!(recorder.restarts_asked.load(Ordering::SeqCst), 1);
    assert!(manager.session("rust").is_none());

    // Further documents don't bring it back.
    manager.open_view(root.path().join("other.rs"), None, "").unwrap();
    manager.poll_events(16);
    tokio::task::yield_now().await;
    assert!(servers.try_recv().is_err());
}

#[tokio::test]
async fn root_change_restarts_against_new_root() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let (mut manager, mut servers, mut server, _path) =
        running_window(&recorder, first.path(), json!({})).await;

    manager.set_folders(vec![second.path().to_path_buf()]);
    assert_eq!(state_of(&manager, "rust"), Some(ServerState::Stopping));
    drive(&mut manager, server.accept_shutdown()).await;

    let (_, mut next) = next_server(&mut manager, &mut servers).await;
    let request = drive(&mut manager, next.accept_initialize(json!({}))).await;
    assert_eq!(request["params"]["rootUri"], file_uri(second.path()));
    assert_eq!(manager.session("rust").unwrap().root(), second.path());
}

#[tokio::test]
async fn close_window_ends_every_session() {
    let root = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let (mut manager, _servers, mut server, _path) =
        running_window(&recorder, root.path(), json!({})).await;

    manager.close_window();
    assert!(!manager.is_finished());
    tokio::join!(manager.shutdown(), server.accept_shutdown());
    assert!(manager.is_finished());
    assert!(manager.status().is_empty());
    assert!(server.recv_or_eof().await.is_none());
    assert_eq!(recorder.restarts_asked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn registry_drops_finished_windows() {
    let root = tempfile::tempdir().unwrap();
    let (launcher, mut servers) = FakeLauncher::new();
    let mut registry = WindowRegistry::new();
    let id = registry.create_window(config(), Arc::new(launcher), Collaborators::default());

    let window = registry.get_mut(id).unwrap();
    window.set_folders(vec![root.path().to_path_buf()]);
    window.open_view(root.path().join("main.rs"), None, "").unwrap();
    let (_, mut server) = next_server(window, &mut servers).await;
    drive(window, server.accept_initialize(json!({}))).await;

    assert!(registry.close_window(id));
    assert_eq!(registry.len(), 1);
    let serve = async {
        server.expect("textDocument/didOpen").await;
        server.accept_shutdown().await;
    };
    let wait = async {
        while !registry.is_empty() {
            registry.poll_events(16);
            tokio::task::yield_now().await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(serve, wait) })
        .await
        .unwrap();
}
