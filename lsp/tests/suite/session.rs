//! Session lifecycle against a scripted server.

use std::path::Path;
use std::time::Duration;

use serde_json::json;
use tether_lsp::{
    Capability, CloseReason, InitializeError, RequestError, ServerConfig, Session, SessionError,
    SessionState,
};
use tokio::sync::oneshot;

use crate::common::{FakeServer, connect, file_uri};

const TIMEOUT: Duration = Duration::from_secs(5);

fn rust_config() -> ServerConfig {
    ServerConfig::new("rust-analyzer", "rust").with_file_extensions(["rs"])
}

async fn ready_session(capabilities: serde_json::Value) -> (Session, FakeServer, tempfile::TempDir) {
    let root = tempfile::tempdir().unwrap();
    let (client, mut server) = connect("rust");
    let (mut session, handshake) =
        Session::start("rust", rust_config(), client, root.path(), TIMEOUT).unwrap();
    assert_eq!(session.state(), SessionState::Starting);

    let (outcome, _) = tokio::join!(handshake.wait(), server.answer_initialize(capabilities));
    session.complete_initialize(outcome.unwrap()).unwrap();
    server.expect("initialized").await;
    (session, server, root)
}

#[tokio::test]
async fn handshake_reaches_ready_with_capabilities() {
    let root = tempfile::tempdir().unwrap();
    let (client, mut server) = connect("rust");
    let (mut session, handshake) =
        Session::start("rust", rust_config(), client, root.path(), TIMEOUT).unwrap();

    assert!(!session.has_capability(Capability::HoverProvider));
    assert!(matches!(
        session.notify("custom/ping", None),
        Err(SessionError::NotReady { .. })
    ));

    let (outcome, request) = tokio::join!(
        handshake.wait(),
        server.answer_initialize(json!({ "hoverProvider": true, "textDocumentSync": 1 }))
    );
    assert_eq!(request["params"]["rootUri"], file_uri(root.path()));
    assert_eq!(request["params"]["processId"], std::process::id());

    session.complete_initialize(outcome.unwrap()).unwrap();
    server.expect("initialized").await;

    assert_eq!(session.state(), SessionState::Ready);
    assert!(session.has_capability(Capability::HoverProvider));
    assert!(!session.has_capability(Capability::RenameProvider));
    assert_eq!(session.server_info().unwrap().name, "fake-server");
}

#[tokio::test]
async fn initialize_options_are_forwarded() {
    let root = tempfile::tempdir().unwrap();
    let mut config = rust_config();
    config.initialization_options = Some(json!({ "checkOnSave": false }));
    let (client, mut server) = connect("rust");
    let (_session, _handshake) = Session::start("rust", config, client, root.path(), TIMEOUT).unwrap();

    let request = server.expect("initialize").await;
    assert_eq!(request["params"]["initializationOptions"]["checkOnSave"], false);
}

#[tokio::test]
async fn rejected_initialize_is_reported() {
    let root = tempfile::tempdir().unwrap();
    let (client, mut server) = connect("rust");
    let (_session, handshake) =
        Session::start("rust", rust_config(), client, root.path(), TIMEOUT).unwrap();

    let serve = async {
        let request = server.expect("initialize").await;
        server
            .send(json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": { "code": -32002, "message": "not yet" }
            }))
            .await;
    };
    let (result, ()) = tokio::join!(handshake.wait(), serve);
    match result {
        Err(InitializeError::Rejected(e)) => assert_eq!(e.code, -32002),
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn silent_server_times_out_initialize() {
    let root = tempfile::tempdir().unwrap();
    let (client, _server) = connect("rust");
    let (_session, handshake) = Session::start(
        "rust",
        rust_config(),
        client,
        root.path(),
        Duration::from_secs(30),
    )
    .unwrap();
    assert!(matches!(
        handshake.wait().await,
        Err(InitializeError::Timeout(d)) if d == Duration::from_secs(30)
    ));
}

#[tokio::test]
async fn document_sync_versions() {
    let (mut session, mut server, root) =
        ready_session(json!({ "textDocumentSync": { "change": 1, "save": { "includeText": true } } })).await;
    let path = root.path().join("main.rs");
    let uri = file_uri(&path);

    session.did_open(&path, "rust", "fn main() {}").unwrap();
    let open = server.expect("textDocument/didOpen").await;
    assert_eq!(open["params"]["textDocument"]["uri"], uri);
    assert_eq!(open["params"]["textDocument"]["languageId"], "rust");
    assert_eq!(open["params"]["textDocument"]["version"], 0);
    assert_eq!(session.document_state(&path).unwrap().version(), 0);

    // Opening twice sends nothing.
    session.did_open(&path, "rust", "ignored").unwrap();

    assert_eq!(session.did_change(&path, "fn main() { 1 }").unwrap(), Some(1));
    let change = server.expect("textDocument/didChange").await;
    assert_eq!(change["params"]["textDocument"]["version"], 1);
    assert_eq!(change["params"]["contentChanges"][0]["text"], "fn main() { 1 }");

    assert!(session.did_save(&path, "fn main() { 1 }").unwrap());
    let save = server.expect("textDocument/didSave").await;
    assert_eq!(save["params"]["text"], "fn main() { 1 }");

    session.did_close(&path).unwrap();
    let close = server.expect("textDocument/didClose").await;
    assert_eq!(close["params"]["textDocument"]["uri"], uri);
    assert!(!session.is_open(&path));

    assert!(matches!(
        session.did_change(&path, "x"),
        Err(SessionError::NotOpen { .. })
    ));
}

#[tokio::test]
async fn sync_kind_none_sends_no_changes() {
    let (mut session, mut server, root) = ready_session(json!({ "textDocumentSync": 0 })).await;
    let path = root.path().join("lib.rs");
    session.did_open(&path, "rust", "").unwrap();
    server.expect("textDocument/didOpen").await;

    assert_eq!(session.did_change(&path, "changed").unwrap(), None);
    assert!(!session.did_save(&path, "changed").unwrap());
    assert_eq!(session.document_state(&path).unwrap().version(), 0);

    // The next thing the server sees is the close, not a change.
    session.did_close(&path).unwrap();
    server.expect("textDocument/didClose").await;
}

#[tokio::test]
async fn end_reaches_stopped_and_drops_capabilities() {
    let (mut session, mut server, root) = ready_session(json!({ "hoverProvider": true })).await;
    session.did_open(&root.path().join("a.rs"), "rust", "").unwrap();
    server.expect("textDocument/didOpen").await;

    let hover = session.request("textDocument/hover", None).unwrap();
    server.expect("textDocument/hover").await;

    tokio::join!(session.end(TIMEOUT), server.accept_shutdown());

    assert_eq!(session.state(), SessionState::Stopped);
    assert!(session.capabilities().is_none());
    assert!(!session.has_capability(Capability::HoverProvider));
    assert!(!session.is_open(&root.path().join("a.rs")));
    assert_eq!(hover.recv().await, Err(RequestError::SessionEnded));

    assert!(matches!(
        session.notify("custom/ping", None),
        Err(SessionError::NotReady { state: SessionState::Stopped, .. })
    ));
    assert!(server.recv_or_eof().await.is_none());
}

#[tokio::test]
async fn unanswered_shutdown_still_exits() {
    let (mut session, mut server, _root) = ready_session(json!({})).await;
    let serve = async {
        server.expect("shutdown").await;
        server.expect("exit").await;
    };
    tokio::join!(session.end(Duration::from_millis(50)), serve);
    assert_eq!(session.state(), SessionState::Stopped);
}

#[tokio::test]
async fn crash_fails_pending_and_reports_once() {
    let (mut session, mut server, _root) = ready_session(json!({ "hoverProvider": true })).await;
    let (crash_tx, crash_rx) = oneshot::channel();
    session.client().set_crash_handler(move |reason| {
        let _ = crash_tx.send(reason);
    });

    let pending = session.request("textDocument/hover", None).unwrap();
    server.expect("textDocument/hover").await;
    server.hang_up().await;

    assert_eq!(pending.recv().await, Err(RequestError::TransportClosed));
    assert_eq!(crash_rx.await.unwrap(), CloseReason::Eof);

    session.end(TIMEOUT).await;
    assert_eq!(session.state(), SessionState::Stopped);
}

#[tokio::test]
async fn requested_end_is_not_a_crash() {
    let (mut session, mut server, _root) = ready_session(json!({})).await;
    let (crash_tx, mut crash_rx) = oneshot::channel::<CloseReason>();
    session.client().set_crash_handler(move |reason| {
        let _ = crash_tx.send(reason);
    });

    let serve = async {
        server.accept_shutdown().await;
        server.hang_up().await;
    };
    tokio::join!(session.end(TIMEOUT), serve);

    // The handler was dropped without being called.
    assert!(crash_rx.try_recv().is_err());
    assert!(session.client().is_closed());
}

#[tokio::test]
async fn relative_root_is_rejected() {
    let (client, _server) = connect("rust");
    let result = Session::start("rust", rust_config(), client, Path::new("relative"), TIMEOUT);
    assert!(matches!(result, Err(InitializeError::InvalidRoot(_))));
}
