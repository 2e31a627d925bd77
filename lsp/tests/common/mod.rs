//! Shared test utilities and fixtures
//!
//! A scripted in-memory language server and a launcher that hands its
//! server side to the test.

#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tether_lsp::{
    FrameReader, FrameWriter, LaunchError, RpcClient, ServerConfig, ServerIo, ServerLauncher,
    Transport, WindowManager,
};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// The server end of an in-memory connection.
pub struct FakeServer {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: Option<FrameWriter<WriteHalf<DuplexStream>>>,
}

impl FakeServer {
    fn pair() -> (Self, ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let server = Self {
            reader: FrameReader::new(server_read),
            writer: Some(FrameWriter::new(server_write)),
        };
        (server, client_read, client_write)
    }

    /// Next message from the client.
    pub async fn recv(&mut self) -> Value {
        let frame = tokio::time::timeout(RECV_TIMEOUT, self.reader.read_frame())
            .await
            .expect("message within timeout")
            .expect("readable frame")
            .expect("frame before EOF");
        serde_json::from_str(&frame).expect("valid JSON")
    }

    /// Next message, asserting its method.
    pub async fn expect(&mut self, method: &str) -> Value {
        let message = self.recv().await;
        assert_eq!(message["method"], method, "unexpected message: {message}");
        message
    }

    /// `None` if the client closed its side.
    pub async fn recv_or_eof(&mut self) -> Option<Value> {
        let frame = tokio::time::timeout(RECV_TIMEOUT, self.reader.read_frame())
            .await
            .expect("message or EOF within timeout")
            .ok()??;
        Some(serde_json::from_str(&frame).expect("valid JSON"))
    }

    pub async fn send(&mut self, message: Value) {
        self.writer
            .as_mut()
            .expect("server has not hung up")
            .write_frame(&message.to_string())
            .await
            .expect("write frame");
    }

    pub async fn respond(&mut self, id: &Value, result: Value) {
        self.send(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
            .await;
    }

    pub async fn notify(&mut self, method: &str, params: Value) {
        self.send(json!({ "jsonrpc": "2.0", "method": method, "params": params }))
            .await;
    }

    pub async fn publish_diagnostics(&mut self, uri: &str, diagnostics: Value) {
        self.notify(
            "textDocument/publishDiagnostics",
            json!({ "uri": uri, "diagnostics": diagnostics }),
        )
        .await;
    }

    /// Answer `initialize` with `capabilities` and wait for `initialized`.
    pub async fn accept_initialize(&mut self, capabilities: Value) -> Value {
        let request = self.answer_initialize(capabilities).await;
        self.expect("initialized").await;
        request
    }

    /// Answer `initialize` only. Returns the request.
    pub async fn answer_initialize(&mut self, capabilities: Value) -> Value {
        let request = self.expect("initialize").await;
        let result = json!({
            "capabilities": capabilities,
            "serverInfo": { "name": "fake-server", "version": "1.0" }
        });
        self.respond(&request["id"], result).await;
        request
    }

    /// Answer `shutdown`, then wait for `exit`.
    pub async fn accept_shutdown(&mut self) {
        let request = self.expect("shutdown").await;
        self.respond(&request["id"], Value::Null).await;
        self.expect("exit").await;
    }

    /// Close the server's output, as a crashing server would.
    pub async fn hang_up(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await.expect("shutdown writer");
        }
    }
}

/// A client connected to a fake server.
pub fn connect(name: &str) -> (RpcClient, FakeServer) {
    let (server, client_read, client_write) = FakeServer::pair();
    let (transport, events) = Transport::start(name, client_read, client_write);
    (RpcClient::new(transport, events), server)
}

/// Hands the server end of every launch to the test.
pub struct FakeLauncher {
    servers: mpsc::UnboundedSender<(String, FakeServer)>,
}

impl FakeLauncher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, FakeServer)>) {
        let (servers, rx) = mpsc::unbounded_channel();
        (Self { servers }, rx)
    }
}

impl ServerLauncher for FakeLauncher {
    fn launch<'a>(
        &'a self,
        name: &'a str,
        _config: &'a ServerConfig,
        _root: &'a Path,
    ) -> BoxFuture<'a, Result<ServerIo, LaunchError>> {
        Box::pin(async move {
            let (server, client_read, client_write) = FakeServer::pair();
            self.servers
                .send((name.to_string(), server))
                .map_err(|_| LaunchError::Failed {
                    server: name.to_string(),
                    reason: "test dropped the launcher receiver".to_string(),
                })?;
            Ok(ServerIo::new(client_read, client_write))
        })
    }
}

/// Run `fut` while the manager handles events and debounce deadlines.
pub async fn drive<T>(manager: &mut WindowManager, fut: impl Future<Output = T>) -> T {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;
            out = &mut fut => return out,
            () = manager.wait_for_activity() => {}
        }
    }
}

/// Wait for the next launch while driving the manager.
pub async fn next_server(
    manager: &mut WindowManager,
    servers: &mut mpsc::UnboundedReceiver<(String, FakeServer)>,
) -> (String, FakeServer) {
    drive(manager, async {
        tokio::time::timeout(RECV_TIMEOUT, servers.recv())
            .await
            .expect("launch within timeout")
            .expect("launcher alive")
    })
    .await
}

/// Handle events until `done` holds.
pub async fn drive_until(manager: &mut WindowManager, mut done: impl FnMut(&WindowManager) -> bool) {
    tokio::time::timeout(RECV_TIMEOUT, async {
        while !done(&*manager) {
            manager.wait_for_activity().await;
        }
    })
    .await
    .expect("condition within timeout");
}

pub fn file_uri(path: &Path) -> String {
    url::Url::from_file_path(path)
        .expect("absolute path")
        .to_string()
}
