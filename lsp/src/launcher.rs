//! Server launching: spawn a process or attach to a socket.
//!
//! The window manager asks a [`ServerLauncher`] for a connected byte stream
//! and never touches processes itself, so tests can substitute in-memory
//! pipes.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use futures_util::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, Command};
use tokio::time::sleep;

use crate::rpc::RpcClient;
use crate::transport::Transport;
use crate::types::{ServerConfig, TcpEndpoint};

const CONNECT_ATTEMPTS: u32 = 20;
const CONNECT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("{command} not found in PATH")]
    NotFound {
        command: String,
        #[source]
        source: which::Error,
    },
    #[error("failed to launch '{server}': {reason}")]
    Failed { server: String, reason: String },
}

/// A connected server: the byte stream plus the process that owns it, if any.
pub struct ServerIo {
    reader: Box<dyn AsyncRead + Unpin + Send>,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    child: Option<Child>,
}

impl ServerIo {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        }
    }

    #[must_use]
    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }

    /// Start the transport and client. Must be called inside a runtime.
    pub fn connect(self, name: &str) -> (RpcClient, Option<Child>) {
        let (transport, events) = Transport::start(name, self.reader, self.writer);
        (RpcClient::new(transport, events), self.child)
    }
}

pub trait ServerLauncher: Send + Sync {
    fn launch<'a>(
        &'a self,
        name: &'a str,
        config: &'a ServerConfig,
        root: &'a Path,
    ) -> BoxFuture<'a, Result<ServerIo, LaunchError>>;
}

/// Spawns configured commands with `tokio::process`.
///
/// Stdio servers talk over the child's stdin/stdout. Servers with a `tcp`
/// endpoint are spawned (when a command is given) and then connected to,
/// retrying while the server starts listening.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    connect_attempts: u32,
    connect_interval: Duration,
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self {
            connect_attempts: CONNECT_ATTEMPTS,
            connect_interval: CONNECT_INTERVAL,
        }
    }
}

impl ProcessLauncher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_connect_retry(mut self, attempts: u32, interval: Duration) -> Self {
        self.connect_attempts = attempts.max(1);
        self.connect_interval = interval;
        self
    }

    fn spawn(name: &str, config: &ServerConfig, root: &Path, stdio: bool) -> Result<Child, LaunchError> {
        let program = which::which(&config.command).map_err(|source| LaunchError::NotFound {
            command: config.command.clone(),
            source,
        })?;

        let mut cmd = Command::new(&program);
        cmd.args(&config.args)
            .envs(&config.env)
            .current_dir(root)
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if stdio {
            cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null()).stdout(Stdio::null());
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", program.display()))
            .map_err(|e| failed(name, &e))?;
        tracing::info!(server = %name, pid = child.id(), "Spawned {}", config.command);

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(name.to_string(), stderr));
        }
        Ok(child)
    }

    async fn connect(&self, endpoint: &TcpEndpoint) -> anyhow::Result<TcpStream> {
        let mut attempt = 1;
        loop {
            match TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt < self.connect_attempts => {
                    tracing::trace!(host = %endpoint.host, port = endpoint.port, attempt, "Connect failed: {e}");
                    attempt += 1;
                    sleep(self.connect_interval).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!(
                            "connecting to {}:{} after {attempt} attempts",
                            endpoint.host, endpoint.port
                        )
                    });
                }
            }
        }
    }

    async fn launch_tcp(
        &self,
        name: &str,
        config: &ServerConfig,
        root: &Path,
        endpoint: &TcpEndpoint,
    ) -> Result<ServerIo, LaunchError> {
        let child = if config.command.is_empty() {
            None
        } else {
            Some(Self::spawn(name, config, root, false)?)
        };
        let stream = self.connect(endpoint).await.map_err(|e| failed(name, &e))?;
        tracing::info!(server = %name, host = %endpoint.host, port = endpoint.port, "Connected");
        let (read_half, write_half) = stream.into_split();
        let io = ServerIo::new(read_half, write_half);
        Ok(match child {
            Some(child) => io.with_child(child),
            None => io,
        })
    }
}

fn failed(name: &str, error: &anyhow::Error) -> LaunchError {
    LaunchError::Failed {
        server: name.to_string(),
        reason: format!("{error:#}"),
    }
}

async fn forward_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %name, "stderr: {line}");
    }
}

impl ServerLauncher for ProcessLauncher {
    fn launch<'a>(
        &'a self,
        name: &'a str,
        config: &'a ServerConfig,
        root: &'a Path,
    ) -> BoxFuture<'a, Result<ServerIo, LaunchError>> {
        Box::pin(async move {
            if let Some(endpoint) = &config.tcp {
                return self.launch_tcp(name, config, root, endpoint).await;
            }
            let mut child = Self::spawn(name, config, root, true)?;
            let stdout = child
                .stdout
                .take()
                .context("no stdout from child")
                .map_err(|e| failed(name, &e))?;
            let stdin = child
                .stdin
                .take()
                .context("no stdin from child")
                .map_err(|e| failed(name, &e))?;
            Ok(ServerIo::new(stdout, stdin).with_child(child))
        })
    }
}
