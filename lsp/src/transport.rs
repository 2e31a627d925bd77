//! Transport: turns a duplex byte stream into discrete message payloads.
//!
//! Two tasks run per transport: a reader that decodes frames and a writer
//! that drains the send queue. Inbound payloads and the single closing
//! notice are delivered, in stream order, on the event channel returned by
//! [`Transport::start`].

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::sync::{mpsc, watch};

use crate::codec::{FrameReader, FrameWriter};

/// Why a transport stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// [`Transport::close`] was called.
    Requested,
    /// The peer closed its end of the stream.
    Eof,
    ReadError(String),
    WriteError(String),
}

impl CloseReason {
    #[must_use]
    pub fn is_requested(&self) -> bool {
        matches!(self, Self::Requested)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("closed by client"),
            Self::Eof => f.write_str("server closed the stream"),
            Self::ReadError(e) => write!(f, "read error: {e}"),
            Self::WriteError(e) => write!(f, "write error: {e}"),
        }
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    Message(String),
    /// Always the last event, sent exactly once.
    Closed(CloseReason),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport '{0}' is closed")]
    Closed(String),
    #[error("child process has no {0} pipe")]
    MissingPipe(&'static str),
}

struct Shared {
    name: String,
    /// `None` once closed. Holding the lock while sending keeps `Closed`
    /// strictly after every delivered message.
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn deliver(&self, payload: String) -> bool {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        match events.as_ref() {
            Some(tx) => tx.send(TransportEvent::Message(payload)).is_ok(),
            None => false,
        }
    }

    /// Returns `false` if the transport was already closed.
    fn close(&self, reason: CloseReason) -> bool {
        let Some(tx) = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return false;
        };
        tracing::debug!(transport = %self.name, %reason, "Transport closing");
        let _ = self.shutdown.send(true);
        let _ = tx.send(TransportEvent::Closed(reason));
        true
    }

    fn is_closed(&self) -> bool {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Handle to a running transport. Dropping it closes the transport.
pub struct Transport {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<String>,
}

impl Transport {
    /// Start the reader and writer tasks. Returns immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<R, W>(
        name: impl Into<String>,
        reader: R,
        writer: W,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            name: name.into(),
            events: Mutex::new(Some(event_tx)),
            shutdown: shutdown_tx,
        });

        // Both loops exit on their own once the shutdown signal fires.
        tokio::spawn(read_loop(shared.clone(), reader, shutdown_rx.clone()));
        tokio::spawn(write_loop(shared.clone(), writer, outbound_rx, shutdown_rx));

        let transport = Self {
            shared,
            outbound: outbound_tx,
        };
        (transport, event_rx)
    }

    /// Bind to a spawned child's stdout (read) and stdin (write).
    pub fn stdio(
        name: impl Into<String>,
        child: &mut Child,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let stdout = child
            .stdout
            .take()
            .ok_or(TransportError::MissingPipe("stdout"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or(TransportError::MissingPipe("stdin"))?;
        Ok(Self::start(name, stdout, stdin))
    }

    /// Bind to a connected TCP socket.
    pub fn tcp(
        name: impl Into<String>,
        stream: TcpStream,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (read_half, write_half) = stream.into_split();
        Self::start(name, read_half, write_half)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queue a payload for framing and writing. Never waits on I/O.
    pub fn send(&self, content: String) -> Result<(), TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed(self.shared.name.clone()));
        }
        self.outbound
            .send(content)
            .map_err(|_| TransportError::Closed(self.shared.name.clone()))
    }

    /// Stop both loops. Idempotent; payloads queued before the call are
    /// still written.
    pub fn close(&self) {
        self.shared.close(CloseReason::Requested);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shared.close(CloseReason::Requested);
    }
}

async fn read_loop<R>(shared: Arc<Shared>, reader: R, mut shutdown: watch::Receiver<bool>)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameReader::new(reader);
    loop {
        let next = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            next = frames.read_frame() => next,
        };
        match next {
            Ok(Some(payload)) => {
                if !shared.deliver(payload) {
                    break;
                }
            }
            Ok(None) => {
                tracing::info!(transport = %shared.name, "Server closed its output");
                shared.close(CloseReason::Eof);
                break;
            }
            Err(e) if e.is_fatal() => {
                tracing::warn!(transport = %shared.name, "Transport read error: {e}");
                shared.close(CloseReason::ReadError(e.to_string()));
                break;
            }
            Err(e) => {
                tracing::warn!(transport = %shared.name, "Skipping malformed frame data: {e}");
            }
        }
    }
}

async fn write_loop<W>(
    shared: Arc<Shared>,
    writer: W,
    mut outbound: mpsc::UnboundedReceiver<String>,
    mut shutdown: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    let mut frames = FrameWriter::new(writer);
    loop {
        // Queued payloads win over the shutdown signal so a final `exit`
        // written just before `close()` still reaches the server.
        let body = tokio::select! {
            biased;
            body = outbound.recv() => match body {
                Some(body) => body,
                None => break,
            },
            _ = shutdown.wait_for(|stop| *stop) => break,
        };
        if let Err(e) = frames.write_frame(&body).await {
            tracing::warn!(transport = %shared.name, "Transport write error: {e}");
            shared.close(CloseReason::WriteError(e.to_string()));
            break;
        }
    }
    let _ = frames.shutdown().await;
}
