//! JSON-RPC client: request/response correlation and handler dispatch.
//!
//! Inbound messages are dispatched on a single task per client, in arrival
//! order. Handlers therefore never run concurrently for the same server and
//! must not block.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time;

use crate::protocol::{
    self, Incoming, Notification, Request, Response, ResponseError, ResponseOutcome,
};
use crate::transport::{CloseReason, Transport, TransportError, TransportEvent};

/// Handles a server-initiated notification. Errors are logged and dropped.
pub type NotificationHandler = Arc<dyn Fn(Option<Value>) -> anyhow::Result<()> + Send + Sync>;

/// Handles a server-initiated request; the return value becomes the response.
pub type RequestHandler = Arc<dyn Fn(Option<Value>) -> Result<Value, ResponseError> + Send + Sync>;

/// Handles a server request whose answer comes later (a user prompt, for
/// example). The response is sent when the returned future resolves.
pub type DeferredRequestHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<Value, ResponseError>> + Send + Sync>;

#[derive(Clone)]
enum ServerRequestHandler {
    Immediate(RequestHandler),
    Deferred(DeferredRequestHandler),
}

type CrashHandler = Box<dyn FnOnce(CloseReason) + Send>;

type Reply = oneshot::Sender<Result<Value, RequestError>>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestError {
    #[error("server error: {0}")]
    Server(ResponseError),
    #[error("transport closed before a response arrived")]
    TransportClosed,
    #[error("session ended")]
    SessionEnded,
    #[error("request timed out")]
    TimedOut,
    #[error("response was malformed or discarded")]
    NoResponse,
    #[error("failed to serialize request: {0}")]
    Serialize(String),
}

struct PendingRequest {
    method: String,
    sent_at: Instant,
    /// `None` once canceled: the entry stays until its response arrives.
    reply: Option<Reply>,
}

struct Inner {
    name: String,
    transport: Transport,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    notification_handlers: Mutex<HashMap<String, NotificationHandler>>,
    request_handlers: Mutex<HashMap<String, ServerRequestHandler>>,
    crash_handler: Mutex<Option<CrashHandler>>,
    /// Set once `exit` was sent; the following closure is not a crash.
    exiting: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn send_value(&self, message: &impl serde::Serialize) -> Result<(), TransportError> {
        match serde_json::to_string(message) {
            Ok(body) => self.transport.send(body),
            Err(e) => {
                tracing::error!(server = %self.name, "Failed to serialize message: {e}");
                Ok(())
            }
        }
    }

    fn fail_pending(&self, error: &RequestError) -> usize {
        let drained: Vec<PendingRequest> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            if let Some(reply) = pending.reply {
                tracing::debug!(server = %self.name, method = %pending.method, "Failing pending request: {error}");
                let _ = reply.send(Err(error.clone()));
            }
        }
        count
    }

    fn dispatch(self: &Arc<Self>, payload: &str) {
        let message: Value = match serde_json::from_str(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(server = %self.name, "Dropping undecodable message: {e}");
                return;
            }
        };
        let Some(incoming) = protocol::parse_incoming(message) else {
            tracing::warn!(server = %self.name, "Ignoring message with neither id nor method");
            return;
        };

        match incoming {
            Incoming::Response { id, outcome } => self.handle_response(&id, outcome),
            Incoming::Request { id, method, params } => {
                self.handle_request(id, &method, params);
            }
            Incoming::Notification { method, params } => {
                self.handle_notification(&method, params);
            }
        }
    }

    fn handle_response(&self, id: &Value, outcome: ResponseOutcome) {
        let Some(id) = id.as_u64() else {
            tracing::warn!(server = %self.name, %id, "Ignoring response with foreign id");
            return;
        };
        let Some(pending) = lock(&self.pending).remove(&id) else {
            tracing::debug!(server = %self.name, id, "Ignoring response for unknown request");
            return;
        };
        tracing::trace!(
            server = %self.name,
            id,
            method = %pending.method,
            elapsed_ms = pending.sent_at.elapsed().as_millis() as u64,
            "Response received"
        );
        let Some(reply) = pending.reply else {
            tracing::trace!(server = %self.name, id, "Discarding response to canceled request");
            return;
        };
        match outcome {
            ResponseOutcome::Result(result) => {
                let _ = reply.send(Ok(result));
            }
            ResponseOutcome::Error(error) => {
                let _ = reply.send(Err(RequestError::Server(error)));
            }
            ResponseOutcome::Malformed => {
                tracing::warn!(
                    server = %self.name,
                    id,
                    method = %pending.method,
                    "Dropping malformed response"
                );
            }
        }
    }

    fn handle_request(self: &Arc<Self>, id: Value, method: &str, params: Option<Value>) {
        let handler = lock(&self.request_handlers).get(method).cloned();
        let outcome = match handler {
            None => Err(ResponseError::method_not_found(method)),
            Some(ServerRequestHandler::Immediate(handler)) => {
                catch_unwind(AssertUnwindSafe(|| handler(params)))
                    .unwrap_or_else(|panic| Err(self.handler_panicked(method, panic.as_ref())))
            }
            Some(ServerRequestHandler::Deferred(handler)) => {
                match catch_unwind(AssertUnwindSafe(|| handler(params))) {
                    Ok(future) => {
                        self.reply_later(id, method, future);
                        return;
                    }
                    Err(panic) => Err(self.handler_panicked(method, panic.as_ref())),
                }
            }
        };
        self.reply(id, method, outcome);
    }

    /// Send the response once `future` resolves, without holding up
    /// dispatch of the messages behind it.
    fn reply_later(
        self: &Arc<Self>,
        id: Value,
        method: &str,
        future: BoxFuture<'static, Result<Value, ResponseError>>,
    ) {
        let client = Arc::downgrade(self);
        let method = method.to_string();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(future).catch_unwind().await;
            let Some(inner) = client.upgrade() else {
                return;
            };
            let outcome =
                outcome.unwrap_or_else(|panic| Err(inner.handler_panicked(&method, panic.as_ref())));
            inner.reply(id, &method, outcome);
        });
    }

    fn reply(&self, id: Value, method: &str, outcome: Result<Value, ResponseError>) {
        let response = match outcome {
            Ok(result) => Response::result(id, result),
            Err(error) => {
                tracing::debug!(server = %self.name, %method, "Server request failed: {error}");
                Response::error(id, error)
            }
        };
        if let Err(e) = self.send_value(&response) {
            tracing::debug!(server = %self.name, %method, "Could not reply: {e}");
        }
    }

    fn handler_panicked(&self, method: &str, panic: &(dyn Any + Send)) -> ResponseError {
        let message = panic_message(panic);
        tracing::error!(server = %self.name, %method, "Request handler panicked: {message}");
        ResponseError::internal_error(message)
    }

    fn handle_notification(&self, method: &str, params: Option<Value>) {
        let Some(handler) = lock(&self.notification_handlers).get(method).cloned() else {
            tracing::trace!(server = %self.name, %method, "Ignoring notification");
            return;
        };
        match catch_unwind(AssertUnwindSafe(|| handler(params))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(server = %self.name, %method, "Notification handler failed: {e:#}");
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(server = %self.name, %method, "Notification handler panicked: {message}");
            }
        }
    }

    fn handle_closed(&self, reason: CloseReason) {
        let failed = self.fail_pending(&RequestError::TransportClosed);
        let graceful = reason.is_requested() || self.exiting.load(Ordering::Acquire);
        if graceful {
            tracing::debug!(server = %self.name, %reason, failed, "Connection closed");
            return;
        }
        tracing::warn!(server = %self.name, %reason, failed, "Connection lost unexpectedly");
        let handler = lock(&self.crash_handler).take();
        if let Some(handler) = handler
            && let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(reason)))
        {
            tracing::error!(
                server = %self.name,
                "Crash handler panicked: {}",
                panic_message(panic.as_ref())
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

async fn dispatch_loop(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        match event {
            TransportEvent::Message(payload) => inner.dispatch(&payload),
            TransportEvent::Closed(reason) => {
                inner.handle_closed(reason);
                break;
            }
        }
    }
}

/// Cheaply cloneable handle to one server connection.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("name", &self.inner.name)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Wrap a started transport and begin dispatching its events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(transport: Transport, events: mpsc::UnboundedReceiver<TransportEvent>) -> Self {
        let inner = Arc::new(Inner {
            name: transport.name().to_string(),
            transport,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            notification_handlers: Mutex::new(HashMap::new()),
            request_handlers: Mutex::new(HashMap::new()),
            crash_handler: Mutex::new(None),
            exiting: AtomicBool::new(false),
        });
        tokio::spawn(dispatch_loop(Arc::downgrade(&inner), events));
        Self { inner }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Send a request. The returned handle resolves with the response.
    pub fn request(&self, method: &str, params: Option<Value>) -> PendingResponse {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let handle = PendingResponse {
            id,
            rx,
            client: Arc::downgrade(&self.inner),
        };

        let body = match serde_json::to_string(&Request::new(id, method, params)) {
            Ok(body) => body,
            Err(e) => {
                let _ = tx.send(Err(RequestError::Serialize(e.to_string())));
                return handle;
            }
        };

        lock(&self.inner.pending).insert(
            id,
            PendingRequest {
                method: method.to_string(),
                sent_at: Instant::now(),
                reply: Some(tx),
            },
        );

        if let Err(e) = self.inner.transport.send(body) {
            tracing::debug!(server = %self.inner.name, %method, "Request not sent: {e}");
            // Whoever removes the entry resolves it; the close path may have
            // drained it already.
            if let Some(pending) = lock(&self.inner.pending).remove(&id)
                && let Some(reply) = pending.reply
            {
                let _ = reply.send(Err(RequestError::TransportClosed));
            }
        }
        handle
    }

    /// Fire-and-forget notification.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        self.inner.send_value(&Notification::new(method, params))
    }

    /// Send `exit`. The transport closure that follows is treated as graceful.
    pub fn notify_exit(&self) -> Result<(), TransportError> {
        self.inner.exiting.store(true, Ordering::Release);
        self.notify("exit", None)
    }

    /// Register the handler for a server notification. Last registration wins.
    pub fn on_notification<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<Value>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        lock(&self.inner.notification_handlers).insert(method.into(), Arc::new(handler));
    }

    /// Register the handler for a server request. Last registration wins.
    pub fn on_request<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<Value>) -> Result<Value, ResponseError> + Send + Sync + 'static,
    {
        lock(&self.inner.request_handlers)
            .insert(method.into(), ServerRequestHandler::Immediate(Arc::new(handler)));
    }

    /// Register a handler that answers asynchronously. Dispatch moves on to
    /// the next message while the answer is pending. Last registration wins,
    /// across both kinds of request handler.
    pub fn on_request_deferred<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ResponseError>> + Send + 'static,
    {
        let handler: DeferredRequestHandler = Arc::new(move |params| handler(params).boxed());
        lock(&self.inner.request_handlers).insert(method.into(), ServerRequestHandler::Deferred(handler));
    }

    /// Invoked at most once, when the transport closes without `close()` or
    /// a preceding `exit`.
    pub fn set_crash_handler<F>(&self, handler: F)
    where
        F: FnOnce(CloseReason) + Send + 'static,
    {
        *lock(&self.inner.crash_handler) = Some(Box::new(handler));
    }

    /// Resolve every outstanding request with `error`. Returns how many were
    /// outstanding.
    pub fn fail_pending(&self, error: &RequestError) -> usize {
        self.inner.fail_pending(error)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn close(&self) {
        self.inner.transport.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.transport.is_closed()
    }
}

/// An in-flight request.
#[must_use = "dropping a PendingResponse ignores the server's answer"]
pub struct PendingResponse {
    id: u64,
    rx: oneshot::Receiver<Result<Value, RequestError>>,
    client: Weak<Inner>,
}

impl PendingResponse {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(self) -> Result<Value, RequestError> {
        self.rx.await.unwrap_or(Err(RequestError::NoResponse))
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`, removing the
    /// pending entry so a late response is ignored.
    pub async fn recv_timeout(self, timeout: Duration) -> Result<Value, RequestError> {
        let Self { id, rx, client } = self;
        match time::timeout(timeout, rx).await {
            Ok(result) => result.unwrap_or(Err(RequestError::NoResponse)),
            Err(_) => {
                if let Some(inner) = client.upgrade() {
                    lock(&inner.pending).remove(&id);
                }
                Err(RequestError::TimedOut)
            }
        }
    }

    /// Stop caring about the response. The server is asked to cancel; if a
    /// response still arrives it is discarded.
    pub fn cancel(self) {
        let Some(inner) = self.client.upgrade() else {
            return;
        };
        let was_pending = match lock(&inner.pending).get_mut(&self.id) {
            Some(pending) => {
                pending.reply = None;
                true
            }
            None => false,
        };
        if was_pending {
            let _ = inner.send_value(&Notification::new(
                "$/cancelRequest",
                Some(protocol::cancel_params(self.id)),
            ));
        }
    }
}
