//! LSP client: sessions with language servers on behalf of editor windows.
//!
//! Layers, bottom up: [`codec`] frames bytes, [`Transport`] moves frames
//! over a stream, [`RpcClient`] correlates JSON-RPC traffic, [`Session`]
//! runs the lifecycle of one server, and [`WindowManager`] decides which
//! sessions exist for a window and owns its diagnostics.

pub mod codec;
pub mod types;

mod capabilities;
mod cursor;
mod diagnostics;
mod launcher;
mod manager;
mod protocol;
mod registry;
mod rpc;
mod session;
mod transport;

pub use capabilities::{Capabilities, Capability, TextDocumentSyncKind, UnknownCapability};
pub use codec::{FrameDecoder, FrameError, FrameReader, FrameWriter, encode_frame};
pub use cursor::{DiagnosticsCursor, Direction};
pub use diagnostics::DiagnosticsStorage;
pub use launcher::{LaunchError, ProcessLauncher, ServerIo, ServerLauncher};
pub use manager::{
    Collaborators, EditApplier, Headless, MessagePresenter, MessageReply, StartError, WindowError,
    WindowManager,
};
pub use protocol::{MessageActionItem, MessageType, PathToUriError, ResponseError, ServerInfo, error_codes};
pub use registry::{WindowId, WindowRegistry};
pub use rpc::{
    DeferredRequestHandler, NotificationHandler, PendingResponse, RequestError, RequestHandler,
    RpcClient,
};
pub use session::{
    DocumentState, InitializeError, InitializeHandshake, InitializeOutcome, Session, SessionError,
    SessionState,
};
pub use tether_types::{Diagnostic, DiagnosticSeverity, Point, Range};
pub use transport::{CloseReason, Transport, TransportError, TransportEvent};
pub use types::{
    DiagnosticsSnapshot, LspConfig, ServerConfig, ServerConfigError, ServerState, ServerStatus,
    TcpEndpoint,
};
