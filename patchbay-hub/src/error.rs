//! Error types for patchbay-hub.

use std::io;
use std::sync::Arc;

/// Result type for hub operations.
pub type Result<T> = std::result::Result<T, HubError>;

/// Errors surfaced by the hub itself (construction, the selector loop, the
/// builder surface).
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A connection was offered before `run` was called.
    #[error("hub is not running")]
    NotRunning,

    /// `run` was called while another thread is already in the loop.
    #[error("hub is already running")]
    AlreadyRunning,
}

/// Terminal error delivered to a connection's receiver. Cloneable because
/// one selector failure fans out to every registered transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// An I/O operation on the connection failed; the transport was aborted.
    #[error("transport i/o failed")]
    Io(#[source] Arc<io::Error>),

    /// The peer closed its write side while we expected further commands.
    #[error("unexpected EOF on remote stream")]
    UnexpectedEof,

    /// The read buffer hit its hard cap without a complete command in view.
    #[error("command buffer overflow: {buffered} bytes buffered without a complete command")]
    Overflow { buffered: usize },

    /// The hub was closed while the connection was still registered.
    #[error("hub closed")]
    HubClosed,

    /// Aborted for a reason that is not a connection-level I/O failure.
    #[error("transport aborted: {0}")]
    Aborted(String),
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(Arc::new(e))
    }
}
