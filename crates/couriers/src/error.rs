use crate::auth::AuthError;
use courier_common::MessageError;
use thiserror::Error;

/// Errors that can occur during relay server operation.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The connection attempt carried no acceptable credential.
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// An inbound payload could not be decoded.
    #[error("{0}")]
    Malformed(#[from] MessageError),
    /// The connection was already closed.
    #[error("connection closed")]
    ConnectionClosed,
    /// The upgrade handshake did not complete within the configured timeout.
    #[error("handshake timed out")]
    HandshakeTimeout,
    /// A write did not complete within the configured timeout.
    #[error("write timed out")]
    WriteTimeout,
    /// The router worker is no longer accepting messages.
    #[error("router closed")]
    RouterClosed,
    /// The registry has been swept for shutdown.
    #[error("server shutting down")]
    ShuttingDown,
}
