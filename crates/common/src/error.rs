//! Common error types

use thiserror::Error;

/// Client-facing errors
///
/// Operations attempted after the connection dies fail fast with
/// [`Error::ConnectionLost`]; resource teardown paths deliberately avoid
/// returning errors at all (see the tracker's free operations).
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying byte stream reports closed
    #[error("no connection transport")]
    TransportUnavailable,

    /// The connection reached its dead state
    #[error("connection was lost")]
    ConnectionLost,

    /// Operation requires a connected state that was never reached
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Bad pin, mode, baud rate or payload
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// Handshake rejected the board's firmware
    #[error("incompatible firmware: {0}")]
    Incompatible(String),

    /// Unrecoverable wire protocol violation
    #[error("protocol violation: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    /// I/O error from the transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
