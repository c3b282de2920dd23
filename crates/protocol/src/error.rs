//! Protocol error types

use thiserror::Error;

/// Wire-level protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Opcode with no defined frame layout; the stream cannot be resynced
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    /// Establish-connection frame did not start with the "IOIO" magic
    #[error("bad establish connection magic")]
    BadMagic,

    /// UART channel index outside the wire format's 2-bit range
    #[error("invalid UART channel {0}")]
    InvalidChannel(u8),

    /// UART data frames carry 1-64 bytes (length is encoded as len-1)
    #[error("UART payload must be 1-64 bytes, got {0}")]
    BadPayloadSize(usize),

    /// I/O error while reading a frame
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
