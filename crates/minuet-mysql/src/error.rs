use std::io;

use thiserror::Error;

/// Errors surfaced by minuet-mysql operations.
#[derive(Debug, Error)]
pub enum MysqlError {
    /// I/O error from the underlying socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Protocol violation or unexpected packet from the server.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication failure.
    #[error("auth error: {0}")]
    Auth(String),

    /// Server-sent error packet.
    #[error("server error {code} ({state}): {message}")]
    Server {
        code: u16,
        state: String,
        message: String,
    },

    /// Connection closed or in an invalid state.
    #[error("connection closed")]
    ConnectionClosed,

    /// Configured connect/read/write deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// Type conversion error.
    #[error("type conversion: {0}")]
    TypeConversion(String),

    /// Could not reach the server at all.
    #[error("network error: {0}")]
    Network(String),
}

pub type MysqlResult<T> = Result<T, MysqlError>;
