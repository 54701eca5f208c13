use std::io;

use thiserror::Error;

use crate::parser::ParseError;

/// Central error type for the Minuet core engine.
#[derive(Debug, Error)]
pub enum MinuetError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error during HTTP request parsing.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// The listener address could not be parsed or bound.
    #[error("invalid listen address: {0}")]
    InvalidAddress(String),

    /// The static-file cache reached its entry ceiling.
    #[error("file cache is full")]
    CacheFull,

    /// A cache snapshot failed validation.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// Generic or miscellaneous error.
    #[error("{0}")]
    Other(String),
}

pub type MinuetResult<T> = Result<T, MinuetError>;
