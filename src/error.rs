// src/error.rs
use std::io;

use thiserror::Error;

use crate::parser::ParseError;

/// Central error type for the ravel core engine.
#[derive(Debug, Error)]
pub enum RavelError {
    /// Underlying I/O error from the OS or network.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Error during HTTP request parsing.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// The listen address could not be parsed.
    #[error("invalid listen address: {0}")]
    Addr(String),

    /// The worker pool has been shut down.
    #[error("worker pool is closed")]
    PoolClosed,
}

pub type RavelResult<T> = Result<T, RavelError>;
