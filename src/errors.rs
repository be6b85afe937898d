//! Error types for the connection pool and the frame codec

use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Connection request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Pool is closed")]
    Closed,

    #[error("No Tokio runtime available to run the request dispatcher")]
    NoRuntime,
}

impl PoolError {
    /// Whether calling `get` again may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Timeout(_) | PoolError::Dial { .. })
    }
}

/// Errors raised while reading or writing length-prefixed frames.
///
/// After any of these the connection should be considered unusable: the
/// stream position no longer lines up with a frame boundary.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Short read: stream ended before {expected} bytes were available")]
    ShortRead { expected: usize },

    #[error("Malformed frame: length prefix {0} is smaller than the 4-byte prefix")]
    Malformed(u32),

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(io::Error),
}

pub type PoolResult<T> = Result<T, PoolError>;

pub type FrameResult<T> = Result<T, FrameError>;
