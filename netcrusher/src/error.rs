//! Error types for crusher and reactor operations.

use std::io;

use thiserror::Error;

/// Errors surfaced to callers of the crusher and reactor APIs.
#[derive(Debug, Error)]
pub enum CrusherError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Builder validation failed; nothing was opened.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Operation not allowed in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The reactor was closed (or its selector failed) before the command ran.
    #[error("reactor is closed")]
    ReactorClosed,

    /// A submitted command panicked on the loop thread.
    #[error("command panicked: {0}")]
    CommandPanicked(String),

    /// The caller stopped waiting for a submitted command.
    #[error("timed out waiting for reactor command")]
    Timeout,

    /// A blocking call was made from the reactor's own loop thread.
    #[error("blocking reactor call issued from the reactor thread")]
    ReactorThread,
}

impl CrusherError {
    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        CrusherError::InvalidState(msg.into())
    }
}

/// Result type for crusher operations.
pub type Result<T> = std::result::Result<T, CrusherError>;
