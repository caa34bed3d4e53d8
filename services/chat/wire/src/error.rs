//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Payload is not valid JSON
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload has no recognizable start or the wrong shape
    #[error("malformed message")]
    Malformed,

    /// A required field is absent
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// Kind string outside the protocol taxonomy
    #[error("unknown kind: {0}")]
    UnknownKind(String),

    /// Length prefix exceeds the frame limit
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

impl WireError {
    /// True for errors that poison the whole connection rather than one frame.
    ///
    /// A single malformed payload is dropped and the stream continues; an
    /// oversized length prefix leaves the stream unparseable, so the
    /// connection must be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WireError::FrameTooLarge(_))
    }
}
