use std::io::Error as IoError;

/// Errors produced while reading or writing frames.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FrameError {
    /// The peer closed the connection between frames.
    #[error("connection closed")]
    Closed,
    /// A frame arrived with no kind byte.
    #[error("empty frame: missing kind code")]
    MissingKind,
    /// The kind byte is not one the protocol defines.
    #[error("unknown frame kind code: {0:#04x}")]
    UnknownKind(u8),
    /// Transport-level failure.
    #[error(transparent)]
    Io(#[from] IoError),
    /// The JSON payload did not match the expected shape.
    #[error("malformed frame payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl FrameError {
    /// True when the error is an orderly end of stream rather than a
    /// protocol violation.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}
