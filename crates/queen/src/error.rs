//! Semantic error kinds for the queen.
//!
//! Per-request errors never take the process down; per-cell fatal errors
//! kick only that cell; listener errors are fatal because they indicate
//! misconfiguration.

use hlhv_protocol::{FrameError, FrameKind};

/// Errors produced while a new connection logs on. Any of these closes the
/// socket.
#[derive(Debug, thiserror::Error)]
pub enum LogonError {
    /// Wrong connection password on cell logon, or wrong session key on
    /// band attach.
    #[error("connection password or session key mismatch")]
    AuthMismatch,
    /// Band logon named a cell the store does not know.
    #[error("no cell called {0}")]
    UnknownCell(String),
    /// Band logon without a cell uuid.
    #[error("band logon did not name a cell")]
    MissingUuid,
    /// The first frame was not a logon frame.
    #[error("connection sent strange kind code: {0:?}")]
    NotLogon(FrameKind),
    /// The logon deadline expired.
    #[error("logon timed out")]
    Timeout,
    /// Malformed kind byte or payload.
    #[error("error parsing logon frame: {0}")]
    Framing(#[from] FrameError),
}

/// Errors from mount table registration and removal.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum MountError {
    /// Patterns cannot be empty.
    #[error("invalid pattern: cannot be empty")]
    EmptyPattern,
    /// Patterns must start with a host, not a slash.
    #[error("invalid pattern {0:?}: must be host specific")]
    HostlessPattern(String),
    /// Another cell already mounted this pattern.
    #[error("existing mount on {0:?}")]
    AlreadyMounted(String),
    /// This cell already holds a mount; one mount per cell.
    #[error("cell is already mounted on {0:?}")]
    CellAlreadyMounted(String),
    /// Unmount of a pattern nobody registered.
    #[error("pattern {0:?} is not mounted")]
    NotMounted(String),
}

/// Errors from [`crate::cells::Cell::provide`].
#[derive(Debug, thiserror::Error)]
pub enum ProvideError {
    /// The band wait list is full; the client gets a 503.
    #[error("server overload: band wait list is full")]
    ServerOverload,
    /// The cell tore down while the caller waited; the client gets a 502.
    #[error("internal communication bandwidth exceeded")]
    BandwidthExceeded,
}

/// Errors that terminate a forwarded request with a 502.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The cell sent a frame kind that has no place in the dialogue.
    #[error("band sent unknown code {0:?}")]
    UnexpectedFrame(FrameKind),
    /// The cell answered with a status code below 200.
    #[error("band sent bad status code {0}")]
    BadStatus(u16),
    /// The cell produced headers the HTTP layer cannot represent.
    #[error("band sent unusable response head: {0}")]
    BadHead(String),
    /// Band I/O failed mid-dialogue.
    #[error("band closed abruptly: {0}")]
    BandClosed(#[from] FrameError),
}
