//! Error taxonomy for the byte stream and framing primitives.
//!
//! Kept small and kind-based rather than one variant per failing syscall,
//! so that callers (input/output workers) can match on behavior instead of
//! on the underlying OS error.

use std::io;

/// Errors produced by [`crate::stream::ByteStream`] and the framed codecs.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The peer closed its side of the connection. Normal, not logged as an
    /// error by callers.
    #[error("stream closed")]
    Closed,

    /// A read or write did not complete before its configured deadline.
    #[error("operation timed out")]
    Timeout,

    /// The underlying syscall was interrupted; callers that see this from
    /// `ByteStream` itself indicate a bug, since `ByteStream` retries
    /// interrupted operations internally.
    #[error("operation interrupted")]
    Interrupted,

    /// A frame's length prefix was invalid, or EOF was hit mid-frame after
    /// the length prefix had already been read. Unlike `Closed`, this always
    /// terminates the connection as unsalvageable.
    #[error("corrupt frame: {reason}")]
    Corrupt {
        /// Human-readable description of what was wrong with the frame.
        reason: &'static str,
    },

    /// Any other I/O failure (bind, accept, unexpected errno, etc).
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl WireError {
    /// True for errors that represent a normal, expected connection
    /// termination rather than an operational failure worth logging loudly.
    pub fn is_routine_close(&self) -> bool {
        matches!(self, WireError::Closed | WireError::Timeout)
    }
}

pub type WireResult<T> = Result<T, WireError>;
