//! Error taxonomy for the session engine, extending [`wire::WireError`] with
//! the kinds of failure spec.md §7 names above the transport layer.

use wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Transport-level failure (closed, timeout, corrupt frame, I/O).
    #[error(transparent)]
    Wire(#[from] WireError),

    /// No factory was registered for an incoming message id. The default
    /// protocol reply handles this at the session level; this variant exists
    /// for callers that want to observe or log the condition themselves.
    #[error("no handler registered for message id {id}")]
    NoHandler { id: i32 },

    /// A handler's `process` returned an application-level failure. Logged
    /// by the input loop, which then continues reading the next frame.
    #[error("handler failed: {reason}")]
    HandlerFailed { reason: String },

    /// An output queue exceeded its configured limits past the grace
    /// period. The session is torn down; this variant is for logging.
    #[error("output queue backpressure violation")]
    BackpressureViolation,

    /// The OS refused to create a thread or allocate a resource needed to
    /// service a connection.
    #[error("resource exhausted: {reason}")]
    ResourceExhaustion { reason: String },

    /// A programmer error: an illegal call sequence (accept before listen,
    /// posting a broadcast message that was never marked for broadcast).
    /// Fatal to the operation, not the process.
    #[error("invalid configuration: {reason}")]
    ConfigurationInvalid { reason: String },
}

pub type NetResult<T> = Result<T, NetError>;
