use thiserror::Error;

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, ErrorKind>;

/// Errors that can occur during admission control operations.
///
/// Local conditions (a bin at capacity, pacing not yet satisfied) are never
/// errors; callers simply wait. Everything here is either a configuration
/// mistake, rejected synchronously at the call that introduced it, or the
/// shutdown outcome that resolves parked waiters during teardown.
#[derive(Error, Debug)]
pub enum ErrorKind {
    /// A bin name was listed more than once in a throttler's bin set
    #[error("duplicate bin name: {0}")]
    DuplicateBin(String),

    /// Two resources in a multi-grab carried the same ordering key,
    /// which would make the global acquisition order ambiguous
    #[error("duplicate ordering key: {0}")]
    DuplicateOrderingKey(String),

    /// A throttle specification carried a value outside its domain
    #[error("invalid throttle spec for bin '{bin}': {reason}")]
    InvalidThrottleSpec {
        /// The bin whose limits were rejected
        bin: String,
        /// Why the limits were rejected
        reason: String,
    },

    /// A throttler was requested for a group that was never created
    /// (or has already been removed)
    #[error("no such throttle group: {0}")]
    UnknownThrottleGroup(String),

    /// The throttler (or the pool, or a single bin) is being torn down;
    /// the wait was resolved instead of being left parked
    #[error("throttler is shutting down")]
    Shutdown,

    /// The connector factory failed while constructing a new instance.
    /// The pool slot reserved for the construction has already been
    /// returned to the budget when this surfaces.
    #[error("failed to construct connector: {0}")]
    Connect(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// An I/O error from the underlying source of a throttled reader
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ErrorKind {
    /// Whether this error is the shutdown/cancellation outcome, as opposed
    /// to a hard failure. Callers draining work during teardown use this to
    /// tell "stop quietly" from "report a problem".
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, ErrorKind::Shutdown)
    }
}
