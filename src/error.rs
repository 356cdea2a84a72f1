//! The crate-wide error type.
//!
//! Only the conditions that are meant to surface to a caller live here.
//! Invariant violations inside the edge-set/recorder bookkeeping panic
//! instead of returning `Result` — they indicate a bug in this runtime,
//! not a mistake a caller can recover from.

use std::fmt;

/// Errors that cross the interception/lifecycle boundary into caller code.
#[derive(thiserror::Error)]
pub enum Error {
    /// A service was registered on a [`crate::context::SubjectContext`]
    /// after its first subject had already attached.
    #[error("context is frozen: registration attempted after the first subject attached")]
    ContextFrozen,

    /// The `runs-before`/`runs-first` markers on a context's registered
    /// services formed a cycle and could not be topologically sorted.
    #[error("handler order cycle: {0}")]
    HandlerOrderCycle(String),

    /// A write interceptor rejected a proposed value.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// A transactional write conflicted with a concurrent change to the
    /// same property.
    #[error(
        "concurrency conflict on {property}: expected timestamp {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        /// The property whose timestamp didn't match what the caller expected.
        property: &'static str,
        /// The timestamp the caller expected when the transaction started.
        expected: u64,
        /// The timestamp actually stored for the property.
        actual: u64,
    },

    /// A user-supplied interceptor raised its own error.
    #[error("interceptor failed: {0}")]
    Intercepted(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // thiserror's Display already carries the useful detail; Debug
        // defers to it so `.unwrap()` panics and log lines read the same.
        write!(f, "{}", self)
    }
}

/// The result type used at the crate's external boundary.
pub type Result<T> = std::result::Result<T, Error>;
