//! Errors that abort a scheduling session.

use ctgen_core::CoreError;
use ctgen_storage::StorageError;

/// Result alias for execution operations.
pub type Result<T> = std::result::Result<T, ExecutionError>;

/// Errors raised by the execution layer.
///
/// Everything here except [`ExecutionError::BudgetExhausted`] is fatal to
/// the session; job-level failures travel as [`ctgen_core::JobStatus`].
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// Core invariant violated (e.g. an empty dependency merge)
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Not enough session time left for the requested grant
    #[error("budget exhausted: requested {requested}s, {remaining}s remaining")]
    BudgetExhausted {
        /// Seconds requested
        requested: u64,
        /// Seconds left at the time of the request
        remaining: u64,
    },

    /// More time was released than the grant held
    #[error("grant {grant} of {reserved}s cannot release {unused}s")]
    BudgetOverRelease {
        /// Grant id
        grant: u64,
        /// Seconds originally reserved
        reserved: u64,
        /// Seconds the caller tried to release
        unused: u64,
    },

    /// A result arrived for a class the session does not schedule
    #[error("result for unknown class {0:?}")]
    UnknownClass(String),

    /// Persistence failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A worker task panicked or was aborted
    #[error("worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}
