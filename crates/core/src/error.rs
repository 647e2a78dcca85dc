//! Errors raised by the core data model.

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while building core values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// A job definition was requested with a non-positive budget or blank class
    #[error("invalid job spec: {0}")]
    InvalidJobSpec(String),

    /// A dependency merge was requested with nothing to merge
    #[error("invalid merge for {cut}: both dependency sets are empty")]
    InvalidMerge {
        /// Class the merge was requested for
        cut: String,
    },

    /// Session configuration is inconsistent
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
