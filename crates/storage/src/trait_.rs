//! Storage trait abstraction.

use async_trait::async_trait;
use ctgen_core::{History, SessionReport, TestSuite};

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Storage for state carried between sessions.
///
/// This trait allows different storage backends to be plugged in.
#[async_trait]
pub trait Storage: Send + Sync {
    // === History ===

    /// Load the cross-session history, empty if none was saved yet.
    async fn load_history(&self) -> Result<History>;

    /// Replace the cross-session history.
    async fn save_history(&self, history: &History) -> Result<()>;

    // === Reports ===

    /// Save a finalized session report.
    async fn save_report(&self, report: &SessionReport) -> Result<()>;

    /// Load the most recently finished report.
    async fn load_latest_report(&self) -> Result<Option<SessionReport>>;

    // === Suites ===

    /// Save the archived suite for a class and configuration.
    async fn save_suite(
        &self,
        class: &str,
        configuration_id: i32,
        suite: &TestSuite,
    ) -> Result<()>;

    /// Load the archived suite for a class and configuration.
    async fn load_suite(&self, class: &str, configuration_id: i32) -> Result<Option<TestSuite>>;
}
