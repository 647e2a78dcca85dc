//! ctgen core data models.
//!
//! This crate defines the values shared by the scheduler, the executor
//! adapter and storage: job definitions and their dependency algebra, the
//! dependency index, job results, configuration and reports.

#![warn(missing_docs)]

// Identities and errors
mod id;
mod error;

// Jobs
mod job;
mod dependency;
mod result;

// Session inputs and outputs
mod config;
mod project;
mod report;

// Re-exports
pub use id::{JobId, JobIdCounter, SessionId};
pub use error::{CoreError, Result};

pub use job::{ClassSet, JobDefinition};
pub use dependency::{ClassDependencies, DependencyIndex};
pub use result::{CrashCause, JobResult, JobStatus, TestArtifact, TestSuite};

pub use config::{EngineConfig, MergePolicy, ScheduleStrategy, SessionConfig, TieBreak};
pub use project::{ClassEntry, ProjectManifest};
pub use report::{ClassHistory, ClassOutcome, ClassReport, History, SessionReport};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
