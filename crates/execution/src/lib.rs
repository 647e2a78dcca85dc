//! Execution layer - budgeting, class selection, job execution and the
//! session loop.

#![warn(missing_docs)]

pub mod error;
pub mod budget;
pub mod dependency;
pub mod selector;
pub mod scheduler;
pub mod analyzer;
pub mod executor;
pub mod archive;
pub mod engine;

pub use error::{ExecutionError, Result};
pub use budget::{BudgetGrant, BudgetManager};
pub use dependency::PendingGraph;
pub use selector::{
    Candidate, ClassSelector, DependencyFirstSelector, SelectorStrategy, SimpleSelector,
};
pub use scheduler::{ClassState, Decision, Dispatch, Phase, Scheduler, Transition};
pub use analyzer::{CommandAnalyzer, DependencyAnalyzer, NoopAnalyzer};
pub use executor::{cancel_pair, CancelHandle, CancelSignal, JobExecutor, ProcessExecutor};
pub use archive::{ArchivedSuite, ReportContext, ResultArchive};
pub use engine::{SessionEngine, SessionOutcome};
