//! Job result model - what came back from one engine run.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::dependency::ClassDependencies;
use crate::id::JobId;
use crate::job::JobDefinition;

/// One generated test, opaque to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestArtifact {
    /// Test name
    pub name: String,

    /// Serialized test body as produced by the engine
    pub content: String,
}

/// A generated test suite.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSuite {
    /// Generated tests
    pub tests: Vec<TestArtifact>,
}

impl TestSuite {
    /// Number of tests in the suite.
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    /// True if the engine produced nothing.
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

/// Why a job crashed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CrashCause {
    /// Memory ceiling exceeded
    OutOfMemory,
    /// Any other abnormal termination
    Abnormal {
        /// Exit code, if the process exited at all
        exit_code: Option<i32>,
        /// Short diagnostic
        message: String,
    },
}

impl std::fmt::Display for CrashCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrashCause::OutOfMemory => write!(f, "oom"),
            CrashCause::Abnormal { exit_code: Some(code), .. } => write!(f, "exit {}", code),
            CrashCause::Abnormal { exit_code: None, .. } => write!(f, "abnormal"),
        }
    }
}

/// Terminal status of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    /// Engine finished within its budget
    Completed,
    /// Wall-clock budget or session deadline hit; the job was killed
    TimedOut,
    /// Engine terminated abnormally
    Crashed {
        /// What went wrong
        cause: CrashCause,
    },
    /// Job was never run
    Skipped {
        /// Why it was not run
        reason: String,
    },
}

impl JobStatus {
    /// Short label used in logs and reason chains.
    pub fn label(&self) -> String {
        match self {
            JobStatus::Completed => "completed".to_string(),
            JobStatus::TimedOut => "timed out".to_string(),
            JobStatus::Crashed { cause } => format!("crashed ({})", cause),
            JobStatus::Skipped { reason } => reason.clone(),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

/// Outcome of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// Job that produced this result
    pub job_id: JobId,

    /// Class under test
    pub target_class: String,

    /// Parameter profile of the job
    pub configuration_id: i32,

    /// Generated suite (empty unless completed)
    pub suite: TestSuite,

    /// Achieved coverage in `[0, 1]`
    pub coverage: f64,

    /// Wall-clock time actually used
    pub elapsed: Duration,

    /// Peak memory reported by the engine
    pub peak_memory_mb: Option<u32>,

    /// Terminal status
    pub status: JobStatus,

    /// Dependencies the engine observed while running
    pub discovered: ClassDependencies,
}

impl JobResult {
    /// Result of a job that finished normally.
    pub fn completed(
        job: &JobDefinition,
        suite: TestSuite,
        coverage: f64,
        elapsed: Duration,
    ) -> Self {
        Self {
            suite,
            coverage: coverage.clamp(0.0, 1.0),
            ..Self::with_status(job, JobStatus::Completed, elapsed)
        }
    }

    /// Result with the given status and nothing produced.
    pub fn with_status(job: &JobDefinition, status: JobStatus, elapsed: Duration) -> Self {
        Self {
            job_id: job.job_id(),
            target_class: job.cut().to_string(),
            configuration_id: job.configuration_id(),
            suite: TestSuite::default(),
            coverage: 0.0,
            elapsed,
            peak_memory_mb: None,
            status,
            discovered: ClassDependencies::default(),
        }
    }

    /// Attach the engine's peak memory figure.
    pub fn peak_memory(mut self, mb: Option<u32>) -> Self {
        self.peak_memory_mb = mb;
        self
    }

    /// Attach dependencies observed by the engine.
    pub fn discovered(mut self, deps: ClassDependencies) -> Self {
        self.discovered = deps;
        self
    }

    /// Elapsed time rounded up to whole seconds.
    pub fn elapsed_secs(&self) -> u64 {
        let secs = self.elapsed.as_secs();
        if self.elapsed.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}
