//! Session configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{CoreError, Result};

/// How classes with equal scores are ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Order in which classes were declared in the project
    #[default]
    Declaration,
    /// Lexicographic class name
    Alphabetical,
}

/// Which ordering heuristic the scheduler uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStrategy {
    /// Declaration order only
    Simple,
    /// Dependencies before their dependents, history as a secondary key
    #[default]
    Seeding,
    /// Never-run and low-coverage classes first, dependencies as a secondary key
    History,
}

/// How the archive treats a second suite for the same class and configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Later results replace earlier ones
    #[default]
    Replace,
    /// Keep whichever suite reached higher coverage
    KeepBestCoverage,
}

/// Budgets and limits for one scheduling session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Total search time available to the session
    pub total_budget_secs: u64,

    /// Time granted to a job on its first attempt
    pub job_budget_secs: u32,

    /// Smallest grant worth dispatching
    pub min_job_budget_secs: u32,

    /// Memory ceiling per job
    pub job_memory_mb: u32,

    /// Memory available to all concurrent jobs together
    pub total_memory_mb: Option<u32>,

    /// Maximum concurrent jobs
    pub concurrency: usize,

    /// Times a timed-out class goes back to pending before it is skipped
    pub max_retries: u32,

    /// Ordering heuristic
    pub strategy: ScheduleStrategy,

    /// Ordering among equally ranked classes
    pub tie_break: TieBreak,

    /// Suite merge behaviour
    pub merge_policy: MergePolicy,

    /// Parameter profile id stamped on every job
    pub configuration_id: i32,

    /// Wall-clock ceiling for the whole session, independent of job budgets
    pub session_deadline_secs: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            total_budget_secs: 3600,
            job_budget_secs: 180,
            min_job_budget_secs: 30,
            job_memory_mb: 1024,
            total_memory_mb: None,
            concurrency: 1,
            max_retries: 2,
            strategy: ScheduleStrategy::Seeding,
            tie_break: TieBreak::Declaration,
            merge_policy: MergePolicy::Replace,
            configuration_id: 0,
            session_deadline_secs: None,
        }
    }
}

impl SessionConfig {
    /// Reject settings the scheduler cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.total_budget_secs == 0 {
            return Err(CoreError::InvalidConfig("total_budget_secs must be positive".into()));
        }
        if self.job_budget_secs == 0 || self.min_job_budget_secs == 0 {
            return Err(CoreError::InvalidConfig("job budgets must be positive".into()));
        }
        if self.min_job_budget_secs > self.job_budget_secs {
            return Err(CoreError::InvalidConfig(format!(
                "min_job_budget_secs ({}) exceeds job_budget_secs ({})",
                self.min_job_budget_secs, self.job_budget_secs
            )));
        }
        if self.job_memory_mb == 0 {
            return Err(CoreError::InvalidConfig("job_memory_mb must be positive".into()));
        }
        if self.concurrency == 0 {
            return Err(CoreError::InvalidConfig("concurrency must be at least 1".into()));
        }
        if let Some(total) = self.total_memory_mb {
            if total < self.job_memory_mb {
                return Err(CoreError::InvalidConfig(format!(
                    "total_memory_mb ({}) cannot fit a single {} MB job",
                    total, self.job_memory_mb
                )));
            }
        }
        Ok(())
    }

    /// Number of workers, bounded by concurrency and the memory pool.
    pub fn worker_count(&self) -> usize {
        match self.total_memory_mb {
            Some(total) => {
                let by_memory = (total / self.job_memory_mb.max(1)).max(1) as usize;
                self.concurrency.min(by_memory)
            }
            None => self.concurrency,
        }
    }
}

/// How to launch the external search engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Program to run
    pub program: String,

    /// Argument templates; `{cut}`, `{seconds}`, `{memory_mb}`,
    /// `{configuration_id}`, `{job_id}`, `{inputs}` and `{parents}` are
    /// substituted per job
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the engine
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Exit code that signals a memory ceiling violation
    #[serde(default = "default_oom_exit_code")]
    pub oom_exit_code: i32,
}

fn default_oom_exit_code() -> i32 {
    137
}

impl EngineConfig {
    /// Engine config for `program` with default settings.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            oom_exit_code: default_oom_exit_code(),
        }
    }

    /// Set argument templates.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_min_above_default() {
        let config = SessionConfig {
            job_budget_secs: 30,
            min_job_budget_secs: 60,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CoreError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let config = SessionConfig { concurrency: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_worker_count_bounded_by_memory() {
        let config = SessionConfig {
            concurrency: 8,
            job_memory_mb: 1024,
            total_memory_mb: Some(3000),
            ..Default::default()
        };
        assert_eq!(config.worker_count(), 2);
        assert_eq!(SessionConfig { concurrency: 4, ..Default::default() }.worker_count(), 4);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let raw = r#"{"total_budget_secs": 120, "tie_break": "alphabetical"}"#;
        let config: SessionConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.total_budget_secs, 120);
        assert_eq!(config.tie_break, TieBreak::Alphabetical);
        assert_eq!(config.job_budget_secs, 180);
        assert_eq!(config.merge_policy, MergePolicy::Replace);
        assert_eq!(config.strategy, ScheduleStrategy::Seeding);
    }

    #[test]
    fn test_engine_config_defaults() {
        let engine: EngineConfig = serde_json::from_str(r#"{"program": "evosuite"}"#).unwrap();
        assert_eq!(engine.oom_exit_code, 137);
        assert!(engine.args.is_empty());
    }
}
