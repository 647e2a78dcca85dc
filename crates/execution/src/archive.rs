//! Result archive - suites, the job log, and the session report.

use ctgen_core::{
    ClassOutcome, ClassReport, DependencyIndex, JobId, JobResult, JobStatus, MergePolicy,
    SessionId, SessionReport, TestSuite, Time,
};
use std::collections::BTreeMap;
use tracing::debug;

use crate::scheduler::{Phase, Scheduler};

/// Suite kept for a (class, configuration) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedSuite {
    /// Job that produced the suite
    pub job_id: JobId,
    /// Coverage the suite reached
    pub coverage: f64,
    /// The suite
    pub suite: TestSuite,
}

/// Session-level facts the archive does not track itself.
#[derive(Debug, Clone)]
pub struct ReportContext {
    /// Session
    pub session_id: SessionId,
    /// When the session started
    pub started_at: Time,
    /// Configured total budget
    pub total_budget_secs: u64,
    /// Whether the session deadline fired
    pub deadline_reached: bool,
}

/// Collects job results for a session.
pub struct ResultArchive {
    policy: MergePolicy,
    results: Vec<JobResult>,
    suites: BTreeMap<(String, i32), ArchivedSuite>,
}

impl ResultArchive {
    /// Create an empty archive.
    pub fn new(policy: MergePolicy) -> Self {
        Self {
            policy,
            results: Vec::new(),
            suites: BTreeMap::new(),
        }
    }

    /// Log `result`, fold its discovered dependencies into `index`, and keep
    /// its suite if it produced one.
    ///
    /// Returns whether the index learned anything.
    pub fn record(&mut self, result: JobResult, index: &mut DependencyIndex) -> bool {
        let learned = !result.discovered.is_empty()
            && index.record_all(&result.target_class, &result.discovered);
        if learned {
            debug!("Index learned dependencies of {}", result.target_class);
        }

        let keeps_suite = match result.status {
            JobStatus::Completed => true,
            JobStatus::Crashed { .. } => !result.suite.is_empty(),
            _ => false,
        };
        if keeps_suite {
            let key = (result.target_class.clone(), result.configuration_id);
            let replace = match (self.policy, self.suites.get(&key)) {
                (_, None) | (MergePolicy::Replace, Some(_)) => true,
                (MergePolicy::KeepBestCoverage, Some(existing)) => {
                    result.coverage >= existing.coverage
                }
            };
            if replace {
                self.suites.insert(
                    key,
                    ArchivedSuite {
                        job_id: result.job_id,
                        coverage: result.coverage,
                        suite: result.suite.clone(),
                    },
                );
            }
        }

        self.results.push(result);
        learned
    }

    /// Archived suite for `class` under `configuration_id`.
    pub fn suite(&self, class: &str, configuration_id: i32) -> Option<&ArchivedSuite> {
        self.suites.get(&(class.to_string(), configuration_id))
    }

    /// Every archived suite with its class and configuration.
    pub fn suites(&self) -> impl Iterator<Item = (&str, i32, &ArchivedSuite)> {
        self.suites
            .iter()
            .map(|((class, cfg), suite)| (class.as_str(), *cfg, suite))
    }

    /// Every result recorded, in arrival order.
    pub fn results(&self) -> &[JobResult] {
        &self.results
    }

    /// Build the session report from the scheduler's final state.
    pub fn finalize(&self, scheduler: &Scheduler, ctx: ReportContext) -> SessionReport {
        let configuration_id = scheduler.configuration_id();
        let classes: Vec<ClassReport> = scheduler
            .classes()
            .iter()
            .map(|state| {
                let completed = state.phase() == Phase::Completed;
                let archived = self
                    .suite(state.name(), configuration_id)
                    .filter(|_| completed);
                ClassReport {
                    class: state.name().to_string(),
                    outcome: if completed {
                        ClassOutcome::Completed
                    } else {
                        ClassOutcome::Skipped
                    },
                    attempts: state.attempts(),
                    coverage: archived.map(|a| a.coverage),
                    tests: archived.map_or(0, |a| a.suite.len()),
                    time_spent_secs: state.time_spent_secs(),
                    last_job: archived.map(|a| a.job_id),
                    reasons: state.reasons(),
                }
            })
            .collect();

        let total_coverage = if classes.is_empty() {
            0.0
        } else {
            classes.iter().filter_map(|c| c.coverage).sum::<f64>() / classes.len() as f64
        };

        SessionReport {
            session_id: ctx.session_id,
            started_at: ctx.started_at,
            finished_at: chrono::Utc::now(),
            total_budget_secs: ctx.total_budget_secs,
            time_spent_secs: classes.iter().map(|c| c.time_spent_secs).sum(),
            deadline_reached: ctx.deadline_reached,
            total_coverage,
            classes,
        }
    }
}
