//! Session report and cross-session history.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::dependency::DependencyIndex;
use crate::id::{JobId, SessionId};
use crate::Time;

/// Terminal state of a class at the end of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassOutcome {
    /// A suite was recorded for the class
    Completed,
    /// The class was given up on
    Skipped,
}

/// Per-class line of the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassReport {
    /// Class name
    pub class: String,

    /// Terminal state
    pub outcome: ClassOutcome,

    /// Number of jobs dispatched for the class
    pub attempts: u32,

    /// Coverage of the archived suite
    pub coverage: Option<f64>,

    /// Number of tests in the archived suite
    pub tests: usize,

    /// Seconds of budget consumed by all attempts
    pub time_spent_secs: u64,

    /// Job whose suite is archived
    pub last_job: Option<JobId>,

    /// Why the class was skipped, oldest first
    pub reasons: Vec<String>,
}

/// Aggregate report of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    /// Session
    pub session_id: SessionId,

    /// When the session started
    pub started_at: Time,

    /// When the session was finalized
    pub finished_at: Time,

    /// Configured total budget
    pub total_budget_secs: u64,

    /// Budget consumed by jobs
    pub time_spent_secs: u64,

    /// Whether the session deadline cut the run short
    pub deadline_reached: bool,

    /// Mean coverage over all classes, skipped classes counting as zero
    pub total_coverage: f64,

    /// Every class, in declaration order
    pub classes: Vec<ClassReport>,
}

impl SessionReport {
    /// Classes that ended skipped.
    pub fn skipped(&self) -> impl Iterator<Item = &ClassReport> {
        self.classes.iter().filter(|c| c.outcome == ClassOutcome::Skipped)
    }

    /// Classes that ended completed.
    pub fn completed(&self) -> impl Iterator<Item = &ClassReport> {
        self.classes.iter().filter(|c| c.outcome == ClassOutcome::Completed)
    }

    /// Report line for `class`.
    pub fn class(&self, class: &str) -> Option<&ClassReport> {
        self.classes.iter().find(|c| c.class == class)
    }
}

/// What earlier sessions learned about one class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassHistory {
    /// Sessions in which the class reached a terminal state
    pub sessions: u32,

    /// Best coverage ever archived
    pub best_coverage: Option<f64>,

    /// Coverage from the most recent session that completed the class
    pub last_coverage: Option<f64>,

    /// Outcome in the most recent session
    pub last_outcome: Option<ClassOutcome>,
}

/// State carried from one session to the next.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    /// Dependencies learned so far
    #[serde(default)]
    pub index: DependencyIndex,

    /// Per-class results
    #[serde(default)]
    pub classes: BTreeMap<String, ClassHistory>,
}

impl History {
    /// Fold a finished session into the history.
    pub fn absorb(&mut self, report: &SessionReport, index: &DependencyIndex) {
        self.index.merge(index);
        for line in &report.classes {
            let entry = self.classes.entry(line.class.clone()).or_default();
            entry.sessions += 1;
            entry.last_outcome = Some(line.outcome);
            if let Some(coverage) = line.coverage {
                entry.last_coverage = Some(coverage);
                let best = entry.best_coverage.map_or(coverage, |b| b.max(coverage));
                entry.best_coverage = Some(best);
            }
        }
    }

    /// Last known coverage of `class`, `None` if it never completed.
    pub fn last_coverage(&self, class: &str) -> Option<f64> {
        self.classes.get(class).and_then(|h| h.last_coverage)
    }
}
