//! Dispatch ordering and class state transitions.
//!
//! The scheduler is a plain state machine. Callers serialize access to it
//! (the session keeps it behind one async mutex) and run jobs outside that
//! critical section.

use std::collections::HashMap;

use ctgen_core::{
    CoreError, DependencyIndex, History, JobDefinition, JobIdCounter, JobResult, JobStatus,
    SessionConfig,
};
use tracing::{debug, info, warn};

use crate::budget::{BudgetGrant, BudgetManager};
use crate::error::{ExecutionError, Result};
use crate::selector::{Candidate, ClassSelector, SelectorStrategy};

/// Reason recorded for classes the budget could not reach.
pub const INSUFFICIENT_BUDGET: &str = "insufficient remaining budget";

/// Reason recorded for classes cut off by the session deadline.
pub const DEADLINE_REACHED: &str = "session deadline reached";

/// Where a class is in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for a dispatch
    Pending,
    /// A job is running
    InProgress,
    /// A suite was recorded
    Completed,
    /// Given up on
    Skipped,
}

/// Scheduling state of one class.
#[derive(Debug, Clone)]
pub struct ClassState {
    name: String,
    order: usize,
    phase: Phase,
    attempts: u32,
    timeouts: u32,
    crashes: u32,
    planned_secs: u32,
    time_spent_secs: u64,
    analyzed: bool,
    last_job: Option<JobDefinition>,
    failures: Vec<String>,
    skip_reason: Option<String>,
}

impl ClassState {
    fn new(name: String, order: usize, planned_secs: u32) -> Self {
        Self {
            name,
            order,
            phase: Phase::Pending,
            attempts: 0,
            timeouts: 0,
            crashes: 0,
            planned_secs,
            time_spent_secs: 0,
            analyzed: false,
            last_job: None,
            failures: Vec::new(),
            skip_reason: None,
        }
    }

    /// Class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Jobs dispatched so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Budget consumed by all attempts.
    pub fn time_spent_secs(&self) -> u64 {
        self.time_spent_secs
    }

    /// Failure history folded into runs (`"timed out ×2"`), followed by the
    /// skip reason if there is one.
    pub fn reasons(&self) -> Vec<String> {
        let mut chain: Vec<(String, u32)> = Vec::new();
        for label in &self.failures {
            match chain.last_mut() {
                Some((last, count)) if last == label => *count += 1,
                _ => chain.push((label.clone(), 1)),
            }
        }
        let mut reasons: Vec<String> = chain
            .into_iter()
            .map(|(label, count)| format!("{} ×{}", label, count))
            .collect();
        if let Some(reason) = &self.skip_reason {
            reasons.push(reason.clone());
        }
        reasons
    }
}

/// A job handed out by the scheduler, with the budget it holds.
#[derive(Debug)]
pub struct Dispatch {
    job: JobDefinition,
    grant: BudgetGrant,
    attempt: u32,
}

impl Dispatch {
    /// Job to run.
    pub fn job(&self) -> &JobDefinition {
        &self.job
    }

    /// 1-based attempt number for the class.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Seconds reserved for the job.
    pub fn granted_secs(&self) -> u64 {
        self.grant.seconds()
    }
}

/// What a worker should do next.
#[derive(Debug)]
pub enum Decision {
    /// Run this job
    Dispatch(Dispatch),
    /// Nothing fits right now, but running jobs may change that
    Wait,
    /// No further dispatches will happen
    Finished,
}

/// Where a class went after a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Class completed
    Completed,
    /// Class returned to pending for another attempt
    Requeued,
    /// Class skipped for the given reason
    Skipped(String),
}

/// Orders pending classes and tracks their state.
pub struct Scheduler {
    min_job_budget_secs: u32,
    job_memory_mb: u32,
    configuration_id: i32,
    max_retries: u32,
    selector: SelectorStrategy,
    classes: Vec<ClassState>,
    positions: HashMap<String, usize>,
    previous_coverage: HashMap<String, f64>,
    stopped: bool,
}

impl Scheduler {
    /// Create a scheduler for `classes`, in declaration order.
    ///
    /// Duplicate names keep their first position.
    pub fn new(config: &SessionConfig, classes: Vec<String>, history: &History) -> Self {
        let mut states = Vec::with_capacity(classes.len());
        let mut positions = HashMap::with_capacity(classes.len());
        for name in classes {
            if positions.contains_key(&name) {
                continue;
            }
            positions.insert(name.clone(), states.len());
            let order = states.len();
            states.push(ClassState::new(name, order, config.job_budget_secs));
        }

        let previous_coverage = states
            .iter()
            .filter_map(|c| history.last_coverage(&c.name).map(|cov| (c.name.clone(), cov)))
            .collect();

        Self {
            min_job_budget_secs: config.min_job_budget_secs,
            job_memory_mb: config.job_memory_mb,
            configuration_id: config.configuration_id,
            max_retries: config.max_retries,
            selector: SelectorStrategy::from_config(config.strategy, config.tie_break),
            classes: states,
            positions,
            previous_coverage,
            stopped: false,
        }
    }

    /// Pending classes that have not been through the analyzer yet.
    ///
    /// Returned classes are marked analyzed, so each class is handed out once.
    pub fn take_unanalyzed(&mut self) -> Vec<String> {
        self.classes
            .iter_mut()
            .filter(|c| c.phase == Phase::Pending && !c.analyzed)
            .map(|c| {
                c.analyzed = true;
                c.name.clone()
            })
            .collect()
    }

    /// Run one dispatch cycle.
    pub fn next_dispatch(
        &mut self,
        index: &DependencyIndex,
        budget: &BudgetManager,
        ids: &JobIdCounter,
    ) -> Result<Decision> {
        if self.stopped {
            return Ok(self.idle());
        }

        loop {
            let remaining = u32::try_from(budget.remaining()).unwrap_or(u32::MAX);
            let Some((pos, secs)) = self.pick(index, remaining) else {
                if self.count(Phase::Pending) > 0 && self.count(Phase::InProgress) == 0 {
                    debug!("{}s left, no pending class fits", remaining);
                }
                return Ok(self.idle());
            };

            let job = match self.build_job(pos, secs, index, ids) {
                Ok(job) => job,
                Err(ExecutionError::Core(CoreError::InvalidJobSpec(msg))) => {
                    warn!("Skipping {:?}: {}", self.classes[pos].name, msg);
                    self.skip(pos, msg);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let grant = match budget.reserve(u64::from(secs)) {
                Ok(grant) => grant,
                Err(ExecutionError::BudgetExhausted { .. }) => return Ok(self.idle()),
                Err(e) => return Err(e),
            };

            let class = &mut self.classes[pos];
            class.phase = Phase::InProgress;
            class.attempts += 1;
            info!(
                "Dispatching job {} ({}s, {} MB, attempt {})",
                job,
                secs,
                job.memory_mb(),
                class.attempts
            );

            return Ok(Decision::Dispatch(Dispatch {
                attempt: class.attempts,
                job,
                grant,
            }));
        }
    }

    /// Highest-ranked pending class whose grant is viable, with that grant.
    fn pick(&self, index: &DependencyIndex, remaining: u32) -> Option<(usize, u32)> {
        let pending: Vec<usize> = (0..self.classes.len())
            .filter(|&i| self.classes[i].phase == Phase::Pending)
            .collect();
        if pending.is_empty() {
            return None;
        }

        let candidates: Vec<Candidate<'_>> = pending
            .iter()
            .map(|&i| {
                let class = &self.classes[i];
                Candidate {
                    class: &class.name,
                    order: class.order,
                    penalty: class.timeouts,
                    previous_coverage: self.previous_coverage.get(&class.name).copied(),
                }
            })
            .collect();

        self.selector
            .rank(&candidates, index)
            .into_iter()
            .map(|r| pending[r])
            .map(|i| (i, self.classes[i].planned_secs.min(remaining)))
            .find(|&(_, secs)| secs >= self.min_job_budget_secs)
    }

    /// Build the job for the class at `pos` from the index's current knowledge.
    fn build_job(
        &self,
        pos: usize,
        secs: u32,
        index: &DependencyIndex,
        ids: &JobIdCounter,
    ) -> Result<JobDefinition> {
        let class = &self.classes[pos];
        let known = index.lookup(&class.name);

        if let Some(previous) = &class.last_job {
            if previous.seconds() == secs && previous.memory_mb() == self.job_memory_mb {
                let missing = known.unknown_to(previous);
                if !missing.is_empty() {
                    debug!("Deriving job for {} with new dependencies", class.name);
                    return Ok(previous.with_dependencies(
                        ids,
                        missing.inputs_opt(),
                        missing.parents_opt(),
                    )?);
                }
            }
        }

        Ok(JobDefinition::new(
            ids,
            secs,
            self.job_memory_mb,
            class.name.clone(),
            self.configuration_id,
            known.inputs_opt(),
            known.parents_opt(),
        )?)
    }

    /// Apply a job's result: release its unused budget and move its class on.
    pub fn on_result(
        &mut self,
        dispatch: Dispatch,
        result: &JobResult,
        budget: &BudgetManager,
    ) -> Result<Transition> {
        let Dispatch { job, grant, .. } = dispatch;
        let granted = grant.seconds();
        let used = match result.status {
            JobStatus::TimedOut => granted,
            _ => result.elapsed_secs().min(granted),
        };
        budget.release(grant, granted - used)?;

        let pos = *self
            .positions
            .get(job.cut())
            .ok_or_else(|| ExecutionError::UnknownClass(job.cut().to_string()))?;

        let max_retries = self.max_retries;
        let min_secs = self.min_job_budget_secs;
        let class = &mut self.classes[pos];
        class.time_spent_secs += used;
        class.last_job = Some(job);

        let transition = match &result.status {
            JobStatus::Completed => {
                class.phase = Phase::Completed;
                Transition::Completed
            }
            JobStatus::Crashed { .. } if !result.suite.is_empty() => {
                class.failures.push(result.status.label());
                class.phase = Phase::Completed;
                Transition::Completed
            }
            JobStatus::Crashed { .. } => {
                class.crashes += 1;
                class.failures.push(result.status.label());
                if class.crashes > 1 {
                    class.phase = Phase::Skipped;
                    Transition::Skipped(result.status.label())
                } else {
                    class.phase = Phase::Pending;
                    Transition::Requeued
                }
            }
            JobStatus::TimedOut => {
                class.timeouts += 1;
                class.failures.push(result.status.label());
                if class.timeouts > max_retries {
                    class.phase = Phase::Skipped;
                    Transition::Skipped(result.status.label())
                } else {
                    let halved = u32::try_from(granted / 2).unwrap_or(u32::MAX);
                    class.planned_secs = halved.max(min_secs);
                    class.phase = Phase::Pending;
                    Transition::Requeued
                }
            }
            JobStatus::Skipped { reason } => {
                class.phase = Phase::Skipped;
                class.skip_reason = Some(reason.clone());
                Transition::Skipped(reason.clone())
            }
        };

        match &transition {
            Transition::Completed => info!(
                "{} completed in {}s (coverage {:.2})",
                class.name, used, result.coverage
            ),
            Transition::Requeued => warn!(
                "{} {}, requeued with {}s",
                class.name, result.status, class.planned_secs
            ),
            Transition::Skipped(reason) => warn!("{} skipped: {}", class.name, reason),
        }

        Ok(transition)
    }

    /// Stop issuing dispatches; running jobs may still report back.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Whether [`Scheduler::stop`] was called.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Move every class that is not terminal to skipped.
    pub fn finish(&mut self) {
        let reason = if self.stopped { DEADLINE_REACHED } else { INSUFFICIENT_BUDGET };
        for pos in 0..self.classes.len() {
            if matches!(self.classes[pos].phase, Phase::Pending | Phase::InProgress) {
                self.skip(pos, reason.to_string());
            }
        }
    }

    fn skip(&mut self, pos: usize, reason: String) {
        let class = &mut self.classes[pos];
        class.phase = Phase::Skipped;
        class.skip_reason = Some(reason);
    }

    fn idle(&self) -> Decision {
        if self.count(Phase::InProgress) > 0 {
            Decision::Wait
        } else {
            Decision::Finished
        }
    }

    fn count(&self, phase: Phase) -> usize {
        self.classes.iter().filter(|c| c.phase == phase).count()
    }

    fn names(&self, phase: Phase) -> Vec<&str> {
        self.classes
            .iter()
            .filter(|c| c.phase == phase)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Classes waiting for a dispatch.
    pub fn pending(&self) -> Vec<&str> {
        self.names(Phase::Pending)
    }

    /// Classes with a running job.
    pub fn in_progress(&self) -> Vec<&str> {
        self.names(Phase::InProgress)
    }

    /// Classes with a recorded suite.
    pub fn completed(&self) -> Vec<&str> {
        self.names(Phase::Completed)
    }

    /// Classes given up on.
    pub fn skipped(&self) -> Vec<&str> {
        self.names(Phase::Skipped)
    }

    /// All classes in declaration order.
    pub fn classes(&self) -> &[ClassState] {
        &self.classes
    }

    /// State of `class`.
    pub fn class(&self, class: &str) -> Option<&ClassState> {
        self.positions.get(class).map(|&i| &self.classes[i])
    }

    /// Parameter profile stamped on every job.
    pub fn configuration_id(&self) -> i32 {
        self.configuration_id
    }
}
