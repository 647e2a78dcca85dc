//! The session engine - runs the dispatch loop across a worker pool.

use std::sync::Arc;
use std::time::Duration;

use ctgen_core::{
    DependencyIndex, History, JobIdCounter, ProjectManifest, SessionConfig, SessionId,
    SessionReport,
};
use ctgen_storage::Storage;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::analyzer::{DependencyAnalyzer, NoopAnalyzer};
use crate::archive::{ReportContext, ResultArchive};
use crate::budget::BudgetManager;
use crate::error::{ExecutionError, Result};
use crate::executor::{cancel_pair, CancelHandle, JobExecutor};
use crate::scheduler::{Decision, Scheduler};

/// What a finished session leaves behind.
#[derive(Debug)]
pub struct SessionOutcome {
    /// Final report
    pub report: SessionReport,
    /// Dependency index including everything learned this session
    pub index: DependencyIndex,
}

/// Runs one scheduling session.
///
/// ```text
/// Analyze → [Rank → Reserve → Execute → Record]* → Finalize → Persist
/// ```
///
/// Workers share one scheduler behind a mutex. Jobs run outside the lock;
/// a worker that finds nothing it can dispatch while other jobs are running
/// parks until one of them reports back.
pub struct SessionEngine {
    config: SessionConfig,
    classes: Vec<String>,
    declared: DependencyIndex,
    executor: Arc<dyn JobExecutor>,
    analyzer: Arc<dyn DependencyAnalyzer>,
    storage: Option<Arc<dyn Storage>>,
    session_id: SessionId,
}

struct SessionState {
    scheduler: Scheduler,
    archive: ResultArchive,
    index: DependencyIndex,
}

struct Shared {
    state: Mutex<SessionState>,
    budget: BudgetManager,
    ids: JobIdCounter,
    wake: Notify,
    cancel: CancelHandle,
    executor: Arc<dyn JobExecutor>,
}

impl SessionEngine {
    /// Create an engine for the classes in `manifest`.
    pub fn new(
        config: SessionConfig,
        manifest: &ProjectManifest,
        executor: Arc<dyn JobExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            classes: manifest.class_names(),
            declared: manifest.declared_dependencies(),
            executor,
            analyzer: Arc::new(NoopAnalyzer),
            storage: None,
            session_id: SessionId::new(),
        })
    }

    /// Set the dependency analyzer.
    pub fn with_analyzer(mut self, analyzer: Arc<dyn DependencyAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Persist history, reports and suites to `storage`.
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Id of the session this engine runs.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Run the session to completion.
    pub async fn run(self) -> Result<SessionOutcome> {
        let started_at = chrono::Utc::now();
        info!(
            "Session {} starting: {} classes, {}s budget, {} workers",
            self.session_id,
            self.classes.len(),
            self.config.total_budget_secs,
            self.config.worker_count()
        );

        let history = match &self.storage {
            Some(storage) => storage.load_history().await?,
            None => History::default(),
        };

        let mut index = history.index.clone();
        index.merge(&self.declared);

        let mut scheduler = Scheduler::new(&self.config, self.classes.clone(), &history);
        let unanalyzed = scheduler.take_unanalyzed();

        let (cancel, _) = cancel_pair();
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState {
                scheduler,
                archive: ResultArchive::new(self.config.merge_policy),
                index,
            }),
            budget: BudgetManager::new(self.config.total_budget_secs),
            ids: JobIdCounter::new(),
            wake: Notify::new(),
            cancel,
            executor: self.executor.clone(),
        });

        // The deadline covers analysis as well as dispatch.
        let deadline = self.config.session_deadline_secs.map(|secs| {
            let shared = shared.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                warn!("Session deadline of {}s reached, stopping", secs);
                shared.state.lock().await.scheduler.stop();
                shared.cancel.cancel();
                shared.wake.notify_waiters();
            })
        });

        self.analyze(unanalyzed, &shared).await;

        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.worker_count() {
            workers.spawn(worker(shared.clone(), worker_id));
        }

        let mut failure = None;
        while let Some(joined) = workers.join_next().await {
            let outcome = joined.map_err(ExecutionError::from).and_then(|r| r);
            if let Err(e) = outcome {
                error!("Worker failed: {}", e);
                workers.abort_all();
                shared.cancel.cancel();
                failure.get_or_insert(e);
            }
        }
        if let Some(task) = deadline {
            task.abort();
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let mut state = shared.state.lock().await;
        let deadline_reached = state.scheduler.is_stopped();
        state.scheduler.finish();
        let report = state.archive.finalize(
            &state.scheduler,
            ReportContext {
                session_id: self.session_id,
                started_at,
                total_budget_secs: self.config.total_budget_secs,
                deadline_reached,
            },
        );

        if let Some(storage) = &self.storage {
            for (class, configuration_id, archived) in state.archive.suites() {
                storage.save_suite(class, configuration_id, &archived.suite).await?;
            }
            storage.save_report(&report).await?;

            let mut history = history;
            history.absorb(&report, &state.index);
            storage.save_history(&history).await?;
        }

        info!(
            "Session {} finished: {} completed, {} skipped, {}s of {}s spent, coverage {:.2}",
            self.session_id,
            report.completed().count(),
            report.skipped().count(),
            report.time_spent_secs,
            report.total_budget_secs,
            report.total_coverage
        );

        Ok(SessionOutcome {
            report,
            index: state.index.clone(),
        })
    }

    /// Run the analyzer over `classes`, bounded by the worker count.
    ///
    /// Stops early, abandoning outstanding analyses, once the session is cancelled.
    async fn analyze(&self, classes: Vec<String>, shared: &Shared) {
        if classes.is_empty() {
            return;
        }

        let permits = Arc::new(Semaphore::new(self.config.worker_count()));
        let mut tasks = JoinSet::new();
        for class in classes {
            let analyzer = self.analyzer.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let deps = analyzer.analyze(&class).await;
                (class, deps)
            });
        }

        let mut cancelled = shared.cancel.signal();
        loop {
            let joined = tokio::select! {
                joined = tasks.join_next() => joined,
                _ = cancelled.cancelled() => {
                    warn!("Session cancelled, abandoning {} dependency analyses", tasks.len());
                    tasks.abort_all();
                    return;
                }
            };
            match joined {
                Some(Ok((class, Ok(deps)))) => {
                    shared.state.lock().await.index.record_all(&class, &deps);
                }
                Some(Ok((class, Err(e)))) => {
                    warn!("Dependency analysis of {} failed: {}", class, e)
                }
                Some(Err(e)) => warn!("Dependency analysis task failed: {}", e),
                None => return,
            }
        }
    }
}

async fn worker(shared: Arc<Shared>, worker_id: usize) -> Result<()> {
    debug!("Worker {} started", worker_id);
    loop {
        // Registered before the state check so a wake between the two is not lost.
        let notified = shared.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let decision = {
            let mut state = shared.state.lock().await;
            let SessionState { scheduler, index, .. } = &mut *state;
            scheduler.next_dispatch(index, &shared.budget, &shared.ids)?
        };

        match decision {
            Decision::Finished => {
                debug!("Worker {} done", worker_id);
                shared.wake.notify_waiters();
                return Ok(());
            }
            Decision::Wait => notified.await,
            Decision::Dispatch(dispatch) => {
                let result = shared
                    .executor
                    .execute(dispatch.job(), shared.cancel.signal())
                    .await;
                {
                    let mut state = shared.state.lock().await;
                    let SessionState { scheduler, archive, index } = &mut *state;
                    scheduler.on_result(dispatch, &result, &shared.budget)?;
                    archive.record(result, index);
                }
                shared.wake.notify_waiters();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ctgen_core::{
        ClassDependencies, ClassEntry, ClassOutcome, JobDefinition, JobResult, JobStatus,
        TestArtifact, TestSuite,
    };
    use ctgen_storage::JsonStorage;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use crate::executor::CancelSignal;

    /// Completes every job instantly, recording the dispatch order.
    #[derive(Default)]
    struct RecordingExecutor {
        order: StdMutex<Vec<String>>,
        discovered: HashMap<String, ClassDependencies>,
    }

    #[async_trait]
    impl JobExecutor for RecordingExecutor {
        async fn execute(&self, job: &JobDefinition, _cancel: CancelSignal) -> JobResult {
            self.order.lock().unwrap().push(job.cut().to_string());
            tokio::task::yield_now().await;
            let test = TestArtifact {
                name: format!("{}Test", job.cut()),
                content: String::new(),
            };
            let suite = TestSuite { tests: vec![test] };
            JobResult::completed(job, suite, 0.5, Duration::from_secs(10))
                .discovered(self.discovered.get(job.cut()).cloned().unwrap_or_default())
        }
    }

    /// Blocks until cancelled.
    struct HangingExecutor;

    #[async_trait]
    impl JobExecutor for HangingExecutor {
        async fn execute(&self, job: &JobDefinition, mut cancel: CancelSignal) -> JobResult {
            let start = std::time::Instant::now();
            cancel.cancelled().await;
            JobResult::with_status(job, JobStatus::TimedOut, start.elapsed())
        }
    }

    struct StaticAnalyzer(HashMap<String, ClassDependencies>);

    #[async_trait]
    impl DependencyAnalyzer for StaticAnalyzer {
        async fn analyze(&self, class: &str) -> anyhow::Result<ClassDependencies> {
            Ok(self.0.get(class).cloned().unwrap_or_default())
        }
    }

    /// Never returns.
    struct StuckAnalyzer;

    #[async_trait]
    impl DependencyAnalyzer for StuckAnalyzer {
        async fn analyze(&self, _class: &str) -> anyhow::Result<ClassDependencies> {
            std::future::pending().await
        }
    }

    /// Fails for one class, knows nothing about the rest.
    struct FailingAnalyzer(&'static str);

    #[async_trait]
    impl DependencyAnalyzer for FailingAnalyzer {
        async fn analyze(&self, class: &str) -> anyhow::Result<ClassDependencies> {
            if class == self.0 {
                anyhow::bail!("cannot load {}", class);
            }
            Ok(ClassDependencies::default())
        }
    }

    fn deps(inputs: &[&str]) -> ClassDependencies {
        ClassDependencies::new(inputs.iter().map(|s| s.to_string()).collect(), Default::default())
    }

    fn config(total: u64) -> SessionConfig {
        SessionConfig {
            total_budget_secs: total,
            job_budget_secs: 60,
            min_job_budget_secs: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_declared_dependency_runs_first() {
        let manifest = ProjectManifest {
            name: "demo".to_string(),
            classes: vec![
                ClassEntry::Declared { name: "A".to_string(), dependencies: deps(&["B"]) },
                ClassEntry::Name("B".to_string()),
            ],
        };
        let executor = Arc::new(RecordingExecutor::default());
        let outcome = SessionEngine::new(config(120), &manifest, executor.clone())
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(*executor.order.lock().unwrap(), vec!["B", "A"]);
        assert_eq!(outcome.report.completed().count(), 2);
        assert_eq!(outcome.report.time_spent_secs, 20);
        assert!((outcome.report.total_coverage - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_analyzer_feeds_ranking() {
        let manifest = ProjectManifest::from_names(["A", "B"]);
        let executor = Arc::new(RecordingExecutor::default());
        let analyzer = StaticAnalyzer([("A".to_string(), deps(&["B"]))].into());

        let outcome = SessionEngine::new(config(1000), &manifest, executor.clone())
            .unwrap()
            .with_analyzer(Arc::new(analyzer))
            .run()
            .await
            .unwrap();

        assert_eq!(*executor.order.lock().unwrap(), vec!["B", "A"]);
        assert!(outcome.index.lookup("A").inputs.contains("B"));
    }

    #[tokio::test]
    async fn test_discovered_dependencies_are_kept() {
        let manifest = ProjectManifest::from_names(["A"]);
        let executor = Arc::new(RecordingExecutor {
            discovered: [("A".to_string(), deps(&["X"]))].into(),
            ..Default::default()
        });

        let outcome = SessionEngine::new(config(1000), &manifest, executor)
            .unwrap()
            .run()
            .await
            .unwrap();
        assert!(outcome.index.lookup("A").inputs.contains("X"));
    }

    #[tokio::test]
    async fn test_concurrent_workers_respect_budget() {
        let names: Vec<String> = (0..20).map(|i| format!("c{:02}", i)).collect();
        let manifest = ProjectManifest::from_names(names.clone());
        let executor = Arc::new(RecordingExecutor::default());
        let config = SessionConfig { concurrency: 4, ..config(300) };

        let outcome = SessionEngine::new(config, &manifest, executor.clone())
            .unwrap()
            .run()
            .await
            .unwrap();

        let report = outcome.report;
        assert!(report.time_spent_secs <= 300);
        assert_eq!(report.classes.len(), 20);
        assert_eq!(executor.order.lock().unwrap().len(), report.completed().count());
        for line in report.skipped() {
            assert_eq!(line.reasons, vec!["insufficient remaining budget".to_string()]);
        }
        // 300s at 10s per job is enough for everything.
        assert_eq!(report.completed().count(), 20);
    }

    #[tokio::test]
    async fn test_deadline_stops_session() {
        let manifest = ProjectManifest::from_names(["A", "B"]);
        let config = SessionConfig { session_deadline_secs: Some(1), ..config(1000) };

        let outcome = SessionEngine::new(config, &manifest, Arc::new(HangingExecutor))
            .unwrap()
            .run()
            .await
            .unwrap();

        let report = outcome.report;
        assert!(report.deadline_reached);
        assert_eq!(report.completed().count(), 0);
        let a = report.class("A").unwrap();
        assert_eq!(a.outcome, ClassOutcome::Skipped);
        assert_eq!(a.attempts, 1);
        assert_eq!(a.reasons.last().map(String::as_str), Some("session deadline reached"));
        assert_eq!(report.class("B").unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_deadline_covers_analysis() {
        let manifest = ProjectManifest::from_names(["A", "B"]);
        let config = SessionConfig { session_deadline_secs: Some(1), ..config(1000) };
        let executor = Arc::new(RecordingExecutor::default());

        let engine = SessionEngine::new(config, &manifest, executor.clone())
            .unwrap()
            .with_analyzer(Arc::new(StuckAnalyzer));
        let outcome = tokio::time::timeout(Duration::from_secs(5), engine.run())
            .await
            .expect("session outlived its deadline")
            .unwrap();

        let report = outcome.report;
        assert!(report.deadline_reached);
        assert!(executor.order.lock().unwrap().is_empty());
        for line in &report.classes {
            assert_eq!(line.outcome, ClassOutcome::Skipped);
            assert_eq!(line.attempts, 0);
            assert_eq!(line.reasons, vec!["session deadline reached".to_string()]);
        }
    }

    #[tokio::test]
    async fn test_failed_analysis_still_schedules_class() {
        let manifest = ProjectManifest::from_names(["A", "B"]);
        let executor = Arc::new(RecordingExecutor::default());

        let outcome = SessionEngine::new(config(1000), &manifest, executor.clone())
            .unwrap()
            .with_analyzer(Arc::new(FailingAnalyzer("A")))
            .run()
            .await
            .unwrap();

        assert_eq!(*executor.order.lock().unwrap(), vec!["A", "B"]);
        let a = outcome.report.class("A").unwrap();
        assert_eq!(a.outcome, ClassOutcome::Completed);
        assert_eq!(a.attempts, 1);
        assert!(outcome.index.lookup("A").is_empty());
        assert_eq!(outcome.report.completed().count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = SessionConfig { concurrency: 0, ..Default::default() };
        let manifest = ProjectManifest::from_names(["A"]);
        assert!(SessionEngine::new(config, &manifest, Arc::new(HangingExecutor)).is_err());
    }

    #[tokio::test]
    async fn test_persists_to_storage() {
        let temp = tempfile::tempdir().unwrap();
        let storage = Arc::new(JsonStorage::new(temp.path()).await.unwrap());
        let manifest = ProjectManifest::from_names(["a.A"]);

        let executor = Arc::new(RecordingExecutor::default());
        let outcome = SessionEngine::new(config(1000), &manifest, executor)
            .unwrap()
            .with_storage(storage.clone())
            .run()
            .await
            .unwrap();

        let latest = storage.load_latest_report().await.unwrap().unwrap();
        assert_eq!(latest.session_id, outcome.report.session_id);

        let suite = storage.load_suite("a.A", 0).await.unwrap().unwrap();
        assert_eq!(suite.len(), 1);

        let history = storage.load_history().await.unwrap();
        assert_eq!(history.last_coverage("a.A"), Some(0.5));
    }
}
