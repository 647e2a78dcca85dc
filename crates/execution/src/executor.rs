//! Job executors - the boundary to the external search engine.

use async_trait::async_trait;
use ctgen_core::{
    ClassDependencies, ClassSet, CrashCause, EngineConfig, JobDefinition, JobResult, JobStatus,
    TestArtifact, TestSuite,
};
use serde::Deserialize;
use std::io;
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Fires a [`CancelSignal`].
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

/// Tells a running job to stop. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

/// Create a connected handle and signal.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelSignal(rx))
}

impl CancelHandle {
    /// Cancel every signal created from this handle.
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    /// Another signal bound to this handle.
    pub fn signal(&self) -> CancelSignal {
        CancelSignal(self.0.subscribe())
    }
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        cancel_pair().1
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                // Handle dropped without cancelling.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Runs a job and reports what happened.
///
/// Executors never fail: every outcome, including a failure to start the
/// engine, is a [`JobResult`]. A job that outlives its budget or is cancelled
/// reports [`JobStatus::TimedOut`].
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Execute `job`, stopping early if `cancel` fires.
    async fn execute(&self, job: &JobDefinition, cancel: CancelSignal) -> JobResult;
}

/// Last stdout line of a successful engine run.
#[derive(Debug, Deserialize)]
struct EngineReport {
    #[serde(default)]
    coverage: f64,
    #[serde(default)]
    tests: Vec<TestArtifact>,
    #[serde(default)]
    inputs: ClassSet,
    #[serde(default)]
    parents: ClassSet,
    #[serde(default)]
    peak_memory_mb: Option<u32>,
}

/// Launches the engine as a child process per job.
pub struct ProcessExecutor {
    engine: EngineConfig,
}

impl ProcessExecutor {
    /// Create an executor for `engine`.
    pub fn new(engine: EngineConfig) -> Self {
        Self { engine }
    }

    fn command(&self, job: &JobDefinition) -> Command {
        let mut cmd = Command::new(&self.engine.program);
        cmd.args(self.engine.args.iter().map(|a| render(a, job)))
            .env("CTGEN_JOB_ID", job.job_id().to_string())
            .env("CTGEN_CUT", job.cut())
            .env("CTGEN_SECONDS", job.seconds().to_string())
            .env("CTGEN_MEMORY_MB", job.memory_mb().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The engine leads its own group so its children can be killed with it.
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &self.engine.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn interpret(&self, job: &JobDefinition, output: Output, elapsed: Duration) -> JobResult {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let report = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .and_then(|l| serde_json::from_str::<EngineReport>(l.trim()).ok());

        let mut result = match report {
            Some(report) => JobResult::completed(
                job,
                TestSuite { tests: report.tests },
                report.coverage,
                elapsed,
            )
            .peak_memory(report.peak_memory_mb)
            .discovered(ClassDependencies::new(report.inputs, report.parents)),
            None if output.status.success() => {
                return JobResult::with_status(
                    job,
                    crashed(Some(0), "engine report missing or malformed".to_string()),
                    elapsed,
                );
            }
            None => JobResult::with_status(job, JobStatus::Completed, elapsed),
        };

        let over_ceiling = result.peak_memory_mb.is_some_and(|peak| peak > job.memory_mb());
        if self.is_oom(&output, &stderr) || over_ceiling {
            result.status = JobStatus::Crashed {
                cause: CrashCause::OutOfMemory,
            };
        } else if !output.status.success() {
            let message = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("")
                .to_string();
            result.status = crashed(output.status.code(), message);
        }
        result
    }

    fn is_oom(&self, output: &Output, stderr: &str) -> bool {
        if output.status.code() == Some(self.engine.oom_exit_code) {
            return true;
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if output.status.signal() == Some(9) {
                return true;
            }
        }
        stderr.contains("OutOfMemoryError")
    }
}

#[async_trait]
impl JobExecutor for ProcessExecutor {
    async fn execute(&self, job: &JobDefinition, mut cancel: CancelSignal) -> JobResult {
        let start = Instant::now();
        let limit = Duration::from_secs(u64::from(job.seconds()));

        let mut child = match self.command(job).spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("failed to start {}: {}", self.engine.program, e);
                return JobResult::with_status(job, crashed(None, message), start.elapsed());
            }
        };
        let pid = child.id();
        debug!("Job {} started (pid {:?})", job.job_id(), pid);

        let stopped = tokio::select! {
            output = collect_output(&mut child) => Ok(output),
            _ = tokio::time::sleep(limit) => {
                debug!("Job {} hit its {}s limit", job.job_id(), job.seconds());
                Err(limit)
            }
            _ = cancel.cancelled() => {
                debug!("Job {} cancelled", job.job_id());
                Err(start.elapsed())
            }
        };

        let output = match stopped {
            Ok(output) => output,
            Err(elapsed) => {
                terminate(&mut child, pid).await;
                return JobResult::with_status(job, JobStatus::TimedOut, elapsed);
            }
        };

        match output {
            Ok(output) => self.interpret(job, output, start.elapsed()),
            Err(e) => JobResult::with_status(
                job,
                crashed(None, format!("failed to collect engine output: {}", e)),
                start.elapsed(),
            ),
        }
    }
}

fn crashed(exit_code: Option<i32>, message: String) -> JobStatus {
    JobStatus::Crashed {
        cause: CrashCause::Abnormal { exit_code, message },
    }
}

/// Substitute job fields into an argument template.
fn render(template: &str, job: &JobDefinition) -> String {
    let join = |set: Option<&ClassSet>| {
        set.map(|s| s.iter().map(String::as_str).collect::<Vec<_>>().join(","))
            .unwrap_or_default()
    };
    template
        .replace("{cut}", job.cut())
        .replace("{seconds}", &job.seconds().to_string())
        .replace("{memory_mb}", &job.memory_mb().to_string())
        .replace("{configuration_id}", &job.configuration_id().to_string())
        .replace("{job_id}", &job.job_id().to_string())
        .replace("{inputs}", &join(job.input_classes()))
        .replace("{parents}", &join(job.parent_classes()))
}

/// Wait for `child` while draining both pipes.
async fn collect_output(child: &mut Child) -> io::Result<Output> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (status, stdout, stderr) = tokio::try_join!(child.wait(), drain(stdout), drain(stderr))?;
    Ok(Output { status, stdout, stderr })
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Kill the engine with everything it spawned, then reap it.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    kill_group(pid);
    if let Err(e) = child.start_kill() {
        debug!("Engine already gone: {}", e);
    }
    if let Err(e) = child.wait().await {
        warn!("Failed to reap engine process: {}", e);
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
        return;
    };
    // SAFETY: killpg only reads its integer arguments. The group id is the
    // engine's pid since it was spawned with process_group(0).
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!("killpg({}) failed: {}", pgid, io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use ctgen_core::JobIdCounter;

    fn job(seconds: u32) -> JobDefinition {
        let inputs = ["b.B".to_string(), "c.C".to_string()].into();
        JobDefinition::new(&JobIdCounter::new(), seconds, 128, "a.A", 3, Some(inputs), None)
            .unwrap()
    }

    fn shell(script: &str) -> ProcessExecutor {
        ProcessExecutor::new(EngineConfig::new("sh").with_args(["-c", script]))
    }

    #[test]
    fn test_render_template() {
        let job = job(60);
        assert_eq!(
            render("-class={cut} -t {seconds} -mem {memory_mb} -c{configuration_id}", &job),
            "-class=a.A -t 60 -mem 128 -c3"
        );
        assert_eq!(render("{inputs}|{parents}", &job), "b.B,c.C|");
    }

    #[tokio::test]
    async fn test_cancel_signal() {
        let (handle, signal) = cancel_pair();
        assert!(!signal.is_cancelled());
        let mut other = handle.signal();
        handle.cancel();
        other.cancelled().await;
        assert!(signal.is_cancelled());
        assert!(!CancelSignal::never().is_cancelled());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_run() {
        let executor = shell(concat!(
            r#"echo progress; echo '{"coverage": 0.75, "#,
            r#""tests": [{"name": "t0", "content": "x"}], "#,
            r#""inputs": ["d.D"], "peak_memory_mb": 100}'"#,
        ));
        let result = executor.execute(&job(30), CancelSignal::never()).await;

        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.coverage, 0.75);
        assert_eq!(result.suite.len(), 1);
        assert_eq!(result.peak_memory_mb, Some(100));
        assert!(result.discovered.inputs.contains("d.D"));
        assert_eq!(result.configuration_id, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_is_set() {
        let script = r#"echo "{\"coverage\": 0.1, \"inputs\": [\"$CTGEN_CUT-$CTGEN_SECONDS\"]}""#;
        let executor = shell(script);
        let result = executor.execute(&job(30), CancelSignal::never()).await;
        assert!(result.discovered.inputs.contains("a.A-30"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_engine() {
        let start = Instant::now();
        let result = shell("sleep 10").execute(&job(1), CancelSignal::never()).await;
        assert_eq!(result.status, JobStatus::TimedOut);
        assert_eq!(result.elapsed, Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_stops_engine() {
        let (handle, signal) = cancel_pair();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.cancel();
        });

        let start = Instant::now();
        let result = shell("sleep 10").execute(&job(30), signal).await;
        assert_eq!(result.status, JobStatus::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_engine_children() {
        let temp = tempfile::tempdir().unwrap();
        let mark = temp.path().join("late");
        let script = format!("(sleep 3; touch '{}'); true", mark.display());

        let result = shell(&script).execute(&job(1), CancelSignal::never()).await;
        assert_eq!(result.status, JobStatus::TimedOut);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!mark.exists(), "engine child outlived the job");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_oom_detection() {
        let by_code = shell("exit 137").execute(&job(30), CancelSignal::never()).await;
        assert_eq!(by_code.status, JobStatus::Crashed { cause: CrashCause::OutOfMemory });

        let by_stderr = shell("echo 'java.lang.OutOfMemoryError: heap' >&2; exit 1")
            .execute(&job(30), CancelSignal::never())
            .await;
        assert_eq!(by_stderr.status, JobStatus::Crashed { cause: CrashCause::OutOfMemory });

        let by_peak = shell(r#"echo '{"coverage": 0.5, "peak_memory_mb": 4096}'"#)
            .execute(&job(30), CancelSignal::never())
            .await;
        assert_eq!(by_peak.status, JobStatus::Crashed { cause: CrashCause::OutOfMemory });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_abnormal_exit() {
        let result = shell("echo boom >&2; exit 3").execute(&job(30), CancelSignal::never()).await;
        assert_eq!(
            result.status,
            JobStatus::Crashed {
                cause: CrashCause::Abnormal { exit_code: Some(3), message: "boom".to_string() }
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_report() {
        let result = shell("echo done").execute(&job(30), CancelSignal::never()).await;
        assert!(matches!(
            result.status,
            JobStatus::Crashed { cause: CrashCause::Abnormal { exit_code: Some(0), .. } }
        ));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let executor = ProcessExecutor::new(EngineConfig::new("/nonexistent/ctgen-engine"));
        let result = executor.execute(&job(30), CancelSignal::never()).await;
        assert!(matches!(
            result.status,
            JobStatus::Crashed { cause: CrashCause::Abnormal { exit_code: None, .. } }
        ));
    }
}
