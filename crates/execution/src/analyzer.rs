//! Static dependency analysis run before a class's first dispatch.

use async_trait::async_trait;
use ctgen_core::ClassDependencies;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Reports the input and parent classes of a class under test.
///
/// Failures are not fatal: the session logs them and schedules the class
/// with whatever the index already knows.
#[async_trait]
pub trait DependencyAnalyzer: Send + Sync {
    /// Analyze `class`.
    async fn analyze(&self, class: &str) -> anyhow::Result<ClassDependencies>;
}

/// Analyzer that knows nothing.
pub struct NoopAnalyzer;

#[async_trait]
impl DependencyAnalyzer for NoopAnalyzer {
    async fn analyze(&self, _class: &str) -> anyhow::Result<ClassDependencies> {
        Ok(ClassDependencies::default())
    }
}

/// Runs an external program per class and reads
/// `{"inputs": [...], "parents": [...]}` from its stdout.
///
/// `{cut}` in any argument is replaced with the class name. A run that
/// outlasts the timeout is killed and counts as a failed analysis.
pub struct CommandAnalyzer {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl CommandAnalyzer {
    /// Time allowed per class unless overridden.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create an analyzer running `program` with argument templates `args`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Run the program from `dir`.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Kill runs that take longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl DependencyAnalyzer for CommandAnalyzer {
    async fn analyze(&self, class: &str) -> anyhow::Result<ClassDependencies> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args.iter().map(|a| a.replace("{cut}", class)));
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(std::process::Stdio::null()).kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(output) => output?,
            Err(_) => anyhow::bail!("analyzer timed out after {}s", self.timeout.as_secs_f64()),
        };
        if !output.status.success() {
            anyhow::bail!(
                "analyzer exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let deps: ClassDependencies = serde_json::from_str(stdout.trim())?;
        debug!(
            "Analyzed {}: {} inputs, {} parents",
            class,
            deps.inputs.len(),
            deps.parents.len()
        );
        Ok(deps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_is_empty() {
        assert!(NoopAnalyzer.analyze("a.A").await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_analyzer_parses_stdout() {
        let analyzer = CommandAnalyzer::new(
            "sh",
            vec![
                "-c".to_string(),
                r#"echo "{\"inputs\": [\"$0.Helper\"], \"parents\": [\"Base\"]}""#.to_string(),
                "{cut}".to_string(),
            ],
        );

        let deps = analyzer.analyze("a.A").await.unwrap();
        assert!(deps.inputs.contains("a.A.Helper"));
        assert!(deps.parents.contains("Base"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_analyzer_failure() {
        let analyzer = CommandAnalyzer::new("sh", vec!["-c".to_string(), "exit 4".to_string()]);
        assert!(analyzer.analyze("a.A").await.is_err());

        let garbage = CommandAnalyzer::new("sh", vec!["-c".to_string(), "echo nope".to_string()]);
        assert!(garbage.analyze("a.A").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_analyzer_timeout() {
        let analyzer = CommandAnalyzer::new("sh", vec!["-c".to_string(), "sleep 10".to_string()])
            .with_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let err = analyzer.analyze("a.A").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_analyzer_working_dir() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("deps.json"), r#"{"inputs": ["b.B"]}"#).unwrap();

        let args = vec!["-c".to_string(), "cat deps.json".to_string()];
        let analyzer = CommandAnalyzer::new("sh", args).with_working_dir(temp.path());
        assert!(analyzer.analyze("a.A").await.unwrap().inputs.contains("b.B"));
    }
}
