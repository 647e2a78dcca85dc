//! ctgen CLI - continuous test generation across a project.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ctgen_core::{ClassOutcome, EngineConfig, ProjectManifest, SessionConfig, SessionReport};
use ctgen_execution::{CommandAnalyzer, ProcessExecutor, SessionEngine};
use ctgen_storage::{JsonStorage, Storage};

#[derive(Parser)]
#[command(name = "ctgen")]
#[command(about = "Continuous test generation scheduler", long_about = None)]
struct Cli {
    /// State directory (history, reports, suites)
    #[arg(long, global = true, default_value = ".ctgen")]
    store: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scheduling session
    Run(RunArgs),
    /// Show the latest session report
    Report {
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Show learned class dependencies
    Deps {
        /// Only this class
        class: Option<String>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Project manifest (JSON)
    #[arg(long)]
    project: PathBuf,

    /// Session config file (JSON); flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Total budget in seconds
    #[arg(long)]
    budget: Option<u64>,

    /// Budget per job in seconds
    #[arg(long)]
    job_budget: Option<u32>,

    /// Maximum concurrent jobs
    #[arg(long)]
    concurrency: Option<usize>,

    /// Wall-clock session deadline in seconds
    #[arg(long)]
    deadline: Option<u64>,

    /// Dependency analyzer program (`{cut}` in its args is the class)
    #[arg(long)]
    analyzer: Option<String>,

    /// Argument for the analyzer program (repeatable)
    #[arg(long = "analyzer-arg", allow_hyphen_values = true)]
    analyzer_args: Vec<String>,

    /// Seconds allowed per analyzer run
    #[arg(long, default_value_t = 60)]
    analyzer_timeout: u64,

    /// Engine exit code that means the memory ceiling was hit
    #[arg(long, default_value_t = 137)]
    oom_exit_code: i32,

    /// Working directory for the engine and the analyzer
    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// Engine program followed by its argument templates
    #[arg(last = true, required = true)]
    engine: Vec<String>,
}

impl RunArgs {
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config: SessionConfig = match &self.config {
            Some(path) => read_json(path)?,
            None => SessionConfig::default(),
        };
        if let Some(budget) = self.budget {
            config.total_budget_secs = budget;
        }
        if let Some(job_budget) = self.job_budget {
            config.job_budget_secs = job_budget;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(deadline) = self.deadline {
            config.session_deadline_secs = Some(deadline);
        }
        Ok(config)
    }

    fn engine_config(&self) -> Result<EngineConfig> {
        let (program, args) = self
            .engine
            .split_first()
            .context("missing engine program after --")?;
        let mut engine = EngineConfig::new(program.clone()).with_args(args.iter().cloned());
        engine.oom_exit_code = self.oom_exit_code;
        engine.working_dir = self.working_dir.clone();
        Ok(engine)
    }

    fn command_analyzer(&self) -> Option<CommandAnalyzer> {
        let program = self.analyzer.as_ref()?;
        let mut analyzer = CommandAnalyzer::new(program.clone(), self.analyzer_args.clone())
            .with_timeout(Duration::from_secs(self.analyzer_timeout));
        if let Some(dir) = &self.working_dir {
            analyzer = analyzer.with_working_dir(dir);
        }
        Some(analyzer)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let storage = Arc::new(JsonStorage::new(&cli.store).await?);

    match cli.command {
        Commands::Run(args) => {
            let config = args.session_config()?;
            let manifest: ProjectManifest = read_json(&args.project)?;
            let executor = Arc::new(ProcessExecutor::new(args.engine_config()?));

            let mut engine =
                SessionEngine::new(config, &manifest, executor)?.with_storage(storage.clone());
            if let Some(analyzer) = args.command_analyzer() {
                engine = engine.with_analyzer(Arc::new(analyzer));
            }

            info!("Running session {}", engine.session_id());
            let outcome = engine.run().await?;

            print_report(&outcome.report);
            println!("Report: {}", storage.report_path(&outcome.report).display());
        }
        Commands::Report { json } => {
            let Some(report) = storage.load_latest_report().await? else {
                println!("No sessions recorded in {}", cli.store.display());
                return Ok(());
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Commands::Deps { class } => {
            let history = storage.load_history().await?;
            let index = &history.index;
            match class {
                Some(class) => {
                    let deps = index.lookup(&class);
                    println!("{}", class);
                    println!("  Inputs: {}", join(deps.inputs.iter()));
                    println!("  Parents: {}", join(deps.parents.iter()));
                    println!("  Dependents: {}", join(index.dependents_of(&class).into_iter()));
                }
                None => {
                    println!("Dependencies ({})", index.len());
                    for (class, deps) in index.iter() {
                        println!("  {} <- {}", class, join(deps.all()));
                    }
                }
            }
        }
    }

    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn join<I, S>(items: I) -> String
where
    I: Iterator<Item = S>,
    S: AsRef<str>,
{
    let joined = items.map(|s| s.as_ref().to_string()).collect::<Vec<_>>().join(", ");
    if joined.is_empty() {
        "-".to_string()
    } else {
        joined
    }
}

fn format_outcome(outcome: ClassOutcome) -> &'static str {
    match outcome {
        ClassOutcome::Completed => "completed",
        ClassOutcome::Skipped => "skipped",
    }
}

fn print_report(report: &SessionReport) {
    println!("Session {}", report.session_id);
    println!(
        "  Time: {}s of {}s{}",
        report.time_spent_secs,
        report.total_budget_secs,
        if report.deadline_reached { " (deadline reached)" } else { "" }
    );
    println!("  Coverage: {:.2}", report.total_coverage);
    println!(
        "  Classes: {} completed, {} skipped",
        report.completed().count(),
        report.skipped().count()
    );

    for line in &report.classes {
        match line.outcome {
            ClassOutcome::Completed => println!(
                "  {} | {} | {:.2} | {} tests | {} attempts | {}s",
                line.class,
                format_outcome(line.outcome),
                line.coverage.unwrap_or(0.0),
                line.tests,
                line.attempts,
                line.time_spent_secs,
            ),
            ClassOutcome::Skipped => println!(
                "  {} | {} | {}",
                line.class,
                format_outcome(line.outcome),
                join(line.reasons.iter()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctgen_execution::DependencyAnalyzer;

    fn parse_run(args: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Commands::Run(run) => run,
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_run_with_engine_args() {
        let run = parse_run(&[
            "ctgen", "run", "--project", "p.json", "--budget", "600", "--", "java", "-jar",
            "engine.jar", "-class", "{cut}",
        ]);
        assert_eq!(run.budget, Some(600));

        let engine = run.engine_config().unwrap();
        assert_eq!(engine.program, "java");
        assert_eq!(engine.args, vec!["-jar", "engine.jar", "-class", "{cut}"]);
        assert_eq!(engine.oom_exit_code, 137);
    }

    #[test]
    fn test_run_requires_engine() {
        assert!(Cli::try_parse_from(["ctgen", "run", "--project", "p.json"]).is_err());
    }

    #[test]
    fn test_flags_override_config_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("session.json");
        let raw = r#"{"total_budget_secs": 900, "concurrency": 2, "max_retries": 5}"#;
        std::fs::write(&path, raw).unwrap();

        let run = parse_run(&[
            "ctgen", "run", "--project", "p.json", "--config", path.to_str().unwrap(),
            "--concurrency", "6", "--deadline", "120", "--", "engine",
        ]);
        let config = run.session_config().unwrap();
        assert_eq!(config.total_budget_secs, 900);
        assert_eq!(config.concurrency, 6);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.session_deadline_secs, Some(120));
    }

    #[test]
    fn test_read_manifest() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("project.json");
        std::fs::write(
            &path,
            r#"{"name": "demo", "classes": ["a.A", {"name": "b.B", "inputs": ["a.A"]}]}"#,
        )
        .unwrap();

        let manifest: ProjectManifest = read_json(&path).unwrap();
        assert_eq!(manifest.class_names(), vec!["a.A", "b.B"]);
        assert!(manifest.declared_dependencies().lookup("b.B").inputs.contains("a.A"));
        assert!(read_json::<ProjectManifest>(&temp.path().join("missing.json")).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_analyzer_runs_from_working_dir() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("deps.json"), r#"{"parents": ["base.Base"]}"#).unwrap();

        let run = parse_run(&[
            "ctgen", "run", "--project", "p.json", "--analyzer", "cat",
            "--analyzer-arg", "deps.json", "--working-dir", temp.path().to_str().unwrap(),
            "--", "engine",
        ]);
        assert_eq!(run.analyzer_timeout, 60);

        let analyzer = run.command_analyzer().unwrap();
        let deps = analyzer.analyze("a.A").await.unwrap();
        assert!(deps.parents.contains("base.Base"));
    }

    #[test]
    fn test_no_analyzer_without_program() {
        let run = parse_run(&["ctgen", "run", "--project", "p.json", "--", "engine"]);
        assert!(run.command_analyzer().is_none());
    }

    #[test]
    fn test_join_placeholder() {
        assert_eq!(join(Vec::<String>::new().iter()), "-");
        assert_eq!(join(["a", "b"].iter()), "a, b");
    }
}
