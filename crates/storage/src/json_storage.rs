//! JSON file storage implementation.
//!
//! Stores state as pretty-printed JSON under a root directory (`.ctgen/` by
//! default):
//!
//! ```text
//! history.json                 dependency index + per-class coverage history
//! reports/<session-id>.json    finalized session reports
//! suites/<class>@<config>.json archived suites
//! ```

use std::path::{Path, PathBuf};

use ctgen_core::{History, SessionReport, TestSuite};
use tokio::fs;
use tracing::debug;

use super::{Result, Storage};

/// File-based JSON storage backend.
pub struct JsonStorage {
    root: PathBuf,
}

impl JsonStorage {
    /// Open storage rooted at `root`, creating the directories it needs.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(root.join("reports")).await?;
        fs::create_dir_all(root.join("suites")).await?;

        Ok(Self { root })
    }

    fn history_path(&self) -> PathBuf {
        self.root.join("history.json")
    }

    /// Path a report for `report` is written to.
    pub fn report_path(&self, report: &SessionReport) -> PathBuf {
        self.root.join("reports").join(format!("{}.json", report.session_id))
    }

    fn suite_path(&self, class: &str, configuration_id: i32) -> PathBuf {
        self.root
            .join("suites")
            .join(format!("{}@{}.json", file_stem(class), configuration_id))
    }
}

#[async_trait::async_trait]
impl Storage for JsonStorage {
    async fn load_history(&self) -> Result<History> {
        Ok(read_json(&self.history_path()).await?.unwrap_or_default())
    }

    async fn save_history(&self, history: &History) -> Result<()> {
        write_json(&self.history_path(), history).await?;
        debug!("Saved history ({} classes)", history.classes.len());
        Ok(())
    }

    async fn save_report(&self, report: &SessionReport) -> Result<()> {
        write_json(&self.report_path(report), report).await
    }

    async fn load_latest_report(&self) -> Result<Option<SessionReport>> {
        let reports: Vec<SessionReport> = list_dir(&self.root.join("reports")).await?;
        Ok(reports.into_iter().max_by_key(|r| r.finished_at))
    }

    async fn save_suite(
        &self,
        class: &str,
        configuration_id: i32,
        suite: &TestSuite,
    ) -> Result<()> {
        write_json(&self.suite_path(class, configuration_id), suite).await
    }

    async fn load_suite(&self, class: &str, configuration_id: i32) -> Result<Option<TestSuite>> {
        read_json(&self.suite_path(class, configuration_id)).await
    }
}

/// Map a class name onto a portable file stem.
///
/// Bytes outside `[A-Za-z0-9._$-]` become `%XX`, so distinct names never
/// share a file.
fn file_stem(class: &str) -> String {
    let mut stem = String::with_capacity(class.len());
    for byte in class.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-' | b'$') {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{:02X}", byte));
        }
    }
    stem
}

async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json.as_bytes()).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let value = serde_json::from_str(&json)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn list_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        if entry.path().extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        if let Ok(Some(item)) = read_json(&entry.path()).await {
            items.push(item);
        }
    }
    Ok(items)
}
