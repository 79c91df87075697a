use std::{
    fs,
    path::PathBuf,
    sync::atomic::{AtomicU32, Ordering},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tracing::info;

use crate::tree::NodeStatus;

/// Allocates run numbers for new operating sessions. Production setups back
/// this with an external registry service.
#[async_trait]
pub trait RunNumberSource: Send + Sync {
    async fn next_run_number(&self) -> Result<u32>;
}

/// In-process counter, good enough for standalone operation and tests.
pub struct SequentialRunNumbers {
    next: AtomicU32,
}

impl SequentialRunNumbers {
    pub fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }
}

#[async_trait]
impl RunNumberSource for SequentialRunNumbers {
    async fn next_run_number(&self) -> Result<u32> {
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

pub struct MissingRunNumberSource;

#[async_trait]
impl RunNumberSource for MissingRunNumberSource {
    async fn next_run_number(&self) -> Result<u32> {
        Err(anyhow!("no run number source is attached"))
    }
}

/// Persists immutable configuration snapshots around the run lifecycle.
#[async_trait]
pub trait ConfigSaver: Send + Sync {
    async fn save_on_start(
        &self,
        snapshot: &NodeStatus,
        run: u32,
        run_type: &str,
        overwrite: &Map<String, Value>,
        method: &str,
    ) -> Result<PathBuf>;

    async fn save_on_stop(&self, run: u32) -> Result<PathBuf>;

    async fn save_on_resume(
        &self,
        snapshot: &NodeStatus,
        overwrite: &Map<String, Value>,
        method: &str,
    ) -> Result<PathBuf>;
}

/// Writes one JSON document per lifecycle event into a dump directory.
pub struct FileConfigSaver {
    dir: PathBuf,
}

impl FileConfigSaver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn write_json(&self, filename: &str, body: &Value) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).with_context(|| {
            format!("failed to create snapshot directory '{}'", self.dir.display())
        })?;
        let path = self.dir.join(filename);
        let encoded = serde_json::to_vec_pretty(body).context("failed to encode snapshot")?;
        fs::write(&path, encoded)
            .with_context(|| format!("failed to write snapshot '{}'", path.display()))?;
        Ok(path)
    }
}

#[async_trait]
impl ConfigSaver for FileConfigSaver {
    async fn save_on_start(
        &self,
        snapshot: &NodeStatus,
        run: u32,
        run_type: &str,
        overwrite: &Map<String, Value>,
        method: &str,
    ) -> Result<PathBuf> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let filename = format!("run{run:06}_{method}_{stamp}.json");
        let body = serde_json::json!({
            "apparatus": snapshot,
            "run": run,
            "run_type": run_type,
            "overrides": overwrite,
            "saved_at": Utc::now().to_rfc3339(),
        });
        let path = self.write_json(&filename, &body)?;
        info!(run, path = %path.display(), "saved start configuration");
        Ok(path)
    }

    async fn save_on_stop(&self, run: u32) -> Result<PathBuf> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let filename = format!("run{run:06}_stop_{stamp}.json");
        let body = serde_json::json!({
            "run": run,
            "stopped_at": Utc::now().to_rfc3339(),
        });
        self.write_json(&filename, &body)
    }

    async fn save_on_resume(
        &self,
        snapshot: &NodeStatus,
        overwrite: &Map<String, Value>,
        method: &str,
    ) -> Result<PathBuf> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let filename = format!("{method}_{stamp}.json");
        let body = serde_json::json!({
            "apparatus": snapshot,
            "overrides": overwrite,
            "saved_at": Utc::now().to_rfc3339(),
        });
        self.write_json(&filename, &body)
    }
}

pub struct MissingConfigSaver;

#[async_trait]
impl ConfigSaver for MissingConfigSaver {
    async fn save_on_start(
        &self,
        _snapshot: &NodeStatus,
        _run: u32,
        _run_type: &str,
        _overwrite: &Map<String, Value>,
        _method: &str,
    ) -> Result<PathBuf> {
        Err(anyhow!("configuration persistence is unavailable"))
    }

    async fn save_on_stop(&self, _run: u32) -> Result<PathBuf> {
        Err(anyhow!("configuration persistence is unavailable"))
    }

    async fn save_on_resume(
        &self,
        _snapshot: &NodeStatus,
        _overwrite: &Map<String, Value>,
        _method: &str,
    ) -> Result<PathBuf> {
        Err(anyhow!("configuration persistence is unavailable"))
    }
}

/// Narrow interface to the electronic logbook. Entries are best effort: the
/// facade logs a failure and moves on rather than blocking the run.
#[async_trait]
pub trait Logbook: Send + Sync {
    async fn message_on_start(
        &self,
        message: &str,
        run: u32,
        run_type: &str,
        operator: &str,
    ) -> Result<()>;

    async fn message_on_stop(&self, message: &str, operator: &str) -> Result<()>;

    async fn add_message(&self, message: &str, operator: &str) -> Result<()>;
}

pub struct NullLogbook;

#[async_trait]
impl Logbook for NullLogbook {
    async fn message_on_start(
        &self,
        _message: &str,
        _run: u32,
        _run_type: &str,
        _operator: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn message_on_stop(&self, _message: &str, _operator: &str) -> Result<()> {
        Ok(())
    }

    async fn add_message(&self, _message: &str, _operator: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::FsmState;

    fn snapshot() -> NodeStatus {
        NodeStatus {
            name: "teststand".to_string(),
            kind: crate::tree::NodeKind::Group,
            state: FsmState::Configured,
            last_result: None,
            children: Vec::new(),
        }
    }

    #[tokio::test]
    async fn sequential_run_numbers_advance() {
        let source = SequentialRunNumbers::starting_at(41);
        assert_eq!(source.next_run_number().await.expect("first"), 41);
        assert_eq!(source.next_run_number().await.expect("second"), 42);
    }

    #[tokio::test]
    async fn start_snapshot_lands_in_the_dump_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let saver = FileConfigSaver::new(dir.path());
        let mut overwrite = Map::new();
        overwrite.insert("run".to_string(), Value::from(7));

        let path = saver
            .save_on_start(&snapshot(), 7, "TEST", &overwrite, "runtime_start")
            .await
            .expect("save");

        assert!(path.starts_with(dir.path()));
        let raw = fs::read_to_string(&path).expect("read back");
        let body: Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(body["run"], 7);
        assert_eq!(body["run_type"], "TEST");
        assert_eq!(body["apparatus"]["name"], "teststand");
        assert_eq!(body["overrides"]["run"], 7);
    }

    #[tokio::test]
    async fn stop_marker_records_the_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let saver = FileConfigSaver::new(dir.path());
        let path = saver.save_on_stop(123).await.expect("save");
        let body: Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read back")).expect("json");
        assert_eq!(body["run"], 123);
        assert!(body["stopped_at"].is_string());
    }

    #[tokio::test]
    async fn missing_saver_refuses() {
        let saver = MissingConfigSaver;
        assert!(saver.save_on_stop(1).await.is_err());
    }
}
