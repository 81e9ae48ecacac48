//! Append-only operation log (`<backup root>/operations.log`, JSON lines)

use crate::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

/// Log file name inside the backup root
pub const OPERATION_LOG_FILE: &str = "operations.log";

/// How an operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Completed
    Success,
    /// Failed
    Failure,
    /// Not run because another run held the lock
    Skipped,
}

/// One line of the operation log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Unique record id
    pub id: Uuid,
    /// When the record was written
    pub timestamp: DateTime<Utc>,
    /// Operation name, e.g. `backup_full`
    pub operation: String,
    /// Outcome
    pub status: OperationStatus,
    /// Target the operation ran against
    pub target: String,
    /// Artifacts created, used or deleted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    /// Failing step, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    /// Human-readable summary
    pub message: String,
    /// Elapsed time
    pub duration_ms: u64,
}

impl OperationRecord {
    /// Record stamped now with a fresh id
    pub fn new(
        operation: impl Into<String>,
        target: impl Into<String>,
        status: OperationStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            operation: operation.into(),
            status,
            target: target.into(),
            artifacts: Vec::new(),
            stage: None,
            message: String::new(),
            duration_ms: 0,
        }
    }

    /// Artifacts involved
    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Failing step
    pub fn with_stage(mut self, stage: Option<Stage>) -> Self {
        self.stage = stage;
        self
    }

    /// Summary text
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Elapsed time
    pub fn with_duration(mut self, duration: std::time::Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }
}

/// Appender for the operation log
#[derive(Debug, Clone)]
pub struct OperationLog {
    path: PathBuf,
}

impl OperationLog {
    /// Log under `backup_root`
    pub fn new(backup_root: &Path) -> Self {
        Self {
            path: backup_root.join(OPERATION_LOG_FILE),
        }
    }

    /// Location of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record. Logging failures never fail the operation being logged.
    pub async fn append(&self, record: &OperationRecord) {
        if let Err(e) = self.try_append(record).await {
            warn!(log = %self.path.display(), error = %e, "Failed to append to operation log");
        }
    }

    async fn try_append(&self, record: &OperationRecord) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    /// All records in append order; unparseable lines are skipped
    pub async fn read_all(&self) -> std::io::Result<Vec<OperationRecord>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        Ok(contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
