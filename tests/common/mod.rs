// Shared fixtures for the pipeline integration tests: a scripted database
// engine and a context wired to a temporary backup root.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dbvault::config::{ConnectionParams, EncryptionKey, VaultConfig};
use dbvault::context::VaultContext;
use dbvault::engine::{ChangeSummary, CreateOutcome, Dump, EngineError, Probe, Restore, RestoreOptions};
use dbvault::notify::RecordingNotifier;
use dbvault::remote::MemoryObjectStore;
use dbvault::resilience::RetryConfig;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const STRUCTURED_CONTENT: &[u8] = b"PGDMP structured dump of app";
pub const CHANGES_CONTENT: &str = "COPY \"public\".\"users\" FROM stdin;\n1\talice\n\\.\n";

/// One call the pipelines made against the engine
#[derive(Debug, Clone)]
pub struct Call {
    pub name: String,
    pub at: DateTime<Utc>,
    /// Bytes of the file handed to a restore call
    pub payload: Option<Vec<u8>>,
    pub schema: Option<String>,
}

#[derive(Default)]
struct Script {
    calls: Vec<Call>,
    dump_delay: Option<Duration>,
    fail_dump: bool,
    unreachable: bool,
    table_count: u64,
    users: Option<u64>,
    archive_mode: String,
}

/// Engine double: writes small fake artifacts and records every call
#[derive(Clone)]
pub struct FakeEngine {
    script: Arc<Mutex<Script>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                table_count: 3,
                users: Some(10),
                archive_mode: "on".to_string(),
                ..Script::default()
            })),
        }
    }

    pub fn with_dump_delay(self, delay: Duration) -> Self {
        self.script.lock().unwrap().dump_delay = Some(delay);
        self
    }

    pub fn set_dump_delay(&self, delay: Option<Duration>) {
        self.script.lock().unwrap().dump_delay = delay;
    }

    pub fn set_fail_dump(&self, fail: bool) {
        self.script.lock().unwrap().fail_dump = fail;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.script.lock().unwrap().unreachable = unreachable;
    }

    pub fn set_table_count(&self, count: u64) {
        self.script.lock().unwrap().table_count = count;
    }

    pub fn set_archive_mode(&self, mode: &str) {
        self.script.lock().unwrap().archive_mode = mode.to_string();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn call_names(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.name).collect()
    }

    pub fn clear_calls(&self) {
        self.script.lock().unwrap().calls.clear();
    }

    /// Any call that writes to the target database
    pub fn destructive_calls(&self) -> Vec<String> {
        self.call_names()
            .into_iter()
            .filter(|n| {
                matches!(
                    n.as_str(),
                    "create_database" | "ensure_schema" | "restore_structured" | "replay_sql"
                )
            })
            .collect()
    }

    fn record(&self, name: &str, payload: Option<Vec<u8>>, schema: Option<String>) {
        self.script.lock().unwrap().calls.push(Call {
            name: name.to_string(),
            at: Utc::now(),
            payload,
            schema,
        });
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        let delay = self.script.lock().unwrap().dump_delay;
        if let Some(delay) = delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Ok(())
    }

    fn failing_dump(&self) -> bool {
        self.script.lock().unwrap().fail_dump
    }
}

#[async_trait]
impl Dump for FakeEngine {
    async fn dump_structured(
        &self,
        _target: &ConnectionParams,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.record("dump_structured", None, None);
        // Partial output first, so failure paths have something to clean up
        tokio::fs::write(output, &STRUCTURED_CONTENT[..5]).await?;
        self.pause(cancel).await?;
        if self.failing_dump() {
            return Err(EngineError::ToolFailed {
                tool: "pg_dump".to_string(),
                code: Some(1),
                stderr: "permission denied for table users".to_string(),
            });
        }
        tokio::fs::write(output, STRUCTURED_CONTENT).await?;
        Ok(())
    }

    async fn render_plain(
        &self,
        structured: &Path,
        output: &Path,
        _cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.record("render_plain", None, None);
        let source = tokio::fs::read(structured).await?;
        let sql = format!("-- rendered from {} bytes\nCREATE TABLE users (id int);\n", source.len());
        tokio::fs::write(output, sql).await?;
        Ok(())
    }

    async fn dump_changes(
        &self,
        _target: &ConnectionParams,
        _since: DateTime<Utc>,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<ChangeSummary, EngineError> {
        self.record("dump_changes", None, None);
        self.pause(cancel).await?;
        tokio::fs::write(output, CHANGES_CONTENT).await?;
        Ok(ChangeSummary {
            tables: vec!["public.users".to_string()],
        })
    }
}

#[async_trait]
impl Restore for FakeEngine {
    async fn restore_structured(
        &self,
        _target: &ConnectionParams,
        artifact: &Path,
        options: &RestoreOptions,
        _cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let payload = tokio::fs::read(artifact).await?;
        self.record("restore_structured", Some(payload), options.schema.clone());
        Ok(())
    }

    async fn replay_sql(
        &self,
        _target: &ConnectionParams,
        script: &Path,
        _cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let payload = tokio::fs::read(script).await?;
        self.record("replay_sql", Some(payload), None);
        Ok(())
    }
}

#[async_trait]
impl Probe for FakeEngine {
    async fn probe(&self, target: &ConnectionParams) -> Result<(), EngineError> {
        self.record("probe", None, None);
        if self.script.lock().unwrap().unreachable {
            return Err(EngineError::Unreachable(format!("connection refused: {}", target)));
        }
        Ok(())
    }

    async fn create_database(&self, _target: &ConnectionParams) -> Result<CreateOutcome, EngineError> {
        self.record("create_database", None, None);
        Ok(CreateOutcome::Created)
    }

    async fn ensure_schema(&self, _target: &ConnectionParams, schema: &str) -> Result<(), EngineError> {
        self.record("ensure_schema", None, Some(schema.to_string()));
        Ok(())
    }

    async fn table_count(&self, _target: &ConnectionParams, _schema: &str) -> Result<u64, EngineError> {
        self.record("table_count", None, None);
        Ok(self.script.lock().unwrap().table_count)
    }

    async fn row_count(
        &self,
        _target: &ConnectionParams,
        _schema: &str,
        table: &str,
    ) -> Result<Option<u64>, EngineError> {
        self.record("row_count", None, None);
        Ok(match table {
            "users" => self.script.lock().unwrap().users,
            _ => None,
        })
    }

    async fn archive_mode(&self, _target: &ConnectionParams) -> Result<String, EngineError> {
        self.record("archive_mode", None, None);
        Ok(self.script.lock().unwrap().archive_mode.clone())
    }
}

pub fn target() -> ConnectionParams {
    ConnectionParams::new("db.internal", 5432, "app", "backup").with_password("secret")
}

/// Temporary backup root plus everything a pipeline runs against
pub struct Harness {
    pub dir: TempDir,
    pub engine: FakeEngine,
    pub bucket: Option<MemoryObjectStore>,
    pub notifier: RecordingNotifier,
    pub ctx: Arc<VaultContext>,
}

pub struct HarnessBuilder {
    engine: FakeEngine,
    bucket: Option<MemoryObjectStore>,
    key: Option<String>,
    retention_days: Option<u32>,
    wal_archive: bool,
    cancel: Option<CancellationToken>,
    timeout: Option<Duration>,
}

impl HarnessBuilder {
    pub fn engine(mut self, engine: FakeEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn remote(mut self) -> Self {
        self.bucket = Some(MemoryObjectStore::new("app-backups"));
        self
    }

    pub fn bucket(mut self, bucket: MemoryObjectStore) -> Self {
        self.bucket = Some(bucket);
        self
    }

    pub fn encryption_key(mut self, passphrase: &str) -> Self {
        self.key = Some(passphrase.to_string());
        self
    }

    pub fn retention_days(mut self, days: u32) -> Self {
        self.retention_days = Some(days);
        self
    }

    pub fn wal_archive(mut self) -> Self {
        self.wal_archive = true;
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Harness {
        let dir = tempfile::tempdir().expect("temp dir");
        self.build_in(dir)
    }

    /// Reuse an existing root, e.g. to restore with a different key
    pub fn build_in(self, dir: TempDir) -> Harness {
        let mut config = VaultConfig::new(target(), dir.path().join("backups"));
        config.encryption_key = self.key.map(EncryptionKey::new);
        config.operation_timeout = self.timeout;
        if let Some(days) = self.retention_days {
            config.retention_days = days;
        }
        if self.wal_archive {
            let wal = dir.path().join("wal");
            std::fs::create_dir_all(&wal).expect("wal dir");
            config.wal_archive_dir = Some(wal);
        }

        let notifier = RecordingNotifier::new();
        let mut builder = VaultContext::builder(config)
            .engine(Arc::new(self.engine.clone()))
            .notifier(Arc::new(notifier.clone()))
            .retry(RetryConfig::immediate(3));
        if let Some(bucket) = &self.bucket {
            builder = builder.object_store(Arc::new(bucket.clone()));
        }
        if let Some(cancel) = self.cancel {
            builder = builder.cancel_token(cancel);
        }

        Harness {
            ctx: Arc::new(builder.build()),
            dir,
            engine: self.engine,
            bucket: self.bucket,
            notifier,
        }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            engine: FakeEngine::new(),
            bucket: None,
            key: None,
            retention_days: None,
            wal_archive: false,
            cancel: None,
            timeout: None,
        }
    }

    pub fn local() -> Self {
        Self::builder().build()
    }

    pub fn root(&self) -> &Path {
        self.ctx.store.root()
    }

    /// File names in the backup root, sorted, hidden entries and
    /// directories excluded
    pub fn files(&self) -> Vec<String> {
        let mut names: Vec<String> = match std::fs::read_dir(self.root()) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .filter_map(|e| e.file_name().to_str().map(str::to_string))
                .filter(|n| !n.starts_with('.') && n != "operations.log")
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }
}
