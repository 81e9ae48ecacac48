//! Restore pipeline
//!
//! `Start -> Fetch -> Verify -> Decrypt -> [CreateDatabase] -> Snapshot ->
//! Restore -> Validate -> Done`, any failure ending in `Failed`. The checksum
//! covers the bytes as stored, so an encrypted artifact is verified before it
//! is decrypted. Everything before `Snapshot` is non-destructive, and the
//! snapshot is sealed on disk before the first destructive statement runs.

mod tenant;
mod validation;

pub use tenant::TenantId;
pub use validation::{validate, ValidationReport};

use crate::backup::{catalog, compression};
use crate::backup::{ArtifactFormat, ArtifactName, BackupArtifact, BackupOrchestrator};
use crate::cancel::{checkpoint, PipelineToken};
use crate::config::ConnectionParams;
use crate::context::VaultContext;
use crate::crypto::{self, CryptoError};
use crate::engine::{CreateOutcome, RestoreOptions};
use crate::integrity::{self, VerifyOutcome};
use crate::lock::{LockScope, TargetLock};
use crate::notify::{self, Notification, NotificationStatus};
use crate::oplog::{OperationRecord, OperationStatus};
use crate::{Result, Stage, VaultError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Restore state machine positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreState {
    /// Request accepted
    Start,
    /// Locating or downloading the artifact
    Fetch,
    /// Checking the checksum sidecar
    Verify,
    /// Decrypting into staging
    Decrypt,
    /// Creating the target database
    CreateDatabase,
    /// Taking the pre-restore snapshot
    Snapshot,
    /// Applying the artifact
    Restore,
    /// Running post-restore checks
    Validate,
    /// Finished
    Done,
    /// Stopped by an error
    Failed,
}

impl fmt::Display for RestoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestoreState::Start => "start",
            RestoreState::Fetch => "fetch",
            RestoreState::Verify => "verify",
            RestoreState::Decrypt => "decrypt",
            RestoreState::CreateDatabase => "create_database",
            RestoreState::Snapshot => "snapshot",
            RestoreState::Restore => "restore",
            RestoreState::Validate => "validate",
            RestoreState::Done => "done",
            RestoreState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What to restore, and where
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    /// Artifact name in the backup root, a file path, or an `s3://` URI
    pub source: String,
    /// Database to restore into
    pub target: ConnectionParams,
    /// Create the target database first; an existing one is fine
    pub create_database: bool,
    /// Restrict the restore to this tenant's schema
    pub tenant: Option<TenantId>,
}

impl RestoreRequest {
    /// Restore `source` into `target`
    pub fn new(source: impl Into<String>, target: ConnectionParams) -> Self {
        Self {
            source: source.into(),
            target,
            create_database: false,
            tenant: None,
        }
    }

    /// Create the target database before restoring
    pub fn create_database(mut self, create: bool) -> Self {
        self.create_database = create;
        self
    }

    /// Restrict the restore to one tenant schema
    pub fn tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }
}

/// Outcome of a completed restore
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    /// The artifact that was applied
    pub artifact: BackupArtifact,
    /// Snapshot taken before the first destructive step
    pub snapshot: BackupArtifact,
    /// Checksum outcome
    pub verification: VerifyOutcome,
    /// Post-restore checks
    pub validation: ValidationReport,
    /// When the first destructive step began
    pub restore_started_at: DateTime<Utc>,
    /// States visited, in order
    pub transitions: Vec<RestoreState>,
}

struct Transitions(Vec<RestoreState>);

impl Transitions {
    fn enter(&mut self, state: RestoreState) {
        info!(state = %state, "Restore state");
        self.0.push(state);
    }
}

/// Drives restores end to end
pub struct RestoreOrchestrator {
    ctx: Arc<VaultContext>,
}

impl RestoreOrchestrator {
    /// Orchestrator over a shared context
    pub fn new(ctx: Arc<VaultContext>) -> Self {
        Self { ctx }
    }

    /// Run a restore. Validation problems do not fail the call: inspect
    /// [`RestoreReport::validation`] or call
    /// [`ValidationReport::ensure_passed`].
    #[instrument(skip(self, request), fields(source = %request.source, target = %request.target, tenant = ?request.tenant))]
    pub async fn restore(&self, request: RestoreRequest) -> Result<RestoreReport> {
        let started = Instant::now();
        let pipeline = PipelineToken::new(&self.ctx.cancel, self.ctx.config.operation_timeout);
        let mut transitions = Transitions(vec![RestoreState::Start]);

        let result = self.run(&request, pipeline.token(), &mut transitions).await;
        if let Err(e) = &result {
            transitions.enter(RestoreState::Failed);
            error!(stage = ?e.stage(), error = %e, path = ?transitions.0, "Restore failed");
        }

        self.report(&request, &result, started.elapsed()).await;
        result
    }

    async fn run(
        &self,
        request: &RestoreRequest,
        cancel: &CancellationToken,
        transitions: &mut Transitions,
    ) -> Result<RestoreReport> {
        if let Some(tenant) = &request.tenant {
            reject_plain_for_tenant(declared_format(&request.source), &request.source, tenant)?;
        }

        let _lock = TargetLock::try_acquire(
            &self.ctx.store.lock_dir(),
            &request.target.target_id(),
            LockScope::Restore,
        )?;
        let staging = self
            .ctx
            .store
            .staging("restore")
            .map_err(|e| VaultError::restore(Stage::Fetch, e))?;

        transitions.enter(RestoreState::Fetch);
        checkpoint(cancel, Stage::Fetch)?;
        let artifact = catalog::resolve(&self.ctx, &request.source, staging.path()).await?;
        if let Some(tenant) = &request.tenant {
            reject_plain_for_tenant(Some(artifact.format), &request.source, tenant)?;
        }
        let stored = artifact
            .local_path
            .clone()
            .ok_or_else(|| VaultError::NotFound(request.source.clone()))?;

        transitions.enter(RestoreState::Verify);
        checkpoint(cancel, Stage::Verify)?;
        let verification = integrity::verify_artifact(&stored).await?;

        let mut working = stored.clone();
        if artifact.encrypted {
            transitions.enter(RestoreState::Decrypt);
            checkpoint(cancel, Stage::Decrypt)?;
            let key = self.ctx.config.encryption_key.as_ref().ok_or_else(|| {
                VaultError::Decryption("artifact is encrypted but no encryption key is configured".to_string())
            })?;
            let plain_name = crypto::plain_file_name(&stored).unwrap_or_else(|| "artifact".to_string());
            working = crypto::decrypt(&stored, &staging.path().join(plain_name), key)
                .await
                .map_err(decryption_failure)?;
        }

        let engine = &self.ctx.engine;
        if request.create_database {
            transitions.enter(RestoreState::CreateDatabase);
            match engine.create_database(&request.target).await {
                Ok(CreateOutcome::Created) => info!(database = %request.target.database, "Database created"),
                Ok(CreateOutcome::AlreadyExists) => {
                    info!(database = %request.target.database, "Database already exists, continuing")
                }
                Err(e) => return Err(VaultError::from_engine(Stage::CreateDatabase, e, true)),
            }
        }

        transitions.enter(RestoreState::Snapshot);
        let snapshot = BackupOrchestrator::new(self.ctx.clone())
            .snapshot(&request.target, cancel)
            .await?;
        info!(snapshot = %snapshot.file_name(), "Pre-restore snapshot sealed");

        transitions.enter(RestoreState::Restore);
        checkpoint(cancel, Stage::Restore)?;
        let restore_started_at = Utc::now();
        match artifact.format {
            ArtifactFormat::CustomCompressed => {
                let options = match &request.tenant {
                    Some(tenant) => {
                        engine
                            .ensure_schema(&request.target, &tenant.schema_name())
                            .await
                            .map_err(|e| VaultError::from_engine(Stage::Restore, e, true))?;
                        RestoreOptions {
                            schema: Some(tenant.schema_name()),
                            ..RestoreOptions::default()
                        }
                    }
                    None => RestoreOptions::default(),
                };
                engine
                    .restore_structured(&request.target, &working, &options, cancel)
                    .await
                    .map_err(|e| VaultError::from_engine(Stage::Restore, e, true))?;
            }
            ArtifactFormat::PlainSql => {
                let gzipped = compression::is_gzip(&working)
                    .await
                    .map_err(|e| VaultError::restore(Stage::Restore, e))?;
                let script = if gzipped {
                    let script = staging.path().join("replay.sql");
                    compression::gunzip_file(&working, &script)
                        .await
                        .map_err(|e| VaultError::restore(Stage::Restore, e))?;
                    script
                } else {
                    working.clone()
                };
                engine
                    .replay_sql(&request.target, &script, cancel)
                    .await
                    .map_err(|e| VaultError::from_engine(Stage::Restore, e, true))?;
            }
        }
        info!(artifact = %artifact.file_name(), "Restore applied");

        transitions.enter(RestoreState::Validate);
        let validation = validate(engine.as_ref(), &request.target, request.tenant.as_ref()).await;

        transitions.enter(RestoreState::Done);
        Ok(RestoreReport {
            artifact,
            snapshot,
            verification,
            validation,
            restore_started_at,
            transitions: transitions.0.clone(),
        })
    }

    async fn report(&self, request: &RestoreRequest, result: &Result<RestoreReport>, elapsed: Duration) {
        let operation = if request.tenant.is_some() { "restore_tenant" } else { "restore" };
        let target = request.target.to_string();

        let (record, status, message) = match result {
            Ok(report) if report.validation.passed() => {
                let message = format!("Restored {} into {}", report.artifact.file_name(), request.target.database);
                (
                    OperationRecord::new(operation, target, OperationStatus::Success)
                        .with_artifacts(vec![report.artifact.file_name(), report.snapshot.file_name()])
                        .with_message(&message),
                    NotificationStatus::Success,
                    message,
                )
            }
            Ok(report) => {
                let message = format!(
                    "Restored {} but validation failed: {}",
                    report.artifact.file_name(),
                    report.validation.problems.join("; ")
                );
                warn!(problems = ?report.validation.problems, "Restore completed with validation problems");
                (
                    OperationRecord::new(operation, target, OperationStatus::Failure)
                        .with_artifacts(vec![report.artifact.file_name(), report.snapshot.file_name()])
                        .with_stage(Some(Stage::Validate))
                        .with_message(&message),
                    NotificationStatus::Failure,
                    message,
                )
            }
            Err(e) => {
                let message = format!("Restore of {} failed: {}", request.source, e);
                (
                    OperationRecord::new(operation, target, OperationStatus::Failure)
                        .with_artifacts(vec![request.source.clone()])
                        .with_stage(e.stage())
                        .with_message(&message),
                    NotificationStatus::Failure,
                    message,
                )
            }
        };

        self.ctx.oplog.append(&record.with_duration(elapsed)).await;
        notify::dispatch(
            self.ctx.notifier.as_ref(),
            Notification {
                status,
                message,
                service: self.ctx.config.service_name.clone(),
                size_bytes: None,
                duration_secs: elapsed.as_secs_f64(),
            },
        )
        .await;
    }
}

/// Format implied by the source's file name, without touching it
fn declared_format(source: &str) -> Option<ArtifactFormat> {
    let name = source.rsplit('/').next().unwrap_or(source);
    ArtifactName::parse(name)
        .map(|parsed| parsed.format)
        .or_else(|| ArtifactFormat::infer(name))
}

fn reject_plain_for_tenant(format: Option<ArtifactFormat>, source: &str, tenant: &TenantId) -> Result<()> {
    match format {
        Some(ArtifactFormat::CustomCompressed) => Ok(()),
        Some(ArtifactFormat::PlainSql) => Err(VaultError::UnsupportedOperation(format!(
            "tenant restore of {} needs a structured dump; {} is plain SQL",
            tenant.schema_name(),
            source
        ))),
        None => Err(VaultError::UnsupportedOperation(format!(
            "cannot tell the format of {}; tenant restore needs a structured dump",
            source
        ))),
    }
}

fn decryption_failure(err: CryptoError) -> VaultError {
    match err {
        CryptoError::Decryption(cause) | CryptoError::KeyDerivation(cause) => VaultError::Decryption(cause),
        other => VaultError::restore(Stage::Decrypt, other),
    }
}
