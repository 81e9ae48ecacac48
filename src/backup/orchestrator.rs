// Backup Orchestrator - full, incremental and pre-restore snapshot pipelines
//
// dump -> compress -> encrypt -> checksum -> upload, strictly in that order.
// Nothing gets a sidecar until every content-mutating step is done, and any
// failure before sealing removes the files the run created.

use super::{catalog, compression};
use super::types::{ArtifactFormat, ArtifactKind, ArtifactName, BackupArtifact, BackupSet};
use crate::cancel::{checkpoint, PipelineToken};
use crate::config::ConnectionParams;
use crate::context::VaultContext;
use crate::lock::{LockScope, TargetLock};
use crate::notify::{self, Notification, NotificationStatus};
use crate::oplog::{OperationRecord, OperationStatus};
use crate::integrity::{self, VerifyOutcome};
use crate::crypto;
use crate::{Result, Stage, VaultError};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const PLAIN_COMPRESSION_LEVEL: u32 = 6;

/// A finished but not yet sealed file
struct Pending {
    name: ArtifactName,
    path: PathBuf,
}

/// Drives backup creation end to end
pub struct BackupOrchestrator {
    ctx: Arc<VaultContext>,
}

impl BackupOrchestrator {
    /// Orchestrator over a shared context
    pub fn new(ctx: Arc<VaultContext>) -> Self {
        Self { ctx }
    }

    /// Create a full or incremental backup of `target`.
    ///
    /// A full backup yields two artifacts from one logical snapshot: the
    /// structured dump (primary) and a plain SQL rendering derived from it.
    /// An incremental backup captures rows created or updated inside the
    /// trailing window; it misses deletes and tables without `updated_at` /
    /// `created_at` columns, and is no substitute for a full backup.
    #[instrument(skip(self, target), fields(kind = %kind, target = %target))]
    pub async fn create_backup(
        &self,
        kind: ArtifactKind,
        target: &ConnectionParams,
    ) -> Result<BackupSet> {
        if kind == ArtifactKind::PreRestoreSnapshot {
            return Err(VaultError::UnsupportedOperation(
                "pre-restore snapshots are taken by the restore pipeline".to_string(),
            ));
        }

        let started = Instant::now();
        let pipeline = PipelineToken::new(&self.ctx.cancel, self.ctx.config.operation_timeout);
        let result = self.run(kind, target, pipeline.token()).await;
        self.report(kind, target, &result, started.elapsed()).await;
        result
    }

    async fn run(
        &self,
        kind: ArtifactKind,
        target: &ConnectionParams,
        cancel: &CancellationToken,
    ) -> Result<BackupSet> {
        let _lock = TargetLock::try_acquire(
            &self.ctx.store.lock_dir(),
            &target.target_id(),
            LockScope::Backup,
        )?;

        let mut artifacts = self.produce(kind, target, cancel).await?;

        if let Err(e) = self.upload_all(&mut artifacts, cancel).await {
            self.roll_back(&artifacts, &e).await;
            return Err(e);
        }

        let mut artifacts = artifacts.into_iter();
        let primary = artifacts
            .next()
            .ok_or_else(|| VaultError::backup(Stage::Dump, "pipeline produced no artifact"))?;
        Ok(BackupSet::new(primary, artifacts.collect()))
    }

    async fn upload_all(
        &self,
        artifacts: &mut [BackupArtifact],
        cancel: &CancellationToken,
    ) -> Result<()> {
        for artifact in artifacts.iter_mut() {
            checkpoint(cancel, Stage::Upload)?;
            let Some(path) = artifact.local_path.clone() else {
                continue;
            };
            artifact.remote_uri = tokio::select! {
                uploaded = self.ctx.remote.upload(&path) => {
                    uploaded.map_err(|e| VaultError::backup(Stage::Upload, e))?
                }
                _ = cancel.cancelled() => return Err(VaultError::Cancelled(Stage::Upload)),
            };
        }
        Ok(())
    }

    /// Undo a set whose upload did not finish. Every remote object of the set
    /// is removed. After a cancellation the local files go too; after a
    /// transfer failure the sealed local set stays usable.
    async fn roll_back(&self, artifacts: &[BackupArtifact], cause: &VaultError) {
        if self.ctx.remote.is_enabled() {
            for artifact in artifacts {
                let name = artifact.file_name();
                match self.ctx.remote.delete_artifact(&name).await {
                    Ok(()) => debug!(artifact = %name, "Removed remote copy of failed backup"),
                    Err(e) => warn!(
                        artifact = %name,
                        error = %e,
                        "Failed to remove remote copy of failed backup"
                    ),
                }
            }
        }

        if matches!(cause, VaultError::Cancelled(_)) {
            let paths: Vec<PathBuf> = artifacts
                .iter()
                .filter_map(|a| a.local_path.clone())
                .collect();
            discard(&paths).await;
        } else {
            warn!(artifacts = artifacts.len(), "Upload failed, sealed local artifacts kept");
        }
    }

    /// Check an artifact against its checksum sidecar. Remote references are
    /// downloaded into a scratch directory first, so this also proves the
    /// remote copy round-trips intact.
    #[instrument(skip(self))]
    pub async fn verify(&self, reference: &str) -> Result<(BackupArtifact, VerifyOutcome)> {
        let staging = self
            .ctx
            .store
            .staging("verify")
            .map_err(|e| VaultError::backup(Stage::Verify, e))?;
        let artifact = catalog::resolve(&self.ctx, reference, staging.path()).await?;
        let path = artifact
            .local_path
            .clone()
            .ok_or_else(|| VaultError::NotFound(reference.to_string()))?;

        let outcome = integrity::verify_artifact(&path).await?;
        match &outcome {
            VerifyOutcome::Verified { digest } => {
                info!(artifact = %artifact.file_name(), digest = %digest, "Artifact verified")
            }
            VerifyOutcome::Unverified => {
                warn!(artifact = %artifact.file_name(), "Artifact has no checksum file")
            }
        }
        Ok((artifact, outcome))
    }

    /// Take the safety snapshot that precedes every destructive restore. The
    /// snapshot is sealed locally before this returns; its upload is best
    /// effort.
    pub(crate) async fn snapshot(
        &self,
        target: &ConnectionParams,
        cancel: &CancellationToken,
    ) -> Result<BackupArtifact> {
        let mut artifacts = self
            .produce(ArtifactKind::PreRestoreSnapshot, target, cancel)
            .await
            .map_err(|e| match e {
                VaultError::Backup { cause, .. } => VaultError::restore(Stage::Snapshot, cause),
                VaultError::Cancelled(_) => VaultError::Cancelled(Stage::Snapshot),
                other => other,
            })?;

        let mut snapshot = artifacts
            .pop()
            .ok_or_else(|| VaultError::restore(Stage::Snapshot, "snapshot produced no artifact"))?;

        if let Some(path) = &snapshot.local_path {
            match self.ctx.remote.upload(path).await {
                Ok(uri) => snapshot.remote_uri = uri,
                Err(e) => warn!(
                    artifact = %snapshot.file_name(),
                    error = %e,
                    "Pre-restore snapshot upload failed, local copy kept"
                ),
            }
        }
        Ok(snapshot)
    }

    /// Dump and seal; on failure every file created so far is removed
    async fn produce(
        &self,
        kind: ArtifactKind,
        target: &ConnectionParams,
        cancel: &CancellationToken,
    ) -> Result<Vec<BackupArtifact>> {
        self.ctx
            .store
            .ensure_layout()
            .await
            .map_err(|e| VaultError::backup(Stage::Dump, e))?;
        self.ctx
            .engine
            .probe(target)
            .await
            .map_err(|e| VaultError::Connectivity(e.to_string()))?;

        let created_at = Utc::now();
        let mut scratch = Vec::new();
        let result = self.produce_into(kind, target, created_at, cancel, &mut scratch).await;
        if result.is_err() {
            discard(&scratch).await;
        }
        result
    }

    async fn produce_into(
        &self,
        kind: ArtifactKind,
        target: &ConnectionParams,
        created_at: DateTime<Utc>,
        cancel: &CancellationToken,
        scratch: &mut Vec<PathBuf>,
    ) -> Result<Vec<BackupArtifact>> {
        let engine = &self.ctx.engine;
        let store = &self.ctx.store;

        let pending = match kind {
            ArtifactKind::Full | ArtifactKind::PreRestoreSnapshot => {
                let structured =
                    ArtifactName::new(kind, ArtifactFormat::CustomCompressed, created_at);
                let structured_path = store.path_for(&structured);
                scratch.push(structured_path.clone());
                engine
                    .dump_structured(target, &structured_path, cancel)
                    .await
                    .map_err(|e| VaultError::from_engine(Stage::Dump, e, false))?;
                info!(artifact = %structured.file_name(), "Structured dump complete");

                let mut pending = vec![Pending {
                    name: structured,
                    path: structured_path.clone(),
                }];

                if kind == ArtifactKind::Full {
                    let plain = ArtifactName::new(kind, ArtifactFormat::PlainSql, created_at);
                    let gz_path = store.path_for(&plain);
                    let sql_path = gz_path.with_extension("");
                    scratch.push(sql_path.clone());
                    engine
                        .render_plain(&structured_path, &sql_path, cancel)
                        .await
                        .map_err(|e| VaultError::from_engine(Stage::Dump, e, false))?;

                    self.compress(&sql_path, &gz_path, cancel, scratch).await?;
                    pending.push(Pending { name: plain, path: gz_path });
                }
                pending
            }
            ArtifactKind::Incremental => {
                let window = chrono::Duration::from_std(self.ctx.config.incremental_window)
                    .unwrap_or_else(|_| chrono::Duration::hours(24));
                let since = created_at - window;

                let name = ArtifactName::new(kind, ArtifactFormat::PlainSql, created_at);
                let gz_path = store.path_for(&name);
                let sql_path = gz_path.with_extension("");
                scratch.push(sql_path.clone());

                let summary = engine
                    .dump_changes(target, since, &sql_path, cancel)
                    .await
                    .map_err(|e| VaultError::from_engine(Stage::Dump, e, false))?;
                if summary.tables.is_empty() {
                    warn!("No table carries updated_at or created_at, the change set is empty");
                } else {
                    info!(tables = summary.tables.len(), since = %since, "Change set captured");
                }

                self.compress(&sql_path, &gz_path, cancel, scratch).await?;
                vec![Pending { name, path: gz_path }]
            }
        };

        let mut sealed = Vec::with_capacity(pending.len());
        for item in pending {
            sealed.push(self.seal(item, cancel, scratch).await?);
        }
        Ok(sealed)
    }

    async fn compress(
        &self,
        sql_path: &std::path::Path,
        gz_path: &std::path::Path,
        cancel: &CancellationToken,
        scratch: &mut Vec<PathBuf>,
    ) -> Result<()> {
        checkpoint(cancel, Stage::Compress)?;
        scratch.push(gz_path.to_path_buf());
        compression::gzip_file(sql_path, gz_path, PLAIN_COMPRESSION_LEVEL)
            .await
            .map_err(|e| VaultError::backup(Stage::Compress, e))?;
        fs::remove_file(sql_path)
            .await
            .map_err(|e| VaultError::backup(Stage::Compress, e))?;
        Ok(())
    }

    /// Optional encryption, then the checksum sidecar
    async fn seal(
        &self,
        item: Pending,
        cancel: &CancellationToken,
        scratch: &mut Vec<PathBuf>,
    ) -> Result<BackupArtifact> {
        let Pending { name, path } = item;

        let (path, encrypted) = match &self.ctx.config.encryption_key {
            Some(key) => {
                checkpoint(cancel, Stage::Encrypt)?;
                let encrypted_path = crypto::encrypt(&path, key)
                    .await
                    .map_err(|e| VaultError::backup(Stage::Encrypt, e))?;
                scratch.push(encrypted_path.clone());
                (encrypted_path, true)
            }
            None => (path, false),
        };

        checkpoint(cancel, Stage::Checksum)?;
        let digest = integrity::seal(&path)
            .await
            .map_err(|e| VaultError::backup(Stage::Checksum, e))?;
        let size_bytes = fs::metadata(&path)
            .await
            .map_err(|e| VaultError::backup(Stage::Checksum, e))?
            .len();

        debug!(artifact = %path.display(), digest = %digest, size_bytes, "Artifact sealed");

        Ok(BackupArtifact {
            id: name.id,
            kind: name.kind,
            format: name.format,
            local_path: Some(path),
            remote_uri: None,
            checksum: Some(digest),
            encrypted,
            created_at: name.created_at,
            size_bytes,
        })
    }

    async fn report(
        &self,
        kind: ArtifactKind,
        target: &ConnectionParams,
        result: &Result<BackupSet>,
        elapsed: Duration,
    ) {
        let label = match kind {
            ArtifactKind::Full => "Full",
            ArtifactKind::Incremental => "Incremental",
            ArtifactKind::PreRestoreSnapshot => "Snapshot",
        };
        let operation = format!("backup_{}", kind.prefix());

        let (record, notification) = match result {
            Ok(set) => {
                let message = format!("{} backup {} completed", label, set.id);
                info!(
                    backup_id = %set.id,
                    artifacts = set.artifacts().count(),
                    size_bytes = set.total_size(),
                    duration_ms = elapsed.as_millis() as u64,
                    "Backup completed"
                );
                (
                    OperationRecord::new(&operation, target.to_string(), OperationStatus::Success)
                        .with_artifacts(set.artifacts().map(|a| a.file_name()).collect())
                        .with_message(&message),
                    Notification {
                        status: NotificationStatus::Success,
                        message,
                        service: self.ctx.config.service_name.clone(),
                        size_bytes: Some(set.total_size()),
                        duration_secs: elapsed.as_secs_f64(),
                    },
                )
            }
            Err(e) => {
                let message = format!("{} backup failed: {}", label, e);
                error!(stage = ?e.stage(), error = %e, "Backup failed");
                (
                    OperationRecord::new(&operation, target.to_string(), OperationStatus::Failure)
                        .with_stage(e.stage())
                        .with_message(&message),
                    Notification {
                        status: NotificationStatus::Failure,
                        message,
                        service: self.ctx.config.service_name.clone(),
                        size_bytes: None,
                        duration_secs: elapsed.as_secs_f64(),
                    },
                )
            }
        };

        self.ctx.oplog.append(&record.with_duration(elapsed)).await;
        notify::dispatch(self.ctx.notifier.as_ref(), notification).await;
    }
}

/// Remove partial output, sidecars included
async fn discard(paths: &[PathBuf]) {
    for path in paths {
        for candidate in [integrity::sidecar_path(path), path.clone()] {
            match fs::remove_file(&candidate).await {
                Ok(()) => debug!(path = %candidate.display(), "Removed partial output"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    path = %candidate.display(),
                    error = %e,
                    "Failed to remove partial output"
                ),
            }
        }
    }
}
