//! Point-in-time recovery staging
//!
//! Recovery itself belongs to the database engine: it restores the base
//! artifact and then replays archived WAL up to the target time. This module
//! only checks that such a replay is possible and writes down how to do it,
//! a JSON plan plus a configuration fragment the engine can load directly.

use crate::backup::BackupArtifact;
use crate::context::VaultContext;
use crate::oplog::{OperationRecord, OperationStatus};
use crate::{Result, Stage, VaultError};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument, warn};

/// Plan document name inside a plan directory
pub const PLAN_FILE: &str = "recovery_plan.json";
/// Engine configuration fragment inside a plan directory
pub const RECOVERY_CONFIG_FILE: &str = "recovery.conf";

/// Action the engine takes once the target time is reached
pub const RECOVERY_TARGET_ACTION: &str = "promote";

/// Everything needed to drive a point-in-time recovery
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryPlan {
    /// Plan identifier, also its directory name under `<root>/pitr/`
    pub id: String,
    /// Artifact to restore before replay
    pub base_artifact: String,
    /// Creation time of the base artifact
    pub base_created_at: DateTime<Utc>,
    /// Replay stops here
    pub target_time: DateTime<Utc>,
    /// Archived WAL location
    pub wal_source: PathBuf,
    /// Engine command that copies one archived segment into place
    pub restore_command: String,
    /// Post-recovery action
    pub recovery_target_action: String,
    /// Where the plan was written
    pub plan_path: PathBuf,
    /// Where the configuration fragment was written
    pub config_path: PathBuf,
    /// When the plan was staged
    pub created_at: DateTime<Utc>,
}

/// Stages recovery plans under `<root>/pitr/`
pub struct PitrCoordinator {
    ctx: Arc<VaultContext>,
}

impl PitrCoordinator {
    /// Coordinator over the shared context
    pub fn new(ctx: Arc<VaultContext>) -> Self {
        Self { ctx }
    }

    /// Validate and write a recovery plan. Never replays anything.
    ///
    /// Fails with [`VaultError::UnsupportedOperation`] when no WAL archive is
    /// configured or reachable, or when the server reports archiving off.
    #[instrument(skip(self), fields(target_time = %target_time))]
    pub async fn stage_pitr(&self, target_time: DateTime<Utc>, base: &str) -> Result<RecoveryPlan> {
        let result = self.stage(target_time, base).await;

        let record = match &result {
            Ok(plan) => OperationRecord::new("stage_pitr", self.ctx.config.target.to_string(), OperationStatus::Success)
                .with_artifacts(vec![plan.base_artifact.clone()])
                .with_message(format!("Recovery plan {} staged for {}", plan.id, plan.target_time)),
            Err(e) => OperationRecord::new("stage_pitr", self.ctx.config.target.to_string(), OperationStatus::Failure)
                .with_artifacts(vec![base.to_string()])
                .with_stage(Some(Stage::StagePitr))
                .with_message(e.to_string()),
        };
        self.ctx.oplog.append(&record).await;
        result
    }

    async fn stage(&self, target_time: DateTime<Utc>, base: &str) -> Result<RecoveryPlan> {
        let wal_source = self.wal_archive().await?;
        let base_artifact = self.resolve_base(base).await?;

        if target_time < base_artifact.created_at {
            return Err(VaultError::InvalidArgument(format!(
                "target time {} precedes base artifact {} created at {}",
                target_time,
                base_artifact.file_name(),
                base_artifact.created_at
            )));
        }

        match self.ctx.engine.archive_mode(&self.ctx.config.target).await {
            Ok(mode) if mode.eq_ignore_ascii_case("off") => {
                return Err(VaultError::UnsupportedOperation(
                    "the server reports archive_mode = off; no WAL is being archived".to_string(),
                ));
            }
            Ok(mode) => info!(archive_mode = %mode, "WAL archiving active"),
            Err(e) => warn!(error = %e, "Could not read archive_mode, staging anyway"),
        }

        let created_at = Utc::now();
        let id = crate::backup::artifact_id(created_at);
        let dir = self.ctx.store.pitr_dir().join(&id);
        fs::create_dir_all(&dir).await.map_err(VaultError::recovery)?;

        let plan = RecoveryPlan {
            restore_command: restore_command(&wal_source),
            recovery_target_action: RECOVERY_TARGET_ACTION.to_string(),
            plan_path: dir.join(PLAN_FILE),
            config_path: dir.join(RECOVERY_CONFIG_FILE),
            base_artifact: base_artifact.file_name(),
            base_created_at: base_artifact.created_at,
            id,
            target_time,
            wal_source,
            created_at,
        };

        let json = serde_json::to_vec_pretty(&plan).map_err(VaultError::recovery)?;
        write_durably(&plan.plan_path, &json).await?;
        write_durably(&plan.config_path, recovery_config(&plan).as_bytes()).await?;

        info!(
            plan = %plan.plan_path.display(),
            base = %plan.base_artifact,
            "Point-in-time recovery plan staged"
        );
        Ok(plan)
    }

    async fn wal_archive(&self) -> Result<PathBuf> {
        let dir = self.ctx.config.wal_archive_dir.clone().ok_or_else(|| {
            VaultError::UnsupportedOperation("WAL archiving is not configured (WAL_ARCHIVE_DIR unset)".to_string())
        })?;
        match fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(dir),
            _ => Err(VaultError::UnsupportedOperation(format!(
                "WAL archive {} does not exist",
                dir.display()
            ))),
        }
    }

    /// Local artifact, or one the remote tier lists
    async fn resolve_base(&self, base: &str) -> Result<BackupArtifact> {
        if let Some(artifact) = self.ctx.store.locate(base).await? {
            return Ok(artifact);
        }

        let name = base.rsplit('/').next().unwrap_or(base);
        let listed = self.ctx.remote.list().await?;
        listed
            .into_iter()
            .find(|remote| remote.name == name)
            .and_then(|remote| {
                let parsed = crate::backup::ArtifactName::parse(&remote.name)?;
                Some(BackupArtifact {
                    id: parsed.id,
                    kind: parsed.kind,
                    format: parsed.format,
                    local_path: None,
                    remote_uri: Some(remote.uri),
                    checksum: None,
                    encrypted: parsed.encrypted,
                    created_at: parsed.created_at,
                    size_bytes: remote.size,
                })
            })
            .ok_or_else(|| VaultError::NotFound(base.to_string()))
    }
}

fn restore_command(wal_source: &Path) -> String {
    format!("cp \"{}/%f\" \"%p\"", wal_source.display())
}

/// Single-quoted configuration value
fn quoted(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn recovery_config(plan: &RecoveryPlan) -> String {
    format!(
        "# point-in-time recovery plan {id}\n\
         # base artifact: {base}\n\
         restore_command = {command}\n\
         recovery_target_time = {time}\n\
         recovery_target_action = {action}\n",
        id = plan.id,
        base = plan.base_artifact,
        command = quoted(&plan.restore_command),
        time = quoted(&plan.target_time.to_rfc3339_opts(SecondsFormat::Millis, true)),
        action = quoted(&plan.recovery_target_action),
    )
}

async fn write_durably(path: &Path, contents: &[u8]) -> Result<()> {
    let write = async {
        let mut file = fs::File::create(path).await?;
        file.write_all(contents).await?;
        file.sync_all().await
    };
    write.await.map_err(VaultError::recovery)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_recovery_config_quoting() {
        let plan = RecoveryPlan {
            id: "20261019T030000.000Z".to_string(),
            base_artifact: "full_20261018T020000.000Z.dump".to_string(),
            base_created_at: Utc.with_ymd_and_hms(2026, 10, 18, 2, 0, 0).unwrap(),
            target_time: Utc.with_ymd_and_hms(2026, 10, 18, 14, 30, 0).unwrap(),
            wal_source: PathBuf::from("/srv/wal's"),
            restore_command: restore_command(Path::new("/srv/wal's")),
            recovery_target_action: RECOVERY_TARGET_ACTION.to_string(),
            plan_path: PathBuf::from("/tmp/plan.json"),
            config_path: PathBuf::from("/tmp/recovery.conf"),
            created_at: Utc.with_ymd_and_hms(2026, 10, 19, 3, 0, 0).unwrap(),
        };

        let config = recovery_config(&plan);
        assert!(config.contains("restore_command = 'cp \"/srv/wal''s/%f\" \"%p\"'"));
        assert!(config.contains("recovery_target_time = '2026-10-18T14:30:00.000Z'"));
        assert!(config.contains("recovery_target_action = 'promote'"));
    }
}
