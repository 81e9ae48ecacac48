// Retention - age-based cleanup of the local and remote tiers
//
// Rules, per tier:
//   * the newest sealed full backup is never deleted, whatever its age
//   * pre-restore snapshots get twice the window, and the newest one is kept
//   * anything else older than the window goes, unsealed leftovers included
// A local artifact is only deleted once a sealed remote copy is confirmed when
// a remote tier is configured.

use super::types::{ArtifactKind, ArtifactName};
use crate::context::VaultContext;
use crate::lock::{LockScope, TargetLock};
use crate::oplog::{OperationRecord, OperationStatus};
use crate::{Result, VaultError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Age limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Maximum age of full and incremental artifacts
    pub window: ChronoDuration,
    /// Maximum age of pre-restore snapshots
    pub snapshot_window: ChronoDuration,
}

impl RetentionPolicy {
    /// Snapshots are kept twice as long as `days`
    pub fn from_days(days: u32) -> Self {
        let window = ChronoDuration::days(i64::from(days.max(1)));
        Self {
            window,
            snapshot_window: window * 2,
        }
    }
}

/// Input to [`plan`]: one artifact on one tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Artifact file name
    pub name: String,
    /// Backup kind
    pub kind: ArtifactKind,
    /// Shared id of the backup run
    pub id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Has a checksum sidecar
    pub sealed: bool,
}

impl Candidate {
    fn from_name(file_name: &str, sealed: bool) -> Option<Self> {
        let parsed = ArtifactName::parse(file_name)?;
        Some(Self {
            name: file_name.to_string(),
            kind: parsed.kind,
            id: parsed.id,
            created_at: parsed.created_at,
            sealed,
        })
    }
}

/// Names to delete from one tier
pub fn plan(policy: &RetentionPolicy, now: DateTime<Utc>, candidates: &[Candidate]) -> Vec<String> {
    let newest_of = |kind: ArtifactKind| {
        candidates
            .iter()
            .filter(|c| c.kind == kind && c.sealed)
            .max_by_key(|c| c.created_at)
            .map(|c| c.id.clone())
    };
    let newest_full = newest_of(ArtifactKind::Full);
    let newest_snapshot = newest_of(ArtifactKind::PreRestoreSnapshot);

    candidates
        .iter()
        .filter(|c| {
            if c.sealed {
                let protected = match c.kind {
                    ArtifactKind::Full => newest_full.as_deref() == Some(c.id.as_str()),
                    ArtifactKind::PreRestoreSnapshot => newest_snapshot.as_deref() == Some(c.id.as_str()),
                    ArtifactKind::Incremental => false,
                };
                if protected {
                    return false;
                }
            }
            let window = match c.kind {
                ArtifactKind::PreRestoreSnapshot => policy.snapshot_window,
                _ => policy.window,
            };
            c.created_at < now - window
        })
        .map(|c| c.name.clone())
        .collect()
}

/// Outcome of one enforcement run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionReport {
    /// Another run held the retention lock
    pub skipped: bool,
    /// Names removed from the backup root
    pub local_deleted: Vec<String>,
    /// Names removed from the bucket
    pub remote_deleted: Vec<String>,
    /// Expired locally but kept for lack of a confirmed remote copy
    pub unconfirmed: Vec<String>,
}

/// Retention enforcement entry point, shared by the manual command,
/// post-backup housekeeping and the scheduled loop
pub struct Retention {
    ctx: Arc<VaultContext>,
    policy: RetentionPolicy,
}

impl Retention {
    /// Retention with the configured policy
    pub fn new(ctx: Arc<VaultContext>) -> Self {
        let policy = RetentionPolicy::from_days(ctx.config.retention_days);
        Self { ctx, policy }
    }

    /// Override the configured windows
    pub fn with_policy(mut self, policy: RetentionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// One pass over both tiers. Deletion failures are logged and skipped;
    /// only failing to take the lock or read the local root is an error.
    #[instrument(skip(self))]
    pub async fn enforce(&self) -> Result<RetentionReport> {
        let started = Instant::now();
        let _lock = match TargetLock::try_acquire(
            &self.ctx.store.lock_dir(),
            &self.ctx.config.target.target_id(),
            LockScope::Retention,
        ) {
            Ok(lock) => lock,
            Err(VaultError::Busy(holder)) => {
                info!(holder = %holder, "Retention already running, skipping");
                self.ctx
                    .oplog
                    .append(
                        &OperationRecord::new(
                            "retention",
                            self.ctx.config.target.to_string(),
                            OperationStatus::Skipped,
                        )
                        .with_message(format!("skipped: {}", holder))
                        .with_duration(started.elapsed()),
                    )
                    .await;
                return Ok(RetentionReport {
                    skipped: true,
                    ..Default::default()
                });
            }
            Err(e) => return Err(e),
        };

        let now = Utc::now();
        let mut report = RetentionReport::default();

        let remote = if self.ctx.remote.is_enabled() {
            match self.ctx.remote.list().await {
                Ok(listed) => Some(listed),
                Err(e) => {
                    warn!(error = %e, "Remote listing failed, local deletions need a remote copy and are deferred");
                    None
                }
            }
        } else {
            None
        };

        // Local tier
        let local = self.ctx.store.list().await?;
        let local_candidates: Vec<Candidate> = local
            .iter()
            .filter_map(|a| Candidate::from_name(&a.file_name(), a.is_sealed()))
            .collect();
        let expired: HashSet<String> = plan(&self.policy, now, &local_candidates).into_iter().collect();

        let confirmed: HashSet<&str> = remote
            .iter()
            .flatten()
            .filter(|r| r.sealed)
            .map(|r| r.name.as_str())
            .collect();

        for artifact in local.iter().filter(|a| expired.contains(&a.file_name())) {
            let name = artifact.file_name();
            if self.ctx.remote.is_enabled() && artifact.is_sealed() && !confirmed.contains(name.as_str()) {
                debug!(artifact = %name, "No confirmed remote copy, keeping local artifact");
                report.unconfirmed.push(name);
                continue;
            }
            let Some(path) = &artifact.local_path else {
                continue;
            };
            match self.ctx.store.delete(path).await {
                Ok(()) => {
                    info!(artifact = %name, "Local artifact expired and removed");
                    report.local_deleted.push(name);
                }
                Err(e) => warn!(artifact = %name, error = %e, "Failed to remove expired artifact"),
            }
        }

        // Remote tier
        if let Some(listed) = &remote {
            let remote_candidates: Vec<Candidate> = listed
                .iter()
                .filter_map(|r| Candidate::from_name(&r.name, r.sealed))
                .collect();
            let doomed: HashSet<String> = plan(&self.policy, now, &remote_candidates).into_iter().collect();
            let protected: HashSet<String> = listed
                .iter()
                .map(|r| r.name.clone())
                .filter(|name| !doomed.contains(name))
                .collect();

            match self.ctx.remote.purge(now - self.policy.window, &protected).await {
                Ok(deleted) => report.remote_deleted = deleted,
                Err(e) => warn!(error = %e, "Remote purge failed"),
            }
        }

        let message = format!(
            "{} local and {} remote artifacts removed, {} kept awaiting remote copy",
            report.local_deleted.len(),
            report.remote_deleted.len(),
            report.unconfirmed.len()
        );
        info!(
            local_deleted = report.local_deleted.len(),
            remote_deleted = report.remote_deleted.len(),
            unconfirmed = report.unconfirmed.len(),
            "Retention enforced"
        );
        self.ctx
            .oplog
            .append(
                &OperationRecord::new(
                    "retention",
                    self.ctx.config.target.to_string(),
                    OperationStatus::Success,
                )
                .with_artifacts(
                    report
                        .local_deleted
                        .iter()
                        .chain(report.remote_deleted.iter())
                        .cloned()
                        .collect(),
                )
                .with_message(message)
                .with_duration(started.elapsed()),
            )
            .await;

        Ok(report)
    }

    /// Enforce every `every` until `cancel` fires. A failed pass is logged
    /// and the loop carries on.
    pub async fn schedule(&self, every: Duration, cancel: &CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Retention schedule stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.enforce().await {
                        warn!(error = %e, "Scheduled retention pass failed");
                    }
                }
            }
        }
    }
}
