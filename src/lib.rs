//! # dbvault
//!
//! Backup and restore orchestration for a PostgreSQL-backed, multi-tenant service.
//!
//! ## Overview
//!
//! dbvault produces consistent, verifiable and optionally encrypted snapshots of a
//! database, ships them to object storage, enforces retention, and reverses the
//! process safely: every destructive restore is preceded by a pre-restore safety
//! snapshot, tenant-scoped restores are limited to a single schema, and
//! point-in-time recovery is staged as a plan for the database engine to execute.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dbvault::backup::{ArtifactKind, BackupOrchestrator};
//! use dbvault::config::VaultConfig;
//! use dbvault::context::VaultContext;
//! use dbvault::engine::PostgresTools;
//!
//! # async fn example() -> dbvault::Result<()> {
//! let config = VaultConfig::from_env()?;
//! let target = config.target.clone();
//! let ctx = Arc::new(
//!     VaultContext::builder(config)
//!         .engine(Arc::new(PostgresTools::new()))
//!         .build(),
//! );
//!
//! let set = BackupOrchestrator::new(ctx).create_backup(ArtifactKind::Full, &target).await?;
//! println!("created {}", set.primary().file_name());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: connection, storage and key resolution from the environment
//! - [`integrity`]: SHA-256 digests and checksum sidecars
//! - [`crypto`]: passphrase-based authenticated encryption of artifacts
//! - [`remote`]: object storage sync with retries and retention purge
//! - [`backup`]: full and incremental backup pipelines, local catalog, retention
//! - [`restore`]: the restore state machine and post-restore validation
//! - [`pitr`]: point-in-time recovery staging

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for dbvault operations
pub type Result<T> = std::result::Result<T, VaultError>;

/// Pipeline step an error or cancellation is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Acquiring the per-target lock
    Lock,
    /// Probing the database
    Connect,
    /// Running the engine's dump tooling
    Dump,
    /// Gzip compression or decompression
    Compress,
    /// Encrypting an artifact
    Encrypt,
    /// Writing the checksum sidecar
    Checksum,
    /// Uploading to remote storage
    Upload,
    /// Locating or downloading the restore source
    Fetch,
    /// Decrypting the restore source
    Decrypt,
    /// Checking the restore source against its digest
    Verify,
    /// Taking the pre-restore safety snapshot
    Snapshot,
    /// Creating the target database or schema
    CreateDatabase,
    /// The destructive restore itself
    Restore,
    /// Post-restore checks
    Validate,
    /// Writing a point-in-time recovery plan
    StagePitr,
    /// Retention enforcement
    Retention,
}

impl Stage {
    /// Stable lowercase name used in logs and the operation log
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Lock => "lock",
            Stage::Connect => "connect",
            Stage::Dump => "dump",
            Stage::Compress => "compress",
            Stage::Encrypt => "encrypt",
            Stage::Checksum => "checksum",
            Stage::Upload => "upload",
            Stage::Fetch => "fetch",
            Stage::Decrypt => "decrypt",
            Stage::Verify => "verify",
            Stage::Snapshot => "snapshot",
            Stage::CreateDatabase => "create_database",
            Stage::Restore => "restore",
            Stage::Validate => "validate",
            Stage::StagePitr => "stage_pitr",
            Stage::Retention => "retention",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for dbvault operations
#[derive(Error, Debug)]
pub enum VaultError {
    /// The target database could not be reached
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// A backup pipeline step failed
    #[error("Backup failed at {stage}: {cause}")]
    Backup {
        /// Step that failed
        stage: Stage,
        /// Human-readable cause
        cause: String,
    },

    /// A restore pipeline step failed
    #[error("Restore failed at {stage}: {cause}")]
    Restore {
        /// Step that failed
        stage: Stage,
        /// Human-readable cause
        cause: String,
    },

    /// Writing the point-in-time recovery plan failed
    #[error("Point-in-time recovery staging failed: {0}")]
    Recovery(String),

    /// Checksum mismatch or unreadable sidecar
    #[error("Integrity error: {0}")]
    Integrity(#[from] integrity::IntegrityError),

    /// Wrong key or corrupt ciphertext
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// The requested operation cannot be performed on this input
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Another operation holds the target's lock
    #[error("Target busy: {0}")]
    Busy(String),

    /// Post-restore checks failed
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Interrupted by operator cancel or timeout
    #[error("Operation cancelled during {0}")]
    Cancelled(Stage),

    /// Configuration could not be resolved
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Remote storage failure outside a pipeline stage
    #[error("Remote storage error: {0}")]
    Remote(#[from] remote::RemoteError),

    /// Malformed operator input, such as a tenant id
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No artifact matches the given name
    #[error("Artifact not found: {0}")]
    NotFound(String),

    /// Local filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VaultError {
    /// Pipeline step this error is attributed to, if any
    pub fn stage(&self) -> Option<Stage> {
        match self {
            VaultError::Backup { stage, .. }
            | VaultError::Restore { stage, .. }
            | VaultError::Cancelled(stage) => Some(*stage),
            VaultError::Connectivity(_) => Some(Stage::Connect),
            VaultError::Recovery(_) => Some(Stage::StagePitr),
            VaultError::Integrity(_) => Some(Stage::Verify),
            VaultError::Decryption(_) => Some(Stage::Decrypt),
            VaultError::Busy(_) => Some(Stage::Lock),
            VaultError::Validation(_) => Some(Stage::Validate),
            _ => None,
        }
    }

    /// Process exit code for the command surface
    pub fn exit_code(&self) -> u8 {
        match self {
            VaultError::Busy(_) => 75,
            VaultError::Cancelled(_) => 130,
            VaultError::Config(_) | VaultError::UnsupportedOperation(_) | VaultError::InvalidArgument(_) => 64,
            _ => 1,
        }
    }

    pub(crate) fn backup(stage: Stage, cause: impl fmt::Display) -> Self {
        VaultError::Backup {
            stage,
            cause: cause.to_string(),
        }
    }

    pub(crate) fn restore(stage: Stage, cause: impl fmt::Display) -> Self {
        VaultError::Restore {
            stage,
            cause: cause.to_string(),
        }
    }

    pub(crate) fn recovery(cause: impl fmt::Display) -> Self {
        VaultError::Recovery(cause.to_string())
    }

    /// Engine failures keep their cancellation and connectivity meaning; the
    /// rest are attributed to `stage` of the running pipeline
    pub(crate) fn from_engine(stage: Stage, err: engine::EngineError, restoring: bool) -> Self {
        match err {
            engine::EngineError::Cancelled => VaultError::Cancelled(stage),
            engine::EngineError::Unreachable(cause) => VaultError::Connectivity(cause),
            other if restoring => VaultError::restore(stage, other),
            other => VaultError::backup(stage, other),
        }
    }
}

/// Environment-driven configuration and credential resolution
pub mod config;

/// Shared runtime context wiring the components together
pub mod context;

/// Checksums and sidecar files
pub mod integrity;

/// Artifact encryption at rest
pub mod crypto;

/// Retry with exponential backoff
pub mod resilience;

/// Per-target advisory locks
pub mod lock;

/// Append-only operation log
pub mod oplog;

/// Outbound notifications
pub mod notify;

/// Database engine interfaces and the PostgreSQL implementation
pub mod engine;

/// Object storage sync
pub mod remote;

/// Backup pipelines, local catalog and retention
pub mod backup;

/// Restore pipeline
pub mod restore;

/// Point-in-time recovery staging
pub mod pitr;

mod cancel;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_attribution() {
        let err = VaultError::backup(Stage::Upload, "connection reset");
        assert_eq!(err.stage(), Some(Stage::Upload));
        assert_eq!(err.to_string(), "Backup failed at upload: connection reset");

        let pitr = VaultError::recovery("disk full");
        assert_eq!(pitr.stage(), Some(Stage::StagePitr));
        assert_eq!(pitr.to_string(), "Point-in-time recovery staging failed: disk full");

        let busy = VaultError::Busy("db.internal:5432/app".to_string());
        assert_eq!(busy.stage(), Some(Stage::Lock));
        assert_ne!(busy.exit_code(), 0);
    }
}
