// Backup System - artifact model, local catalog, pipelines and retention

/// Merged local and remote listing, reference resolution
pub mod catalog;
/// gzip helpers for plain SQL artifacts
pub mod compression;
/// Backup pipelines
pub mod orchestrator;
/// Age-based cleanup of both tiers
pub mod retention;
/// The backup root on disk
pub mod storage;
/// Artifact naming and metadata
pub mod types;

pub use catalog::CatalogEntry;
pub use orchestrator::BackupOrchestrator;
pub use retention::{Retention, RetentionPolicy, RetentionReport};
pub use storage::LocalStore;
pub use types::{artifact_id, ArtifactFormat, ArtifactKind, ArtifactName, BackupArtifact, BackupSet};
