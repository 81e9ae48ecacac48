// Local artifact catalog - the backup root on disk

use super::types::{ArtifactFormat, ArtifactKind, ArtifactName, BackupArtifact};
use crate::integrity;
use crate::{Result, VaultError};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// The backup root and its layout
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The backup root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lock files, one per target and scope
    pub fn lock_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Staged recovery plans
    pub fn pitr_dir(&self) -> PathBuf {
        self.root.join("pitr")
    }

    /// Create the root and lock directory
    pub async fn ensure_layout(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.root).await?;
        fs::create_dir_all(self.lock_dir()).await
    }

    /// Where an artifact with this name lives
    pub fn path_for(&self, name: &ArtifactName) -> PathBuf {
        self.root.join(name.file_name())
    }

    /// Scratch directory inside the root, removed when dropped
    pub fn staging(&self, purpose: &str) -> std::io::Result<tempfile::TempDir> {
        std::fs::create_dir_all(&self.root)?;
        tempfile::Builder::new()
            .prefix(&format!(".{}-", purpose))
            .tempdir_in(&self.root)
    }

    /// Every artifact in the root that follows the naming scheme, newest
    /// first. Unsealed leftovers are included with `checksum: None`.
    pub async fn list(&self) -> std::io::Result<Vec<BackupArtifact>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut artifacts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().and_then(ArtifactName::parse) else {
                continue;
            };
            artifacts.push(describe(&entry.path(), name).await?);
        }

        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.file_name().cmp(&b.file_name())));
        Ok(artifacts)
    }

    /// Resolve a reference to a local file: a name in the root, or a path.
    /// Files outside the naming scheme have their format inferred from the
    /// extension and their creation time taken from the modification time.
    pub async fn locate(&self, reference: &str) -> Result<Option<BackupArtifact>> {
        let as_path = Path::new(reference);
        let candidates = if as_path.is_absolute() {
            vec![as_path.to_path_buf()]
        } else {
            vec![self.root.join(reference), as_path.to_path_buf()]
        };

        for path in candidates {
            match fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => return describe_any(&path).await.map(Some),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Remove an artifact, sidecar first so an interrupted delete never
    /// leaves a sealed-looking half
    pub async fn delete(&self, artifact: &Path) -> std::io::Result<()> {
        for path in [integrity::sidecar_path(artifact), artifact.to_path_buf()] {
            match fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "Removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

async fn describe(path: &Path, name: ArtifactName) -> std::io::Result<BackupArtifact> {
    let size_bytes = fs::metadata(path).await?.len();
    let checksum = match integrity::read_sidecar(path).await {
        Ok(digest) => digest,
        Err(e) => {
            warn!(artifact = %path.display(), error = %e, "Unreadable checksum file, treating as unsealed");
            None
        }
    };

    Ok(BackupArtifact {
        id: name.id,
        kind: name.kind,
        format: name.format,
        local_path: Some(path.to_path_buf()),
        remote_uri: None,
        checksum,
        encrypted: name.encrypted,
        created_at: name.created_at,
        size_bytes,
    })
}

async fn describe_any(path: &Path) -> Result<BackupArtifact> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| VaultError::NotFound(path.display().to_string()))?;

    if let Some(name) = ArtifactName::parse(file_name) {
        return Ok(describe(path, name).await?);
    }

    let format = ArtifactFormat::infer(file_name).ok_or_else(|| {
        VaultError::UnsupportedOperation(format!("cannot tell the format of {}", file_name))
    })?;
    let meta = fs::metadata(path).await?;
    let created_at: DateTime<Utc> = meta.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now());

    let name = ArtifactName {
        kind: ArtifactKind::Full,
        id: file_name.to_string(),
        created_at,
        format,
        encrypted: file_name.ends_with(".enc"),
    };
    Ok(describe(path, name).await?)
}
