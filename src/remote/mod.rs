//! Remote storage sync
//!
//! [`ObjectStore`] is the narrow seam to a bucket; [`RemoteSync`] layers the
//! artifact rules on top of it: sidecars travel with their artifacts, transient
//! failures are retried with backoff, a failed upload leaves nothing behind,
//! and an unconfigured remote turns every call into a logged skip.

mod memory;
#[cfg(feature = "s3")]
mod s3;

pub use memory::MemoryObjectStore;
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;

use crate::backup::ArtifactName;
use crate::config::RemoteTarget;
use crate::integrity;
use crate::resilience::{RetryConfig, RetryExecutor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised by remote storage
#[derive(Error, Debug)]
pub enum RemoteError {
    /// No object under this key
    #[error("object not found: {0}")]
    NotFound(String),

    /// Network-level failure; worth retrying
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// Refused by the service; not retried
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Not an `s3://bucket/key` URI
    #[error("invalid remote URI: {0}")]
    InvalidUri(String),

    /// Local filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// Worth another attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transfer(_))
    }
}

/// Storage options applied on upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOptions {
    /// Storage class, provider default if unset
    pub storage_class: Option<String>,
    /// Request server-side encryption
    pub server_side_encryption: bool,
}

impl PutOptions {
    fn for_target(target: &RemoteTarget) -> Self {
        Self {
            storage_class: Some(target.storage_class.clone()),
            server_side_encryption: target.server_side_encryption,
        }
    }
}

/// One object as reported by a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Full object key
    pub key: String,
    /// Size in bytes
    pub size: u64,
    /// Last modification time
    pub last_modified: Option<DateTime<Utc>>,
}

/// Minimal bucket interface
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket name
    fn bucket(&self) -> &str;

    /// Upload `source` to `key`
    async fn put(&self, key: &str, source: &Path, options: &PutOptions) -> Result<(), RemoteError>;

    /// Write the object to `dest`, replacing any existing file
    async fn get(&self, key: &str, dest: &Path) -> Result<(), RemoteError>;

    /// Every object whose key starts with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, RemoteError>;

    /// Deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<(), RemoteError>;
}

/// An artifact present in the bucket, sidecar folded in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArtifact {
    /// Artifact file name
    pub name: String,
    /// Object key
    pub key: String,
    /// `s3://` URI
    pub uri: String,
    /// Size in bytes
    pub size: u64,
    /// Last modification time
    pub last_modified: Option<DateTime<Utc>>,
    /// Its checksum sidecar is present too
    pub sealed: bool,
}

impl RemoteArtifact {
    /// Creation time from the file name, falling back to the object timestamp
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        ArtifactName::parse(&self.name)
            .map(|parsed| parsed.created_at)
            .or(self.last_modified)
    }
}

/// Split `s3://bucket/key` into its parts
pub fn parse_uri(uri: &str) -> Result<(String, String), RemoteError> {
    let rest = uri
        .strip_prefix("s3://")
        .ok_or_else(|| RemoteError::InvalidUri(uri.to_string()))?;
    match rest.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() && !key.ends_with('/') => {
            Ok((bucket.to_string(), key.to_string()))
        }
        _ => Err(RemoteError::InvalidUri(uri.to_string())),
    }
}

struct Configured {
    store: Arc<dyn ObjectStore>,
    target: RemoteTarget,
    retry: RetryExecutor,
}

/// Artifact-level operations against the configured bucket
pub struct RemoteSync {
    inner: Option<Configured>,
}

impl RemoteSync {
    /// No remote configured; every operation is a skip
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Sync against `store` with the default retry policy
    pub fn new(store: Arc<dyn ObjectStore>, target: RemoteTarget) -> Self {
        Self {
            inner: Some(Configured {
                store,
                target,
                retry: RetryExecutor::default(),
            }),
        }
    }

    /// Replace the retry policy
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        if let Some(inner) = self.inner.as_mut() {
            inner.retry = RetryExecutor::new(config);
        }
        self
    }

    /// A bucket is configured
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Configured target, if any
    pub fn target(&self) -> Option<&RemoteTarget> {
        self.inner.as_ref().map(|inner| &inner.target)
    }

    /// `s3://bucket/<prefix><name>`
    pub fn uri_for(&self, name: &str) -> Option<String> {
        self.inner
            .as_ref()
            .map(|inner| format!("s3://{}/{}{}", inner.store.bucket(), inner.target.prefix, name))
    }

    /// Upload a sealed artifact and then its sidecar. Returns the artifact's
    /// URI, or `None` when no remote is configured.
    pub async fn upload(&self, artifact: &Path) -> Result<Option<String>, RemoteError> {
        let Some(inner) = self.inner.as_ref() else {
            debug!(artifact = %artifact.display(), "No remote storage configured, skipping upload");
            return Ok(None);
        };

        let name = file_name(artifact)?;
        let sidecar = integrity::sidecar_path(artifact);
        if !tokio::fs::try_exists(&sidecar).await? {
            return Err(RemoteError::Rejected(format!(
                "refusing to upload {} without its checksum",
                name
            )));
        }

        let key = format!("{}{}", inner.target.prefix, name);
        let sidecar_key = integrity::sidecar_path(Path::new(&key)).to_string_lossy().into_owned();
        let options = PutOptions::for_target(&inner.target);

        let result = async {
            self.put_with_retry(inner, &key, artifact, &options).await?;
            self.put_with_retry(inner, &sidecar_key, &sidecar, &options).await
        }
        .await;

        if let Err(e) = result {
            warn!(key = %key, error = %e, "Upload failed, removing partial remote objects");
            for stale in [&sidecar_key, &key] {
                if let Err(cleanup) = inner.store.delete(stale).await {
                    warn!(key = %stale, error = %cleanup, "Failed to remove partial remote object");
                }
            }
            return Err(e);
        }

        let uri = format!("s3://{}/{}", inner.store.bucket(), key);
        info!(uri = %uri, "Artifact uploaded");
        Ok(Some(uri))
    }

    async fn put_with_retry(
        &self,
        inner: &Configured,
        key: &str,
        source: &Path,
        options: &PutOptions,
    ) -> Result<(), RemoteError> {
        inner
            .retry
            .execute(
                &format!("upload {}", key),
                || inner.store.put(key, source, options),
                RemoteError::is_transient,
            )
            .await
    }

    async fn get_with_retry(&self, inner: &Configured, key: &str, dest: &Path) -> Result<(), RemoteError> {
        let result = inner
            .retry
            .execute(
                &format!("download {}", key),
                || inner.store.get(key, dest),
                RemoteError::is_transient,
            )
            .await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(dest).await;
        }
        result
    }

    /// Fetch an artifact (by `s3://` URI or bare name under the prefix) and its
    /// sidecar into `dest_dir`. Returns `None` when no remote is configured.
    pub async fn download(&self, source: &str, dest_dir: &Path) -> Result<Option<PathBuf>, RemoteError> {
        let Some(inner) = self.inner.as_ref() else {
            debug!(source = source, "No remote storage configured, skipping download");
            return Ok(None);
        };

        let key = if source.starts_with("s3://") {
            let (bucket, key) = parse_uri(source)?;
            if bucket != inner.store.bucket() {
                return Err(RemoteError::InvalidUri(format!(
                    "{} is not in the configured bucket {}",
                    source,
                    inner.store.bucket()
                )));
            }
            key
        } else {
            format!("{}{}", inner.target.prefix, source)
        };

        let name = key.rsplit('/').next().unwrap_or(key.as_str()).to_string();
        let dest = dest_dir.join(&name);
        tokio::fs::create_dir_all(dest_dir).await?;

        self.get_with_retry(inner, &key, &dest).await?;

        let sidecar_key = format!("{}.{}", key, integrity::SIDECAR_EXTENSION);
        match self
            .get_with_retry(inner, &sidecar_key, &integrity::sidecar_path(&dest))
            .await
        {
            Ok(()) => {}
            Err(RemoteError::NotFound(_)) => {
                warn!(key = %key, "Remote artifact has no checksum file");
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&dest).await;
                return Err(e);
            }
        }

        info!(key = %key, dest = %dest.display(), "Artifact downloaded");
        Ok(Some(dest))
    }

    /// Artifacts under the configured prefix; empty when no remote is configured
    pub async fn list(&self) -> Result<Vec<RemoteArtifact>, RemoteError> {
        let Some(inner) = self.inner.as_ref() else {
            debug!("No remote storage configured, skipping listing");
            return Ok(Vec::new());
        };

        let objects = inner
            .retry
            .execute(
                "list remote artifacts",
                || inner.store.list(&inner.target.prefix),
                RemoteError::is_transient,
            )
            .await?;

        let suffix = format!(".{}", integrity::SIDECAR_EXTENSION);
        let mut sidecars = HashSet::new();
        let mut artifacts = BTreeMap::new();
        for object in objects {
            let Some(name) = object.key.strip_prefix(&inner.target.prefix) else {
                continue;
            };
            // Nested keys belong to someone else
            if name.is_empty() || name.contains('/') {
                continue;
            }
            if let Some(artifact) = name.strip_suffix(&suffix) {
                sidecars.insert(artifact.to_string());
                continue;
            }
            artifacts.insert(
                name.to_string(),
                RemoteArtifact {
                    name: name.to_string(),
                    uri: format!("s3://{}/{}", inner.store.bucket(), object.key),
                    key: object.key,
                    size: object.size,
                    last_modified: object.last_modified,
                    sealed: false,
                },
            );
        }

        Ok(artifacts
            .into_values()
            .map(|mut artifact| {
                artifact.sealed = sidecars.contains(&artifact.name);
                artifact
            })
            .collect())
    }

    /// Remove an artifact and its sidecar; sidecar first so a half-finished
    /// delete never leaves a sealed-looking object
    pub async fn delete_artifact(&self, name: &str) -> Result<(), RemoteError> {
        let Some(inner) = self.inner.as_ref() else {
            return Ok(());
        };
        let key = format!("{}{}", inner.target.prefix, name);
        let sidecar_key = format!("{}.{}", key, integrity::SIDECAR_EXTENSION);
        for k in [&sidecar_key, &key] {
            inner
                .retry
                .execute(&format!("delete {}", k), || inner.store.delete(k), RemoteError::is_transient)
                .await?;
        }
        Ok(())
    }

    /// Delete every remote artifact created before `older_than` unless its name
    /// is in `protected`. Returns the deleted names.
    pub async fn purge(
        &self,
        older_than: DateTime<Utc>,
        protected: &HashSet<String>,
    ) -> Result<Vec<String>, RemoteError> {
        if !self.is_enabled() {
            debug!("No remote storage configured, skipping remote purge");
            return Ok(Vec::new());
        }

        let mut deleted = Vec::new();
        for artifact in self.list().await? {
            if protected.contains(&artifact.name) {
                continue;
            }
            match artifact.created_at() {
                Some(created) if created < older_than => {
                    self.delete_artifact(&artifact.name).await?;
                    info!(artifact = %artifact.name, "Remote artifact purged");
                    deleted.push(artifact.name);
                }
                _ => {}
            }
        }
        Ok(deleted)
    }
}

fn file_name(path: &Path) -> Result<String, RemoteError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| RemoteError::Rejected(format!("{} has no usable file name", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uri() {
        assert_eq!(
            parse_uri("s3://app-backups/backups/full_20261018T020000.000Z.dump").unwrap(),
            (
                "app-backups".to_string(),
                "backups/full_20261018T020000.000Z.dump".to_string()
            )
        );
        assert!(parse_uri("https://example.com/x").is_err());
        assert!(parse_uri("s3://bucket-only").is_err());
        assert!(parse_uri("s3://bucket/dir/").is_err());
    }

    #[tokio::test]
    async fn test_disabled_is_a_skip() {
        let sync = RemoteSync::disabled();
        let dir = tempfile::tempdir().unwrap();
        assert!(!sync.is_enabled());
        assert_eq!(sync.upload(&dir.path().join("missing.dump")).await.unwrap(), None);
        assert_eq!(sync.download("missing.dump", dir.path()).await.unwrap(), None);
        assert!(sync.list().await.unwrap().is_empty());
        assert!(sync.purge(Utc::now(), &HashSet::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_requires_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("full_20261018T020000.000Z.dump");
        tokio::fs::write(&artifact, b"archive").await.unwrap();

        let store = Arc::new(MemoryObjectStore::new("app-backups"));
        let sync = RemoteSync::new(store.clone(), RemoteTarget::new("app-backups"));

        assert!(matches!(sync.upload(&artifact).await, Err(RemoteError::Rejected(_))));
        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("full_20261018T020000.000Z.dump");
        tokio::fs::write(&artifact, b"archive").await.unwrap();
        integrity::seal(&artifact).await.unwrap();

        let store = Arc::new(MemoryObjectStore::new("app-backups"));
        store.fail_next_puts(10).await;
        let sync = RemoteSync::new(store.clone(), RemoteTarget::new("app-backups"))
            .with_retry(RetryConfig::immediate(3));

        assert!(matches!(sync.upload(&artifact).await, Err(RemoteError::Transfer(_))));
        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_transient_put_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("full_20261018T020000.000Z.dump");
        tokio::fs::write(&artifact, b"archive").await.unwrap();
        integrity::seal(&artifact).await.unwrap();

        let store = Arc::new(MemoryObjectStore::new("app-backups"));
        store.fail_next_puts(1).await;
        let sync = RemoteSync::new(store.clone(), RemoteTarget::new("app-backups"))
            .with_retry(RetryConfig::immediate(3));

        let uri = sync.upload(&artifact).await.unwrap().unwrap();
        assert_eq!(uri, "s3://app-backups/backups/full_20261018T020000.000Z.dump");

        let listed = sync.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].sealed);
        assert_eq!(
            store.put_options("backups/full_20261018T020000.000Z.dump").await.unwrap().storage_class.as_deref(),
            Some("STANDARD_IA")
        );
    }
}
