// Catalog - artifact lookup across the local and remote tiers

use super::types::{ArtifactFormat, ArtifactKind, ArtifactName, BackupArtifact};
use crate::context::VaultContext;
use crate::remote::RemoteError;
use crate::{Result, Stage, VaultError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

/// One artifact as seen across both tiers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    /// Artifact file name
    pub name: String,
    /// Backup kind, from the name
    pub kind: ArtifactKind,
    /// Storage format, from the name
    pub format: ArtifactFormat,
    /// Creation time encoded in the name
    pub created_at: DateTime<Utc>,
    /// Size on whichever tier reported it
    pub size_bytes: u64,
    /// Present in the backup root
    pub local: bool,
    /// Present in the bucket
    pub remote: bool,
    /// A checksum sidecar exists on at least one tier
    pub verifiable: bool,
}

impl CatalogEntry {
    /// `local`, `remote` or `local+remote`
    pub fn location(&self) -> &'static str {
        match (self.local, self.remote) {
            (true, true) => "local+remote",
            (true, false) => "local",
            _ => "remote",
        }
    }
}

/// Merged listing, newest first. A failing remote listing degrades to the
/// local view with a warning.
pub async fn list(ctx: &VaultContext) -> Result<Vec<CatalogEntry>> {
    let mut entries: BTreeMap<String, CatalogEntry> = BTreeMap::new();

    for artifact in ctx.store.list().await? {
        let name = artifact.file_name();
        entries.insert(
            name.clone(),
            CatalogEntry {
                name,
                kind: artifact.kind,
                format: artifact.format,
                created_at: artifact.created_at,
                size_bytes: artifact.size_bytes,
                local: true,
                remote: false,
                verifiable: artifact.is_sealed(),
            },
        );
    }

    match ctx.remote.list().await {
        Ok(listed) => {
            for remote in listed {
                if let Some(entry) = entries.get_mut(&remote.name) {
                    entry.remote = true;
                    entry.verifiable |= remote.sealed;
                    continue;
                }
                let Some(parsed) = ArtifactName::parse(&remote.name) else {
                    continue;
                };
                entries.insert(
                    remote.name.clone(),
                    CatalogEntry {
                        name: remote.name,
                        kind: parsed.kind,
                        format: parsed.format,
                        created_at: parsed.created_at,
                        size_bytes: remote.size,
                        local: false,
                        remote: true,
                        verifiable: remote.sealed,
                    },
                );
            }
        }
        Err(e) => warn!(error = %e, "Remote listing failed, showing local artifacts only"),
    }

    let mut entries: Vec<CatalogEntry> = entries.into_values().collect();
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.name.cmp(&b.name)));
    Ok(entries)
}

/// Find `source` locally (name in the root, or a path), or download it from
/// the remote tier (bare name or `s3://` URI) into `staging`
pub async fn resolve(ctx: &VaultContext, source: &str, staging: &Path) -> Result<BackupArtifact> {
    let is_uri = source.starts_with("s3://");

    if !is_uri {
        if let Some(artifact) = ctx.store.locate(source).await? {
            return Ok(artifact);
        }
    }

    if !ctx.remote.is_enabled() {
        return Err(if is_uri {
            VaultError::restore(Stage::Fetch, "remote storage is not configured")
        } else {
            VaultError::NotFound(source.to_string())
        });
    }

    let downloaded = ctx
        .remote
        .download(source, staging)
        .await
        .map_err(|e| match e {
            RemoteError::NotFound(_) => VaultError::NotFound(source.to_string()),
            other => VaultError::restore(Stage::Fetch, other),
        })?
        .ok_or_else(|| VaultError::NotFound(source.to_string()))?;

    let mut artifact = ctx
        .store
        .locate(&downloaded.to_string_lossy())
        .await?
        .ok_or_else(|| VaultError::NotFound(source.to_string()))?;
    artifact.remote_uri = if is_uri {
        Some(source.to_string())
    } else {
        ctx.remote.uri_for(source)
    };
    Ok(artifact)
}
