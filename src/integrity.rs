//! Integrity verification for backup artifacts
//!
//! Digests always cover the bytes as stored on disk, after compression and
//! encryption. The digest lives in a `<artifact>.sha256` sidecar in `sha256sum`
//! format, and its presence is what marks an artifact as complete.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Sidecar suffix
pub const SIDECAR_EXTENSION: &str = "sha256";

const READ_BUFFER: usize = 64 * 1024;

/// Errors raised while checking a sidecar
#[derive(Error, Debug)]
pub enum IntegrityError {
    /// The artifact's digest differs from its sidecar
    #[error("checksum mismatch for {path}: expected {expected}, found {actual}")]
    Mismatch {
        /// Artifact checked
        path: PathBuf,
        /// Digest recorded in the sidecar
        expected: String,
        /// Digest of the bytes on disk
        actual: String,
    },

    /// The sidecar is not in `sha256sum` format
    #[error("malformed checksum file {0}")]
    MalformedSidecar(PathBuf),

    /// Filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of checking an artifact against its sidecar
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerifyOutcome {
    /// Digest matched the sidecar
    Verified {
        /// Hex SHA-256 of the artifact
        digest: String,
    },
    /// No sidecar to check against; the artifact was used as-is
    Unverified,
}

impl VerifyOutcome {
    /// A sidecar was present and matched
    pub fn is_verified(&self) -> bool {
        matches!(self, VerifyOutcome::Verified { .. })
    }
}

/// `<artifact>.sha256`
pub fn sidecar_path(artifact: &Path) -> PathBuf {
    let mut name: OsString = artifact.as_os_str().to_owned();
    name.push(".");
    name.push(SIDECAR_EXTENSION);
    PathBuf::from(name)
}

/// Hex SHA-256 of the file's on-disk bytes
pub async fn compute_digest(path: &Path) -> Result<String, IntegrityError> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Compare the file's digest with `expected`
pub async fn verify(path: &Path, expected: &str) -> Result<(), IntegrityError> {
    let actual = compute_digest(path).await?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(IntegrityError::Mismatch {
            path: path.to_path_buf(),
            expected: expected.trim().to_string(),
            actual,
        })
    }
}

/// Flush the artifact to disk, then compute and persist its sidecar.
///
/// The sidecar is written to a temporary name and renamed into place, so a
/// crash never leaves a half-written digest next to an artifact.
pub async fn seal(artifact: &Path) -> Result<String, IntegrityError> {
    fs::File::open(artifact).await?.sync_all().await?;

    let digest = compute_digest(artifact).await?;
    let sidecar = sidecar_path(artifact);
    let file_name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut staging = sidecar.clone().into_os_string();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);

    let mut file = fs::File::create(&staging).await?;
    file.write_all(format!("{}  {}\n", digest, file_name).as_bytes()).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&staging, &sidecar).await?;

    debug!(artifact = %artifact.display(), digest = %digest, "Checksum sidecar written");
    Ok(digest)
}

/// Digest recorded in the artifact's sidecar, or `None` when there is no sidecar
pub async fn read_sidecar(artifact: &Path) -> Result<Option<String>, IntegrityError> {
    let sidecar = sidecar_path(artifact);
    let contents = match fs::read_to_string(&sidecar).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    parse_sidecar(&contents)
        .map(Some)
        .ok_or(IntegrityError::MalformedSidecar(sidecar))
}

fn parse_sidecar(contents: &str) -> Option<String> {
    let digest = contents.split_whitespace().next()?;
    if digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(digest.to_ascii_lowercase())
    } else {
        None
    }
}

/// Check an artifact against its sidecar.
///
/// A missing sidecar is tolerated with a warning so manually supplied files can
/// still be restored; callers that need a hard guarantee must require
/// [`VerifyOutcome::Verified`].
pub async fn verify_artifact(artifact: &Path) -> Result<VerifyOutcome, IntegrityError> {
    match read_sidecar(artifact).await? {
        Some(expected) => {
            verify(artifact, &expected).await?;
            debug!(artifact = %artifact.display(), "Checksum verified");
            Ok(VerifyOutcome::Verified { digest: expected })
        }
        None => {
            warn!(
                artifact = %artifact.display(),
                "No checksum file found, proceeding without integrity verification"
            );
            Ok(VerifyOutcome::Unverified)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seal_then_verify() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("full_20260101T000000.000Z.dump");
        fs::write(&artifact, b"PGDMP fake archive").await.unwrap();

        let digest = seal(&artifact).await.unwrap();
        assert_eq!(digest.len(), 64);

        let sidecar = fs::read_to_string(sidecar_path(&artifact)).await.unwrap();
        assert!(sidecar.ends_with("  full_20260101T000000.000Z.dump\n"));

        let outcome = verify_artifact(&artifact).await.unwrap();
        assert_eq!(outcome, VerifyOutcome::Verified { digest });
    }

    #[tokio::test]
    async fn test_missing_sidecar_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("manual.sql");
        fs::write(&artifact, b"SELECT 1;").await.unwrap();

        assert_eq!(verify_artifact(&artifact).await.unwrap(), VerifyOutcome::Unverified);
    }

    #[tokio::test]
    async fn test_tampered_artifact_fails() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("a.dump");
        fs::write(&artifact, b"original bytes").await.unwrap();
        seal(&artifact).await.unwrap();

        fs::write(&artifact, b"original bytez").await.unwrap();
        let err = verify_artifact(&artifact).await.unwrap_err();
        assert!(matches!(err, IntegrityError::Mismatch { .. }));
    }

    #[tokio::test]
    async fn test_garbage_sidecar_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("a.dump");
        fs::write(&artifact, b"bytes").await.unwrap();
        fs::write(sidecar_path(&artifact), "not-a-digest  a.dump\n").await.unwrap();

        assert!(matches!(
            read_sidecar(&artifact).await,
            Err(IntegrityError::MalformedSidecar(_))
        ));
    }
}
