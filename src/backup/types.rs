// Backup System Types - artifact descriptors and the on-disk naming scheme

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

const ID_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";
const ENCRYPTED_SUFFIX: &str = ".enc";

/// Millisecond UTC timestamp identifier, e.g. `20261018T020000.000Z`
pub fn artifact_id(at: DateTime<Utc>) -> String {
    at.format(ID_FORMAT).to_string()
}

fn parse_artifact_id(id: &str) -> Option<DateTime<Utc>> {
    let naive = id.strip_suffix('Z')?;
    NaiveDateTime::parse_from_str(naive, "%Y%m%dT%H%M%S%.3f")
        .ok()
        .map(|dt| dt.and_utc())
}

/// What a backup run captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Whole database, structured dump plus plain rendering
    Full,
    /// Rows changed inside the trailing window
    Incremental,
    /// Taken automatically before a destructive restore
    PreRestoreSnapshot,
}

impl ArtifactKind {
    /// File name prefix
    pub fn prefix(&self) -> &'static str {
        match self {
            ArtifactKind::Full => "full",
            ArtifactKind::Incremental => "incremental",
            ArtifactKind::PreRestoreSnapshot => "snapshot",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "full" => Some(ArtifactKind::Full),
            "incremental" => Some(ArtifactKind::Incremental),
            "snapshot" => Some(ArtifactKind::PreRestoreSnapshot),
            _ => None,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// How an artifact's content is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFormat {
    /// Engine-native archive, internally compressed; supports selective restore
    CustomCompressed,
    /// Gzipped SQL script
    PlainSql,
}

impl ArtifactFormat {
    /// File name extension, leading dot included
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::CustomCompressed => ".dump",
            ArtifactFormat::PlainSql => ".sql.gz",
        }
    }

    /// Guess the format of a file that does not follow the naming scheme
    pub fn infer(file_name: &str) -> Option<Self> {
        let name = file_name.strip_suffix(ENCRYPTED_SUFFIX).unwrap_or(file_name);
        if [".dump", ".custom", ".backup"].iter().any(|ext| name.ends_with(ext)) {
            Some(ArtifactFormat::CustomCompressed)
        } else if name.ends_with(".sql") || name.ends_with(".sql.gz") {
            Some(ArtifactFormat::PlainSql)
        } else {
            None
        }
    }
}

/// Parsed `<kind>_<id><ext>[.enc]` file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    /// Backup kind
    pub kind: ArtifactKind,
    /// Timestamp id shared by every artifact of one run
    pub id: String,
    /// Creation time parsed from the id
    pub created_at: DateTime<Utc>,
    /// Content format
    pub format: ArtifactFormat,
    /// Carries the `.enc` suffix
    pub encrypted: bool,
}

impl ArtifactName {
    /// Name for a new artifact created at `created_at`
    pub fn new(kind: ArtifactKind, format: ArtifactFormat, created_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            id: artifact_id(created_at),
            created_at,
            format,
            encrypted: false,
        }
    }

    /// `None` for anything not produced by this crate
    pub fn parse(file_name: &str) -> Option<Self> {
        let (name, encrypted) = match file_name.strip_suffix(ENCRYPTED_SUFFIX) {
            Some(stripped) => (stripped, true),
            None => (file_name, false),
        };

        let (stem, format) = [ArtifactFormat::PlainSql, ArtifactFormat::CustomCompressed]
            .into_iter()
            .find_map(|format| name.strip_suffix(format.extension()).map(|stem| (stem, format)))?;

        let (prefix, id) = stem.split_once('_')?;
        let kind = ArtifactKind::from_prefix(prefix)?;
        let created_at = parse_artifact_id(id)?;

        Some(Self {
            kind,
            id: id.to_string(),
            created_at,
            format,
            encrypted,
        })
    }

    /// Set the `.enc` flag
    pub fn encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    /// `<kind>_<id><ext>[.enc]`
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}{}{}",
            self.kind.prefix(),
            self.id,
            self.format.extension(),
            if self.encrypted { ENCRYPTED_SUFFIX } else { "" }
        )
    }
}

/// One stored artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifact {
    /// Shared id of the run
    pub id: String,
    /// Backup kind
    pub kind: ArtifactKind,
    /// Content format
    pub format: ArtifactFormat,
    /// Absent once purged locally
    pub local_path: Option<PathBuf>,
    /// Absent if never uploaded
    pub remote_uri: Option<String>,
    /// Digest of the as-stored bytes; absent for unsealed files
    pub checksum: Option<String>,
    /// Stored as ciphertext
    pub encrypted: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Size of the stored bytes
    pub size_bytes: u64,
}

impl BackupArtifact {
    /// Canonical name for this artifact
    pub fn name(&self) -> ArtifactName {
        ArtifactName {
            kind: self.kind,
            id: self.id.clone(),
            created_at: self.created_at,
            format: self.format,
            encrypted: self.encrypted,
        }
    }

    /// The stored file name; an externally supplied file keeps its own
    pub fn file_name(&self) -> String {
        self.local_path
            .as_ref()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| self.name().file_name())
    }

    /// Has a checksum sidecar
    pub fn is_sealed(&self) -> bool {
        self.checksum.is_some()
    }
}

/// Artifacts produced by one backup run, sharing an id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupSet {
    /// Id shared by every artifact in the set
    pub id: String,
    /// Backup kind
    pub kind: ArtifactKind,
    primary: BackupArtifact,
    companions: Vec<BackupArtifact>,
}

impl BackupSet {
    /// Build a set; `companions` follow the primary in listing order
    pub fn new(primary: BackupArtifact, companions: Vec<BackupArtifact>) -> Self {
        Self {
            id: primary.id.clone(),
            kind: primary.kind,
            primary,
            companions,
        }
    }

    /// The artifact a restore would normally pick: the structured dump for a
    /// full backup, the change set for an incremental one
    pub fn primary(&self) -> &BackupArtifact {
        &self.primary
    }

    /// Primary first, then companions
    pub fn artifacts(&self) -> impl Iterator<Item = &BackupArtifact> {
        std::iter::once(&self.primary).chain(self.companions.iter())
    }

    /// Combined stored size in bytes
    pub fn total_size(&self) -> u64 {
        self.artifacts().map(|a| a.size_bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_name_scheme() {
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 2, 0, 0).unwrap();
        let name = ArtifactName::new(ArtifactKind::Full, ArtifactFormat::PlainSql, at);
        assert_eq!(name.file_name(), "full_20261018T020000.000Z.sql.gz");

        let encrypted = ArtifactName::new(ArtifactKind::PreRestoreSnapshot, ArtifactFormat::CustomCompressed, at)
            .encrypted(true);
        assert_eq!(encrypted.file_name(), "snapshot_20261018T020000.000Z.dump.enc");

        let parsed = ArtifactName::parse("snapshot_20261018T020000.000Z.dump.enc").unwrap();
        assert_eq!(parsed, encrypted);
        assert_eq!(parsed.created_at, at);
    }

    #[test]
    fn test_foreign_names_are_ignored() {
        assert!(ArtifactName::parse("operations.log").is_none());
        assert!(ArtifactName::parse("full_20261018T020000.000Z.dump.sha256").is_none());
        assert!(ArtifactName::parse("weekly_20261018T020000.000Z.dump").is_none());
        assert!(ArtifactName::parse("full_yesterday.dump").is_none());
    }

    #[test]
    fn test_format_inference() {
        assert_eq!(ArtifactFormat::infer("prod.backup"), Some(ArtifactFormat::CustomCompressed));
        assert_eq!(ArtifactFormat::infer("prod.sql"), Some(ArtifactFormat::PlainSql));
        assert_eq!(ArtifactFormat::infer("prod.sql.gz.enc"), Some(ArtifactFormat::PlainSql));
        assert_eq!(ArtifactFormat::infer("prod.tar"), None);
    }

    #[test]
    fn test_millisecond_ids_sort_chronologically() {
        let a = Utc.timestamp_millis_opt(1_792_202_400_001).unwrap();
        let b = Utc.timestamp_millis_opt(1_792_202_400_010).unwrap();
        assert!(artifact_id(a) < artifact_id(b));
    }
}
