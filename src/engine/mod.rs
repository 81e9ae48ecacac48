//! Database engine interfaces
//!
//! The orchestrators never shell out directly. Everything they need from the
//! database is behind three narrow traits, so a native client (or a test fake)
//! can stand in for the PostgreSQL tooling without touching pipeline logic.

mod postgres;
pub(crate) mod process;

pub use postgres::PostgresTools;

use crate::config::ConnectionParams;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors raised by engine tooling
#[derive(Error, Debug)]
pub enum EngineError {
    /// The tool could not be started
    #[error("failed to launch {tool}: {source}")]
    Spawn {
        /// Program name
        tool: String,
        /// Launch error
        #[source]
        source: std::io::Error,
    },

    /// The tool exited unsuccessfully
    #[error("{tool} exited with status {code:?}: {stderr}")]
    ToolFailed {
        /// Program name
        tool: String,
        /// Exit status, `None` if killed by a signal
        code: Option<i32>,
        /// Captured standard error
        stderr: String,
    },

    /// Connection failed
    #[error("database unreachable: {0}")]
    Unreachable(String),

    /// A catalog query failed
    #[error("query failed: {0}")]
    Query(String),

    /// Stopped by the cancel token
    #[error("cancelled")]
    Cancelled,

    /// Filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a structured artifact is applied to the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Drop existing objects before recreating them
    pub clean: bool,
    /// Skip ownership and privilege statements so the artifact is portable
    pub no_owner: bool,
    /// Restrict the restore to one schema
    pub schema: Option<String>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            clean: true,
            no_owner: true,
            schema: None,
        }
    }
}

/// Result of a create-database request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The database was created
    Created,
    /// The database was already there
    AlreadyExists,
}

/// Summary of a time-window change capture
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    /// `schema.table` names that had a timestamp column to filter on
    pub tables: Vec<String>,
}

/// Producing artifacts from a live target
#[async_trait]
pub trait Dump: Send + Sync {
    /// Structured (custom format, internally compressed) dump of the whole target
    async fn dump_structured(
        &self,
        target: &ConnectionParams,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError>;

    /// Plain SQL rendering of an existing structured dump, without touching the
    /// source database
    async fn render_plain(
        &self,
        structured: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError>;

    /// Rows created or updated at or after `since`, as replayable SQL
    async fn dump_changes(
        &self,
        target: &ConnectionParams,
        since: DateTime<Utc>,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<ChangeSummary, EngineError>;
}

/// Applying artifacts to a target
#[async_trait]
pub trait Restore: Send + Sync {
    /// Apply a structured dump
    async fn restore_structured(
        &self,
        target: &ConnectionParams,
        artifact: &Path,
        options: &RestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError>;

    /// Sequential statement replay of an uncompressed SQL script
    async fn replay_sql(
        &self,
        target: &ConnectionParams,
        script: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError>;
}

/// Connectivity and inspection
#[async_trait]
pub trait Probe: Send + Sync {
    /// Open and close a connection
    async fn probe(&self, target: &ConnectionParams) -> Result<(), EngineError>;

    /// Create the target database
    async fn create_database(&self, target: &ConnectionParams) -> Result<CreateOutcome, EngineError>;

    /// Create `schema` if it does not exist
    async fn ensure_schema(&self, target: &ConnectionParams, schema: &str) -> Result<(), EngineError>;

    /// Base tables in `schema`
    async fn table_count(&self, target: &ConnectionParams, schema: &str) -> Result<u64, EngineError>;

    /// Row count of `schema.table`, or `None` if the table does not exist
    async fn row_count(
        &self,
        target: &ConnectionParams,
        schema: &str,
        table: &str,
    ) -> Result<Option<u64>, EngineError>;

    /// Value of the server's `archive_mode` setting
    async fn archive_mode(&self, target: &ConnectionParams) -> Result<String, EngineError>;
}

/// Everything the orchestrators need from the database
pub trait DatabaseEngine: Dump + Restore + Probe {}

impl<T: Dump + Restore + Probe> DatabaseEngine for T {}

/// Double-quote an identifier for interpolation into SQL
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
