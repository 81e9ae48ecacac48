// PostgreSQL implementation of the engine traits
// pg_dump / pg_restore / psql for archive work, sqlx for probing and change capture

use super::process;
use super::{
    quote_ident, ChangeSummary, CreateOutcome, Dump, EngineError, Probe, Restore, RestoreOptions,
};
use crate::config::ConnectionParams;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Row};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

const DUPLICATE_DATABASE: &str = "42P04";

const TABLES_WITH_TIMESTAMPS: &str = r#"
    SELECT c.table_schema::text AS table_schema,
           c.table_name::text AS table_name,
           bool_or(c.column_name = 'updated_at') AS has_updated_at,
           bool_or(c.column_name = 'created_at') AS has_created_at
    FROM information_schema.columns c
    JOIN information_schema.tables t
      ON t.table_schema = c.table_schema
     AND t.table_name = c.table_name
     AND t.table_type = 'BASE TABLE'
    WHERE c.column_name IN ('updated_at', 'created_at')
      AND c.table_schema NOT IN ('pg_catalog', 'information_schema')
    GROUP BY c.table_schema, c.table_name
    ORDER BY c.table_schema, c.table_name
"#;

/// PostgreSQL client tooling plus a direct sqlx connection for inspection
#[derive(Debug, Clone)]
pub struct PostgresTools {
    bin_dir: Option<PathBuf>,
    connect_timeout: Duration,
    compression_level: u8,
}

impl Default for PostgresTools {
    fn default() -> Self {
        Self::new()
    }
}

impl PostgresTools {
    /// Tools from `PATH`, ten second connect timeout
    pub fn new() -> Self {
        Self {
            bin_dir: None,
            connect_timeout: Duration::from_secs(10),
            compression_level: 6,
        }
    }

    /// Directory holding `pg_dump`, `pg_restore` and `psql`; `PATH` otherwise
    pub fn with_bin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bin_dir = Some(dir.into());
        self
    }

    /// Give up connecting after `timeout`
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn tool(&self, name: &str) -> Command {
        let program = match &self.bin_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        };
        let mut command = Command::new(program);
        command.stdout(Stdio::null());
        command
    }

    fn with_connection(&self, command: &mut Command, target: &ConnectionParams) {
        command
            .arg("--host")
            .arg(&target.host)
            .arg("--port")
            .arg(target.port.to_string())
            .arg("--username")
            .arg(&target.user)
            .arg("--no-password")
            .env("PGCONNECT_TIMEOUT", self.connect_timeout.as_secs().max(1).to_string());
        if let Some(password) = &target.password {
            command.env("PGPASSWORD", password);
        }
    }

    fn connect_options(target: &ConnectionParams) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .username(&target.user)
            .database(&target.database)
            .application_name("dbvault");
        if let Some(password) = &target.password {
            options = options.password(password);
        }
        options
    }

    async fn connect(&self, target: &ConnectionParams) -> Result<PgConnection, EngineError> {
        let options = Self::connect_options(target);
        match tokio::time::timeout(self.connect_timeout, PgConnection::connect_with(&options)).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(EngineError::Unreachable(format!("{}: {}", target, e))),
            Err(_) => Err(EngineError::Unreachable(format!(
                "{}: no response within {:?}",
                target, self.connect_timeout
            ))),
        }
    }
}

fn query_error(e: sqlx::Error) -> EngineError {
    EngineError::Query(e.to_string())
}

fn change_predicate(has_updated_at: bool, has_created_at: bool, since: &str) -> String {
    let mut clauses = Vec::new();
    if has_updated_at {
        clauses.push(format!("updated_at >= '{}'::timestamptz", since));
    }
    if has_created_at {
        clauses.push(format!("created_at >= '{}'::timestamptz", since));
    }
    clauses.join(" OR ")
}

#[async_trait]
impl Dump for PostgresTools {
    #[instrument(skip(self, cancel), fields(target = %target))]
    async fn dump_structured(
        &self,
        target: &ConnectionParams,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let mut command = self.tool("pg_dump");
        self.with_connection(&mut command, target);
        command
            .arg("--format=custom")
            .arg(format!("--compress={}", self.compression_level))
            .arg("--file")
            .arg(output)
            .arg(&target.database);

        process::run(command, "pg_dump", cancel).await?;
        debug!(output = %output.display(), "Structured dump written");
        Ok(())
    }

    async fn render_plain(
        &self,
        structured: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        // No --dbname: pg_restore only converts the archive into a script.
        let mut command = self.tool("pg_restore");
        command
            .arg("--clean")
            .arg("--if-exists")
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg("--file")
            .arg(output)
            .arg(structured);

        process::run(command, "pg_restore", cancel).await?;
        Ok(())
    }

    #[instrument(skip(self, cancel), fields(target = %target))]
    async fn dump_changes(
        &self,
        target: &ConnectionParams,
        since: DateTime<Utc>,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<ChangeSummary, EngineError> {
        let since = since.to_rfc3339_opts(SecondsFormat::Micros, true);
        let mut conn = self.connect(target).await?;

        // One snapshot for every table in the change set.
        let mut tx = conn.begin().await.map_err(query_error)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

        let tables = sqlx::query(TABLES_WITH_TIMESTAMPS)
            .fetch_all(&mut *tx)
            .await
            .map_err(query_error)?;

        let mut out = BufWriter::new(tokio::fs::File::create(output).await?);
        out.write_all(
            format!(
                "-- dbvault incremental change set\n\
                 -- rows created or updated since {}\n\
                 -- deleted rows are not captured\n\
                 SET client_encoding = 'UTF8';\n\n",
                since
            )
            .as_bytes(),
        )
        .await?;

        let mut summary = ChangeSummary::default();
        for row in tables {
            let schema: String = row.try_get("table_schema").map_err(query_error)?;
            let table: String = row.try_get("table_name").map_err(query_error)?;
            let has_updated_at: bool = row.try_get("has_updated_at").map_err(query_error)?;
            let has_created_at: bool = row.try_get("has_created_at").map_err(query_error)?;

            let qualified = format!("{}.{}", quote_ident(&schema), quote_ident(&table));
            let statement = format!(
                "COPY (SELECT * FROM {} WHERE {}) TO STDOUT",
                qualified,
                change_predicate(has_updated_at, has_created_at, &since)
            );

            out.write_all(format!("COPY {} FROM stdin;\n", qualified).as_bytes()).await?;
            {
                let mut stream = tx.copy_out_raw(&statement).await.map_err(query_error)?;
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                        next = stream.next() => next,
                    };
                    match next {
                        Some(chunk) => out.write_all(&chunk.map_err(query_error)?).await?,
                        None => break,
                    }
                }
            }
            out.write_all(b"\\.\n\n").await?;

            summary.tables.push(format!("{}.{}", schema, table));
        }

        tx.rollback().await.map_err(query_error)?;
        out.flush().await?;
        out.into_inner().sync_all().await?;

        info!(tables = summary.tables.len(), since = %since, "Change set captured");
        Ok(summary)
    }
}

#[async_trait]
impl Restore for PostgresTools {
    #[instrument(skip(self, cancel), fields(target = %target))]
    async fn restore_structured(
        &self,
        target: &ConnectionParams,
        artifact: &Path,
        options: &RestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let mut command = self.tool("pg_restore");
        self.with_connection(&mut command, target);
        command.arg("--dbname").arg(&target.database).arg("--exit-on-error");
        if options.clean {
            command.arg("--clean").arg("--if-exists");
        }
        if options.no_owner {
            command.arg("--no-owner").arg("--no-privileges");
        }
        if let Some(schema) = &options.schema {
            command.arg("--schema").arg(schema);
        }
        command.arg(artifact);

        process::run(command, "pg_restore", cancel).await?;
        Ok(())
    }

    #[instrument(skip(self, cancel), fields(target = %target))]
    async fn replay_sql(
        &self,
        target: &ConnectionParams,
        script: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let mut command = self.tool("psql");
        self.with_connection(&mut command, target);
        command
            .arg("--no-psqlrc")
            .arg("--quiet")
            .arg("--single-transaction")
            .arg("--set")
            .arg("ON_ERROR_STOP=1")
            .arg("--dbname")
            .arg(&target.database)
            .arg("--file")
            .arg(script);

        process::run(command, "psql", cancel).await?;
        Ok(())
    }
}

#[async_trait]
impl Probe for PostgresTools {
    async fn probe(&self, target: &ConnectionParams) -> Result<(), EngineError> {
        let mut conn = self.connect(target).await?;
        sqlx::query("SELECT 1")
            .execute(&mut conn)
            .await
            .map_err(|e| EngineError::Unreachable(e.to_string()))?;
        let _ = conn.close().await;
        Ok(())
    }

    async fn create_database(&self, target: &ConnectionParams) -> Result<CreateOutcome, EngineError> {
        let mut conn = self.connect(&target.with_database("postgres")).await?;
        let statement = format!("CREATE DATABASE {}", quote_ident(&target.database));

        let outcome = match sqlx::query(&statement).execute(&mut conn).await {
            Ok(_) => CreateOutcome::Created,
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(DUPLICATE_DATABASE) => {
                CreateOutcome::AlreadyExists
            }
            Err(e) => return Err(query_error(e)),
        };
        let _ = conn.close().await;
        Ok(outcome)
    }

    async fn ensure_schema(&self, target: &ConnectionParams, schema: &str) -> Result<(), EngineError> {
        let mut conn = self.connect(target).await?;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)))
            .execute(&mut conn)
            .await
            .map_err(query_error)?;
        let _ = conn.close().await;
        Ok(())
    }

    async fn table_count(&self, target: &ConnectionParams, schema: &str) -> Result<u64, EngineError> {
        let mut conn = self.connect(target).await?;
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM information_schema.tables \
             WHERE table_schema = $1 AND table_type = 'BASE TABLE'",
        )
        .bind(schema)
        .fetch_one(&mut conn)
        .await
        .map_err(query_error)?;
        let _ = conn.close().await;
        Ok(count.max(0) as u64)
    }

    async fn row_count(
        &self,
        target: &ConnectionParams,
        schema: &str,
        table: &str,
    ) -> Result<Option<u64>, EngineError> {
        let mut conn = self.connect(target).await?;
        let qualified = format!("{}.{}", quote_ident(schema), quote_ident(table));

        let exists: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
            .bind(&qualified)
            .fetch_one(&mut conn)
            .await
            .map_err(query_error)?;
        if exists.is_none() {
            let _ = conn.close().await;
            return Ok(None);
        }

        let count: i64 = sqlx::query_scalar(&format!("SELECT count(*) FROM {}", qualified))
            .fetch_one(&mut conn)
            .await
            .map_err(query_error)?;
        let _ = conn.close().await;
        Ok(Some(count.max(0) as u64))
    }

    async fn archive_mode(&self, target: &ConnectionParams) -> Result<String, EngineError> {
        let mut conn = self.connect(target).await?;
        let mode: String = sqlx::query_scalar("SHOW archive_mode")
            .fetch_one(&mut conn)
            .await
            .map_err(query_error)?;
        let _ = conn.close().await;
        Ok(mode)
    }
}
