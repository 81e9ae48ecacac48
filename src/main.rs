//! dbvault - backup and restore CLI
//!
//! Configuration comes from the environment (see `VaultConfig::from_env`).
//! Exit status is zero on success and non-zero after logging the failing stage.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dbvault::backup::{catalog, ArtifactKind, BackupOrchestrator, Retention};
use dbvault::config::VaultConfig;
use dbvault::context::{VaultContext, VaultContextBuilder};
use dbvault::engine::PostgresTools;
use dbvault::integrity::VerifyOutcome;
use dbvault::pitr::PitrCoordinator;
use dbvault::restore::{RestoreOrchestrator, RestoreRequest, TenantId};
use dbvault::VaultError;

/// Backup and restore orchestration for PostgreSQL
#[derive(Parser, Debug)]
#[command(name = "dbvault")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or check backups
    #[command(subcommand)]
    Backup(BackupCommands),

    /// Inspect and restore backups
    #[command(subcommand)]
    Restore(RestoreCommands),

    /// Retention housekeeping
    #[command(subcommand)]
    Retention(RetentionCommands),

    /// Enforce retention periodically until interrupted
    Schedule {
        /// Seconds between retention passes
        #[arg(long, default_value = "86400", value_parser = parse_seconds)]
        interval: Duration,
    },
}

#[derive(Subcommand, Debug)]
enum BackupCommands {
    /// Structured and plain SQL dump of the whole database
    Full,
    /// Rows created or updated inside the incremental window
    Incremental,
    /// Check an artifact against its checksum file
    Verify {
        /// File name in the backup root, path, or s3:// URI
        artifact: String,
    },
}

#[derive(Subcommand, Debug)]
enum RestoreCommands {
    /// List local and remote artifacts
    List,
    /// Restore a whole database
    Restore {
        /// File name in the backup root, path, or s3:// URI
        artifact: String,
        /// Create the target database first (true/false, yes/no, 1/0)
        #[arg(action = ArgAction::Set, value_parser = BoolishValueParser::new(), default_value = "false")]
        create_db: bool,
    },
    /// Restore one tenant's schema from a structured dump
    Tenant {
        tenant_id: String,
        artifact: String,
    },
    /// Stage a point-in-time recovery plan
    Pitr {
        /// RFC 3339, or `YYYY-MM-DD HH:MM:SS` in UTC
        #[arg(value_parser = parse_time)]
        target_time: DateTime<Utc>,
        base_artifact: String,
    },
}

#[derive(Subcommand, Debug)]
enum RetentionCommands {
    /// Delete expired artifacts on both tiers
    Enforce,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            let vault_error = e.downcast_ref::<VaultError>();
            error!(stage = ?vault_error.and_then(VaultError::stage), "{:#}", e);
            eprintln!("Error: {e:#}");
            ExitCode::from(vault_error.map(VaultError::exit_code).unwrap_or(1))
        }
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = VaultConfig::from_env().map_err(VaultError::from)?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            interrupt.cancel();
        }
    });

    let builder = VaultContext::builder(config.clone())
        .engine(Arc::new(PostgresTools::new()))
        .cancel_token(cancel.clone());
    let ctx = Arc::new(attach_remote(builder, &config).await.build());

    match cli.command {
        Commands::Backup(BackupCommands::Full) => backup(&ctx, ArtifactKind::Full).await,
        Commands::Backup(BackupCommands::Incremental) => backup(&ctx, ArtifactKind::Incremental).await,
        Commands::Backup(BackupCommands::Verify { artifact }) => {
            let (found, outcome) = BackupOrchestrator::new(ctx.clone()).verify(&artifact).await?;
            match outcome {
                VerifyOutcome::Verified { digest } => {
                    println!("OK\t{}\t{}", found.file_name(), digest);
                    Ok(ExitCode::SUCCESS)
                }
                VerifyOutcome::Unverified => {
                    println!("UNVERIFIED\t{}\tno checksum file", found.file_name());
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Restore(RestoreCommands::List) => {
            let entries = catalog::list(&ctx).await?;
            if entries.is_empty() {
                println!("No backups found");
            }
            for entry in entries {
                println!(
                    "{}\t{}\t{}\t{}\t{}{}",
                    entry.name,
                    entry.kind,
                    entry.created_at.to_rfc3339(),
                    entry.size_bytes,
                    entry.location(),
                    if entry.verifiable { "" } else { "\tunverified" }
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Restore(RestoreCommands::Restore { artifact, create_db }) => {
            let request = RestoreRequest::new(artifact, ctx.config.target.clone()).create_database(create_db);
            restore(&ctx, request).await
        }
        Commands::Restore(RestoreCommands::Tenant { tenant_id, artifact }) => {
            let tenant = TenantId::parse(&tenant_id)?;
            let request = RestoreRequest::new(artifact, ctx.config.target.clone()).tenant(tenant);
            restore(&ctx, request).await
        }
        Commands::Restore(RestoreCommands::Pitr {
            target_time,
            base_artifact,
        }) => {
            let plan = PitrCoordinator::new(ctx.clone())
                .stage_pitr(target_time, &base_artifact)
                .await?;
            println!("Recovery plan {} staged", plan.id);
            println!("  base artifact: {}", plan.base_artifact);
            println!("  target time:   {}", plan.target_time.to_rfc3339());
            println!("  plan:          {}", plan.plan_path.display());
            println!("  config:        {}", plan.config_path.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Retention(RetentionCommands::Enforce) => {
            let report = Retention::new(ctx.clone()).enforce().await?;
            if report.skipped {
                println!("Retention already running elsewhere, skipped");
            } else {
                println!(
                    "Removed {} local and {} remote artifacts; {} kept awaiting a remote copy",
                    report.local_deleted.len(),
                    report.remote_deleted.len(),
                    report.unconfirmed.len()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule { interval } => {
            Retention::new(ctx.clone()).schedule(interval, &cancel).await;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn backup(ctx: &Arc<VaultContext>, kind: ArtifactKind) -> anyhow::Result<ExitCode> {
    let set = BackupOrchestrator::new(ctx.clone())
        .create_backup(kind, &ctx.config.target)
        .await?;
    for artifact in set.artifacts() {
        println!(
            "{}\t{}\t{}",
            artifact.file_name(),
            artifact.size_bytes,
            artifact.remote_uri.as_deref().unwrap_or("-")
        );
    }

    // Housekeeping never fails the backup
    if let Err(e) = Retention::new(ctx.clone()).enforce().await {
        warn!(error = %e, "Post-backup retention failed");
    }
    Ok(ExitCode::SUCCESS)
}

async fn restore(ctx: &Arc<VaultContext>, request: RestoreRequest) -> anyhow::Result<ExitCode> {
    let report = RestoreOrchestrator::new(ctx.clone()).restore(request).await?;
    println!("Restored {}", report.artifact.file_name());
    println!("  pre-restore snapshot: {}", report.snapshot.file_name());
    if !report.verification.is_verified() {
        println!("  warning: artifact had no checksum file and was not verified");
    }
    println!(
        "  schema {}: {} tables, row counts {:?}",
        report.validation.schema, report.validation.table_count, report.validation.row_counts
    );
    report
        .validation
        .ensure_passed()
        .context("restore completed but post-restore validation failed")?;
    Ok(ExitCode::SUCCESS)
}

#[cfg(feature = "s3")]
async fn attach_remote(builder: VaultContextBuilder, config: &VaultConfig) -> VaultContextBuilder {
    match &config.remote {
        Some(remote) => builder.object_store(Arc::new(dbvault::remote::S3ObjectStore::new(remote).await)),
        None => builder,
    }
}

#[cfg(not(feature = "s3"))]
async fn attach_remote(builder: VaultContextBuilder, _config: &VaultConfig) -> VaultContextBuilder {
    builder
}

fn parse_seconds(raw: &str) -> Result<Duration, String> {
    match raw.parse::<u64>() {
        Ok(0) => Err("interval must be at least one second".to_string()),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(e) => Err(e.to_string()),
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("'{}' is not an RFC 3339 or 'YYYY-MM-DD HH:MM:SS' timestamp", raw))
}
