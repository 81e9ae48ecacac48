// Post-restore validation: reachability, table count, core record counts

use super::tenant::TenantId;
use crate::config::ConnectionParams;
use crate::engine::DatabaseEngine;
use crate::{Result, VaultError};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

const PRIMARY_SCHEMA: &str = "public";
/// Must exist after a whole-database restore
const REQUIRED_TABLE: &str = "users";
/// Counted when present
const OPTIONAL_TABLES: &[&str] = &["tenants"];

/// What the checks found; problems do not roll the restore back
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// The target accepted a connection
    pub reachable: bool,
    /// Schema the counts cover
    pub schema: String,
    /// Base tables found
    pub table_count: u64,
    /// Rows per checked table
    pub row_counts: BTreeMap<String, u64>,
    /// Everything that failed a check
    pub problems: Vec<String>,
}

impl ValidationReport {
    /// No problems were found
    pub fn passed(&self) -> bool {
        self.problems.is_empty()
    }

    /// [`VaultError::Validation`] listing every problem, if any
    pub fn ensure_passed(&self) -> Result<()> {
        if self.passed() {
            Ok(())
        } else {
            Err(VaultError::Validation(self.problems.join("; ")))
        }
    }
}

/// Check a freshly restored target. A tenant restore is checked within its
/// own schema and does not require the core tables.
pub async fn validate(
    engine: &dyn DatabaseEngine,
    target: &ConnectionParams,
    tenant: Option<&TenantId>,
) -> ValidationReport {
    let schema = tenant.map(TenantId::schema_name).unwrap_or_else(|| PRIMARY_SCHEMA.to_string());
    let mut report = ValidationReport {
        schema: schema.clone(),
        ..Default::default()
    };

    if let Err(e) = engine.probe(target).await {
        report.problems.push(format!("database unreachable: {}", e));
        warn!(target = %target, error = %e, "Validation failed: database unreachable");
        return report;
    }
    report.reachable = true;

    match engine.table_count(target, &schema).await {
        Ok(0) => report.problems.push(format!("schema {} has no tables", schema)),
        Ok(count) => report.table_count = count,
        Err(e) => report.problems.push(format!("could not count tables in {}: {}", schema, e)),
    }

    let tables = std::iter::once(REQUIRED_TABLE).chain(OPTIONAL_TABLES.iter().copied());
    for table in tables {
        match engine.row_count(target, &schema, table).await {
            Ok(Some(rows)) => {
                report.row_counts.insert(table.to_string(), rows);
            }
            Ok(None) if table == REQUIRED_TABLE && tenant.is_none() => {
                report.problems.push(format!("core table {}.{} is missing", schema, table));
            }
            Ok(None) => {}
            Err(e) => report.problems.push(format!("could not count {}.{}: {}", schema, table, e)),
        }
    }

    if report.passed() {
        info!(
            schema = %report.schema,
            tables = report.table_count,
            row_counts = ?report.row_counts,
            "Post-restore validation passed"
        );
    } else {
        warn!(problems = ?report.problems, "Post-restore validation found problems");
    }
    report
}
