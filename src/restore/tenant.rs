// Tenant identifiers and their schema names

use crate::VaultError;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

const MAX_LEN: usize = 50;

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("static pattern compiles"))
}

/// Validated tenant identifier; safe to splice into a schema name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TenantId(String);

impl TenantId {
    /// Accepts 1 to 50 letters, digits or underscores
    pub fn parse(raw: &str) -> Result<Self, VaultError> {
        if raw.is_empty() || raw.len() > MAX_LEN {
            return Err(VaultError::InvalidArgument(format!(
                "tenant id must be 1 to {} characters, got {}",
                MAX_LEN,
                raw.len()
            )));
        }
        if !pattern().is_match(raw) {
            return Err(VaultError::InvalidArgument(format!(
                "tenant id '{}' may only contain letters, digits and underscores",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// The validated id
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `tenant_<id>`
    pub fn schema_name(&self) -> String {
        format!("tenant_{}", self.0)
    }
}

impl FromStr for TenantId {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
