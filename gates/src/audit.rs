//! Append-only audit trail for waiver lifecycle transitions.
//!
//! One JSON record per line, never rewritten. Every state-changing store
//! call appends exactly one entry, in call order, before it returns; once a
//! waiver is pruned from the active store the log is the only record of it.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::GateError;

pub const AUDIT_RELATIVE_PATH: &str = ".gatehouse/audit.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Create,
    Revoke,
    Extend,
    FlagReview,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Revoke => "REVOKE",
            Self::Extend => "EXTEND",
            Self::FlagReview => "FLAG_REVIEW",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub waiver_id: String,
    pub details: serde_json::Value,
    pub user: String,
    pub cwd: String,
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(project_root: &Path) -> Self {
        Self {
            path: project_root.join(AUDIT_RELATIVE_PATH),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and flush it to disk before returning.
    pub fn append(
        &self,
        action: AuditAction,
        waiver_id: &str,
        details: serde_json::Value,
    ) -> Result<AuditLogEntry, GateError> {
        let entry = AuditLogEntry {
            timestamp: Utc::now(),
            action,
            waiver_id: waiver_id.to_string(),
            details,
            user: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
            cwd: std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let line = serde_json::to_string(&entry).map_err(|e| GateError::Parse {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        writeln!(file, "{line}").map_err(|e| self.io_error(e))?;
        file.flush().map_err(|e| self.io_error(e))?;
        file.sync_data().map_err(|e| self.io_error(e))?;

        Ok(entry)
    }

    /// Sequential scan of the whole log. An absent log is an empty log.
    pub fn entries(&self) -> Result<Vec<AuditLogEntry>, GateError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        let mut entries = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditLogEntry =
                serde_json::from_str(line).map_err(|e| GateError::Parse {
                    path: format!("{}:{}", self.path.display(), idx + 1),
                    message: e.to_string(),
                })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn io_error(&self, e: std::io::Error) -> GateError {
        GateError::Io {
            path: self.path.display().to_string(),
            message: e.to_string(),
        }
    }
}
