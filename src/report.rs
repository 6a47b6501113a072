use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{Value, json};

use crate::build_info;
use crate::engine::{DocumentOutcome, MigrationResult, RollbackOutcome};
use crate::error::{DocRolesError, Result};
use crate::model::MigrationStatus;

const MAX_NAME_ATTEMPTS: usize = 100;

/// Writes one timestamped JSON audit file per pipeline invocation. Files
/// are created exclusively and never rewritten.
pub struct ReportBuilder {
    dir: PathBuf,
}

impl ReportBuilder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn migration_report(&self, result: &MigrationResult) -> Result<PathBuf> {
        let listing = |status: MigrationStatus| -> Vec<&DocumentOutcome> {
            result
                .outcomes
                .iter()
                .filter(|o| o.status == status)
                .collect()
        };

        let payload = json!({
            "kind": "migration",
            "generated_at": Utc::now().to_rfc3339(),
            "tool_version": env!("CARGO_PKG_VERSION"),
            "build_sha": build_info::git_sha(),
            "dry_run": result.dry_run,
            "force": result.force,
            "cancelled": result.cancelled,
            "summary": {
                "documents_processed": result.documents_processed,
                "successful": result.successful,
                "partial": result.partial,
                "failed": result.failed,
                "roles_created": result.roles_created.len(),
            },
            "roles_created": result.roles_created,
            "organizations_affected": result.organizations_affected,
            "documents": {
                "success": listing(MigrationStatus::Success),
                "partial": listing(MigrationStatus::Partial),
                "failed": listing(MigrationStatus::Error),
            },
            "pre_validation": result.pre_validation,
            "post_validation": result.post_validation,
            "warnings": result.warnings,
        });

        self.write("migration", &payload)
    }

    pub fn rollback_report(&self, outcome: &RollbackOutcome) -> Result<PathBuf> {
        let payload = json!({
            "kind": "rollback",
            "generated_at": Utc::now().to_rfc3339(),
            "tool_version": env!("CARGO_PKG_VERSION"),
            "build_sha": build_info::git_sha(),
            "result": outcome,
        });

        self.write("rollback", &payload)
    }

    /// Record a run the engine refused before touching any document.
    pub fn refusal_report(
        &self,
        kind: &str,
        err: &DocRolesError,
        dry_run: bool,
        force: bool,
    ) -> Result<PathBuf> {
        let payload = json!({
            "kind": kind,
            "generated_at": Utc::now().to_rfc3339(),
            "tool_version": env!("CARGO_PKG_VERSION"),
            "build_sha": build_info::git_sha(),
            "dry_run": dry_run,
            "force": force,
            "refused": true,
            "error": err.code(),
            "message": err.to_string(),
        });

        self.write(kind, &payload)
    }

    fn write(&self, kind: &str, payload: &Value) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let body = serde_json::to_string_pretty(payload)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                format!("{kind}-{stamp}.json")
            } else {
                format!("{kind}-{stamp}-{attempt}.json")
            };
            let path = self.dir.join(name);

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(body.as_bytes())?;
                    file.sync_all()?;
                    return Ok(path);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Err(DocRolesError::Io(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free report file name for {kind}-{stamp}"),
        )))
    }
}
