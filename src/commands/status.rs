use std::collections::BTreeMap;
use std::path::Path;

use colored::Colorize;
use serde::Serialize;

use crate::build_info;
use crate::error::Result;
use crate::model::{CreatedRole, MigrationStatus};
use crate::output::{self, Format};
use crate::resolver::MIGRATION_ROLE_DESCRIPTION;
use crate::store::backups::BackupStore;
use crate::store::db::Db;
use crate::store::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    NotStarted,
    Running,
    Migrated,
}

impl PipelineState {
    fn label(self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Running => "RUNNING",
            Self::Migrated => "MIGRATED",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub state: PipelineState,
    pub database: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_tables: Vec<String>,
    pub documents: usize,
    pub backup_records: usize,
    pub status_summary: BTreeMap<MigrationStatus, usize>,
    pub role_mappings: usize,
    pub auto_created_roles: Vec<CreatedRole>,
    pub version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_sha: Option<&'static str>,
}

/// Snapshot the pipeline state. A held run lock wins over the backup table.
pub fn collect(db: &Db, database: &Path, lock_path: &Path) -> Result<StatusReport> {
    let backups = BackupStore::new(db);
    let missing_tables = db.missing_app_tables()?;
    let migrated = backups.exists()?;

    let state = if lock::is_held(lock_path)? {
        PipelineState::Running
    } else if migrated {
        PipelineState::Migrated
    } else {
        PipelineState::NotStarted
    };

    let documents = if missing_tables.iter().any(|t| t == "documents") {
        0
    } else {
        db.document_count()?
    };
    let auto_created_roles = if missing_tables.iter().any(|t| t == "organization_roles") {
        Vec::new()
    } else {
        db.roles_with_description(MIGRATION_ROLE_DESCRIPTION)?
            .into_iter()
            .map(|role| CreatedRole {
                organization_id: role.organization_id,
                name: role.name,
            })
            .collect()
    };

    let (backup_records, status_summary, role_mappings) = if migrated {
        (
            backups.count()?,
            backups.status_summary()?,
            backups.mappings()?.len(),
        )
    } else {
        (0, BTreeMap::new(), 0)
    };

    Ok(StatusReport {
        state,
        database: database.display().to_string(),
        missing_tables,
        documents,
        backup_records,
        status_summary,
        role_mappings,
        auto_created_roles,
        version: env!("CARGO_PKG_VERSION"),
        build_sha: build_info::git_sha(),
    })
}

pub fn run(root: &Path, db_flag: Option<&Path>, format: Format) -> Result<()> {
    let (workspace, db) = super::open(root, db_flag)?;
    let report = collect(
        &db,
        &workspace.database_path(db_flag),
        &workspace.lock_path(),
    )?;
    print_status(&report, format)
}

pub fn print_status(report: &StatusReport, format: Format) -> Result<()> {
    match format {
        Format::Json => output::print_json(report)?,
        Format::Pretty => {
            let state = match report.state {
                PipelineState::NotStarted => report.state.label().green(),
                PipelineState::Running => report.state.label().yellow().bold(),
                PipelineState::Migrated => report.state.label().cyan().bold(),
            };
            println!("{} {}", "docroles".bold(), state);
            println!("  {} {}", "database:".dimmed(), report.database);
            if !report.missing_tables.is_empty() {
                println!(
                    "  {} {}",
                    "missing tables:".dimmed(),
                    report.missing_tables.join(", ").red()
                );
            }
            println!("  {} {}", "documents:".dimmed(), report.documents);
            println!("  {} {}", "backup records:".dimmed(), report.backup_records);
            for (status, count) in &report.status_summary {
                println!("    {} {}", format!("{status}:").dimmed(), count);
            }
            if !report.auto_created_roles.is_empty() {
                println!(
                    "  {} {}",
                    "auto-created roles:".dimmed(),
                    report.auto_created_roles.len()
                );
                for role in &report.auto_created_roles {
                    println!("    - {} ({})", role.name, role.organization_id.dimmed());
                }
            }
        }
        Format::Minimal => {
            let count = |status| report.status_summary.get(&status).copied().unwrap_or(0);
            println!(
                "state={} documents={} backups={} success={} partial={} error={} auto_created_roles={}",
                report.state.label(),
                report.documents,
                report.backup_records,
                count(MigrationStatus::Success),
                count(MigrationStatus::Partial),
                count(MigrationStatus::Error),
                report.auto_created_roles.len()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MigrationEngine;
    use crate::store::db::tests::{doc, org, role, seeded};
    use crate::store::lock::RunLock;
    use tempfile::tempdir;

    #[test]
    fn state_follows_backup_table_and_lock() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("run.lock");
        let db = seeded();
        org(&db, "Acme");
        role(&db, "Acme", "Administrator");
        doc(&db, "d1", "Acme", &["admin", "hr"]);

        let before = collect(&db, Path::new(":memory:"), &lock_path).unwrap();
        assert_eq!(before.state, PipelineState::NotStarted);
        assert_eq!(before.documents, 1);
        assert_eq!(before.backup_records, 0);

        MigrationEngine::new(&db).run(false, false).unwrap();
        let after = collect(&db, Path::new(":memory:"), &lock_path).unwrap();
        assert_eq!(after.state, PipelineState::Migrated);
        assert_eq!(after.backup_records, 1);
        assert_eq!(after.status_summary[&MigrationStatus::Success], 1);
        assert_eq!(after.role_mappings, 2);
        assert_eq!(after.auto_created_roles[0].name, "HR");

        let _held = RunLock::acquire(&lock_path).unwrap();
        let running = collect(&db, Path::new(":memory:"), &lock_path).unwrap();
        assert_eq!(running.state, PipelineState::Running);
    }

    #[test]
    fn missing_tables_are_reported_not_fatal() {
        let dir = tempdir().unwrap();
        let db = Db::open_memory().unwrap();
        let report = collect(&db, Path::new(":memory:"), &dir.path().join("run.lock")).unwrap();
        assert_eq!(report.state, PipelineState::NotStarted);
        assert_eq!(report.documents, 0);
        assert_eq!(report.missing_tables.len(), 3);
    }
}
