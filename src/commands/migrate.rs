use std::path::Path;

use colored::Colorize;
use serde::Serialize;
use tracing::info;

use crate::commands::status;
use crate::engine::{MigrationEngine, MigrationResult};
use crate::error::{DocRolesError, Result};
use crate::model::MigrationStatus;
use crate::output::{self, Format};
use crate::report::ReportBuilder;
use crate::store::lock::RunLock;

#[derive(Serialize)]
struct MigrateOutput<'a> {
    #[serde(flatten)]
    result: &'a MigrationResult,
    report_path: String,
}

pub fn run(
    root: &Path,
    db_flag: Option<&Path>,
    live: bool,
    force: bool,
    status_only: bool,
    format: Format,
) -> Result<()> {
    let (workspace, db) = super::open(root, db_flag)?;
    if status_only {
        let report = status::collect(
            &db,
            &workspace.database_path(db_flag),
            &workspace.lock_path(),
        )?;
        return status::print_status(&report, format);
    }

    let dry_run = !live;
    let _lock = if live {
        Some(RunLock::acquire(&workspace.lock_path())?)
    } else {
        None
    };

    let result = MigrationEngine::new(&db)
        .run(dry_run, force)
        .inspect_err(|err| super::record_refusal(&workspace, "migration", err, dry_run, force))?;
    let report_path = ReportBuilder::new(workspace.reports_dir()).migration_report(&result)?;
    info!(report = %report_path.display(), "migration report written");

    print_result(&result, &report_path, format)?;

    match failure_reason(&result) {
        Some(reason) => Err(DocRolesError::RunFailed(reason)),
        None => Ok(()),
    }
}

/// Why the run should exit non-zero, if it should.
fn failure_reason(result: &MigrationResult) -> Option<String> {
    if result.cancelled {
        return Some("migration cancelled before every document was processed".into());
    }
    if result.failed > 0 || result.partial > 0 {
        return Some(format!(
            "migration finished with {} failed and {} partial document(s)",
            result.failed, result.partial
        ));
    }
    if let Some(post) = &result.post_validation
        && !post.ok
    {
        return Some(format!(
            "post-migration validation failed: {}",
            post.issues.join("; ")
        ));
    }
    if result.dry_run && !result.pre_validation.ok {
        return Some(format!(
            "pre-migration validation failed: {}",
            result.pre_validation.issues.join("; ")
        ));
    }
    None
}

fn print_result(result: &MigrationResult, report_path: &Path, format: Format) -> Result<()> {
    match format {
        Format::Json => output::print_json(&MigrateOutput {
            result,
            report_path: report_path.display().to_string(),
        })?,
        Format::Pretty => {
            let mode = if result.dry_run { "dry-run" } else { "live" };
            println!("{} {}", "docroles migrate".bold(), format!("({mode})").dimmed());
            println!(
                "  {} {} ({} success, {} partial, {} failed)",
                "documents:".dimmed(),
                result.documents_processed,
                result.successful.to_string().green(),
                result.partial.to_string().yellow(),
                result.failed.to_string().red()
            );
            let created_label = if result.dry_run {
                "roles to create:"
            } else {
                "roles created:"
            };
            println!(
                "  {} {}",
                created_label.dimmed(),
                result.roles_created.len()
            );
            for role in &result.roles_created {
                println!("    - {} ({})", role.name, role.organization_id.dimmed());
            }
            println!(
                "  {} {}",
                "organizations affected:".dimmed(),
                result.organizations_affected.join(", ")
            );

            println!();
            output::print_validation("Pre-migration validation", &result.pre_validation);
            if let Some(post) = &result.post_validation {
                output::print_validation("Post-migration validation", post);
            }

            let troubled: Vec<_> = result
                .outcomes
                .iter()
                .filter(|o| o.status != MigrationStatus::Success)
                .collect();
            if !troubled.is_empty() {
                println!("\n{}", "Documents needing attention".red().bold());
                for outcome in troubled {
                    println!(
                        "  {} {} {} -> {}",
                        outcome.document_id.bold(),
                        outcome.status.to_string().yellow(),
                        output::roles_inline(&outcome.original),
                        output::roles_inline(&outcome.migrated)
                    );
                    for note in &outcome.notes {
                        println!("      {}", note.dimmed());
                    }
                }
            }

            output::print_warnings(&result.warnings);
            if result.cancelled {
                println!("\n{}", "Run cancelled; remaining documents untouched.".yellow());
            }
            println!("\n  {} {}", "report:".dimmed(), report_path.display());
        }
        Format::Minimal => {
            println!(
                "dry_run={} processed={} success={} partial={} failed={} roles_created={} organizations={} pre_ok={} post_ok={} cancelled={} report={}",
                result.dry_run,
                result.documents_processed,
                result.successful,
                result.partial,
                result.failed,
                result.roles_created.len(),
                result.organizations_affected.len(),
                result.pre_validation.ok,
                result.post_validation.as_ref().is_none_or(|v| v.ok),
                result.cancelled,
                report_path.display()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backups::BackupStore;
    use crate::store::db::Db;
    use crate::store::db::tests::{doc, org, role};
    use tempfile::tempdir;

    fn workspace_db(root: &Path) -> Db {
        crate::commands::init::run(root, None, Format::Minimal).unwrap();
        Db::open(&root.join("docroles.db")).unwrap()
    }

    #[test]
    fn dry_run_is_default_and_writes_a_report() {
        let dir = tempdir().unwrap();
        let db = workspace_db(dir.path());
        org(&db, "Acme");
        role(&db, "Acme", "Administrator");
        doc(&db, "d1", "Acme", &["admin"]);

        run(dir.path(), None, false, false, false, Format::Minimal).unwrap();

        assert!(!BackupStore::new(&db).exists().unwrap());
        let reports: Vec<_> = std::fs::read_dir(dir.path().join(".docroles/reports"))
            .unwrap()
            .collect();
        assert_eq!(reports.len(), 1);
    }

    #[test]
    fn partial_documents_fail_the_run_after_reporting() {
        let dir = tempdir().unwrap();
        let db = workspace_db(dir.path());
        org(&db, "Acme");
        role(&db, "Acme", "Administrator");
        doc(&db, "d1", "Acme", &["admin", "   "]);

        let err = run(dir.path(), None, true, false, false, Format::Minimal).unwrap_err();
        assert_eq!(err.code(), "run_failed");
        assert!(BackupStore::new(&db).exists().unwrap());
        assert_eq!(
            db.get_document("d1").unwrap().unwrap().access_roles,
            vec!["Administrator"]
        );
    }

    #[test]
    fn refused_run_still_leaves_a_report() {
        let dir = tempdir().unwrap();
        let db = workspace_db(dir.path());
        org(&db, "Acme");
        role(&db, "Acme", "Owner");
        doc(&db, "d1", "Acme", &["owner"]);

        run(dir.path(), None, true, false, false, Format::Minimal).unwrap();
        let err = run(dir.path(), None, true, false, false, Format::Minimal).unwrap_err();
        assert!(matches!(err, DocRolesError::AlreadyMigrated));

        let reports: Vec<serde_json::Value> =
            std::fs::read_dir(dir.path().join(".docroles/reports"))
                .unwrap()
                .map(|entry| {
                    let body = std::fs::read_to_string(entry.unwrap().path()).unwrap();
                    serde_json::from_str(&body).unwrap()
                })
                .collect();
        assert_eq!(reports.len(), 2);
        let refusal = reports
            .iter()
            .find(|r| r["refused"] == true)
            .expect("refusal report");
        assert_eq!(refusal["error"], "already_migrated");
        assert_eq!(refusal["force"], false);
    }

    #[test]
    fn live_run_refuses_while_locked() {
        let dir = tempdir().unwrap();
        let db = workspace_db(dir.path());
        org(&db, "Acme");
        role(&db, "Acme", "Owner");
        doc(&db, "d1", "Acme", &["owner"]);

        let _held = RunLock::acquire(&dir.path().join(".docroles/run.lock")).unwrap();
        let err = run(dir.path(), None, true, false, false, Format::Minimal).unwrap_err();
        assert!(matches!(err, DocRolesError::Locked(_)));
        assert!(!BackupStore::new(&db).exists().unwrap());
    }
}
