use std::path::Path;

use colored::Colorize;
use serde::Serialize;
use tracing::info;

use crate::commands::status;
use crate::engine::{RollbackEngine, RollbackOptions, RollbackOutcome, RollbackResult};
use crate::error::{DocRolesError, Result};
use crate::output::{self, Format};
use crate::report::ReportBuilder;
use crate::store::lock::RunLock;

#[derive(Debug, Clone, Copy)]
pub struct RollbackFlags {
    pub live: bool,
    pub force: bool,
    pub status: bool,
    pub cleanup_only: bool,
    pub no_cleanup: bool,
}

#[derive(Serialize)]
struct RollbackOutput<'a> {
    #[serde(flatten)]
    outcome: &'a RollbackOutcome,
    report_path: String,
}

pub fn run(
    root: &Path,
    db_flag: Option<&Path>,
    flags: RollbackFlags,
    format: Format,
) -> Result<()> {
    let (workspace, db) = super::open(root, db_flag)?;
    if flags.status {
        let report = status::collect(
            &db,
            &workspace.database_path(db_flag),
            &workspace.lock_path(),
        )?;
        return status::print_status(&report, format);
    }

    let options = RollbackOptions {
        dry_run: !flags.live,
        force: flags.force,
        cleanup: !flags.no_cleanup,
        cleanup_only: flags.cleanup_only,
        preview_limit: workspace.config.preview_limit,
    };

    let _lock = if flags.live {
        Some(RunLock::acquire(&workspace.lock_path())?)
    } else {
        None
    };

    let outcome = RollbackEngine::new(&db).run(options).inspect_err(|err| {
        super::record_refusal(&workspace, "rollback", err, options.dry_run, options.force)
    })?;
    let report_path = ReportBuilder::new(workspace.reports_dir()).rollback_report(&outcome)?;
    info!(report = %report_path.display(), "rollback report written");

    print_outcome(&outcome, &report_path, format)?;

    match &outcome {
        RollbackOutcome::NothingToRollback => Ok(()),
        RollbackOutcome::Completed(result) => match failure_reason(result) {
            Some(reason) => Err(DocRolesError::RunFailed(reason)),
            None => Ok(()),
        },
    }
}

fn failure_reason(result: &RollbackResult) -> Option<String> {
    if result.cancelled {
        return Some("rollback cancelled before every document was restored".into());
    }
    if result.errors > 0 {
        return Some(format!("{} document(s) failed to restore", result.errors));
    }
    if result.dry_run && !result.precondition.ok {
        return Some(format!(
            "rollback precondition failed: {}",
            result.precondition.issues.join("; ")
        ));
    }
    None
}

fn print_outcome(outcome: &RollbackOutcome, report_path: &Path, format: Format) -> Result<()> {
    match format {
        Format::Json => output::print_json(&RollbackOutput {
            outcome,
            report_path: report_path.display().to_string(),
        })?,
        Format::Pretty => match outcome {
            RollbackOutcome::NothingToRollback => {
                println!(
                    "{} {}",
                    "docroles rollback".bold(),
                    "nothing to roll back".green()
                );
            }
            RollbackOutcome::Completed(result) => print_pretty(result, report_path),
        },
        Format::Minimal => match outcome {
            RollbackOutcome::NothingToRollback => println!("outcome=nothing_to_rollback"),
            RollbackOutcome::Completed(result) => println!(
                "outcome=completed dry_run={} backups={} restored={} errors={} orphans={} cleanup={} auto_created_roles={} cancelled={} report={}",
                result.dry_run,
                result.backup_records,
                result.restored,
                result.errors,
                result.skipped_orphans.len(),
                result.cleanup_performed,
                result.auto_created_roles.len(),
                result.cancelled,
                report_path.display()
            ),
        },
    }
    Ok(())
}

fn print_pretty(result: &RollbackResult, report_path: &Path) {
    let mode = if result.dry_run { "dry-run" } else { "live" };
    println!("{} {}", "docroles rollback".bold(), format!("({mode})").dimmed());
    println!("  {} {}", "backup records:".dimmed(), result.backup_records);
    for (status, count) in &result.status_snapshot {
        println!("    {} {}", format!("{status}:").dimmed(), count);
    }

    println!();
    output::print_validation("Rollback precondition", &result.precondition);

    if result.dry_run {
        if !result.preview.is_empty() {
            println!("\n{}", "Preview".bold());
        }
        for entry in &result.preview {
            let current = entry
                .current
                .as_deref()
                .map(output::roles_inline)
                .unwrap_or_else(|| "<missing>".to_string());
            println!(
                "  {} {} -> {} {}",
                entry.document_id.bold(),
                current,
                output::roles_inline(&entry.original),
                format!("({})", entry.migration_status).dimmed()
            );
        }
    } else {
        println!(
            "\n  {} {} ({} errors, {} orphans skipped)",
            "restored:".dimmed(),
            result.restored.to_string().green(),
            result.errors.to_string().red(),
            result.skipped_orphans.len()
        );
        for failure in &result.error_details {
            println!("    - {} {}", failure.document_id.bold(), failure.error.red());
        }
        if let Some(post) = &result.post_validation {
            output::print_validation("Post-rollback check", post);
        }
        if result.cleanup_performed {
            println!("  {} {}", "cleanup:".dimmed(), "backup tables dropped".green());
        } else if let Some(reason) = &result.cleanup_skipped_reason {
            println!("  {} {}", "cleanup skipped:".dimmed(), reason.yellow());
        }
    }

    if !result.auto_created_roles.is_empty() {
        println!("\n{}", "Auto-created roles".yellow().bold());
        for role in &result.auto_created_roles {
            println!(
                "  - {} ({}) {}",
                role.name,
                role.organization_id.dimmed(),
                role.note.yellow()
            );
        }
    }

    output::print_warnings(&result.warnings);
    println!("\n  {} {}", "report:".dimmed(), report_path.display());
}
