use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;

use serde::Serialize;
use tracing::{info, warn};

use crate::engine::Checkpoint;
use crate::error::{DocRolesError, Result};
use crate::model::MigrationStatus;
use crate::resolver::MIGRATION_ROLE_DESCRIPTION;
use crate::store::backups::BackupStore;
use crate::store::db::Db;
use crate::validate::{ValidationReport, Validator};

pub const DEFAULT_PREVIEW_LIMIT: usize = 10;
pub const MANUAL_REVIEW_NOTE: &str = "not removed, manual review recommended";

#[derive(Debug, Clone, Copy)]
pub struct RollbackOptions {
    pub dry_run: bool,
    pub force: bool,
    /// Drop the backup tables after a clean restore pass.
    pub cleanup: bool,
    /// Skip the restore pass and only clean up.
    pub cleanup_only: bool,
    pub preview_limit: usize,
}

impl Default for RollbackOptions {
    fn default() -> Self {
        Self {
            dry_run: true,
            force: false,
            cleanup: true,
            cleanup_only: false,
            preview_limit: DEFAULT_PREVIEW_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewEntry {
    pub document_id: String,
    /// `None` when the document no longer exists or cannot be decoded.
    pub current: Option<Vec<String>>,
    pub original: Vec<String>,
    pub migration_status: MigrationStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreError {
    pub document_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoCreatedRole {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub note: &'static str,
}

#[derive(Debug, Default, Serialize)]
pub struct RollbackResult {
    pub dry_run: bool,
    pub force: bool,
    pub cleanup_requested: bool,
    pub cleanup_only: bool,
    pub backup_records: usize,
    pub status_snapshot: BTreeMap<MigrationStatus, usize>,
    pub precondition: ValidationReport,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub preview: Vec<PreviewEntry>,
    pub restored: usize,
    pub errors: usize,
    pub error_details: Vec<RestoreError>,
    pub skipped_orphans: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_validation: Option<ValidationReport>,
    pub cleanup_performed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_skipped_reason: Option<String>,
    pub auto_created_roles: Vec<AutoCreatedRole>,
    pub warnings: Vec<String>,
    pub cancelled: bool,
}

impl RollbackResult {
    pub fn is_clean(&self) -> bool {
        self.errors == 0 && !self.cancelled
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RollbackOutcome {
    NothingToRollback,
    Completed(RollbackResult),
}

pub struct RollbackEngine<'a> {
    db: &'a Db,
    checkpoint: Checkpoint<'a>,
}

impl<'a> RollbackEngine<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self {
            db,
            checkpoint: Checkpoint::default(),
        }
    }

    pub fn with_cancel(mut self, flag: &'a AtomicBool) -> Self {
        self.checkpoint = Checkpoint::new(flag);
        self
    }

    pub fn run(&self, options: RollbackOptions) -> Result<RollbackOutcome> {
        let backups = BackupStore::new(self.db);
        if !backups.exists()? {
            info!("no backup table present; nothing to roll back");
            return Ok(RollbackOutcome::NothingToRollback);
        }

        let mut result = RollbackResult {
            dry_run: options.dry_run,
            force: options.force,
            cleanup_requested: options.cleanup || options.cleanup_only,
            cleanup_only: options.cleanup_only,
            backup_records: backups.count()?,
            status_snapshot: backups.status_summary()?,
            precondition: Validator::new(self.db).rollback_precondition()?,
            ..RollbackResult::default()
        };

        if !result.precondition.ok {
            if !options.dry_run && !options.force {
                return Err(DocRolesError::ValidationFailed(
                    result.precondition.issues.clone(),
                ));
            }
            result
                .warnings
                .extend(result.precondition.issues.iter().cloned());
        }
        result
            .warnings
            .extend(result.precondition.warnings.iter().cloned());

        result.auto_created_roles = self.auto_created_roles()?;

        if options.dry_run {
            result.preview = self.preview(&backups, options.preview_limit)?;
            return Ok(RollbackOutcome::Completed(result));
        }

        if !options.cleanup_only {
            self.restore(&backups, &mut result)?;
            result.post_validation = Some(Validator::new(self.db).post_rollback()?);
        }

        if options.cleanup || options.cleanup_only {
            self.cleanup(&backups, &mut result, options.force)?;
        }

        info!(
            restored = result.restored,
            errors = result.errors,
            orphans = result.skipped_orphans.len(),
            cleanup = result.cleanup_performed,
            "rollback finished"
        );
        Ok(RollbackOutcome::Completed(result))
    }

    fn preview(&self, backups: &BackupStore<'_>, limit: usize) -> Result<Vec<PreviewEntry>> {
        let mut entries = Vec::new();
        for record in backups.get_all()?.into_iter().take(limit) {
            let current = self
                .db
                .get_document(&record.document_id)
                .ok()
                .flatten()
                .map(|doc| doc.access_roles);
            entries.push(PreviewEntry {
                document_id: record.document_id,
                current,
                original: record.original_access_roles,
                migration_status: record.migration_status,
            });
        }
        Ok(entries)
    }

    /// Write every original value back. Per-record failures are collected
    /// and the pass continues.
    fn restore(&self, backups: &BackupStore<'_>, result: &mut RollbackResult) -> Result<()> {
        for record in backups.get_all()? {
            if self.checkpoint.cancelled() {
                warn!(restored = result.restored, "rollback cancelled at document boundary");
                result.cancelled = true;
                break;
            }

            match self
                .db
                .set_document_roles(&record.document_id, &record.original_access_roles)
            {
                Ok(()) => result.restored += 1,
                Err(DocRolesError::DocumentNotFound(id)) => {
                    warn!(document_id = %id, "backup record has no document; skipped");
                    result.skipped_orphans.push(id);
                }
                Err(err) => {
                    warn!(document_id = %record.document_id, error = %err, "restore failed");
                    result.errors += 1;
                    result.error_details.push(RestoreError {
                        document_id: record.document_id,
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn cleanup(
        &self,
        backups: &BackupStore<'_>,
        result: &mut RollbackResult,
        force: bool,
    ) -> Result<()> {
        if result.cancelled {
            result.cleanup_skipped_reason = Some("rollback was cancelled".into());
            return Ok(());
        }
        if result.errors > 0 && !force {
            result.cleanup_skipped_reason = Some(format!(
                "{} documents failed to restore; backups kept (use --force to drop anyway)",
                result.errors
            ));
            return Ok(());
        }

        backups.drop()?;
        result.cleanup_performed = true;
        if !result.auto_created_roles.is_empty() {
            warn!(
                roles = result.auto_created_roles.len(),
                "auto-created roles left in place for manual review"
            );
        }
        Ok(())
    }

    /// Roles created by the migration. Reported only; this pipeline never
    /// deletes them because they may have been assigned since.
    fn auto_created_roles(&self) -> Result<Vec<AutoCreatedRole>> {
        Ok(self
            .db
            .roles_with_description(MIGRATION_ROLE_DESCRIPTION)?
            .into_iter()
            .map(|role| AutoCreatedRole {
                id: role.id,
                organization_id: role.organization_id,
                name: role.name,
                note: MANUAL_REVIEW_NOTE,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MigrationEngine;
    use crate::model::BackupRecord;
    use crate::store::db::tests::{doc, org, role, seeded};
    use chrono::Utc;

    fn live(cleanup: bool) -> RollbackOptions {
        RollbackOptions {
            dry_run: false,
            cleanup,
            ..RollbackOptions::default()
        }
    }

    fn completed(outcome: RollbackOutcome) -> RollbackResult {
        match outcome {
            RollbackOutcome::Completed(result) => result,
            RollbackOutcome::NothingToRollback => panic!("expected a completed rollback"),
        }
    }

    fn migrated_acme() -> Db {
        let db = seeded();
        org(&db, "Acme");
        role(&db, "Acme", "Administrator");
        doc(&db, "d1", "Acme", &["admin", "hr"]);
        doc(&db, "d2", "Acme", &["hr", "hr", "Pilot", "zzz\u{1}bad"]);
        doc(&db, "d3", "Acme", &[]);
        MigrationEngine::new(&db).run(false, false).unwrap();
        db
    }

    #[test]
    fn round_trip_restores_exact_values() {
        let db = migrated_acme();
        assert_eq!(
            db.get_document("d2").unwrap().unwrap().access_roles,
            vec!["HR", "Pilot"]
        );

        let result = completed(RollbackEngine::new(&db).run(live(true)).unwrap());

        assert_eq!(result.restored, 3);
        assert!(result.is_clean());
        assert_eq!(
            db.get_document("d1").unwrap().unwrap().access_roles,
            vec!["admin", "hr"]
        );
        assert_eq!(
            db.get_document("d2").unwrap().unwrap().access_roles,
            vec!["hr", "hr", "Pilot", "zzz\u{1}bad"]
        );
        assert!(db.get_document("d3").unwrap().unwrap().access_roles.is_empty());
        assert_eq!(
            result.status_snapshot.get(&MigrationStatus::Partial),
            Some(&1)
        );
    }

    #[test]
    fn cleanup_reports_but_keeps_auto_created_roles() {
        let db = migrated_acme();

        let result = completed(RollbackEngine::new(&db).run(live(true)).unwrap());

        assert!(result.cleanup_performed);
        assert!(!BackupStore::new(&db).exists().unwrap());
        let names: Vec<&str> = result
            .auto_created_roles
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, vec!["HR", "Pilot"]);
        assert!(result.auto_created_roles.iter().all(|r| r.note == MANUAL_REVIEW_NOTE));
        assert!(db.find_active_role("Acme", "HR").unwrap().is_some());
    }

    #[test]
    fn second_rollback_finds_nothing() {
        let db = migrated_acme();
        completed(RollbackEngine::new(&db).run(live(true)).unwrap());
        let after_first = db.raw_document_roles().unwrap();

        let second = RollbackEngine::new(&db).run(live(true)).unwrap();
        assert!(matches!(second, RollbackOutcome::NothingToRollback));
        assert_eq!(db.raw_document_roles().unwrap(), after_first);
    }

    #[test]
    fn no_cleanup_keeps_backups() {
        let db = migrated_acme();
        let result = completed(RollbackEngine::new(&db).run(live(false)).unwrap());

        assert!(!result.cleanup_performed);
        assert!(BackupStore::new(&db).exists().unwrap());
    }

    #[test]
    fn dry_run_previews_without_mutation() {
        let db = migrated_acme();
        let before = db.raw_document_roles().unwrap();

        let result = completed(
            RollbackEngine::new(&db)
                .run(RollbackOptions {
                    preview_limit: 2,
                    ..RollbackOptions::default()
                })
                .unwrap(),
        );

        assert_eq!(db.raw_document_roles().unwrap(), before);
        assert!(BackupStore::new(&db).exists().unwrap());
        assert_eq!(result.preview.len(), 2);
        assert_eq!(
            result.preview[0].current.as_deref(),
            Some(&["Administrator".to_string(), "HR".to_string()][..])
        );
        assert_eq!(result.preview[0].original, vec!["admin", "hr"]);
        assert_eq!(result.restored, 0);
    }

    #[test]
    fn excess_backups_abort_unless_forced() {
        let db = migrated_acme();
        let backups = BackupStore::new(&db);
        for id in ["x1", "x2", "x3", "x4"] {
            backups
                .create(&BackupRecord {
                    document_id: id.into(),
                    original_access_roles: vec!["ghost".into()],
                    migrated_access_roles: vec![],
                    migration_status: MigrationStatus::Success,
                    migration_notes: None,
                    created_at: Utc::now(),
                })
                .unwrap();
        }
        let before = db.raw_document_roles().unwrap();

        let err = RollbackEngine::new(&db).run(live(true)).unwrap_err();
        assert!(matches!(err, DocRolesError::ValidationFailed(_)));
        assert_eq!(db.raw_document_roles().unwrap(), before);

        let forced = completed(
            RollbackEngine::new(&db)
                .run(RollbackOptions {
                    force: true,
                    ..live(true)
                })
                .unwrap(),
        );
        assert_eq!(forced.restored, 3);
        assert_eq!(forced.skipped_orphans.len(), 4);
        assert!(!forced.warnings.is_empty());
        assert!(forced.cleanup_performed);
    }

    #[test]
    fn cleanup_only_drops_without_restoring() {
        let db = migrated_acme();
        let before = db.raw_document_roles().unwrap();

        let result = completed(
            RollbackEngine::new(&db)
                .run(RollbackOptions {
                    cleanup_only: true,
                    cleanup: false,
                    ..live(false)
                })
                .unwrap(),
        );

        assert_eq!(result.restored, 0);
        assert!(result.cleanup_performed);
        assert!(result.post_validation.is_none());
        assert_eq!(db.raw_document_roles().unwrap(), before);
        assert!(!BackupStore::new(&db).exists().unwrap());
    }

    #[test]
    fn cancelled_rollback_keeps_backups() {
        let db = migrated_acme();
        let flag = AtomicBool::new(true);

        let result = completed(
            RollbackEngine::new(&db)
                .with_cancel(&flag)
                .run(live(true))
                .unwrap(),
        );

        assert!(result.cancelled);
        assert_eq!(result.restored, 0);
        assert!(!result.cleanup_performed);
        assert!(BackupStore::new(&db).exists().unwrap());
    }
}
