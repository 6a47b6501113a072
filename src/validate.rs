use serde::Serialize;

use crate::aliases;
use crate::error::{DocRolesError, Result};
use crate::store::backups::{BACKUP_TABLE, BackupStore};
use crate::store::db::Db;

/// Outcome of one validation pass. Issues make the pass fail; warnings are
/// informational.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_tables: Vec<String>,
}

impl ValidationReport {
    fn finish(mut self) -> Self {
        self.ok = self.issues.is_empty();
        self
    }
}

pub struct Validator<'a> {
    db: &'a Db,
}

impl<'a> Validator<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    pub fn pre_migration(&self) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();

        let missing = self.db.missing_app_tables()?;
        if !missing.is_empty() {
            report
                .issues
                .push(format!("required tables missing: {}", missing.join(", ")));
            report.missing_tables = missing;
            return Ok(report.finish());
        }

        if self.db.document_count()? == 0 {
            report.issues.push("no documents found".into());
        }

        let bare = self.db.organizations_without_roles()?;
        if !bare.is_empty() {
            report.issues.push(format!(
                "organizations without any roles: {}",
                bare.join(", ")
            ));
        }

        let unknown_orgs = self.documents_with_unknown_organization()?;
        if !unknown_orgs.is_empty() {
            report.warnings.push(format!(
                "documents referencing missing organizations will fail: {}",
                unknown_orgs.join(", ")
            ));
        }

        Ok(report.finish())
    }

    pub fn post_migration(&self) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();
        let backups = BackupStore::new(self.db);

        if !backups.exists()? {
            report.issues.push(format!("backup table {BACKUP_TABLE} missing"));
            return Ok(report.finish());
        }

        let without_backup = self.documents_without_backup()?;
        if !without_backup.is_empty() {
            report.issues.push(format!(
                "documents without a backup record: {}",
                without_backup.join(", ")
            ));
        }

        let mut lost = Vec::new();
        let mut originally_empty = Vec::new();
        for record in backups.get_all()? {
            let doc = match self.db.get_document(&record.document_id) {
                Ok(Some(doc)) => doc,
                Ok(None) => continue,
                Err(DocRolesError::MalformedRoles(id, reason)) => {
                    report
                        .issues
                        .push(format!("document {id} has unreadable roles: {reason}"));
                    continue;
                }
                Err(other) => return Err(other),
            };
            if !doc.access_roles.is_empty() {
                continue;
            }
            if record.original_access_roles.is_empty() {
                originally_empty.push(record.document_id);
            } else {
                lost.push(record.document_id);
            }
        }

        if !lost.is_empty() {
            report.issues.push(format!(
                "documents ended migration with no roles: {}",
                lost.join(", ")
            ));
        }
        if !originally_empty.is_empty() {
            report.warnings.push(format!(
                "documents had no roles before migration: {}",
                originally_empty.join(", ")
            ));
        }

        Ok(report.finish())
    }

    pub fn rollback_precondition(&self) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();
        let backups = BackupStore::new(self.db);

        if !backups.exists()? {
            report.issues.push("no backup table; nothing to roll back".into());
            return Ok(report.finish());
        }

        let backup_count = backups.count()?;
        let document_count = self.db.document_count()?;
        if backup_count > document_count {
            report.issues.push(format!(
                "backup record count ({backup_count}) exceeds document count ({document_count})"
            ));
        }

        let orphans = backups.orphaned_document_ids()?;
        if !orphans.is_empty() {
            report.warnings.push(format!(
                "backup records for documents that no longer exist: {}",
                orphans.join(", ")
            ));
        }

        Ok(report.finish())
    }

    /// Approximate scan for documents that still look migrated. A document
    /// whose original text contained a canonical role name is reported too,
    /// so findings are warnings and never fail the pass.
    pub fn post_rollback(&self) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();
        let canonical = aliases::canonical_names();

        for (id, raw) in self.db.raw_document_roles()? {
            let hits: Vec<&str> = canonical
                .iter()
                .copied()
                .filter(|name| raw.contains(name))
                .collect();
            if !hits.is_empty() {
                report.warnings.push(format!(
                    "document {id} still contains canonical role names ({}); verify manually",
                    hits.join(", ")
                ));
            }
        }

        Ok(report.finish())
    }

    fn documents_without_backup(&self) -> Result<Vec<String>> {
        let mut stmt = self.db.conn().prepare(&format!(
            "SELECT d.id FROM documents d
             WHERE NOT EXISTS (SELECT 1 FROM {BACKUP_TABLE} b WHERE b.document_id = d.id)
             ORDER BY d.id"
        ))?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    fn documents_with_unknown_organization(&self) -> Result<Vec<String>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT d.id FROM documents d
             WHERE NOT EXISTS (SELECT 1 FROM organizations o WHERE o.id = d.organization_id)
             ORDER BY d.id",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}
