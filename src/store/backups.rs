use std::collections::BTreeMap;

use rusqlite::{OptionalExtension, params};
use serde::Serialize;

use crate::error::{DocRolesError, Result};
use crate::model::{BackupRecord, MigrationStatus};
use crate::store::db::{Db, encode_roles, parse_dt, parse_roles};

pub const BACKUP_TABLE: &str = "document_role_backups";
pub const MAPPING_TABLE: &str = "document_role_mappings";

/// One raw role string resolved to a role row during a live migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleMapping {
    pub organization_id: String,
    pub raw_role: String,
    pub role_id: String,
    pub role_name: String,
    pub created: bool,
}

/// Pre-mutation snapshots keyed by document. The presence of the backup
/// table is the run-state flag: present means migrated and not cleaned up.
pub struct BackupStore<'a> {
    db: &'a Db,
}

struct BackupRow {
    document_id: String,
    original: String,
    migrated: String,
    status: String,
    notes: Option<String>,
    created_at: String,
}

impl BackupRow {
    fn into_record(self) -> Result<BackupRecord> {
        let migration_status = self.status.parse::<MigrationStatus>().map_err(|e| {
            DocRolesError::MalformedRoles(self.document_id.clone(), e)
        })?;
        Ok(BackupRecord {
            original_access_roles: parse_roles(&self.document_id, &self.original)?,
            migrated_access_roles: parse_roles(&self.document_id, &self.migrated)?,
            migration_status,
            migration_notes: self.notes,
            created_at: parse_dt(&self.created_at),
            document_id: self.document_id,
        })
    }
}

impl<'a> BackupStore<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    pub fn exists(&self) -> Result<bool> {
        self.db.table_exists(BACKUP_TABLE)
    }

    /// Create the backup and mapping tables if absent.
    pub fn ensure(&self) -> Result<()> {
        self.db.conn().execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {BACKUP_TABLE} (
                document_id TEXT PRIMARY KEY,
                original_access_roles TEXT NOT NULL,
                migrated_access_roles TEXT NOT NULL,
                migration_status TEXT NOT NULL
                    CHECK (migration_status IN ('success', 'partial', 'error')),
                migration_notes TEXT,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {MAPPING_TABLE} (
                organization_id TEXT NOT NULL,
                raw_role TEXT NOT NULL,
                role_id TEXT NOT NULL,
                role_name TEXT NOT NULL,
                created INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (organization_id, raw_role)
            );"
        ))?;
        Ok(())
    }

    /// Insert a record. When the document already has one, its original
    /// roles and timestamp are kept; the outcome columns are refreshed
    /// unless the new record is an error, which changed nothing.
    /// Returns whether a row was written.
    pub fn create(&self, record: &BackupRecord) -> Result<bool> {
        let changes = self.db.conn().execute(
            &format!(
                "INSERT INTO {BACKUP_TABLE}
                    (document_id, original_access_roles, migrated_access_roles,
                     migration_status, migration_notes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(document_id) DO UPDATE SET
                    migrated_access_roles = excluded.migrated_access_roles,
                    migration_status = excluded.migration_status,
                    migration_notes = excluded.migration_notes
                 WHERE excluded.migration_status != 'error'"
            ),
            params![
                record.document_id,
                encode_roles(&record.original_access_roles)?,
                encode_roles(&record.migrated_access_roles)?,
                record.migration_status.as_str(),
                record.migration_notes,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(changes > 0)
    }

    pub fn get(&self, document_id: &str) -> Result<Option<BackupRecord>> {
        let row = self
            .db
            .conn()
            .query_row(
                &format!(
                    "SELECT document_id, original_access_roles, migrated_access_roles,
                            migration_status, migration_notes, created_at
                     FROM {BACKUP_TABLE} WHERE document_id = ?1"
                ),
                params![document_id],
                |row| {
                    Ok(BackupRow {
                        document_id: row.get(0)?,
                        original: row.get(1)?,
                        migrated: row.get(2)?,
                        status: row.get(3)?,
                        notes: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        row.map(BackupRow::into_record).transpose()
    }

    /// Every record, ordered by document id.
    pub fn get_all(&self) -> Result<Vec<BackupRecord>> {
        let mut stmt = self.db.conn().prepare(&format!(
            "SELECT document_id, original_access_roles, migrated_access_roles,
                    migration_status, migration_notes, created_at
             FROM {BACKUP_TABLE} ORDER BY document_id"
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(BackupRow {
                    document_id: row.get(0)?,
                    original: row.get(1)?,
                    migrated: row.get(2)?,
                    status: row.get(3)?,
                    notes: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(BackupRow::into_record).collect()
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 =
            self.db
                .conn()
                .query_row(&format!("SELECT COUNT(*) FROM {BACKUP_TABLE}"), [], |row| {
                    row.get(0)
                })?;
        Ok(count as usize)
    }

    /// Record counts by migration status.
    pub fn status_summary(&self) -> Result<BTreeMap<MigrationStatus, usize>> {
        let mut stmt = self.db.conn().prepare(&format!(
            "SELECT migration_status, COUNT(*) FROM {BACKUP_TABLE} GROUP BY migration_status"
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut summary = BTreeMap::new();
        for (status, count) in rows {
            let status = status
                .parse::<MigrationStatus>()
                .map_err(|e| DocRolesError::MalformedRoles(BACKUP_TABLE.into(), e))?;
            summary.insert(status, count as usize);
        }
        Ok(summary)
    }

    /// Backup document ids with no matching document row.
    pub fn orphaned_document_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self.db.conn().prepare(&format!(
            "SELECT b.document_id FROM {BACKUP_TABLE} b
             WHERE NOT EXISTS (SELECT 1 FROM documents d WHERE d.id = b.document_id)
             ORDER BY b.document_id"
        ))?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn record_mapping(&self, mapping: &RoleMapping) -> Result<()> {
        self.db.conn().execute(
            &format!(
                "INSERT OR IGNORE INTO {MAPPING_TABLE}
                    (organization_id, raw_role, role_id, role_name, created)
                 VALUES (?1, ?2, ?3, ?4, ?5)"
            ),
            params![
                mapping.organization_id,
                mapping.raw_role,
                mapping.role_id,
                mapping.role_name,
                mapping.created,
            ],
        )?;
        Ok(())
    }

    pub fn mappings(&self) -> Result<Vec<RoleMapping>> {
        if !self.db.table_exists(MAPPING_TABLE)? {
            return Ok(Vec::new());
        }
        let mut stmt = self.db.conn().prepare(&format!(
            "SELECT organization_id, raw_role, role_id, role_name, created
             FROM {MAPPING_TABLE} ORDER BY organization_id, raw_role"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(RoleMapping {
                organization_id: row.get(0)?,
                raw_role: row.get(1)?,
                role_id: row.get(2)?,
                role_name: row.get(3)?,
                created: row.get(4)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Irreversibly remove the backup and mapping tables.
    pub fn drop(&self) -> Result<()> {
        self.db.conn().execute_batch(&format!(
            "DROP TABLE IF EXISTS {BACKUP_TABLE};
             DROP TABLE IF EXISTS {MAPPING_TABLE};"
        ))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::db::tests::{doc, seeded};
    use chrono::Utc;

    fn record(id: &str, original: &[&str], status: MigrationStatus) -> BackupRecord {
        BackupRecord {
            document_id: id.into(),
            original_access_roles: original.iter().map(|r| r.to_string()).collect(),
            migrated_access_roles: vec!["Administrator".into()],
            migration_status: status,
            migration_notes: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn exists_tracks_table_lifecycle() {
        let db = seeded();
        let store = BackupStore::new(&db);
        assert!(!store.exists().unwrap());

        store.ensure().unwrap();
        assert!(store.exists().unwrap());

        store.drop().unwrap();
        assert!(!store.exists().unwrap());
        assert!(!db.table_exists(MAPPING_TABLE).unwrap());
    }

    #[test]
    fn create_keeps_first_snapshot() {
        let db = seeded();
        let store = BackupStore::new(&db);
        store.ensure().unwrap();

        assert!(store.create(&record("d1", &["admin"], MigrationStatus::Success)).unwrap());
        store
            .create(&record("d1", &["Administrator"], MigrationStatus::Success))
            .unwrap();

        let kept = store.get("d1").unwrap().unwrap();
        assert_eq!(kept.original_access_roles, vec!["admin"]);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn later_success_replaces_error_outcome() {
        let db = seeded();
        let store = BackupStore::new(&db);
        store.ensure().unwrap();

        let mut failed = record("d1", &["admin"], MigrationStatus::Error);
        failed.migrated_access_roles = vec!["admin".into()];
        failed.migration_notes = Some("organization 'Acme' not found".into());
        store.create(&failed).unwrap();
        let first_created = store.get("d1").unwrap().unwrap().created_at;

        let mut retried = record("d1", &["Administrator"], MigrationStatus::Success);
        retried.created_at = first_created + chrono::Duration::hours(1);
        assert!(store.create(&retried).unwrap());

        let kept = store.get("d1").unwrap().unwrap();
        assert_eq!(kept.original_access_roles, vec!["admin"]);
        assert_eq!(kept.migrated_access_roles, vec!["Administrator"]);
        assert_eq!(kept.migration_status, MigrationStatus::Success);
        assert_eq!(kept.migration_notes, None);
        assert_eq!(kept.created_at, first_created);
    }

    #[test]
    fn later_error_leaves_applied_outcome() {
        let db = seeded();
        let store = BackupStore::new(&db);
        store.ensure().unwrap();

        store.create(&record("d1", &["admin"], MigrationStatus::Success)).unwrap();
        let mut failed = record("d1", &["Administrator"], MigrationStatus::Error);
        failed.migrated_access_roles = vec!["Administrator".into()];
        assert!(!store.create(&failed).unwrap());

        let kept = store.get("d1").unwrap().unwrap();
        assert_eq!(kept.original_access_roles, vec!["admin"]);
        assert_eq!(kept.migrated_access_roles, vec!["Administrator"]);
        assert_eq!(kept.migration_status, MigrationStatus::Success);
    }

    #[test]
    fn status_summary_groups_by_status() {
        let db = seeded();
        let store = BackupStore::new(&db);
        store.ensure().unwrap();
        store.create(&record("d1", &["admin"], MigrationStatus::Success)).unwrap();
        store.create(&record("d2", &["hr"], MigrationStatus::Success)).unwrap();
        store.create(&record("d3", &["x"], MigrationStatus::Partial)).unwrap();

        let summary = store.status_summary().unwrap();
        assert_eq!(summary.get(&MigrationStatus::Success), Some(&2));
        assert_eq!(summary.get(&MigrationStatus::Partial), Some(&1));
        assert_eq!(summary.get(&MigrationStatus::Error), None);
    }

    #[test]
    fn orphaned_records_detected() {
        let db = seeded();
        doc(&db, "d1", "Acme", &["admin"]);
        let store = BackupStore::new(&db);
        store.ensure().unwrap();
        store.create(&record("d1", &["admin"], MigrationStatus::Success)).unwrap();
        store.create(&record("gone", &["hr"], MigrationStatus::Success)).unwrap();

        assert_eq!(store.orphaned_document_ids().unwrap(), vec!["gone"]);
    }

    #[test]
    fn mappings_empty_without_table() {
        let db = seeded();
        assert!(BackupStore::new(&db).mappings().unwrap().is_empty());
    }
}
