use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::AtomicBool;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::Checkpoint;
use crate::error::{DocRolesError, Result};
use crate::model::{BackupRecord, CreatedRole, MigrationStatus};
use crate::resolver::RoleResolver;
use crate::store::backups::{BackupStore, RoleMapping};
use crate::store::db::{Db, StoredDocument};
use crate::validate::{ValidationReport, Validator};

/// Per-document result of a migration or dry run.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentOutcome {
    pub document_id: String,
    pub organization_id: String,
    pub original: Vec<String>,
    pub migrated: Vec<String>,
    pub status: MigrationStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    /// True when the document row was rewritten.
    pub applied: bool,
    #[serde(skip)]
    roles_created: Vec<CreatedRole>,
}

impl DocumentOutcome {
    fn new(id: &str, organization_id: &str, original: Vec<String>) -> Self {
        Self {
            document_id: id.to_string(),
            organization_id: organization_id.to_string(),
            migrated: original.clone(),
            original,
            status: MigrationStatus::Success,
            notes: Vec::new(),
            applied: false,
            roles_created: Vec::new(),
        }
    }

    /// Mark the whole document as failed; nothing is applied.
    fn fail(&mut self, note: String) {
        self.status = MigrationStatus::Error;
        self.migrated = self.original.clone();
        self.applied = false;
        self.roles_created.clear();
        self.notes.push(note);
    }

    fn notes_text(&self) -> Option<String> {
        if self.notes.is_empty() {
            None
        } else {
            Some(self.notes.join("; "))
        }
    }

    fn backup_record(&self) -> BackupRecord {
        BackupRecord {
            document_id: self.document_id.clone(),
            original_access_roles: self.original.clone(),
            migrated_access_roles: self.migrated.clone(),
            migration_status: self.status,
            migration_notes: self.notes_text(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct MigrationResult {
    pub dry_run: bool,
    pub force: bool,
    pub documents_processed: usize,
    pub successful: usize,
    pub partial: usize,
    pub failed: usize,
    pub roles_created: Vec<CreatedRole>,
    pub organizations_affected: Vec<String>,
    pub outcomes: Vec<DocumentOutcome>,
    pub pre_validation: ValidationReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_validation: Option<ValidationReport>,
    pub warnings: Vec<String>,
    pub cancelled: bool,
}

impl MigrationResult {
    /// True when every document migrated cleanly and validation passed.
    pub fn is_clean(&self) -> bool {
        self.failed == 0
            && self.partial == 0
            && !self.cancelled
            && self.post_validation.as_ref().is_none_or(|v| v.ok)
    }

    fn tally(&mut self, outcome: DocumentOutcome) {
        self.documents_processed += 1;
        match outcome.status {
            MigrationStatus::Success => self.successful += 1,
            MigrationStatus::Partial => self.partial += 1,
            MigrationStatus::Error => self.failed += 1,
        }
        self.outcomes.push(outcome);
    }
}

/// Canonical names collected for one document.
#[derive(Default)]
struct Resolution {
    names: Vec<String>,
    resolved: usize,
    failures: Vec<String>,
}

impl Resolution {
    fn push(&mut self, name: String) {
        self.resolved += 1;
        if !self.names.contains(&name) {
            self.names.push(name);
        }
    }

    fn status(&self) -> MigrationStatus {
        match (self.resolved, self.failures.len()) {
            (_, 0) => MigrationStatus::Success,
            (0, _) => MigrationStatus::Error,
            _ => MigrationStatus::Partial,
        }
    }

    fn apply_to(self, outcome: &mut DocumentOutcome) {
        outcome.status = self.status();
        outcome.notes.extend(self.failures);
        if outcome.status == MigrationStatus::Error {
            outcome.migrated = outcome.original.clone();
            outcome.roles_created.clear();
        } else {
            outcome.migrated = self.names;
        }
    }
}

/// Resolve every raw role; one failing role never stops the others.
fn resolve_all<F>(roles: &[String], mut resolve_one: F) -> Resolution
where
    F: FnMut(&str) -> Result<String>,
{
    let mut resolution = Resolution::default();
    for raw in roles {
        match resolve_one(raw) {
            Ok(name) => resolution.push(name),
            Err(err) => resolution.failures.push(err.to_string()),
        }
    }
    resolution
}

pub struct MigrationEngine<'a> {
    db: &'a Db,
    checkpoint: Checkpoint<'a>,
}

impl<'a> MigrationEngine<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self {
            db,
            checkpoint: Checkpoint::default(),
        }
    }

    /// Stop at the next document boundary once `flag` is set.
    pub fn with_cancel(mut self, flag: &'a AtomicBool) -> Self {
        self.checkpoint = Checkpoint::new(flag);
        self
    }

    pub fn run(&self, dry_run: bool, force: bool) -> Result<MigrationResult> {
        let validator = Validator::new(self.db);
        let backups = BackupStore::new(self.db);

        let pre = validator.pre_migration()?;
        if !pre.missing_tables.is_empty() {
            return Err(DocRolesError::MissingTables(pre.missing_tables));
        }

        let mut result = MigrationResult {
            dry_run,
            force,
            ..MigrationResult::default()
        };

        if backups.exists()? {
            if !dry_run && !force {
                return Err(DocRolesError::AlreadyMigrated);
            }
            result.warnings.push(if dry_run {
                "backup table already exists; a live run would be refused without --force".into()
            } else {
                "re-running over existing backups; first snapshots are kept".into()
            });
        }

        if !pre.ok {
            if !dry_run && !force {
                return Err(DocRolesError::ValidationFailed(pre.issues));
            }
            for issue in &pre.issues {
                warn!(issue = %issue, "pre-migration validation issue");
            }
        }
        result.pre_validation = pre;

        if !dry_run {
            backups.ensure()?;
        }

        let documents = self.db.list_stored_documents()?;
        info!(documents = documents.len(), dry_run, force, "starting migration");

        let mut planned: BTreeMap<(String, String), CreatedRole> = BTreeMap::new();
        let mut created: BTreeSet<CreatedRole> = BTreeSet::new();
        let mut organizations: BTreeSet<String> = BTreeSet::new();

        for stored in &documents {
            if self.checkpoint.cancelled() {
                warn!(
                    processed = result.documents_processed,
                    "migration cancelled at document boundary"
                );
                result.cancelled = true;
                break;
            }

            let outcome = if dry_run {
                self.plan_document(stored, &mut planned)
            } else {
                self.migrate_document(stored, &backups)
            };

            debug!(
                document_id = %outcome.document_id,
                status = %outcome.status,
                applied = outcome.applied,
                "document processed"
            );
            if outcome.status != MigrationStatus::Error {
                organizations.insert(outcome.organization_id.clone());
            }
            created.extend(outcome.roles_created.iter().cloned());
            result.tally(outcome);
        }

        result.roles_created = if dry_run {
            planned.into_values().collect()
        } else {
            created.into_iter().collect()
        };
        result.organizations_affected = organizations.into_iter().collect();

        if !dry_run {
            result.post_validation = Some(validator.post_migration()?);
        }

        info!(
            processed = result.documents_processed,
            successful = result.successful,
            partial = result.partial,
            failed = result.failed,
            roles_created = result.roles_created.len(),
            "migration finished"
        );
        Ok(result)
    }

    /// Simulate one document without writing anything.
    fn plan_document(
        &self,
        stored: &StoredDocument,
        planned: &mut BTreeMap<(String, String), CreatedRole>,
    ) -> DocumentOutcome {
        let doc = match stored.clone().into_document() {
            Ok(doc) => doc,
            Err(err) => {
                let mut outcome = DocumentOutcome::new(&stored.id, &stored.organization_id, vec![]);
                outcome.fail(err.to_string());
                return outcome;
            }
        };
        let mut outcome =
            DocumentOutcome::new(&doc.id, &doc.organization_id, doc.access_roles.clone());

        match self.db.organization_exists(&doc.organization_id) {
            Ok(true) => {}
            Ok(false) => {
                outcome.fail(
                    DocRolesError::OrganizationNotFound(doc.organization_id.clone()).to_string(),
                );
                return outcome;
            }
            Err(err) => {
                outcome.fail(err.to_string());
                return outcome;
            }
        }

        let resolver = RoleResolver::new(self.db);
        let org = doc.organization_id.as_str();
        let resolution = resolve_all(&doc.access_roles, |raw| {
            let plan = resolver.plan(org, raw)?;
            if !plan.would_create {
                return Ok(plan.name);
            }
            let key = (org.to_string(), plan.name.to_lowercase());
            let role = planned.entry(key).or_insert_with(|| CreatedRole {
                organization_id: org.to_string(),
                name: plan.name.clone(),
            });
            Ok(role.name.clone())
        });
        resolution.apply_to(&mut outcome);
        outcome
    }

    /// Migrate one document. Failures are recorded on the outcome, never
    /// returned, so the batch always continues.
    fn migrate_document(
        &self,
        stored: &StoredDocument,
        backups: &BackupStore<'_>,
    ) -> DocumentOutcome {
        let doc = match stored.clone().into_document() {
            Ok(doc) => doc,
            Err(err) => {
                warn!(document_id = %stored.id, error = %err, "unreadable access roles; skipped");
                let mut outcome = DocumentOutcome::new(&stored.id, &stored.organization_id, vec![]);
                outcome.fail(err.to_string());
                return outcome;
            }
        };

        let mut outcome =
            DocumentOutcome::new(&doc.id, &doc.organization_id, doc.access_roles.clone());

        if let Err(err) = self.migrate_in_transaction(&mut outcome, backups) {
            warn!(
                document_id = %outcome.document_id,
                error = %err,
                "document migration failed; transaction rolled back"
            );
            outcome.fail(format!("persistence error: {err}"));
        }

        if !outcome.applied {
            // Keep exactly one restorable record per document even when
            // nothing was changed.
            if let Err(err) = backups.create(&outcome.backup_record()) {
                warn!(document_id = %outcome.document_id, error = %err, "backup write failed");
                outcome.notes.push(format!("backup write failed: {err}"));
            }
        }

        outcome
    }

    /// Resolve, back up, then mutate inside one transaction. Returning early
    /// without commit rolls back everything written for this document.
    fn migrate_in_transaction(
        &self,
        outcome: &mut DocumentOutcome,
        backups: &BackupStore<'_>,
    ) -> Result<()> {
        let tx = self.db.conn().unchecked_transaction()?;
        let org = outcome.organization_id.clone();

        if !self.db.organization_exists(&org)? {
            outcome.fail(DocRolesError::OrganizationNotFound(org).to_string());
            return Ok(());
        }

        let resolver = RoleResolver::new(self.db);
        let mut mappings = Vec::new();
        let mut roles_created = Vec::new();
        let resolution = resolve_all(&outcome.original, |raw| {
            let (role, created) = resolver.resolve(&org, raw)?;
            if created {
                roles_created.push(CreatedRole {
                    organization_id: org.clone(),
                    name: role.name.clone(),
                });
            }
            mappings.push(RoleMapping {
                organization_id: org.clone(),
                raw_role: raw.to_string(),
                role_id: role.id,
                role_name: role.name.clone(),
                created,
            });
            Ok(role.name)
        });
        outcome.roles_created = roles_created;
        resolution.apply_to(outcome);

        if outcome.status == MigrationStatus::Error {
            return Ok(());
        }

        backups.create(&outcome.backup_record())?;
        for mapping in &mappings {
            backups.record_mapping(mapping)?;
        }
        self.db
            .set_document_roles(&outcome.document_id, &outcome.migrated)?;

        tx.commit()?;
        outcome.applied = true;
        Ok(())
    }
}
