use tracing::debug;
use uuid::Uuid;

use crate::aliases;
use crate::error::{DocRolesError, Result};
use crate::model::OrganizationRole;
use crate::store::db::Db;

/// Marker description for roles created by the migration, used to find
/// them again at rollback cleanup.
pub const MIGRATION_ROLE_DESCRIPTION: &str = "Auto-created during access-role migration";

pub const MAX_ROLE_NAME_LEN: usize = 100;

/// What a dry run would do for one raw role string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRole {
    pub name: String,
    pub would_create: bool,
}

/// Resolves raw role strings to organization roles, creating missing ones.
///
/// Callers performing a live migration run `resolve` inside the per-document
/// write transaction; the single writer connection plus the unique
/// `(organization_id, name_key)` index keep role creation serialized per
/// organization.
pub struct RoleResolver<'a> {
    db: &'a Db,
}

impl<'a> RoleResolver<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    pub fn normalize(raw: &str) -> String {
        aliases::normalize(raw)
    }

    /// Return the active role matching `normalize(raw)` in `organization_id`,
    /// creating it when absent. The flag is true when a role was created.
    pub fn resolve(&self, organization_id: &str, raw: &str) -> Result<(OrganizationRole, bool)> {
        let name = Self::checked_name(raw)?;

        if let Some(role) = self.db.find_active_role(organization_id, &name)? {
            return Ok((role, false));
        }

        let role = OrganizationRole {
            id: Uuid::new_v4().to_string(),
            organization_id: organization_id.to_string(),
            name: name.clone(),
            is_system_role: false,
            is_active: true,
            description: Some(MIGRATION_ROLE_DESCRIPTION.to_string()),
            permissions: Vec::new(),
        };

        if self.db.insert_role(&role)? {
            debug!(organization_id, role = %role.name, "created role");
            return Ok((role, true));
        }

        // Lost an insert race, or an inactive role holds the name.
        match self.db.find_active_role(organization_id, &name)? {
            Some(existing) => Ok((existing, false)),
            None => Err(DocRolesError::RoleResolution {
                raw: raw.to_string(),
                reason: format!("an inactive role named '{name}' already exists"),
            }),
        }
    }

    /// Read-only counterpart of `resolve` for dry runs.
    pub fn plan(&self, organization_id: &str, raw: &str) -> Result<PlannedRole> {
        let name = Self::checked_name(raw)?;
        match self.db.find_active_role(organization_id, &name)? {
            Some(role) => Ok(PlannedRole {
                name: role.name,
                would_create: false,
            }),
            None => Ok(PlannedRole {
                name,
                would_create: true,
            }),
        }
    }

    fn checked_name(raw: &str) -> Result<String> {
        let reject = |reason: &str| DocRolesError::RoleResolution {
            raw: raw.to_string(),
            reason: reason.to_string(),
        };

        let name = Self::normalize(raw);
        if name.is_empty() {
            return Err(reject("role name is empty"));
        }
        if name.chars().count() > MAX_ROLE_NAME_LEN {
            return Err(reject("role name exceeds 100 characters"));
        }
        if name.chars().any(char::is_control) {
            return Err(reject("role name contains control characters"));
        }
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::db::tests::{org, role, seeded};

    #[test]
    fn resolve_reuses_existing_role() {
        let db = seeded();
        org(&db, "Acme");
        role(&db, "Acme", "Administrator");

        let (found, created) = RoleResolver::new(&db).resolve("Acme", "ADMIN").unwrap();
        assert_eq!(found.name, "Administrator");
        assert!(!created);
    }

    #[test]
    fn resolve_creates_marked_role_once() {
        let db = seeded();
        org(&db, "Acme");
        let resolver = RoleResolver::new(&db);

        let (first, created) = resolver.resolve("Acme", "hr").unwrap();
        assert!(created);
        assert_eq!(first.name, "HR");
        assert_eq!(first.description.as_deref(), Some(MIGRATION_ROLE_DESCRIPTION));
        assert!(!first.is_system_role);
        assert!(first.permissions.is_empty());

        let (second, created_again) = resolver.resolve("Acme", "Hr").unwrap();
        assert!(!created_again);
        assert_eq!(second.id, first.id);
        assert_eq!(db.list_roles("Acme").unwrap().len(), 1);
    }

    #[test]
    fn non_ascii_case_variants_resolve_to_one_role() {
        let db = seeded();
        org(&db, "Acme");
        let resolver = RoleResolver::new(&db);

        let (first, created) = resolver.resolve("Acme", "Équipe").unwrap();
        assert!(created);
        let (second, created_again) = resolver.resolve("Acme", "équipe").unwrap();
        assert!(!created_again);
        assert_eq!(second.id, first.id);
        assert_eq!(second.name, "Équipe");
        assert_eq!(db.list_roles("Acme").unwrap().len(), 1);
    }

    #[test]
    fn unmapped_role_created_verbatim() {
        let db = seeded();
        org(&db, "Acme");
        let (created_role, created) = RoleResolver::new(&db).resolve("Acme", "Pilot").unwrap();
        assert!(created);
        assert_eq!(created_role.name, "Pilot");
    }

    #[test]
    fn invalid_names_rejected() {
        let db = seeded();
        org(&db, "Acme");
        let resolver = RoleResolver::new(&db);

        for raw in ["", "   ", "bad\u{0}name"] {
            let err = resolver.resolve("Acme", raw).unwrap_err();
            assert!(matches!(err, DocRolesError::RoleResolution { .. }), "{raw:?}");
        }
        let long = "x".repeat(MAX_ROLE_NAME_LEN + 1);
        assert!(resolver.resolve("Acme", &long).is_err());
        assert!(db.list_roles("Acme").unwrap().is_empty());
    }

    #[test]
    fn inactive_role_blocks_creation() {
        let db = seeded();
        org(&db, "Acme");
        db.insert_role(&OrganizationRole {
            id: "old".into(),
            organization_id: "Acme".into(),
            name: "Lead".into(),
            is_system_role: false,
            is_active: false,
            description: None,
            permissions: vec![],
        })
        .unwrap();

        let err = RoleResolver::new(&db).resolve("Acme", "lead").unwrap_err();
        assert!(err.to_string().contains("inactive role"));
    }

    #[test]
    fn plan_never_writes() {
        let db = seeded();
        org(&db, "Acme");
        role(&db, "Acme", "Owner");
        let resolver = RoleResolver::new(&db);

        assert_eq!(
            resolver.plan("Acme", "owner").unwrap(),
            PlannedRole {
                name: "Owner".into(),
                would_create: false
            }
        );
        assert!(resolver.plan("Acme", "manager").unwrap().would_create);
        assert_eq!(db.list_roles("Acme").unwrap().len(), 1);
    }
}
