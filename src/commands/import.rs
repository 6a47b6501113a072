use std::fs;
use std::io::Read;
use std::path::Path;

use colored::Colorize;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{DocRolesError, Result};
use crate::model::{Document, Organization, OrganizationRole};
use crate::output::{self, Format};
use crate::store::backups::BackupStore;
use crate::store::db::Db;

/// Seed file loaded by `docroles import`. YAML is a superset of JSON, so
/// both formats parse through the same path.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Fixture {
    #[serde(default)]
    organizations: Vec<OrganizationSpec>,
    #[serde(default)]
    roles: Vec<RoleSpec>,
    #[serde(default)]
    documents: Vec<DocumentSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OrganizationSpec {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RoleSpec {
    organization: String,
    name: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    is_system_role: bool,
    #[serde(default = "active_by_default")]
    is_active: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    permissions: Vec<String>,
}

fn active_by_default() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DocumentSpec {
    id: String,
    organization: String,
    #[serde(default)]
    access_roles: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
struct ImportSummary {
    source: String,
    organizations: usize,
    roles: usize,
    roles_skipped: usize,
    documents: usize,
}

pub fn run(
    root: &Path,
    db_flag: Option<&Path>,
    source: &str,
    force: bool,
    format: Format,
) -> Result<()> {
    let (_workspace, db) = super::open(root, db_flag)?;
    let fixture = parse_fixture(source, &read_source(source)?)?;

    db.ensure_app_schema()?;
    if BackupStore::new(&db).exists()? {
        if !force {
            return Err(DocRolesError::AlreadyMigrated);
        }
        warn!("importing while a migration backup exists; new documents will have no backup");
    }

    let mut summary = apply(&db, fixture)?;
    summary.source = source.to_string();
    info!(
        organizations = summary.organizations,
        roles = summary.roles,
        documents = summary.documents,
        "fixture imported"
    );

    match format {
        Format::Json => output::print_json(&summary)?,
        Format::Pretty => {
            println!("{} {}", "Imported".green().bold(), source);
            println!("  {} {}", "organizations:".dimmed(), summary.organizations);
            println!(
                "  {} {} ({} already present)",
                "roles:".dimmed(),
                summary.roles,
                summary.roles_skipped
            );
            println!("  {} {}", "documents:".dimmed(), summary.documents);
        }
        Format::Minimal => println!(
            "organizations={} roles={} roles_skipped={} documents={}",
            summary.organizations, summary.roles, summary.roles_skipped, summary.documents
        ),
    }
    Ok(())
}

fn read_source(source: &str) -> Result<String> {
    if source == "-" {
        let mut contents = String::new();
        std::io::stdin().read_to_string(&mut contents)?;
        return Ok(contents);
    }
    Ok(fs::read_to_string(source)?)
}

fn parse_fixture(source: &str, raw: &str) -> Result<Fixture> {
    if raw.trim().is_empty() {
        return Err(DocRolesError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("source '{source}' is empty"),
        )));
    }
    Ok(serde_yaml::from_str(raw)?)
}

/// Write every fixture row in one transaction.
fn apply(db: &Db, fixture: Fixture) -> Result<ImportSummary> {
    let tx = db.conn().unchecked_transaction()?;
    let mut summary = ImportSummary::default();

    for spec in fixture.organizations {
        let name = spec.name.unwrap_or_else(|| spec.id.clone());
        db.insert_organization(&Organization { id: spec.id, name })?;
        summary.organizations += 1;
    }

    for spec in fixture.roles {
        let role = OrganizationRole {
            id: spec.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            organization_id: spec.organization,
            name: spec.name,
            is_system_role: spec.is_system_role,
            is_active: spec.is_active,
            description: spec.description,
            permissions: spec.permissions,
        };
        if db.insert_role(&role)? {
            summary.roles += 1;
        } else {
            summary.roles_skipped += 1;
        }
    }

    for spec in fixture.documents {
        db.insert_document(&Document {
            id: spec.id,
            organization_id: spec.organization,
            access_roles: spec.access_roles,
            updated_at: None,
        })?;
        summary.documents += 1;
    }

    tx.commit()?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::db::tests::seeded;

    const FIXTURE: &str = r#"
organizations:
  - id: Acme
roles:
  - organization: Acme
    name: Administrator
    is_system_role: true
  - organization: Acme
    name: administrator
documents:
  - id: d1
    organization: Acme
    access_roles: [admin, hr]
  - id: d2
    organization: Ghost
"#;

    #[test]
    fn apply_loads_rows_and_skips_duplicate_roles() {
        let db = seeded();
        let fixture = parse_fixture("fixture.yaml", FIXTURE).unwrap();
        let summary = apply(&db, fixture).unwrap();

        assert_eq!(summary.organizations, 1);
        assert_eq!(summary.roles, 1);
        assert_eq!(summary.roles_skipped, 1);
        assert_eq!(summary.documents, 2);

        let d1 = db.get_document("d1").unwrap().unwrap();
        assert_eq!(d1.access_roles, vec!["admin", "hr"]);
        assert!(db.get_document("d2").unwrap().unwrap().access_roles.is_empty());
        assert_eq!(db.list_organizations().unwrap()[0].name, "Acme");
    }

    #[test]
    fn json_fixtures_parse_too() {
        let raw = r#"{"documents": [{"id": "d1", "organization": "Acme", "access_roles": ["owner"]}]}"#;
        let fixture = parse_fixture("fixture.json", raw).unwrap();
        assert_eq!(fixture.documents.len(), 1);
        assert!(fixture.organizations.is_empty());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = parse_fixture("bad.yaml", "documents:\n  - id: d1\n    org: Acme\n").unwrap_err();
        assert!(matches!(err, DocRolesError::Yaml(_)));
    }

    #[test]
    fn empty_source_is_rejected() {
        assert!(parse_fixture("empty.yaml", "  \n").is_err());
    }
}
