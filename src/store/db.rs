use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{DocRolesError, Result};
use crate::model::{Document, Organization, OrganizationRole};

/// Application tables the pipeline reads and writes.
pub const APP_TABLES: &[&str] = &["organizations", "organization_roles", "documents"];

// ---------------------------------------------------------------------------
// Helpers: timestamps and JSON role lists stored in TEXT columns
// ---------------------------------------------------------------------------

pub(crate) fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_dt_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|v| parse_dt(&v))
}

pub(crate) fn parse_roles(owner: &str, raw: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw)
        .map_err(|e| DocRolesError::MalformedRoles(owner.to_string(), e.to_string()))
}

pub(crate) fn encode_roles(roles: &[String]) -> Result<String> {
    Ok(serde_json::to_string(roles)?)
}

/// A document row with its role list still in stored (JSON text) form.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub id: String,
    pub organization_id: String,
    pub access_roles: String,
    pub updated_at: Option<String>,
}

impl StoredDocument {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            access_roles: row.get(2)?,
            updated_at: row.get(3)?,
        })
    }

    pub fn into_document(self) -> Result<Document> {
        let access_roles = parse_roles(&self.id, &self.access_roles)?;
        Ok(Document {
            id: self.id,
            organization_id: self.organization_id,
            access_roles,
            updated_at: parse_dt_opt(self.updated_at),
        })
    }
}

fn role_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(OrganizationRole, String)> {
    Ok((
        OrganizationRole {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            name: row.get(2)?,
            is_system_role: row.get(3)?,
            is_active: row.get(4)?,
            description: row.get(5)?,
            permissions: Vec::new(),
        },
        row.get(6)?,
    ))
}

fn finish_role((mut role, permissions): (OrganizationRole, String)) -> Result<OrganizationRole> {
    role.permissions = parse_roles(&role.id, &permissions)?;
    Ok(role)
}

/// Unicode lowercase fold backing role-name uniqueness and lookup.
/// SQLite's NOCASE only folds ASCII.
fn name_key(name: &str) -> String {
    name.to_lowercase()
}

const ROLE_COLUMNS: &str =
    "id, organization_id, name, is_system_role, is_active, description, permissions";

// ---------------------------------------------------------------------------
// Db
// ---------------------------------------------------------------------------

/// Owned SQLite handle shared by every pipeline component for one run.
/// The connection closes when the value is dropped.
pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open the application database at the given file path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA busy_timeout=5000;",
        )?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA busy_timeout=5000;")?;
        Ok(Self { conn })
    }

    /// Expose the raw connection (transactions, tests).
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Create the application tables when absent. Used by `init`/`import`
    /// and tests; the pipeline itself never creates them.
    pub fn ensure_app_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS organizations (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS organization_roles (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                name TEXT NOT NULL,
                name_key TEXT NOT NULL,
                is_system_role INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                description TEXT,
                permissions TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_roles_org_name_key
                ON organization_roles(organization_id, name_key);

            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                title TEXT,
                access_roles TEXT NOT NULL DEFAULT '[]',
                updated_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_documents_org
                ON documents(organization_id);",
        )?;
        Ok(())
    }

    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Application tables that do not exist, in declaration order.
    pub fn missing_app_tables(&self) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for table in APP_TABLES {
            if !self.table_exists(table)? {
                missing.push((*table).to_string());
            }
        }
        Ok(missing)
    }

    // -----------------------------------------------------------------------
    // Organizations
    // -----------------------------------------------------------------------

    pub fn insert_organization(&self, org: &Organization) -> Result<()> {
        self.conn.execute(
            "INSERT INTO organizations (id, name) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET name = ?2",
            params![org.id, org.name],
        )?;
        Ok(())
    }

    pub fn organization_exists(&self, id: &str) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM organizations WHERE id = ?1",
                params![id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn list_organizations(&self) -> Result<Vec<Organization>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name FROM organizations ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Organization {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Organizations that have no role rows at all.
    pub fn organizations_without_roles(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT o.id FROM organizations o
             WHERE NOT EXISTS (
                SELECT 1 FROM organization_roles r WHERE r.organization_id = o.id
             )
             ORDER BY o.id",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Organization roles
    // -----------------------------------------------------------------------

    /// Active role in `organization_id` whose name matches case-insensitively.
    pub fn find_active_role(
        &self,
        organization_id: &str,
        name: &str,
    ) -> Result<Option<OrganizationRole>> {
        let sql = format!(
            "SELECT {ROLE_COLUMNS} FROM organization_roles
             WHERE organization_id = ?1 AND name_key = ?2 AND is_active = 1
             ORDER BY name = ?3 DESC
             LIMIT 1"
        );
        let row = self
            .conn
            .query_row(
                &sql,
                params![organization_id, name_key(name), name],
                role_from_row,
            )
            .optional()?;
        row.map(finish_role).transpose()
    }

    /// Insert a role; returns false when an equally-named role already exists.
    pub fn insert_role(&self, role: &OrganizationRole) -> Result<bool> {
        let permissions = encode_roles(&role.permissions)?;
        let changes = self.conn.execute(
            "INSERT INTO organization_roles
                (id, organization_id, name, name_key, is_system_role, is_active, description, permissions, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT DO NOTHING",
            params![
                role.id,
                role.organization_id,
                role.name,
                name_key(&role.name),
                role.is_system_role,
                role.is_active,
                role.description,
                permissions,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(changes > 0)
    }

    pub fn list_roles(&self, organization_id: &str) -> Result<Vec<OrganizationRole>> {
        let sql = format!(
            "SELECT {ROLE_COLUMNS} FROM organization_roles
             WHERE organization_id = ?1 ORDER BY name"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![organization_id], role_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(finish_role).collect()
    }

    /// Roles carrying an exact description, ordered by organization then name.
    pub fn roles_with_description(&self, description: &str) -> Result<Vec<OrganizationRole>> {
        let sql = format!(
            "SELECT {ROLE_COLUMNS} FROM organization_roles
             WHERE description = ?1 ORDER BY organization_id, name"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![description], role_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(finish_role).collect()
    }

    // -----------------------------------------------------------------------
    // Documents
    // -----------------------------------------------------------------------

    pub fn insert_document(&self, doc: &Document) -> Result<()> {
        let roles = encode_roles(&doc.access_roles)?;
        self.conn.execute(
            "INSERT INTO documents (id, organization_id, access_roles, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                organization_id = ?2,
                access_roles = ?3,
                updated_at = ?4",
            params![
                doc.id,
                doc.organization_id,
                roles,
                doc.updated_at.map(|dt| dt.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// All document rows ordered by id, role lists undecoded so one malformed
    /// row does not hide the others.
    pub fn list_stored_documents(&self) -> Result<Vec<StoredDocument>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, organization_id, access_roles, updated_at FROM documents ORDER BY id",
        )?;
        let rows = stmt.query_map([], StoredDocument::from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, organization_id, access_roles, updated_at FROM documents WHERE id = ?1",
                params![id],
                StoredDocument::from_row,
            )
            .optional()?;
        row.map(StoredDocument::into_document).transpose()
    }

    /// Raw stored `access_roles` text, without decoding.
    pub fn raw_document_roles(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, access_roles FROM documents ORDER BY id")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn document_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Overwrite a document's role list and bump `updated_at`.
    pub fn set_document_roles(&self, id: &str, roles: &[String]) -> Result<()> {
        let encoded = encode_roles(roles)?;
        let changes = self.conn.execute(
            "UPDATE documents SET access_roles = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, encoded, Utc::now().to_rfc3339()],
        )?;
        if changes == 0 {
            return Err(DocRolesError::DocumentNotFound(id.to_string()));
        }
        Ok(())
    }
}
