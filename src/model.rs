use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Success,
    Partial,
    Error,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MigrationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "partial" => Ok(Self::Partial),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown migration status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Organization {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    pub organization_id: String,
    pub access_roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrganizationRole {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub is_system_role: bool,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
}

/// Pre-mutation snapshot of a document's role field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupRecord {
    pub document_id: String,
    pub original_access_roles: Vec<String>,
    pub migrated_access_roles: Vec<String>,
    pub migration_status: MigrationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A role the migration created because no matching role existed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CreatedRole {
    pub organization_id: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&MigrationStatus::Partial).unwrap();
        assert_eq!(json, r#""partial""#);
    }

    #[test]
    fn status_parses_stored_text() {
        assert_eq!("error".parse::<MigrationStatus>(), Ok(MigrationStatus::Error));
        assert!("done".parse::<MigrationStatus>().is_err());
    }

    #[test]
    fn document_omits_missing_timestamp() {
        let doc = Document {
            id: "d1".into(),
            organization_id: "Acme".into(),
            access_roles: vec!["admin".into(), "admin".into()],
            updated_at: None,
        };
        let json = serde_json::to_string(&doc).unwrap();
        assert!(!json.contains("updated_at"));
        assert!(json.contains(r#"["admin","admin"]"#));
    }
}
