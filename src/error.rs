use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocRolesError {
    #[error("docroles already initialized in this directory")]
    AlreadyInitialized,

    #[error("required tables are missing: {}", .0.join(", "))]
    MissingTables(Vec<String>),

    #[error("validation failed: {}", .0.join("; "))]
    ValidationFailed(Vec<String>),

    #[error(
        "migration already applied and not cleaned up; roll back first or use --force to re-run"
    )]
    AlreadyMigrated,

    #[error("role '{raw}' cannot be resolved: {reason}")]
    RoleResolution { raw: String, reason: String },

    #[error("organization '{0}' not found")]
    OrganizationNotFound(String),

    #[error("document '{0}' not found")]
    DocumentNotFound(String),

    #[error("document '{0}' has a malformed access_roles value: {1}")]
    MalformedRoles(String, String),

    #[error("locked by another process: {0}")]
    Locked(String),

    #[error("{0}")]
    RunFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

impl DocRolesError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyInitialized => "already_initialized",
            Self::MissingTables(_) => "missing_tables",
            Self::ValidationFailed(_) => "validation_failed",
            Self::AlreadyMigrated => "already_migrated",
            Self::RoleResolution { .. } => "role_resolution",
            Self::OrganizationNotFound(_) => "organization_not_found",
            Self::DocumentNotFound(_) => "document_not_found",
            Self::MalformedRoles(_, _) => "malformed_roles",
            Self::Locked(_) => "locked",
            Self::RunFailed(_) => "run_failed",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
            Self::Db(_) => "db_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, DocRolesError>;
