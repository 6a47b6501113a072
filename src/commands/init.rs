use std::fs;
use std::path::Path;

use colored::Colorize;
use serde_json::json;
use tracing::info;

use crate::config::Workspace;
use crate::error::Result;
use crate::output::{self, Format};
use crate::store::db::Db;

pub fn run(root: &Path, db_flag: Option<&Path>, format: Format) -> Result<()> {
    let workspace = Workspace::init(root)?;
    let database = workspace.database_path(db_flag);
    let db = Db::open(&database)?;
    db.ensure_app_schema()?;
    fs::create_dir_all(workspace.reports_dir())?;
    info!(root = %root.display(), database = %database.display(), "workspace initialized");

    match format {
        Format::Json => output::print_json(&json!({
            "initialized": root.display().to_string(),
            "database": database.display().to_string(),
            "reports_dir": workspace.reports_dir().display().to_string(),
        }))?,
        Format::Pretty => {
            println!("{} {}", "Initialized".green().bold(), root.display());
            println!("  {} {}", "database:".dimmed(), database.display());
            println!(
                "  {} {}",
                "reports:".dimmed(),
                workspace.reports_dir().display()
            );
        }
        Format::Minimal => println!("initialized={}", database.display()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DocRolesError;
    use tempfile::tempdir;

    #[test]
    fn init_creates_schema_and_refuses_twice() {
        let dir = tempdir().unwrap();
        run(dir.path(), None, Format::Minimal).unwrap();

        let db = Db::open(&dir.path().join("docroles.db")).unwrap();
        assert!(db.missing_app_tables().unwrap().is_empty());
        assert!(dir.path().join(".docroles/reports").is_dir());

        let err = run(dir.path(), None, Format::Minimal).unwrap_err();
        assert!(matches!(err, DocRolesError::AlreadyInitialized));
    }
}
