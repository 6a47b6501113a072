pub mod import;
pub mod init;
pub mod migrate;
pub mod rollback;
pub mod status;

use std::path::Path;

use tracing::{info, warn};

use crate::config::Workspace;
use crate::error::{DocRolesError, Result};
use crate::report::ReportBuilder;
use crate::store::db::Db;

/// Open the workspace rooted at `root` and the database it points to.
pub(crate) fn open(root: &Path, db_flag: Option<&Path>) -> Result<(Workspace, Db)> {
    let workspace = Workspace::open(root)?;
    let db = Db::open(&workspace.database_path(db_flag))?;
    Ok((workspace, db))
}

/// Leave an audit report behind when the engine refuses to run. Other
/// errors are left to the caller.
pub(crate) fn record_refusal(
    workspace: &Workspace,
    kind: &str,
    err: &DocRolesError,
    dry_run: bool,
    force: bool,
) {
    if !matches!(
        err,
        DocRolesError::AlreadyMigrated | DocRolesError::ValidationFailed(_)
    ) {
        return;
    }
    match ReportBuilder::new(workspace.reports_dir()).refusal_report(kind, err, dry_run, force) {
        Ok(path) => info!(report = %path.display(), error = err.code(), "refusal report written"),
        Err(write_err) => warn!(error = %write_err, "refusal report could not be written"),
    }
}
