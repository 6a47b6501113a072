use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::rollback::DEFAULT_PREVIEW_LIMIT;
use crate::error::{DocRolesError, Result};

pub const WORKSPACE_DIR: &str = ".docroles";
pub const CONFIG_VERSION: u64 = 1;
pub const DB_ENV: &str = "DOCROLES_DB";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub version: u64,
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
    #[serde(default = "default_preview_limit")]
    pub preview_limit: usize,
}

fn default_database() -> PathBuf {
    PathBuf::from("docroles.db")
}

fn default_reports_dir() -> PathBuf {
    Path::new(WORKSPACE_DIR).join("reports")
}

fn default_preview_limit() -> usize {
    DEFAULT_PREVIEW_LIMIT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            database: default_database(),
            reports_dir: default_reports_dir(),
            preview_limit: default_preview_limit(),
        }
    }
}

/// A directory holding `.docroles/config.json`. Relative paths in the
/// config resolve against `root`.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    pub config: Config,
}

impl Workspace {
    /// Open the workspace at `root`, using defaults when no config exists.
    pub fn open(root: &Path) -> Result<Self> {
        let path = Self::config_path(root);
        let config = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            Config::default()
        };
        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    /// Write a fresh config file.
    pub fn init(root: &Path) -> Result<Self> {
        let path = Self::config_path(root);
        if path.exists() {
            return Err(DocRolesError::AlreadyInitialized);
        }
        fs::create_dir_all(root.join(WORKSPACE_DIR))?;
        let config = Config::default();
        fs::write(&path, serde_json::to_string_pretty(&config)?)?;
        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    fn config_path(root: &Path) -> PathBuf {
        root.join(WORKSPACE_DIR).join("config.json")
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Database path: explicit flag, then `$DOCROLES_DB`, then config.
    pub fn database_path(&self, flag: Option<&Path>) -> PathBuf {
        let env = std::env::var(DB_ENV).ok().filter(|v| !v.is_empty());
        self.database_path_with(flag, env.as_deref())
    }

    fn database_path_with(&self, flag: Option<&Path>, env: Option<&str>) -> PathBuf {
        match (flag, env) {
            (Some(path), _) => self.resolve(path),
            (None, Some(path)) => self.resolve(Path::new(path)),
            (None, None) => self.resolve(&self.config.database),
        }
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.resolve(&self.config.reports_dir)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(WORKSPACE_DIR).join("run.lock")
    }
}
