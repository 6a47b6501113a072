use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use docroles::commands::{self, rollback::RollbackFlags};
use docroles::output::Format;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "DOCROLES_LOG";

#[derive(Parser)]
#[command(
    name = "docroles",
    version,
    about = "Migrate free-text document access roles to organization roles, reversibly"
)]
struct Cli {
    /// Output format
    #[arg(long, global = true, value_enum, default_value = "json")]
    format: Format,
    /// Shorthand for --format pretty
    #[arg(long, global = true, hide = true)]
    pretty: bool,
    /// SQLite database path (overrides DOCROLES_DB and the config file)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .docroles/ and the application tables in the current directory
    Init,
    /// Load organizations, roles and documents from a YAML or JSON file
    Import {
        /// Fixture file path, or - for stdin
        file: String,
        /// Import even though a migration backup exists
        #[arg(long)]
        force: bool,
    },
    /// Show the pipeline state
    Status,
    /// Rewrite document access roles to canonical organization roles
    Migrate {
        /// Report what would change without writing (default)
        #[arg(long, conflicts_with = "live")]
        dry_run: bool,
        /// Apply the migration
        #[arg(long)]
        live: bool,
        /// Proceed despite validation issues or existing backups
        #[arg(long)]
        force: bool,
        /// Print the pipeline state and exit
        #[arg(long)]
        status: bool,
    },
    /// Restore original access roles from the migration backup
    Rollback {
        /// Preview the restore without writing (default)
        #[arg(long, conflicts_with = "live")]
        dry_run: bool,
        /// Apply the rollback
        #[arg(long)]
        live: bool,
        /// Proceed despite failed preconditions; drop backups even after restore errors
        #[arg(long)]
        force: bool,
        /// Print the pipeline state and exit
        #[arg(long)]
        status: bool,
        /// Skip the restore pass and only drop the backup tables
        #[arg(long, conflicts_with = "no_cleanup")]
        cleanup_only: bool,
        /// Keep the backup tables after restoring
        #[arg(long)]
        no_cleanup: bool,
    },
}

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let format = if cli.pretty {
        Format::Pretty
    } else {
        cli.format
    };
    if let Err(e) = run(cli, format) {
        match format {
            Format::Json => {
                eprintln!(
                    "{}",
                    serde_json::json!({
                        "error": e.code(),
                        "message": e.to_string()
                    })
                );
            }
            _ => eprintln!("error: {e}"),
        }
        std::process::exit(1);
    }
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli, format: Format) -> docroles::error::Result<()> {
    let root = std::env::current_dir()?;
    let db = cli.db.as_deref();
    dispatch(&root, db, cli.command, format)
}

fn dispatch(
    root: &Path,
    db: Option<&Path>,
    command: Commands,
    format: Format,
) -> docroles::error::Result<()> {
    match command {
        Commands::Init => commands::init::run(root, db, format),
        Commands::Import { file, force } => commands::import::run(root, db, &file, force, format),
        Commands::Status => commands::status::run(root, db, format),
        Commands::Migrate {
            dry_run: _,
            live,
            force,
            status,
        } => commands::migrate::run(root, db, live, force, status, format),
        Commands::Rollback {
            dry_run: _,
            live,
            force,
            status,
            cleanup_only,
            no_cleanup,
        } => commands::rollback::run(
            root,
            db,
            RollbackFlags {
                live,
                force,
                status,
                cleanup_only,
                no_cleanup,
            },
            format,
        ),
    }
}
