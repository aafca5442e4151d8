mod report;
mod scaffold;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tabula_common::{ErrorKind, Version};
use tabula_config::{AppConfig, ConfigLoader, LogConfig, LogFormat, loader::apply_env_overrides};
use tabula_db::{CancelFlag, Catalog, Migrator, MigratorOptions, SchemaStore, lock};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tabula", version, about = "Versioned schema migrations for SQLite")]
struct Cli {
    /// Config file (defaults to ~/.tabula/config.yml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// SQLite database to migrate
    #[arg(long, global = true, env = "TABULA_DATABASE", value_name = "PATH")]
    database: Option<PathBuf>,

    /// Directory of migration descriptors
    #[arg(long, global = true, env = "TABULA_MIGRATIONS", value_name = "DIR")]
    migrations: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply, revert and inspect migrations
    #[command(subcommand)]
    Migrate(MigrateCommand),
}

#[derive(Subcommand, Debug, PartialEq)]
enum MigrateCommand {
    /// Apply pending migrations
    Up {
        /// Stop after this version
        #[arg(long, value_name = "VERSION")]
        to: Option<Version>,
        /// Print the SQL instead of running it
        #[arg(long)]
        dry_run: bool,
    },
    /// Revert the most recently applied migrations
    Down {
        #[arg(long, default_value_t = 1)]
        steps: usize,
    },
    /// Show applied, pending, modified, orphaned and draft versions
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Print the SQL pending migrations would run
    Plan,
    /// Scaffold a new migration descriptor
    New { name: String },
    /// Remove a migration lock left behind by a crashed run
    Unlock,
}

/// Everything the blocking part of a command needs, resolved up front.
struct Settings {
    database: PathBuf,
    busy_timeout: Duration,
    migrations_dir: Option<PathBuf>,
    builtin: bool,
    options: MigratorOptions,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_status(&e))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let loader = ConfigLoader::new();
    let config = load_config(&loader, cli.config.as_deref())?;
    init_tracing(&config.log, cli.verbose);
    match config_source(&loader, cli.config.as_deref()) {
        Some(path) => info!("loaded config from {}", path.display()),
        None => debug!(
            "no config file in {}, using defaults",
            loader.config_dir().display()
        ),
    }

    let Commands::Migrate(command) = cli.command;
    let migrations_dir = cli.migrations.or_else(|| config.migrations.directory.clone());

    if let MigrateCommand::New { name } = &command {
        let dir = migrations_dir.unwrap_or_else(|| PathBuf::from("migrations"));
        let path = scaffold::new_migration(&dir, name, chrono::Utc::now())?;
        println!("created {}", path.display());
        return Ok(());
    }

    let database = match cli.database.or_else(|| config.database.path.clone()) {
        Some(path) => path,
        None => {
            let path = loader.default_database_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            path
        }
    };
    debug!("using database {}", database.display());

    let settings = Settings {
        database,
        busy_timeout: Duration::from_millis(config.database.busy_timeout_ms),
        migrations_dir,
        builtin: config.migrations.builtin,
        options: MigratorOptions {
            ledger_table: config.migrations.ledger_table.clone(),
            allow_out_of_order: config.migrations.allow_out_of_order,
            lock_stale_after: config.migrations.lock_stale_after_secs.map(Duration::from_secs),
        },
    };

    let cancel = CancelFlag::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after the current migration");
                cancel.cancel();
            }
        })
    };

    let result = tokio::task::spawn_blocking(move || execute(command, settings, cancel))
        .await
        .context("migration task panicked")?;
    interrupt.abort();
    result
}

fn load_config(loader: &ConfigLoader, path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => {
            let mut config = ConfigLoader::load_from(path)?;
            apply_env_overrides(&mut config, |key| std::env::var(key).ok());
            Ok(config)
        }
        None => Ok(loader.load()?),
    }
}

/// The config file `load_config` read, if any.
fn config_source(loader: &ConfigLoader, explicit: Option<&Path>) -> Option<PathBuf> {
    explicit.map(Path::to_path_buf).or_else(|| loader.config_file())
}

fn init_tracing(log: &LogConfig, verbose: u8) {
    let level = match verbose {
        0 => log.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn build_catalog(settings: &Settings) -> Result<Catalog> {
    let mut catalog = if settings.builtin {
        Catalog::builtin()?
    } else {
        Catalog::default()
    };
    if let Some(dir) = &settings.migrations_dir {
        catalog.extend_from_dir(dir)?;
    }
    info!("{} migration(s) known", catalog.len());
    Ok(catalog)
}

fn execute(command: MigrateCommand, settings: Settings, cancel: CancelFlag) -> Result<()> {
    let store = SchemaStore::open_with_timeout(&settings.database, settings.busy_timeout)?;

    if command == MigrateCommand::Unlock {
        match lock::force_release(&store)? {
            Some(info) => println!(
                "released lock held by {} since {}",
                info.holder,
                info.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            None => println!("no migration lock held"),
        }
        return Ok(());
    }

    let catalog = build_catalog(&settings)?;
    let migrator = Migrator::new(&store, &catalog, settings.options)?
        .with_cancel_flag(cancel)
        .on_progress(report::print_progress);

    match command {
        MigrateCommand::Up { to, dry_run: true } => {
            report::print_plan(&migrator.plan_to(to)?);
        }
        MigrateCommand::Plan => {
            report::print_plan(&migrator.plan()?);
        }
        MigrateCommand::Up { to, dry_run: false } => {
            let run = match to {
                Some(target) => migrator.up_to(target)?,
                None => migrator.up()?,
            };
            report::print_run(&run);
        }
        MigrateCommand::Down { steps } => {
            report::print_run(&migrator.down(steps)?);
        }
        MigrateCommand::Status { json } => {
            let rows = migrator.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                report::print_status(&rows, &settings.database);
            }
        }
        MigrateCommand::New { .. } | MigrateCommand::Unlock => {}
    }
    Ok(())
}

/// Process exit status for a failed command, by error kind.
fn exit_status(err: &anyhow::Error) -> u8 {
    let kind = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<tabula_common::Error>())
        .map(|e| e.kind());
    match kind {
        Some(ErrorKind::Conflict) => 3,
        Some(ErrorKind::Dependency) => 4,
        Some(ErrorKind::Locked) => 5,
        Some(ErrorKind::StoreUnavailable) => 6,
        Some(ErrorKind::Malformed) => 7,
        Some(ErrorKind::Cancelled) => 130,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("tabula").chain(args.iter().copied())).unwrap()
    }

    fn migrate(args: &[&str]) -> MigrateCommand {
        let Commands::Migrate(command) = parse(args).command;
        command
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_up_with_target_and_dry_run() {
        assert_eq!(
            migrate(&["migrate", "up", "--to", "20201030184852", "--dry-run"]),
            MigrateCommand::Up {
                to: Some(Version::new(20201030184852)),
                dry_run: true
            }
        );
        assert_eq!(
            migrate(&["migrate", "up"]),
            MigrateCommand::Up {
                to: None,
                dry_run: false
            }
        );
    }

    #[test]
    fn down_defaults_to_one_step() {
        assert_eq!(migrate(&["migrate", "down"]), MigrateCommand::Down { steps: 1 });
        assert_eq!(
            migrate(&["migrate", "down", "--steps", "3"]),
            MigrateCommand::Down { steps: 3 }
        );
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = parse(&["migrate", "status", "--json", "--database", "app.db", "-vv"]);
        assert_eq!(cli.database, Some(PathBuf::from("app.db")));
        assert_eq!(cli.verbose, 2);
        let Commands::Migrate(command) = cli.command;
        assert_eq!(command, MigrateCommand::Status { json: true });
    }

    #[test]
    fn rejects_bad_version() {
        let parsed = Cli::try_parse_from(["tabula", "migrate", "up", "--to", "yesterday"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn new_requires_a_name() {
        assert!(Cli::try_parse_from(["tabula", "migrate", "new"]).is_err());
        assert_eq!(
            migrate(&["migrate", "new", "add_priority"]),
            MigrateCommand::New {
                name: "add_priority".into()
            }
        );
    }

    fn settings(dir: &Path, migrations_dir: Option<PathBuf>) -> Settings {
        Settings {
            database: dir.join("app.db"),
            busy_timeout: Duration::from_millis(500),
            migrations_dir,
            builtin: true,
            options: MigratorOptions::default(),
        }
    }

    fn recorded(database: &Path) -> Vec<i64> {
        let store = SchemaStore::open(database).unwrap();
        let ledger = tabula_db::Ledger::new("schema_migrations").unwrap();
        store
            .with_connection(|conn| ledger.entries(conn))
            .unwrap()
            .iter()
            .map(|e| e.version.get())
            .collect()
    }

    #[test]
    fn dry_run_honours_target_and_leaves_the_database_alone() {
        let dir = tempfile::tempdir().unwrap();
        execute(
            MigrateCommand::Up {
                to: Some(Version::new(20201030184851)),
                dry_run: true,
            },
            settings(dir.path(), None),
            CancelFlag::new(),
        )
        .unwrap();
        assert!(recorded(&dir.path().join("app.db")).is_empty());

        execute(
            MigrateCommand::Up {
                to: Some(Version::new(20201030184851)),
                dry_run: false,
            },
            settings(dir.path(), None),
            CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(recorded(&dir.path().join("app.db")), vec![20201030184851]);
    }

    #[test]
    fn up_status_and_down_run_against_a_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let run = |command| execute(command, settings(dir.path(), None), CancelFlag::new());

        run(MigrateCommand::Up {
            to: None,
            dry_run: false,
        })
        .unwrap();
        assert_eq!(
            recorded(&dir.path().join("app.db")),
            vec![20201030184851, 20201030184852]
        );
        run(MigrateCommand::Status { json: true }).unwrap();
        run(MigrateCommand::Status { json: false }).unwrap();
        run(MigrateCommand::Down { steps: 1 }).unwrap();
        assert_eq!(recorded(&dir.path().join("app.db")), vec![20201030184851]);
        run(MigrateCommand::Unlock).unwrap();
    }

    #[test]
    fn scaffolded_migration_does_not_break_status_or_up() {
        let dir = tempfile::tempdir().unwrap();
        let migrations = dir.path().join("migrations");
        scaffold::new_migration(&migrations, "add_priority", chrono::Utc::now()).unwrap();

        for command in [
            MigrateCommand::Status { json: false },
            MigrateCommand::Plan,
            MigrateCommand::Up {
                to: None,
                dry_run: false,
            },
        ] {
            let result = execute(
                command,
                settings(dir.path(), Some(migrations.clone())),
                CancelFlag::new(),
            );
            assert!(result.is_ok(), "{:?}", result.err());
        }
        assert_eq!(
            recorded(&dir.path().join("app.db")),
            vec![20201030184851, 20201030184852]
        );
    }

    #[test]
    fn cancelled_up_exits_with_130() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = execute(
            MigrateCommand::Up {
                to: None,
                dry_run: false,
            },
            settings(dir.path(), None),
            cancel,
        )
        .unwrap_err();
        assert_eq!(exit_status(&err), 130);
        assert!(recorded(&dir.path().join("app.db")).is_empty());
    }

    #[test]
    fn config_source_prefers_the_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::with_dir(dir.path());
        assert_eq!(config_source(&loader, None), None);

        std::fs::write(dir.path().join("config.yml"), "{}\n").unwrap();
        assert_eq!(
            config_source(&loader, None),
            Some(dir.path().join("config.yml"))
        );
        let explicit = dir.path().join("other.toml");
        assert_eq!(config_source(&loader, Some(&explicit)), Some(explicit.clone()));
    }

    #[test]
    fn exit_status_follows_error_kind() {
        let locked = anyhow::Error::new(tabula_common::Error::Locked("held".into()));
        assert_eq!(exit_status(&locked), 5);

        let wrapped = anyhow::Error::new(
            tabula_common::Error::Dependency("users".into()).in_migration(Version::new(2)),
        )
        .context("while migrating");
        assert_eq!(exit_status(&wrapped), 4);

        assert_eq!(
            exit_status(&anyhow::Error::new(tabula_common::Error::Cancelled("x".into()))),
            130
        );
        assert_eq!(exit_status(&anyhow::anyhow!("something else")), 1);
    }
}
