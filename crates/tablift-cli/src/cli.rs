//! tablift - load delimited files into a SQL database from a DDL schema

mod config;
mod logging;
mod output;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tablift_core::{Connection, DatabaseDriver};
use tablift_drivers::DriverRegistry;
use tablift_migrate::{
    DatasetFile, FileListingCache, LocalDirectorySource, MigrationRun, QueryGateway, SchemaFile,
    SchemaOracle, build_inference_prompt, prepare_run,
};
use tokio_util::sync::CancellationToken;

use config::Config;
use logging::LogFormat;

/// The report has non-fatal errors
const EXIT_PARTIAL: u8 = 2;
/// The command failed outright
const EXIT_FATAL: u8 = 1;

const DEFAULT_SAMPLE_ROWS: usize = 5;

/// Load CSV files into a SQL database from a DDL schema
#[derive(Parser, Debug)]
#[command(name = "tablift")]
#[command(about = "Create tables from DDL and load CSV files into them", long_about = None)]
#[command(version)]
pub struct Args {
    /// Configuration file
    #[arg(long, global = true, env = "TABLIFT_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// PostgreSQL connection URL
    #[arg(long, global = true, env = "TABLIFT_DATABASE_URL", value_name = "URL")]
    pub database_url: Option<String>,

    /// SQLite database file (takes precedence over --database-url)
    #[arg(long, global = true, value_name = "PATH")]
    pub sqlite: Option<PathBuf>,

    /// Log level filter when RUST_LOG is unset
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the schema and load files into it
    Migrate(MigrateArgs),
    /// Run a read-only SELECT query
    Query {
        /// The SELECT statement
        sql: String,
    },
    /// List tables with exact row counts
    Tables,
    /// Show a table's row count and a three-row sample
    Verify {
        table: String,
    },
    /// List the loadable files of a directory
    Files {
        #[arg(long, value_name = "DIR")]
        dir: PathBuf,
    },
    /// Print the schema inference prompt for the given files
    Prompt {
        /// Data lines to include per file, after the header
        #[arg(long, default_value_t = DEFAULT_SAMPLE_ROWS)]
        sample_rows: usize,

        #[arg(value_name = "FILES", required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(clap::Args, Debug)]
pub struct MigrateArgs {
    /// DDL file to execute
    #[arg(long, value_name = "FILE", required_unless_present = "infer_from", conflicts_with = "infer_from")]
    pub schema: Option<PathBuf>,

    /// Saved schema-inference answer; markdown fences are removed
    #[arg(long, value_name = "FILE")]
    pub infer_from: Option<PathBuf>,

    /// Directory to take files from
    #[arg(long, value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// Files of --dir to load, by name (all of them when omitted)
    #[arg(long, value_name = "ID", num_args = 1.., requires = "dir")]
    pub ids: Vec<String>,

    /// Only analyse the schema and print the DDL that would run
    #[arg(long)]
    pub dry_run: bool,

    /// Files to load
    #[arg(value_name = "FILES")]
    pub files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_PARTIAL),
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("tablift: error: {e:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

/// Run the command; `Ok(false)` means it finished with non-fatal errors.
async fn run(args: Args) -> Result<bool> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(url) = &args.database_url {
        config.use_postgres_url(url);
    }
    if let Some(path) = &args.sqlite {
        config.use_sqlite(path);
    }

    logging::init(
        args.log_level.as_deref().unwrap_or(&config.log.level),
        args.log_format.unwrap_or(config.log.format),
    )?;

    match args.command {
        Command::Migrate(migrate) => run_migrate(&config, migrate, args.json).await,
        Command::Query { sql } => {
            let gateway = QueryGateway::new(connect(&config).await?);
            let result = gateway.query(&sql).await;
            gateway.close().await?;
            let result = result?;
            if args.json {
                output::print_json(&result)?;
            } else {
                println!("{}", output::query_table(&result));
            }
            Ok(true)
        }
        Command::Tables => {
            let gateway = QueryGateway::new(connect(&config).await?);
            let tables = gateway.list_tables().await;
            gateway.close().await?;
            let tables = tables?;
            if args.json {
                output::print_json(&tables)?;
            } else {
                println!("{}", output::tables_table(&tables));
            }
            Ok(true)
        }
        Command::Verify { table } => {
            let gateway = QueryGateway::new(connect(&config).await?);
            let verification = gateway.verify_table(&table).await;
            gateway.close().await?;
            let verification =
                verification.with_context(|| format!("Failed to verify table {}", table))?;
            if args.json {
                output::print_json(&verification)?;
            } else {
                println!("{}", output::render_verification(&verification));
            }
            Ok(true)
        }
        Command::Files { dir } => {
            let cache = FileListingCache::new(LocalDirectorySource::new(&dir));
            let files = cache
                .list_files()
                .await
                .with_context(|| format!("Failed to list {}", dir.display()))?;
            if args.json {
                output::print_json(&files)?;
            } else {
                println!("{}", output::files_table(&files));
            }
            Ok(true)
        }
        Command::Prompt { sample_rows, files } => {
            let (files, errors) = read_files(&files).await;
            if let Some(error) = errors.first() {
                return Err(anyhow!("{}", error));
            }
            println!("{}", build_inference_prompt(&files, sample_rows));
            Ok(true)
        }
    }
}

async fn run_migrate(config: &Config, args: MigrateArgs, json: bool) -> Result<bool> {
    let (files, download_errors) = collect_files(&args).await?;

    if args.dry_run {
        let schema = match (&args.schema, &args.infer_from) {
            (Some(path), _) => read_schema(path).await?,
            (None, Some(path)) => SchemaFile::new(path).infer_schema(&files).await?,
            (None, None) => return Err(anyhow!("--schema or --infer-from is required")),
        };
        let prepared = prepare_run(&schema);
        if json {
            output::print_json(&prepared)?;
        } else {
            println!("{}", output::render_prepared(&prepared));
        }
        return Ok(true);
    }

    let cancellation = CancellationToken::new();
    let interrupt = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling the current phase");
            interrupt.cancel();
        }
    });

    let driver = driver_for(config)?;
    let options = config.migrate.clone().with_cancellation(cancellation);
    let run = MigrationRun::new(driver, config.database.connection_config()?, options)
        .with_download_errors(download_errors);

    let report = match (&args.schema, &args.infer_from) {
        (Some(path), _) => {
            let schema = read_schema(path).await?;
            run.execute(files, &schema).await?
        }
        (None, Some(path)) => {
            run.execute_with_oracle(files, &SchemaFile::new(path))
                .await?
        }
        (None, None) => return Err(anyhow!("--schema or --infer-from is required")),
    };

    if json {
        output::print_json(&report)?;
    } else {
        print!("{}", output::render_report(&report));
    }
    Ok(report.success)
}

/// Files named on the command line plus those picked from `--dir`
async fn collect_files(args: &MigrateArgs) -> Result<(Vec<DatasetFile>, Vec<String>)> {
    let (mut files, mut errors) = read_files(&args.files).await;

    if let Some(dir) = &args.dir {
        let cache = FileListingCache::new(LocalDirectorySource::new(dir));
        let ids = if args.ids.is_empty() {
            cache
                .list_files()
                .await
                .with_context(|| format!("Failed to list {}", dir.display()))?
                .into_iter()
                .map(|entry| entry.id)
                .collect()
        } else {
            args.ids.clone()
        };
        let (downloaded, failed) = cache.download_all(&ids).await;
        files.extend(downloaded);
        errors.extend(failed);
    }

    tracing::info!(files = files.len(), failed = errors.len(), "input files collected");
    Ok((files, errors))
}

async fn read_files(paths: &[PathBuf]) -> (Vec<DatasetFile>, Vec<String>) {
    let mut files = Vec::with_capacity(paths.len());
    let mut errors = Vec::new();
    for path in paths {
        match DatasetFile::read(path).await {
            Ok(file) => files.push(file),
            Err(e) => errors.push(format!("Failed to download file {}: {}", path.display(), e)),
        }
    }
    (files, errors)
}

async fn read_schema(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read schema {}", path.display()))
}

fn driver_for(config: &Config) -> Result<Arc<dyn DatabaseDriver>> {
    DriverRegistry::with_defaults()
        .get(&config.database.driver)
        .ok_or_else(|| anyhow!("Unsupported database driver '{}'", config.database.driver))
}

async fn connect(config: &Config) -> Result<Arc<dyn Connection>> {
    let driver = driver_for(config)?;
    let connection_config = config.database.connection_config()?;
    driver
        .connect(&connection_config)
        .await
        .with_context(|| format!("Failed to connect to {}", driver.display_name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_command_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_migrate_arguments() {
        let args = Args::try_parse_from([
            "tablift",
            "--sqlite",
            "out.db",
            "migrate",
            "--schema",
            "schema.sql",
            "customers.csv",
            "orders.csv",
            "--json",
        ])
        .unwrap();

        assert!(args.json);
        assert_eq!(args.sqlite, Some(PathBuf::from("out.db")));
        match args.command {
            Command::Migrate(migrate) => {
                assert_eq!(migrate.schema, Some(PathBuf::from("schema.sql")));
                assert_eq!(
                    migrate.files,
                    vec![PathBuf::from("customers.csv"), PathBuf::from("orders.csv")]
                );
                assert!(!migrate.dry_run);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_migrate_needs_a_schema_source() {
        assert!(Args::try_parse_from(["tablift", "migrate", "a.csv"]).is_err());
        assert!(
            Args::try_parse_from([
                "tablift", "migrate", "--schema", "a.sql", "--infer-from", "b.sql"
            ])
            .is_err()
        );
    }

    #[test]
    fn test_ids_require_a_directory() {
        assert!(
            Args::try_parse_from(["tablift", "migrate", "--schema", "s.sql", "--ids", "a.csv"])
                .is_err()
        );
        let args = Args::try_parse_from([
            "tablift", "migrate", "--schema", "s.sql", "--dir", "data", "--ids", "a.csv", "b.csv",
        ])
        .unwrap();
        match args.command {
            Command::Migrate(migrate) => assert_eq!(migrate.ids, vec!["a.csv", "b.csv"]),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_prompt_defaults() {
        let args = Args::try_parse_from(["tablift", "prompt", "a.csv"]).unwrap();
        match args.command {
            Command::Prompt { sample_rows, files } => {
                assert_eq!(sample_rows, DEFAULT_SAMPLE_ROWS);
                assert_eq!(files, vec![PathBuf::from("a.csv")]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_collect_files_reports_unreadable_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.csv"), "id\n1\n").unwrap();
        std::fs::write(dir.path().join("notes.md"), "ignored").unwrap();
        let args = MigrateArgs {
            schema: Some(PathBuf::from("s.sql")),
            infer_from: None,
            dir: Some(dir.path().to_path_buf()),
            ids: Vec::new(),
            dry_run: false,
            files: vec![dir.path().join("missing.csv")],
        };

        let (files, errors) = collect_files(&args).await.unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "a.csv");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Failed to download file "), "{}", errors[0]);
    }
}
