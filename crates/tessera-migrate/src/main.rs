//! tessera-migrate CLI
//!
//! Command-line tool for running migrations and inspecting planned schema
//! changes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use tessera_migrate::prelude::*;
use tessera_migrate::UnitState;
use tessera_schema::{normalize_schema, validate_identifier, Schema};

/// Schema-diff migrations for PostgreSQL.
#[derive(Parser)]
#[command(name = "tessera-migrate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database URL.
    #[arg(
        short,
        long,
        env = "DATABASE_URL",
        default_value = tessera_migrate::config::DEFAULT_DATABASE_URL
    )]
    database: String,

    /// Maximum pooled connections.
    #[arg(long, default_value_t = 5)]
    max_connections: u32,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the migrations system (create the ledger table).
    Init,

    /// Apply pending SQL migrations, then reconcile declared tables.
    Migrate {
        /// Directory of `*.sql` migrations.
        #[arg(long, default_value = "migrations")]
        dir: PathBuf,

        /// JSON file mapping table names to schemas.
        #[arg(long)]
        schema: Option<PathBuf>,

        /// Show SQL without executing (dry run).
        #[arg(long)]
        dry_run: bool,
    },

    /// Show applied migrations.
    ShowMigrations,

    /// Show the SQL a table migration would execute.
    Sql {
        /// JSON file mapping table names to schemas.
        #[arg(long)]
        schema: PathBuf,

        /// Table to plan.
        #[arg(long)]
        table: String,
    },
}

fn load_schemas(path: &Path) -> anyhow::Result<BTreeMap<String, Schema>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading schema file {}", path.display()))?;
    let schemas: BTreeMap<String, Schema> = serde_json::from_str(&text)
        .with_context(|| format!("parsing schema file {}", path.display()))?;
    for (table, schema) in &schemas {
        validate_identifier(table)?;
        schema.check_identifiers()?;
    }
    Ok(schemas)
}

fn load_runner(dir: &Path) -> anyhow::Result<MigrationRunner> {
    match MigrationRunner::new().load_dir(dir) {
        Ok(runner) => Ok(runner),
        Err(MigrateError::MigrationsDirNotFound(path)) => {
            warn!(
                path = %path.display(),
                "Migrations directory not found, no SQL migrations to run"
            );
            Ok(MigrationRunner::new())
        }
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut pool = DatabaseConfig::new(&cli.database)
        .max_connections(cli.max_connections)
        .connect()
        .await?;

    match cli.command {
        Commands::Init => {
            info!("Initializing migrations system...");
            MigrationRunner::new().init(&pool).await?;
            info!("Migrations table created successfully.");
        }

        Commands::Migrate {
            dir,
            schema,
            dry_run,
        } => {
            let runner = load_runner(&dir)?;
            let schemas = match &schema {
                Some(path) => load_schemas(path)?,
                None => BTreeMap::new(),
            };

            if dry_run {
                info!("Dry run mode - SQL will be printed but not executed.");
                runner.init(&pool).await?;
                for unit in runner.status(&mut pool).await? {
                    if unit.collection.is_none() && unit.state == UnitState::Pending {
                        println!("-- migration {}", unit.migration);
                    }
                }
                for (table, schema) in &schemas {
                    let target = normalize_schema(table, schema);
                    println!("-- table {table}");
                    for sql in runner.sql_for_table(&mut pool, table, &target).await? {
                        println!("{sql};");
                    }
                }
                return Ok(());
            }

            let applied = runner.run_global(&pool).await?;
            info!(count = applied.len(), "Global migrations applied");

            for (table, schema) in &schemas {
                let target = normalize_schema(table, schema);
                let report = runner.migrate_table(&pool, table, &target).await?;
                if report.plan.is_empty() {
                    info!(table = %table, "Table up to date");
                } else {
                    info!(
                        table = %table,
                        statements = report.plan.sql().len(),
                        "Table migrated"
                    );
                }
            }
        }

        Commands::ShowMigrations => {
            let runner = MigrationRunner::new();
            runner.init(&pool).await?;
            let applied = runner.applied(&mut pool).await?;

            if applied.is_empty() {
                info!("No migrations have been applied yet.");
            } else {
                println!("\nApplied migrations:");
                println!("{:-<60}", "");

                for migration in &applied {
                    let at = migration
                        .applied_at
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_default();
                    println!(" [X] {} ({})", migration.label(), at);
                }
                println!();
            }
        }

        Commands::Sql { schema, table } => {
            let schemas = load_schemas(&schema)?;
            let declared = schemas
                .get(&table)
                .with_context(|| format!("table '{table}' not declared in {}", schema.display()))?;
            let target = normalize_schema(&table, declared);

            let sql = MigrationRunner::new()
                .sql_for_table(&mut pool, &table, &target)
                .await?;
            if sql.is_empty() {
                info!(table = %table, "Table up to date");
            }
            for statement in sql {
                println!("{statement};");
            }
        }
    }

    Ok(())
}
