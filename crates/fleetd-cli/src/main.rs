mod background_cmd;
mod config;
mod core_ctx;
mod repo_cmd;
mod run_cmd;
mod runtime_cmd;
mod serve_cmd;
mod task_cmd;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use fleetd_db::pool;

use config::FleetdConfig;

#[derive(Parser)]
#[command(name = "fleetd", about = "Orchestration core for containerized coding-agent runs")]
struct Cli {
    /// Database URL (overrides FLEETD_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a fleetd config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/fleetd")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the fleetd database (requires config file or env vars)
    DbInit,
    /// Repository anchor rows
    Repo {
        #[command(subcommand)]
        command: RepoCommands,
    },
    /// Task definitions
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Run lifecycle: create, retry, cancel, inspect
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Task-runtime pool administration
    Runtime {
        #[command(subcommand)]
        command: RuntimeCommands,
    },
    /// Background work queue
    Background {
        #[command(subcommand)]
        command: BackgroundCommands,
    },
    /// Run the HTTP API and the scheduler/pool/dead-run background loops
    Serve {
        /// Bind address (overrides config file / FLEETD_SERVER_BIND)
        #[arg(long)]
        bind: Option<String>,
        /// Port (overrides config file / FLEETD_SERVER_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
enum RepoCommands {
    /// Register a repository
    Create {
        name: String,
        clone_url: String,
        #[arg(long, default_value = "main")]
        default_branch: String,
        #[arg(long)]
        project_key: Option<String>,
    },
    /// List repositories
    List,
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Register a task bound to a repository
    Create {
        repository_id: Uuid,
        name: String,
        #[arg(long, default_value = "claude-code")]
        harness_name: String,
        #[arg(long)]
        concurrency_limit: Option<i32>,
        #[arg(long, default_value_t = 3)]
        retry_max_attempts: i32,
        #[arg(long, default_value_t = 30)]
        retry_backoff_base_seconds: i32,
        #[arg(long, default_value_t = 2.0)]
        retry_backoff_multiplier: f64,
        #[arg(long)]
        cron_expression: Option<String>,
    },
    /// List tasks for a repository
    List { repository_id: Uuid },
}

#[derive(Subcommand)]
enum RunCommands {
    /// Enqueue a new Queued run
    Create {
        task_id: Uuid,
        #[arg(long)]
        concurrency_key: Option<String>,
    },
    /// Enqueue a retry run for a failed/cancelled run
    Retry { run_id: Uuid },
    /// Cancel a run, escalating to force-kill after the grace window
    Cancel {
        run_id: Uuid,
        #[arg(long, default_value_t = 30)]
        grace_seconds: u64,
    },
    /// Show a single run
    Get { run_id: Uuid },
    /// List runs, optionally filtered by task or repository
    List {
        #[arg(long)]
        task_id: Option<Uuid>,
        #[arg(long)]
        repository_id: Option<Uuid>,
    },
}

#[derive(Subcommand)]
enum RuntimeCommands {
    /// List every task-runtime in the pool
    List,
    /// Show a single task-runtime
    Get { runtime_id: Uuid },
    /// Drain and stop a runtime, regardless of current occupancy
    Recycle { runtime_id: Uuid },
    /// Clear a runtime's quarantine, returning it to Ready
    QuarantineClear { runtime_id: Uuid },
}

#[derive(Subcommand)]
enum BackgroundCommands {
    /// List the retained background-work snapshot
    List,
    /// Show a single background-work item
    Get { work_id: Uuid },
}

/// Execute `fleetd init`: write a config file without touching the database.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: Some(db_url.to_string()),
        },
        ..Default::default()
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `fleetd db-init` to create and migrate the database.");

    Ok(())
}

/// Execute `fleetd db-init`: create the database (if needed) and migrate it.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = FleetdConfig::resolve(cli_db_url, None, None, None)?;

    println!("Initializing fleetd database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("fleetd db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Config resolution happens again below (per-command, since only some
    // commands need a pool), but the log level has to be known before the
    // subscriber is installed, so resolve it here too.
    let log_level = FleetdConfig::resolve(cli.database_url.as_deref(), None, None, None)
        .map(|c| c.log_level)
        .unwrap_or_else(|_| config::DEFAULT_LOG_LEVEL.to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Repo { command } => {
            let resolved = FleetdConfig::resolve(cli.database_url.as_deref(), None, None, None)?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = match command {
                RepoCommands::Create {
                    name,
                    clone_url,
                    default_branch,
                    project_key,
                } => {
                    repo_cmd::create(
                        &db_pool,
                        &name,
                        &clone_url,
                        &default_branch,
                        project_key.as_deref(),
                    )
                    .await
                }
                RepoCommands::List => repo_cmd::list(&db_pool).await,
            };
            db_pool.close().await;
            result?;
        }
        Commands::Task { command } => {
            let resolved = FleetdConfig::resolve(cli.database_url.as_deref(), None, None, None)?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = match command {
                TaskCommands::Create {
                    repository_id,
                    name,
                    harness_name,
                    concurrency_limit,
                    retry_max_attempts,
                    retry_backoff_base_seconds,
                    retry_backoff_multiplier,
                    cron_expression,
                } => {
                    task_cmd::create(
                        &db_pool,
                        repository_id,
                        &name,
                        &harness_name,
                        concurrency_limit,
                        retry_max_attempts,
                        retry_backoff_base_seconds,
                        retry_backoff_multiplier,
                        cron_expression.as_deref(),
                    )
                    .await
                }
                TaskCommands::List { repository_id } => {
                    task_cmd::list(&db_pool, repository_id).await
                }
            };
            db_pool.close().await;
            result?;
        }
        Commands::Run { command } => {
            let resolved = FleetdConfig::resolve(cli.database_url.as_deref(), None, None, None)?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let core = core_ctx::build(db_pool.clone(), &resolved.core);
            let result = match command {
                RunCommands::Create {
                    task_id,
                    concurrency_key,
                } => run_cmd::create(&core, task_id, concurrency_key.as_deref()).await,
                RunCommands::Retry { run_id } => run_cmd::retry(&core, run_id).await,
                RunCommands::Cancel {
                    run_id,
                    grace_seconds,
                } => run_cmd::cancel(&core, run_id, grace_seconds).await,
                RunCommands::Get { run_id } => run_cmd::get(&core, run_id).await,
                RunCommands::List {
                    task_id,
                    repository_id,
                } => run_cmd::list(&core, task_id, repository_id).await,
            };
            db_pool.close().await;
            result?;
        }
        Commands::Runtime { command } => {
            let resolved = FleetdConfig::resolve(cli.database_url.as_deref(), None, None, None)?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let core = core_ctx::build(db_pool.clone(), &resolved.core);
            let result = match command {
                RuntimeCommands::List => runtime_cmd::list(&core).await,
                RuntimeCommands::Get { runtime_id } => runtime_cmd::get(&core, runtime_id).await,
                RuntimeCommands::Recycle { runtime_id } => {
                    runtime_cmd::recycle(&core, runtime_id).await
                }
                RuntimeCommands::QuarantineClear { runtime_id } => {
                    runtime_cmd::quarantine_clear(&core, runtime_id).await
                }
            };
            db_pool.close().await;
            result?;
        }
        Commands::Background { command } => {
            let resolved = FleetdConfig::resolve(cli.database_url.as_deref(), None, None, None)?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let core = core_ctx::build(db_pool.clone(), &resolved.core);
            let result = match command {
                BackgroundCommands::List => background_cmd::list(&core).await,
                BackgroundCommands::Get { work_id } => background_cmd::get(&core, work_id).await,
            };
            core.background.shutdown();
            db_pool.close().await;
            result?;
        }
        Commands::Serve { bind, port } => {
            let resolved = FleetdConfig::resolve(
                cli.database_url.as_deref(),
                None,
                bind.as_deref(),
                port,
            )?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            pool::run_migrations(&db_pool).await?;
            let result =
                serve_cmd::run_serve(db_pool.clone(), &resolved).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}

