mod backend;
mod config;
mod serve_cmd;
mod workflow_cmds;

use anyhow::Result;
use clap::{Parser, Subcommand};

use config::GleitzeitConfig;
use gleitzeit_db::pool;

#[derive(Parser)]
#[command(name = "gleitzeit", about = "Workflow orchestration engine")]
struct Cli {
    /// Database URL (overrides GLEITZEIT_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a gleitzeit config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/gleitzeit")]
        db_url: String,
        /// Store backend: postgres, file, or memory
        #[arg(long, default_value = "postgres")]
        store: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the gleitzeit database (create + migrate)
    DbInit,
    /// Parse and validate a workflow file without persisting it
    Validate {
        /// Path to the workflow file (TOML or JSON)
        file: String,
    },
    /// Validate a workflow file and persist it in queued state
    Submit {
        /// Path to the workflow file (TOML or JSON)
        file: String,
    },
    /// Show a workflow's aggregate status and per-task progress
    Status {
        /// Workflow ID
        workflow_id: String,
    },
    /// Print the canonical result of a terminal task
    Result {
        /// Workflow ID
        workflow_id: String,
        /// Task id within the workflow
        task_id: String,
    },
    /// Cancel every non-terminal task of a workflow (offline)
    Cancel {
        /// Workflow ID
        workflow_id: String,
    },
    /// Run the execution engine with its HTTP submitter API
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Listen port
        #[arg(long, default_value_t = 8787)]
        port: u16,
    },
}

/// Execute the `gleitzeit init` command: write the config file.
fn cmd_init(db_url: &str, store: &str, force: bool) -> Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_owned(),
        },
        store: config::StoreSection {
            backend: store.to_owned(),
            path: None,
        },
        engine: config::EngineSection::default(),
        protocols: vec![config::ProtocolEntry {
            id: "llm/v1".to_owned(),
            methods: vec!["chat".to_owned(), "complete".to_owned()],
            open_world: false,
        }],
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  store.backend = {store}");
    println!();
    println!("Next: run `gleitzeit db-init` to create and migrate the database.");
    Ok(())
}

/// Execute the `gleitzeit db-init` command: create database and migrate.
async fn cmd_db_init(cli_db_url: Option<&str>) -> Result<()> {
    let resolved = GleitzeitConfig::resolve(cli_db_url)?;

    println!("Initializing gleitzeit database...");
    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;
    db_pool.close().await;
    println!("Database ready at {}", resolved.db_config.database_url);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            db_url,
            store,
            force,
        } => {
            cmd_init(&db_url, &store, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Validate { file } => {
            workflow_cmds::run_validate(&file)?;
        }
        Commands::Submit { file } => {
            let resolved = GleitzeitConfig::resolve(cli.database_url.as_deref())?;
            let store = backend::open_store(&resolved).await?;
            workflow_cmds::run_submit(&store, &file).await?;
        }
        Commands::Status { workflow_id } => {
            let resolved = GleitzeitConfig::resolve(cli.database_url.as_deref())?;
            let store = backend::open_store(&resolved).await?;
            workflow_cmds::run_status(&store, &workflow_id).await?;
        }
        Commands::Result {
            workflow_id,
            task_id,
        } => {
            let resolved = GleitzeitConfig::resolve(cli.database_url.as_deref())?;
            let store = backend::open_store(&resolved).await?;
            workflow_cmds::run_result(&store, &workflow_id, &task_id).await?;
        }
        Commands::Cancel { workflow_id } => {
            let resolved = GleitzeitConfig::resolve(cli.database_url.as_deref())?;
            let store = backend::open_store(&resolved).await?;
            workflow_cmds::run_cancel(&store, &workflow_id).await?;
        }
        Commands::Serve { bind, port } => {
            let resolved = GleitzeitConfig::resolve(cli.database_url.as_deref())?;
            serve_cmd::run_serve(resolved, &bind, port).await?;
        }
    }

    Ok(())
}
