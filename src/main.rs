use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use kamehouse_lib::{config::Config, db, logging, migrate};

#[derive(Debug, Parser)]
#[command(name = "kamehouse", about = "KameHouse household chores API", version)]
struct Cli {
    /// SQLite database URL. Overrides KAMEHOUSE_DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP API (the default).
    Serve {
        /// Port to listen on. Overrides KAMEHOUSE_PORT.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Apply pending schema migrations and exit.
    Migrate,
    /// Database maintenance commands.
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Run VACUUM to compact the database.
    Vacuum,
}

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = Config::from_env().context("load configuration")?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    let _guard = logging::init(&config).context("initialise logging")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            runtime.block_on(kamehouse_lib::serve(config))?;
            Ok(0)
        }
        Commands::Migrate => runtime.block_on(handle_migrate(&config)),
        Commands::Db(DbCommand::Vacuum) => runtime.block_on(handle_vacuum(&config)),
    }
}

async fn handle_migrate(config: &Config) -> Result<i32> {
    let pool = db::open_sqlite_pool(&config.database_url)
        .await
        .context("open database")?;
    let result = migrate::apply_migrations(&pool).await;
    pool.close().await;
    let applied = result?;
    if applied.is_empty() {
        println!("Database is up to date.");
    } else {
        println!("Applied {} migration(s):", applied.len());
        for name in &applied {
            println!("  {name}");
        }
    }
    Ok(0)
}

async fn handle_vacuum(config: &Config) -> Result<i32> {
    let pool = db::open_sqlite_pool(&config.database_url)
        .await
        .context("open database")?;
    let result = sqlx::query("VACUUM")
        .execute(&pool)
        .await
        .context("vacuum database");
    pool.close().await;
    result?;
    println!("Database vacuum completed.");
    Ok(0)
}
