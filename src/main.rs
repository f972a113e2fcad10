mod cli;
mod server;
mod tools;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use convostore::config::AppConfig;

#[derive(Parser)]
#[command(name = "convostore", version, about = "Conversation storage engine and MCP server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the MCP server (stdio transport by default)
    Serve {
        /// Serve streamable HTTP on server.host:server.port instead of stdio
        #[arg(long)]
        http: bool,
    },
    /// Inspect or change the schema version
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
    /// Check database integrity and schema state
    Doctor,
    /// Show storage, pool and context cache statistics
    Stats,
    /// Manage the persistent context cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Show current, latest and pending versions
    Status,
    /// Apply every pending migration
    Up,
    /// Roll back to an earlier version
    Down {
        /// Target version (0 removes the whole schema)
        #[arg(long)]
        to: u32,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Delete expired entries and evict down to cache.max_entries
    Cleanup,
    /// Delete entries whose key matches a SQL LIKE pattern
    Invalidate {
        /// Pattern such as 'summary:conv1:%'
        pattern: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load()?;

    // Log to stderr so stdout stays clean for MCP JSON-RPC.
    let filter = EnvFilter::try_new(&config.server.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve { http } => {
            if http || config.server.transport == "http" {
                server::serve_http(config).await?;
            } else {
                server::serve_stdio(config).await?;
            }
        }
        Command::Migrate { action } => match action {
            MigrateAction::Status => cli::migrate::status(&config)?,
            MigrateAction::Up => cli::migrate::up(&config)?,
            MigrateAction::Down { to } => cli::migrate::down(&config, to)?,
        },
        Command::Doctor => cli::doctor::doctor(&config)?,
        Command::Stats => cli::stats::stats(&config).await?,
        Command::Cache { action } => match action {
            CacheAction::Cleanup => cli::cache::cleanup(&config).await?,
            CacheAction::Invalidate { pattern } => cli::cache::invalidate(&config, &pattern).await?,
        },
    }

    Ok(())
}
