//! tmhub CLI — the main entry point.
//!
//! Commands:
//! - `serve`   — Start the server (gateway + delivery workers + sweepers)
//! - `migrate` — Run database migrations and exit
//! - `seed`    — Install built-in groups and the SSRF deny list
//! - `config`  — Configuration helpers

use clap::{Parser, Subcommand};
use uuid::Uuid;

mod commands;

#[derive(Parser)]
#[command(
    name = "tmhub",
    about = "tmhub — collaborative threat modeling server",
    version,
    long_about = "tmhub serves shared threat model diagrams over WebSocket sessions with \
role- and group-based authorization, and fans user-triggered add-on work out to \
external services over signed webhooks."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,

        /// Override the host (e.g. 0.0.0.0 for Docker)
        #[arg(long)]
        host: Option<String>,
    },

    /// Run database migrations and exit
    Migrate,

    /// Install built-in groups and the SSRF deny seed
    Seed {
        /// Also grant administrator capability to this user UUID
        #[arg(long)]
        admin: Option<Uuid>,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print a default tmhub.toml to stdout
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    match cli.command {
        Commands::Serve { port, host } => commands::serve::run(port, host).await,
        Commands::Migrate => commands::migrate::run().await,
        Commands::Seed { admin } => commands::seed::run(admin).await,
        Commands::Config { action } => match action {
            ConfigAction::Init => {
                print!("{}", tmhub_config::AppConfig::default_toml());
                Ok(())
            }
        },
    }
}
