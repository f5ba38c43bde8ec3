use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "tweetwatch",
    version,
    about = "Relay new posts from watched accounts to Telegram",
    long_about = "Polls public timelines for a set of accounts and forwards every new post, with its media, to a Telegram chat"
)]
struct Cli {
    /// Path of the .env file holding the configuration (watched for changes)
    #[arg(long, env = "TWEETWATCH_ENV_FILE", default_value = ".env", global = true)]
    env_file: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch the configured accounts until interrupted
    Run,

    /// Fetch one account once and print the normalized posts as JSON
    Fetch {
        /// Account name (with or without @ symbol)
        #[arg(required = true)]
        account: String,

        /// Use the fallback feed instead of the primary source
        #[arg(long, default_value = "false")]
        fallback: bool,
    },

    /// Send a test message to the configured chat
    TestNotify,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize logging
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    if args.verbose {
        debug!("Verbose mode enabled");
    }

    match args.command {
        Commands::Run => commands::run::execute(&args.env_file).await?,
        Commands::Fetch { account, fallback } => {
            commands::fetch::execute(&args.env_file, &account, fallback).await?
        }
        Commands::TestNotify => commands::test_notify::execute(&args.env_file).await?,
    }

    Ok(())
}
