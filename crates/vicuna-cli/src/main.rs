//! Vicuna CLI - chat with a local Vicuna model from the terminal.

use clap::{Parser, Subcommand};

mod commands;

/// Vicuna - run a local Vicuna model through llama.cpp
#[derive(Parser)]
#[command(name = "vicuna")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    session: commands::SessionArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the executable and model weights if they are missing
    Pull {
        /// Download again even if the files exist
        #[arg(long)]
        force: bool,
    },

    /// Send one or more prompts and print the responses
    Ask {
        /// Prompts, sent in order to the same session
        #[arg(required = true)]
        prompts: Vec<String>,
    },

    /// Start an interactive chat
    Chat,

    /// Show the resolved configuration
    Info,
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose { "debug" } else { "warn" };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let overrides = cli.session.overrides()?;

    match cli.command {
        Commands::Pull { force } => block_on(commands::pull::run(overrides, force)),
        Commands::Ask { prompts } => block_on(commands::ask::run(overrides, &prompts)),
        Commands::Chat => block_on(commands::chat::run(overrides)),
        Commands::Info => commands::info::run(overrides),
    }
}

fn block_on(command: impl std::future::Future<Output = miette::Result<()>>) -> miette::Result<()> {
    tokio::runtime::Runtime::new()
        .map_err(|e| miette::miette!("Failed to start async runtime: {}", e))?
        .block_on(command)
}
