//! vodfetch CLI - headless runner for the download engine
//!
//! Feeds playlist entries to the engine, renders progress and maps Ctrl-C
//! to a clean pause.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// vodfetch - resumable IPTV VOD downloader
#[derive(Parser)]
#[command(name = "vodfetch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Engine config file (JSON)
    #[arg(long, global = true, env = "VODFETCH_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding resume records
    #[arg(long, global = true, env = "VODFETCH_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "human")]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the entries of a playlist export
    Run {
        /// JSON array of {name, source_url, kind}
        #[arg(short, long)]
        entries: PathBuf,

        /// Root directory for downloads
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Files downloaded at once
        #[arg(short, long)]
        concurrency: Option<usize>,

        #[command(flatten)]
        provider: commands::ProviderArgs,
    },

    /// Continue every interrupted download
    Resume {
        /// Files downloaded at once
        #[arg(short, long)]
        concurrency: Option<usize>,

        #[command(flatten)]
        provider: commands::ProviderArgs,
    },

    /// List interrupted downloads
    Pending,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "vodfetch=debug" } else { "vodfetch=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => vodfetch_core::config::load_config(path).await?,
        None => Default::default(),
    };
    if cli.state_dir.is_some() {
        config.state_dir = cli.state_dir.clone();
    }
    tracing::debug!(
        "Resume records under {:?}",
        vodfetch_core::config::state_dir(&config)
    );

    match cli.command {
        Commands::Run {
            entries,
            output,
            concurrency,
            provider,
        } => {
            provider.apply(&mut config)?;
            if let Some(output) = output {
                config.output_dir = output;
            }
            commands::run_entries(config, &entries, concurrency, cli.format).await?
        }

        Commands::Resume {
            concurrency,
            provider,
        } => {
            provider.apply(&mut config)?;
            commands::resume_pending(config, concurrency, cli.format).await?
        }

        Commands::Pending => commands::list_pending(&config, cli.format).await?,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "vodfetch", &mut std::io::stdout());
        }
    }

    Ok(())
}
