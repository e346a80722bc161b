//! CLI command implementations

use crate::output::{format_bytes, print_summary};
use crate::progress::TaskProgressBars;
use crate::OutputFormat;
use anyhow::{bail, Context, Result};
use clap::Args;
use console::style;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use vodfetch_core::engine::ResumeStore;
use vodfetch_core::DownloadManager;
use vodfetch_types::{EngineConfig, EngineEvent, PlaylistEntry, ProviderConfig};

/// Portal credentials given on the command line
#[derive(Args, Debug, Default)]
pub struct ProviderArgs {
    /// Portal base URL, e.g. http://portal.example.com:8080
    #[arg(long)]
    provider_url: Option<String>,

    #[arg(long, requires = "provider_url")]
    username: Option<String>,

    #[arg(long, env = "VODFETCH_PASSWORD", hide_env_values = true, requires = "provider_url")]
    password: Option<String>,

    /// Send the token as this query parameter instead of a bearer header
    #[arg(long, requires = "provider_url")]
    token_param: Option<String>,
}

impl ProviderArgs {
    /// Add the command-line provider to `config`
    pub fn apply(self, config: &mut EngineConfig) -> Result<()> {
        let Some(base_url) = self.provider_url else {
            return Ok(());
        };
        let (Some(username), Some(password)) = (self.username, self.password) else {
            bail!("--provider-url needs --username and --password");
        };

        let mut provider = ProviderConfig {
            name: String::new(),
            base_url,
            username,
            password,
            token_param: self.token_param,
            token_ttl_secs: 600,
        };
        provider.name = provider.host().context("provider URL has no host")?;
        config.providers.retain(|p| p.name != provider.name);
        config.providers.push(provider);
        Ok(())
    }
}

// ============================================================================
// Download Commands
// ============================================================================

pub async fn run_entries(
    config: EngineConfig,
    entries_path: &Path,
    concurrency: Option<usize>,
    format: OutputFormat,
) -> Result<()> {
    let content = tokio::fs::read_to_string(entries_path)
        .await
        .with_context(|| format!("cannot read {}", entries_path.display()))?;
    let entries: Vec<PlaylistEntry> =
        serde_json::from_str(&content).context("entries file is not a JSON list of entries")?;

    let output_dir = config.output_dir.clone();
    let concurrency = concurrency.unwrap_or(config.max_concurrent_tasks);
    let manager = Arc::new(DownloadManager::new(config).await?);
    let events = manager.subscribe();

    manager.enqueue_entries(&entries, &output_dir)?;
    drive(manager, events, concurrency, format).await
}

pub async fn resume_pending(
    config: EngineConfig,
    concurrency: Option<usize>,
    format: OutputFormat,
) -> Result<()> {
    let concurrency = concurrency.unwrap_or(config.max_concurrent_tasks);
    let manager = Arc::new(DownloadManager::new(config).await?);
    let events = manager.subscribe();

    if manager.resume().await?.is_empty() {
        println!("{} Nothing to resume", style("○").dim());
        return Ok(());
    }
    drive(manager, events, concurrency, format).await
}

/// Run the queued batch with live output; Ctrl-C pauses instead of killing
async fn drive(
    manager: Arc<DownloadManager>,
    mut events: tokio::sync::broadcast::Receiver<EngineEvent>,
    concurrency: usize,
    format: OutputFormat,
) -> Result<()> {
    let render = tokio::spawn(async move {
        let mut bars = TaskProgressBars::new();
        loop {
            match events.recv().await {
                Ok(event) => {
                    match format {
                        OutputFormat::Json => {
                            if let Ok(line) = serde_json::to_string(&event) {
                                println!("{}", line);
                            }
                        }
                        OutputFormat::Human | OutputFormat::Table => bars.handle_event(&event),
                    }
                    if matches!(event, EngineEvent::BatchCompleted { .. }) {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let pauser = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{} Pausing, progress is kept...", style("⏸").yellow());
                manager.pause().await;
            }
        })
    };

    let summary = manager.run(concurrency).await;
    pauser.abort();
    let _ = render.await;

    print_summary(&summary, format)?;
    if summary.failed > 0 {
        bail!("{} download(s) failed", summary.failed);
    }
    Ok(())
}

// ============================================================================
// Resume Records
// ============================================================================

pub async fn list_pending(config: &EngineConfig, format: OutputFormat) -> Result<()> {
    let store = ResumeStore::new(vodfetch_core::config::state_dir(config)).await?;
    let records = store.list().await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct PendingRow {
                destination: String,
                done: String,
                size: String,
                progress: String,
            }

            let rows: Vec<PendingRow> = records
                .iter()
                .map(|r| PendingRow {
                    destination: r.destination.display().to_string(),
                    done: format_bytes(r.completed_bytes()),
                    size: r
                        .total_size
                        .map(format_bytes)
                        .unwrap_or_else(|| "?".to_string()),
                    progress: format!("{:.1}%", r.progress()),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if records.is_empty() {
                println!("{} No interrupted downloads", style("○").dim());
                return Ok(());
            }
            for record in &records {
                println!(
                    "{} {} {}",
                    style(format!("{:>5.1}%", record.progress())).yellow(),
                    style(record.destination.display()).cyan(),
                    style(format!("({})", record.source_url)).dim()
                );
            }
        }
    }

    Ok(())
}
