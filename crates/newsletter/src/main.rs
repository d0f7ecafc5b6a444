//! Newsletter CLI - send the configured newsletter now or on a schedule.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter};

use newsletter::{
    ConfigFile, IntervalScheduler, LogProgress, NewsletterConfig, NewsletterJob, RunOutcome,
    DEFAULT_INTERVAL, NEWSLETTER_TASK,
};

/// Newsletter CLI - deliver an HTML newsletter over SMTP.
#[derive(Parser)]
#[command(name = "newsletter")]
#[command(about = "Scheduled HTML newsletter delivery over SMTP")]
#[command(version)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true, default_value = "newsletter.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send the newsletter once, now
    Send,

    /// Send the newsletter on a fixed interval until interrupted
    Schedule {
        /// Hours between runs (defaults to the task's trigger, 168)
        #[arg(long)]
        interval_hours: Option<u64>,

        /// Send once at startup instead of waiting a full interval
        #[arg(long)]
        run_on_start: bool,
    },

    /// Show the task descriptor and its default trigger
    Task,
}

fn filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("newsletter=debug,info")
        } else {
            EnvFilter::new("newsletter=info,warn")
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; `debug_mode` in the config can raise the level later.
    let (filter_layer, filter_handle) = reload::Layer::new(filter(cli.verbose));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter_layer)
        .init();

    match cli.command {
        Commands::Task => {
            run_task_info();
            Ok(())
        }
        Commands::Send => {
            let config = load_config(&cli.config).await?;
            if config.debug_mode && !cli.verbose {
                filter_handle
                    .reload(filter(true))
                    .context("Failed to enable debug logging")?;
            }
            run_send(&cli.config, &config).await
        }
        Commands::Schedule {
            interval_hours,
            run_on_start,
        } => {
            let config = load_config(&cli.config).await?;
            if config.debug_mode && !cli.verbose {
                filter_handle
                    .reload(filter(true))
                    .context("Failed to enable debug logging")?;
            }
            run_schedule(&cli.config, interval_hours, run_on_start).await
        }
    }
}

async fn load_config(path: &Path) -> Result<NewsletterConfig> {
    let config = NewsletterConfig::from_file(path)
        .await
        .with_context(|| format!("Failed to load config from {}", path.display()))?;

    tracing::info!(
        path = %path.display(),
        host = %config.smtp.host,
        port = config.smtp.port,
        implicit_tls = config.smtp.use_ssl,
        "Loaded configuration"
    );
    Ok(config)
}

/// The file is re-read on every run, connection settings included.
fn build_job(path: &Path) -> NewsletterJob {
    NewsletterJob::new(Arc::new(ConfigFile::new(path)))
}

async fn run_send(path: &Path, config: &NewsletterConfig) -> Result<()> {
    let job = build_job(path);

    match job.run(&CancellationToken::new(), &LogProgress).await {
        RunOutcome::Delivered => {
            println!("✅ Newsletter sent to {}", config.email.to_addr);
            Ok(())
        }
        RunOutcome::Cancelled => {
            println!("Newsletter run cancelled");
            Ok(())
        }
        RunOutcome::Failed(e) => bail!("Newsletter was not delivered: {e}"),
        RunOutcome::Faulted(reason) => bail!("Newsletter run failed: {reason}"),
    }
}

async fn run_schedule(
    path: &Path,
    interval_hours: Option<u64>,
    run_on_start: bool,
) -> Result<()> {
    let job = build_job(path);

    let scheduler = match interval_hours {
        Some(0) => bail!("--interval-hours must be at least 1"),
        Some(hours) => IntervalScheduler::new(Duration::from_secs(hours * 3600)),
        None => job
            .default_triggers()
            .into_iter()
            .next()
            .map(IntervalScheduler::from_trigger)
            .context("Task has no default trigger")?,
    }
    .run_on_start(run_on_start);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                return;
            }
            tracing::info!("Interrupt received, stopping scheduler");
            cancel.cancel();
        });
    }

    let stats = scheduler.run(&job, &cancel).await;
    println!(
        "\n📊 Scheduler Summary\n   Runs: {}\n   Delivered: {}",
        stats.runs, stats.delivered
    );
    Ok(())
}

fn run_task_info() {
    println!("📬 {}", NEWSLETTER_TASK.name);
    println!("   Description: {}", NEWSLETTER_TASK.description);
    println!("   Category: {}", NEWSLETTER_TASK.category);
    println!("   Key: {}", NEWSLETTER_TASK.key);
    println!(
        "   Default trigger: every {} hours",
        DEFAULT_INTERVAL.as_secs() / 3600
    );
}
