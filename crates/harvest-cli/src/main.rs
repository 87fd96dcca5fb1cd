use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use harvest_sync::{HarvestConfig, HarvestRunner, TargetOutcome};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const LOG_TARGETS: [&str; 5] = [
    "harvest_cli",
    "harvest_sync",
    "harvest_storage",
    "harvest_adapters",
    "harvest_core",
];

#[derive(Debug, Parser)]
#[command(name = "harvest-cli")]
#[command(about = "Instructor profile harvester")]
struct Cli {
    #[command(flatten)]
    options: RunOptions,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Discover targets and scrape every one missing from the output.
    Run,
    /// Build or print the cached target list.
    Discover {
        /// Ignore the cache and fetch the listing again.
        #[arg(long)]
        refresh: bool,
    },
    /// Compare the cached target list against the output file.
    Status,
}

#[derive(Debug, Args)]
struct RunOptions {
    /// Output CSV path.
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,
    /// Number of concurrent browser workers.
    #[arg(short = 't', long = "threads", global = true)]
    threads: Option<usize>,
    /// Proxy used for listing-page requests.
    #[arg(short = 'p', long = "proxies", global = true)]
    proxy: Option<String>,
    /// Delay in seconds after each listing page and scraped profile.
    #[arg(short, long, global = true)]
    delay: Option<f64>,
    /// Rediscover targets and discard previous output.
    #[arg(short, long, global = true)]
    clean: bool,
    /// Target list cache path.
    #[arg(long, global = true)]
    urls_file: Option<PathBuf>,
    /// Attempts per profile before giving up.
    #[arg(long, global = true)]
    max_retries: Option<usize>,
    #[arg(long, global = true, overrides_with = "headed")]
    headless: bool,
    /// Show the browser window.
    #[arg(long, global = true, overrides_with = "headless")]
    headed: bool,
    /// User agent presented by the browser.
    #[arg(long = "browser-agent", global = true)]
    browser_agent: Option<String>,
    /// Print the run summary as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[arg(short, long, global = true)]
    verbose: bool,
}

impl RunOptions {
    /// Overlay flags the user passed onto the environment-derived config.
    fn apply(&self, mut config: HarvestConfig) -> Result<HarvestConfig> {
        if let Some(output) = &self.output {
            config.output_path = output.clone();
        }
        if let Some(threads) = self.threads {
            config.concurrency = threads.max(1);
        }
        if let Some(proxy) = &self.proxy {
            config.proxy = Some(proxy.clone());
        }
        if let Some(delay) = self.delay {
            config.delay = Duration::try_from_secs_f64(delay)
                .with_context(|| format!("invalid delay {delay}"))?;
        }
        if self.clean {
            config.clean = true;
        }
        if let Some(path) = &self.urls_file {
            config.targets_path = path.clone();
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if self.headed {
            config.headless = false;
        } else if self.headless {
            config.headless = true;
        }
        if let Some(agent) = &self.browser_agent {
            config.user_agent = agent.clone();
        }
        Ok(config)
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let default_filter = LOG_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",");

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.options.verbose);

    let config = cli.options.apply(HarvestConfig::from_env())?;
    let runner = HarvestRunner::new(config);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = runner.run_once().await?;
            if cli.options.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                for report in &summary.targets {
                    if let TargetOutcome::Failed { error } = &report.outcome {
                        eprintln!(
                            "failed after {} attempts: {} ({error})",
                            report.attempts, report.target
                        );
                    }
                }
                println!(
                    "harvest complete: run_id={} discovered={} skipped={} succeeded={} unavailable={} failed={} rows={} output={}",
                    summary.run_id,
                    summary.discovered,
                    summary.skipped_seen,
                    summary.succeeded,
                    summary.unavailable,
                    summary.failed,
                    summary.rows_written,
                    summary.output_path
                );
            }
        }
        Commands::Discover { refresh } => {
            let targets = runner.discover(refresh || runner.config().clean).await?;
            println!(
                "{} targets cached at {}",
                targets.len(),
                runner.config().targets_path.display()
            );
        }
        Commands::Status => {
            let status = runner.status().await?;
            if cli.options.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else if !status.cache_present {
                println!(
                    "no target list at {}; run `harvest-cli discover` first",
                    runner.config().targets_path.display()
                );
            } else {
                println!(
                    "total={} done={} remaining={}",
                    status.total, status.done, status.remaining
                );
            }
        }
    }

    Ok(())
}
