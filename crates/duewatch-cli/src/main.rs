use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use duewatch_core::app::{ReminderService, ScanOutcome, ServiceBuilder, Wiring};
use duewatch_core::config::{Config, Transport};

const DEFAULT_CONFIG: &str = "duewatch.toml";

#[derive(Debug, Parser)]
#[command(name = "duewatch", version, about = "Overdue-task reminder scanner and consumer")]
struct Cli {
    /// Log filter, e.g. `info` or `duewatch_core=debug`.
    #[arg(long, global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scanner and the consumers until Ctrl-C.
    Run {
        /// Config file (defaults to ./duewatch.toml when present).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run a single scan pass and exit.
    Scan {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Write the default configuration file.
    Init {
        #[arg(default_value = DEFAULT_CONFIG)]
        path: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&cli.log).context("parse --log filter")?)
        .with(fmt::layer().with_target(false))
        .init();

    match cli.command {
        Command::Run { config } => run(config.as_deref()).await,
        Command::Scan { config } => scan(config.as_deref()).await,
        Command::Init { path, force } => init(&path, force),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let default = Path::new(DEFAULT_CONFIG);
    let path = match path {
        Some(path) => Some(path),
        None if default.exists() => Some(default),
        None => None,
    };
    let config = Config::load(path)?;
    match path {
        Some(path) => info!(config = %path.display(), "configuration loaded"),
        None => info!("no config file; using defaults"),
    }
    Ok(config)
}

async fn run(config: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let recover = config.queue.recover_on_start;
    let Wiring {
        queue,
        sqlite_broker,
        scanner,
        consumers,
        ..
    } = ServiceBuilder::new(config).build()?;

    if recover && let Some(broker) = &sqlite_broker {
        let recovered = broker
            .recover_unacked()
            .await
            .context("recover unacknowledged reminders")?;
        if recovered > 0 {
            info!(recovered, "returned unacknowledged reminders to the queue");
        }
    }

    info!(queue = %queue.describe(), "starting reminder service");
    let service = ReminderService::spawn(Some(scanner), consumers);

    tokio::signal::ctrl_c()
        .await
        .context("wait for Ctrl-C")?;
    info!("shutdown requested");

    let report = service.shutdown_and_join().await;
    for (name, exit) in &report.consumers {
        info!(consumer = %name, exit = ?exit, "consumer finished");
    }
    Ok(())
}

async fn scan(config: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config)?;
    if config.queue.transport == Transport::Memory {
        // reminders published here would vanish with the process, already marked sent
        bail!("`scan` needs a durable queue; set queue.transport = \"sqlite\"");
    }
    let wiring = ServiceBuilder::new(config).build()?;

    match wiring.scanner.scan_and_dispatch().await? {
        ScanOutcome::Idle => println!("no overdue tasks"),
        ScanOutcome::Dispatched(report) => {
            println!(
                "selected {}, published {}, marked sent {}",
                report.selected, report.published, report.marked
            );
            for task_id in &report.conflicts {
                println!("conflict: {task_id} changed while scanning; will be re-checked next scan");
            }
        }
    }
    Ok(())
}

fn init(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default().save_to(path)?;
    println!("wrote {}", path.display());
    Ok(())
}
