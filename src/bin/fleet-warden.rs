//! fleet-warden: the fleet daemon.
//!
//! # Usage
//!
//! ```text
//! fleet-warden --config fleet.json run
//! fleet-warden --config fleet.json check-updates
//! fleet-warden --config fleet.json backup
//! fleet-warden --config fleet.json next-task
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use fleet_warden::config::LoggingSettings;
use fleet_warden::{ConfigHandle, FleetManager, Services};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "fleet-warden", about = "Dedicated server fleet manager")]
struct Cli {
    /// Configuration document (JSON, or YAML by extension).
    #[arg(long, short, default_value = "fleet.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run monitors, the scheduler and the watchdog until Ctrl-C.
    Run,
    /// Compare installed builds with the build feed and exit.
    CheckUpdates,
    /// Back up every active server and exit.
    Backup,
    /// Print the next scheduled task.
    NextTask,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ConfigHandle::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let _log_guard = init_tracing(&config.read().logging)?;

    let services = Services::from_config(&config.read());
    let fleet = FleetManager::new(config, services);

    match cli.command {
        Command::Run => run(fleet).await,
        Command::CheckUpdates => {
            for (name, result) in fleet.check_updates().await {
                println!(
                    "{:<20} installed {:<12} latest {:<12} {}",
                    name,
                    result.installed_build.as_deref().unwrap_or("?"),
                    result.latest_build.as_deref().unwrap_or("?"),
                    if result.update_available { "UPDATE AVAILABLE" } else { "" }
                );
            }
            Ok(())
        }
        Command::Backup => {
            let report = fleet.backup_now().await?;
            for archive in &report.archives {
                println!("{:<20} {}", archive.server, archive.path.display());
            }
            for (server, error) in &report.failures {
                eprintln!("{:<20} failed: {}", server, error);
            }
            println!("{} expired archives deleted", report.pruned);
            Ok(())
        }
        Command::NextTask => {
            match fleet.next_scheduled() {
                Some((task, at)) => println!("{} ({}) at {}", task.name, task.kind, at),
                None => println!("No scheduled task"),
            }
            Ok(())
        }
    }
}

async fn run(fleet: FleetManager) -> anyhow::Result<()> {
    tracing::info!(servers = fleet.servers().len(), "fleet-warden starting");
    fleet.start();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    tracing::info!("Shutdown requested");
    fleet.shutdown();
    Ok(())
}

/// Console logging, plus a daily rolling file when a log directory is configured.
fn init_tracing(
    settings: &LoggingSettings,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,fleet_warden=debug"))
        .context("building log filter")?;

    let (file_writer, guard) = match settings.directory.as_deref() {
        Some(dir) => {
            let (writer, guard) = rolling_file(dir)?;
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(file_writer.map(|writer| fmt::layer().with_writer(writer).with_ansi(false)))
        .init();

    Ok(guard)
}

fn rolling_file(
    dir: &Path,
) -> anyhow::Result<(
    tracing_appender::non_blocking::NonBlocking,
    tracing_appender::non_blocking::WorkerGuard,
)> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let appender = tracing_appender::rolling::daily(dir, "fleet-warden.log");
    Ok(tracing_appender::non_blocking(appender))
}
