//! panel-guard daemon.
//!
//! Loads configuration, builds the security core, runs its maintenance
//! tasks and hot-reloads rate-limit settings until SIGINT or SIGTERM.

use std::path::PathBuf;

use clap::Parser;

use panel_guard::config::loader::load_config;
use panel_guard::config::watcher::ConfigWatcher;
use panel_guard::config::GuardConfig;
use panel_guard::lifecycle::{wait_for_signal, SecurityCore};
use panel_guard::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "panel-guard", version, about = "Admin panel security core")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "PANEL_GUARD_CONFIG", default_value = "panel-guard.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config_exists = args.config.exists();
    let config = if config_exists {
        load_config(&args.config)?
    } else {
        GuardConfig::default()
    };

    logging::init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "panel-guard starting");
    if !config_exists {
        tracing::warn!(path = %args.config.display(), "Config file not found, using defaults");
    }

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let core = SecurityCore::from_config(&config)?;
    let tasks = core.start();

    let (watcher, mut updates) = ConfigWatcher::new(&args.config);
    let _watch_guard = if config_exists {
        Some(watcher.run()?)
    } else {
        None
    };

    let signal = wait_for_signal();
    tokio::pin!(signal);
    loop {
        tokio::select! {
            Some(updated) = updates.recv() => core.apply_config(&updated),
            _ = &mut signal => break,
        }
    }

    tasks.stop().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
