//! # vivify-server
//!
//! Vivify server binary: loads settings, wires the task store to the
//! connection registry, and serves `/ws`, `/health`, and `/metrics`.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use vivify_realtime::{BatchConfig, ConnectionRegistry, RealtimeServer, ServerConfig, TaskPublisher};
use vivify_settings::VivifySettings;
use vivify_tasks::TaskStore;

/// Vivify real-time task update server.
#[derive(Parser, Debug)]
#[command(name = "vivify-server", about = "Vivify real-time task update server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (defaults to `~/.vivify/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, settings: &mut VivifySettings) {
        if let Some(ref host) = self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
    }
}

fn resolve_settings(cli: &Cli) -> Result<VivifySettings> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(vivify_settings::settings_path);
    let mut settings = vivify_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);
    Ok(settings)
}

fn build_server(settings: &VivifySettings) -> RealtimeServer {
    let registry = ConnectionRegistry::new(BatchConfig::from(&settings.batching));
    let store = TaskStore::seeded().with_publisher(TaskPublisher::new(Arc::clone(&registry)));
    tracing::info!(tasks = store.len(), "task store seeded");
    RealtimeServer::new(ServerConfig::from(&settings.server), registry, Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = resolve_settings(&cli)?;

    vivify_core::logging::init_subscriber(&settings.logging.level);

    let metrics = vivify_realtime::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let server = build_server(&settings).with_metrics(metrics);
    let (addr, handle) = server
        .listen()
        .await
        .context("Failed to bind server")?;

    tracing::info!(
        batching = settings.batching.enabled,
        max_batch_size = settings.batching.max_batch_size,
        max_batch_delay_ms = settings.batching.max_batch_delay_ms,
        "Vivify listening on http://{addr}"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    let report = server.shutdown().drain(handle, None).await;
    tracing::info!(
        flushed = report.flushed,
        forced = report.forced,
        timed_out = report.timed_out,
        "Shutdown complete"
    );
    Ok(())
}
