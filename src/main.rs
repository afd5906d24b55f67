//! Shield proxy binary.
//!
//! Startup order: config → logging → metrics → store → worker → background
//! tasks → admin listener → gateway listener. The gateway runs in the
//! foreground until SIGINT/SIGTERM, then every task drains through the
//! shared shutdown broadcast.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use shield_proxy::admin;
use shield_proxy::clock::{SharedClock, SystemClock};
use shield_proxy::config::{load_config, watcher::ConfigWatcher, ShieldConfig};
use shield_proxy::lifecycle::{build_worker, signals, startup, Shutdown};
use shield_proxy::observability::{logging, metrics};
use shield_proxy::store::{CounterStore, MemoryStore};
use shield_proxy::HttpServer;

#[derive(Parser)]
#[command(name = "shield-proxy", version, about = "Rate limiting and IP ban gateway")]
struct Args {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Do not watch the config file for middleware overrides.
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ShieldConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = ?args.config, "shield-proxy starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let clock: SharedClock = Arc::new(SystemClock);
    let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new(clock.clone()));
    let worker = build_worker(config, store, clock)?;

    let shutdown = Shutdown::new();
    signals::trigger_on_signal(shutdown.clone());
    let mut tasks = worker.spawn_background(&shutdown);

    // Keep the watcher handle alive for the life of the process.
    let _watcher = match (&args.config, args.no_watch) {
        (Some(path), false) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            match watcher.run() {
                Ok(handle) => {
                    tasks.push(tokio::spawn(startup::reload_overrides(
                        worker.pipeline.clone(),
                        updates,
                        shutdown.subscribe(),
                    )));
                    Some(handle)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Config watcher unavailable, hot reload disabled");
                    None
                }
            }
        }
        _ => None,
    };

    let admin_config = &worker.config.admin;
    if admin_config.enabled {
        let listener = TcpListener::bind(&admin_config.bind_address).await?;
        let router = admin::setup_admin_router(worker.clone());
        let rx = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = admin::serve(router, listener, rx).await {
                tracing::error!(error = %e, "Admin API failed");
            }
        }));
    }

    let listener = TcpListener::bind(&worker.config.listener.bind_address).await?;
    tracing::info!(
        address = %listener.local_addr()?,
        max_connections = worker.config.listener.max_connections,
        request_timeout_secs = worker.config.timeouts.request_secs,
        "Listening for connections"
    );

    let result = HttpServer::new(&worker)
        .run(listener, shutdown.subscribe())
        .await;

    shutdown.trigger();
    for task in tasks {
        let _ = task.await;
    }

    result?;
    tracing::info!("Shutdown complete");
    Ok(())
}
