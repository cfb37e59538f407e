//! opsd-daemon - governance control plane daemon.
//!
//! Startup order matters: tracing first so the secret preflight can
//! warn, then configuration (fails fast on missing secrets), then the
//! store, then the background tasks (alert driver, cleanup sweep), and
//! finally the HTTP listener. Shutdown is signal-driven; in-flight
//! transactions are small and bounded, so the process can stop as soon
//! as the listener drains.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use opsd_core::events::EventBus;
use opsd_core::group::GroupRegistry;
use opsd_daemon::alert_driver::{self, TracingSink};
use opsd_daemon::broker::ExtBroker;
use opsd_daemon::config::Config;
use opsd_daemon::engine::GovernanceEngine;
use opsd_daemon::http::{router, AppState};
use opsd_daemon::store::Store;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// How often the stale ext-call sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Terminal ext-call rows older than this are swept.
const SWEEP_MAX_AGE_DAYS: i64 = 30;

/// opsd daemon - governance engine, broker, and HTTP surface
#[derive(Parser, Debug)]
#[command(name = "opsd-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Store directory (overrides OPSD_STORE_DIR)
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// HTTP listen port (overrides OPSD_HTTP_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::from_env().context("configuration preflight failed")?;
    if let Some(store_dir) = args.store_dir {
        config.store_dir = store_dir;
    }
    if let Some(port) = args.port {
        config.http_port = port;
    }

    let store = Store::open(&config.store_dir)
        .with_context(|| format!("failed to open store at {:?}", config.store_dir))?;
    info!(store_dir = ?config.store_dir, strict = config.strict, "store opened");

    let bus = EventBus::default();
    let registry = GroupRegistry::default();
    let engine = GovernanceEngine::new(store.clone(), bus.clone(), registry, config.strict);
    let broker = ExtBroker::from_config(store.clone(), &config);

    // Alert driver. The Telegram transport is an external collaborator;
    // without it, alerts land in the daemon log.
    if !config.telegram_enabled() {
        info!("telegram alerting not configured; alerts go to the log only");
    }
    let alert_task = alert_driver::spawn(&bus, config.alerts.clone(), Arc::new(TracingSink));

    // Hourly sweep of stale terminal ext-call rows.
    let sweep_engine = engine.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = sweep_engine.sweep_ext_calls(SWEEP_MAX_AGE_DAYS) {
                warn!(error = %e, "ext-call sweep failed");
            }
        }
    });

    let addr: SocketAddr = ([0, 0, 0, 0], config.http_port).into();
    let state = Arc::new(AppState {
        engine,
        broker,
        config,
    });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "opsd daemon listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    info!("shutting down");
    sweep_task.abort();
    alert_task.abort();
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}
