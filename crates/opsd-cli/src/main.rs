//! opsd - admin CLI for the governance store.
//!
//! Products and capabilities are admin-only surfaces: they are managed
//! here (or by the engine) and never through the cockpit's HTTP
//! mutations. The CLI opens the store directly, so run it on the daemon
//! host; the store's single-writer lock serializes it against the
//! daemon's own writes.

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// opsd admin CLI
#[derive(Parser, Debug)]
#[command(name = "opsd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Store directory (defaults to OPSD_STORE_DIR or ./opsd-store)
    #[arg(long, global = true)]
    store_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage products
    Product {
        #[command(subcommand)]
        command: commands::product::ProductCommand,
    },
    /// Manage external-access capabilities
    Capability {
        #[command(subcommand)]
        command: commands::capability::CapabilityCommand,
    },
    /// Archive the store directory as a compressed tarball
    Backup(commands::backup::BackupArgs),
}

fn store_dir(cli: &Cli) -> PathBuf {
    cli.store_dir.clone().unwrap_or_else(|| {
        std::env::var("OPSD_STORE_DIR")
            .map_or_else(|_| PathBuf::from("opsd-store"), PathBuf::from)
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let store_dir = store_dir(&cli);

    match cli.command {
        Command::Product { command } => commands::product::run(&store_dir, command),
        Command::Capability { command } => commands::capability::run(&store_dir, command),
        Command::Backup(args) => commands::backup::run(&store_dir, &args),
    }
}
