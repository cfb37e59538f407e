//! Product administration.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use opsd_core::id::now_iso;
use opsd_core::product::{Product, ProductStatus, RiskLevel};
use opsd_daemon::store::{products, Store};

/// Product subcommands.
#[derive(Subcommand, Debug)]
pub enum ProductCommand {
    /// Create or update a product (preserves created_at on update)
    Upsert {
        /// Unique short slug
        #[arg(long)]
        id: String,
        /// Display name
        #[arg(long)]
        name: String,
        /// active, paused, or killed
        #[arg(long, default_value = "active")]
        status: ProductStatus,
        /// low, normal, or high
        #[arg(long, default_value = "normal")]
        risk_level: RiskLevel,
    },
    /// List all products
    List,
}

/// Runs a product subcommand against the store at `store_dir`.
///
/// # Errors
///
/// Returns any store or validation failure.
pub fn run(store_dir: &Path, command: ProductCommand) -> Result<()> {
    let store = Store::open(store_dir).context("failed to open store")?;
    let conn = store.lock().map_err(|e| anyhow::anyhow!("{e}"))?;

    match command {
        ProductCommand::Upsert {
            id,
            name,
            status,
            risk_level,
        } => {
            let now = now_iso();
            let created_at = products::get(&conn, &id)?
                .map_or_else(|| now.clone(), |existing| existing.created_at);
            products::upsert(
                &conn,
                &Product {
                    id: id.clone(),
                    name,
                    status,
                    risk_level,
                    created_at,
                    updated_at: now,
                },
            )?;
            println!("product {id} upserted");
        }
        ProductCommand::List => {
            for product in products::list(&conn)? {
                println!(
                    "{:<16} {:<8} {:<8} {}",
                    product.id, product.status, product.risk_level, product.name
                );
            }
        }
    }
    Ok(())
}
