//! Capability grant administration.
//!
//! Grants enforce the same invariants the broker assumes: L2/L3 carry an
//! expiry within seven days of the grant, and L3 requires two prior
//! approvals from distinct groups, recorded alongside the grant.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use opsd_core::capability::{validate_grant, AccessLevel, Capability};
use opsd_core::group::GroupRegistry;
use opsd_core::id::now_iso;
use opsd_daemon::store::{capabilities, Store};

/// Capability subcommands.
#[derive(Subcommand, Debug)]
pub enum CapabilityCommand {
    /// Grant (or re-grant) provider access to a group
    Grant {
        /// Receiving group
        #[arg(long)]
        group: String,
        /// Provider name
        #[arg(long)]
        provider: String,
        /// Access level 0..=3
        #[arg(long)]
        level: u8,
        /// Allowed actions (repeatable); empty means any within level
        #[arg(long = "allow")]
        allowed: Vec<String>,
        /// Denied actions (repeatable); win over the allow list
        #[arg(long = "deny")]
        denied: Vec<String>,
        /// Expiry (UTC ISO-8601); required for L2/L3
        #[arg(long)]
        expires_at: Option<String>,
        /// Approving groups for L3 grants (repeat twice, distinct)
        #[arg(long = "approved-by")]
        approved_by: Vec<String>,
        /// Granting actor
        #[arg(long, default_value = "main")]
        granted_by: String,
    },
    /// Revoke a grant (flips active off; history is kept)
    Revoke {
        /// Group the grant belongs to
        #[arg(long)]
        group: String,
        /// Provider the grant covers
        #[arg(long)]
        provider: String,
    },
    /// List all grants
    List,
}

/// Runs a capability subcommand against the store at `store_dir`.
///
/// # Errors
///
/// Returns validation failures (bad level, expiry bound, missing
/// approvals) and store errors.
pub fn run(store_dir: &Path, command: CapabilityCommand) -> Result<()> {
    let store = Store::open(store_dir).context("failed to open store")?;
    let conn = store.lock().map_err(|e| anyhow::anyhow!("{e}"))?;
    let registry = GroupRegistry::default();

    match command {
        CapabilityCommand::Grant {
            group,
            provider,
            level,
            allowed,
            denied,
            expires_at,
            approved_by,
            granted_by,
        } => {
            registry.require(&group).map_err(|e| anyhow::anyhow!("{e}"))?;
            let Some(level) = AccessLevel::from_u8(level) else {
                bail!("level must be 0..=3");
            };
            let granted_at = now_iso();
            validate_grant(level, &granted_at, expires_at.as_deref(), &approved_by)
                .map_err(|e| anyhow::anyhow!("{e}"))?;

            for approver in &approved_by {
                registry
                    .require(approver)
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
                capabilities::record_grant_approval(
                    &conn, &group, &provider, approver, &granted_at,
                )?;
            }
            capabilities::upsert(
                &conn,
                &Capability {
                    group_folder: group.clone(),
                    provider: provider.clone(),
                    access_level: level,
                    allowed_actions: allowed,
                    denied_actions: denied,
                    granted_by,
                    granted_at,
                    expires_at,
                    active: true,
                },
            )?;
            println!("capability granted: {group} -> {provider} (L{})", level.as_u8());
        }
        CapabilityCommand::Revoke { group, provider } => {
            if capabilities::revoke(&conn, &group, &provider)? {
                println!("capability revoked: {group} -> {provider}");
            } else {
                bail!("no grant found for {group} -> {provider}");
            }
        }
        CapabilityCommand::List => {
            for cap in capabilities::list(&conn)? {
                println!(
                    "{:<12} {:<12} L{} active={} expires={}",
                    cap.group_folder,
                    cap.provider,
                    cap.access_level.as_u8(),
                    cap.active,
                    cap.expires_at.as_deref().unwrap_or("-"),
                );
            }
        }
    }
    Ok(())
}
