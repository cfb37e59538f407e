//! Store backup: one gzip tarball of the store directory.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Args;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::Builder;

/// Backup arguments.
#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Output directory for the archive (defaults to the current dir)
    #[arg(long)]
    out: Option<PathBuf>,
}

/// Archives the store directory as
/// `opsd-backup-<UTC-timestamp>.tar.gz`.
///
/// # Errors
///
/// Returns I/O failures and a missing store directory.
pub fn run(store_dir: &Path, args: &BackupArgs) -> Result<()> {
    if !store_dir.is_dir() {
        bail!("store directory {store_dir:?} does not exist");
    }
    let out_dir = args.out.clone().unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&out_dir).context("failed to create output directory")?;

    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let archive_path = out_dir.join(format!("opsd-backup-{stamp}.tar.gz"));

    let file = File::create(&archive_path)
        .with_context(|| format!("failed to create {archive_path:?}"))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);
    builder
        .append_dir_all("opsd-store", store_dir)
        .context("failed to archive store directory")?;
    builder
        .into_inner()
        .and_then(GzEncoder::finish)
        .context("failed to finalize archive")?;

    println!("backup written to {}", archive_path.display());
    Ok(())
}
