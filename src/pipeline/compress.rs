//! Compress stage: pack a downloaded file into a 7z archive next to it.
//!
//! The archive is written under a `.7z.part` name and renamed into place once complete,
//! so a failed or cancelled attempt leaves no half-written archive behind.

use super::PipelineContext;
use super::download::{PartialFile, file_size};
use crate::error::{Error, Result};
use crate::types::ItemId;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Result of one compression
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompressReport {
    /// The item has no downloaded file yet; nothing was done
    NotDownloaded,
    /// The item's format is not compressed; nothing was done
    NotEligible,
    /// An archive was already recorded and is still on disk; nothing was done
    AlreadyCompressed,
    /// The archive was written and recorded
    Compressed {
        /// Archive path
        path: String,
        /// Size of the downloaded file
        original_size: u64,
        /// Size of the archive
        compressed_size: u64,
    },
}

/// Compress the downloaded file of `item_id` unless it is ineligible or already packed
pub async fn run(ctx: &PipelineContext, item_id: ItemId) -> Result<CompressReport> {
    let item = ctx
        .db
        .get_item(item_id)
        .await?
        .ok_or_else(|| Error::Validation(format!("item {} does not exist", item_id)))?;

    if !item.is_downloaded() {
        tracing::debug!(item_id = %item_id, "Nothing to compress yet");
        return Ok(CompressReport::NotDownloaded);
    }

    let format = item.format.as_deref().unwrap_or("bin");
    if !ctx.config.compression.applies_to(format) {
        tracing::debug!(item_id = %item_id, format, "Format is not compressed");
        return Ok(CompressReport::NotEligible);
    }

    if item.is_compressed() {
        let archive = item.compressed_path.as_deref().unwrap_or_default();
        if file_size(Path::new(archive)).await?.is_some_and(|size| size > 0) {
            tracing::debug!(item_id = %item_id, "Item already compressed");
            return Ok(CompressReport::AlreadyCompressed);
        }
        tracing::warn!(item_id = %item_id, archive, "Recorded archive is gone, compressing again");
    }

    let source = PathBuf::from(item.local_path.as_deref().unwrap_or_default());
    let Some(original_size) = file_size(&source).await? else {
        return Err(Error::FileMissing { path: source });
    };

    let archive = archive_path(&source);
    let partial = archive.with_extension("7z.part");
    tracing::info!(item_id = %item_id, path = %source.display(), "Compressing file");

    let guard = PartialFile::new(partial.clone());
    pack(&source, &partial).await?;
    tokio::fs::rename(&partial, &archive).await?;
    guard.commit();

    let compressed_size = file_size(&archive).await?.unwrap_or(0);
    let archive_str = archive.to_string_lossy().into_owned();
    if !ctx
        .db
        .mark_compressed(item_id, &archive_str, compressed_size as i64)
        .await?
    {
        // The item was deleted or re-downloaded under us
        tracing::warn!(item_id = %item_id, "Item changed during compression, discarding archive");
        if let Err(e) = tokio::fs::remove_file(&archive).await {
            tracing::warn!(path = %archive.display(), error = %e, "Failed to remove archive");
        }
        return Ok(CompressReport::NotDownloaded);
    }

    tracing::info!(
        item_id = %item_id,
        original_size,
        compressed_size,
        "Compression complete"
    );

    Ok(CompressReport::Compressed {
        path: archive_str,
        original_size,
        compressed_size,
    })
}

/// `<dir>/<stem>.7z` beside the source file
pub fn archive_path(source: &Path) -> PathBuf {
    source.with_extension("7z")
}

async fn pack(source: &Path, dest: &Path) -> Result<()> {
    let source_owned = source.to_path_buf();
    let dest_owned = dest.to_path_buf();

    // sevenz-rust is synchronous; keep it off the runtime threads
    tokio::task::spawn_blocking(move || sevenz_rust::compress_to_path(&source_owned, &dest_owned))
        .await
        .map_err(|e| Error::Other(format!("compression task panicked: {}", e)))?
        .map_err(|e| {
            Error::Other(format!(
                "failed to compress {} to 7z: {}",
                source.display(),
                e
            ))
        })
}
