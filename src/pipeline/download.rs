//! Download stage: stream an item's file to local storage.
//!
//! A partially written file never outlives a failed attempt: the file is owned by a
//! [`PartialFile`] guard that deletes it unless the download commits, which also covers
//! attempts cancelled by the job timeout.

use super::PipelineContext;
use crate::db::Item;
use crate::error::{Error, Result};
use crate::types::ItemId;
use futures::StreamExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;

/// Format tags recognised from a resource reference's extension
const KNOWN_FORMATS: &[&str] = &[
    "pdf", "epub", "mobi", "azw3", "azw", "djvu", "txt", "doc", "docx", "rtf", "zip", "rar", "7z",
    "gz", "cbz", "cbr",
];

/// Result of one download attempt
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DownloadReport {
    /// A local file was already recorded; nothing was done
    AlreadyDownloaded,
    /// Another worker is still writing the file; nothing was done
    InFlight,
    /// The file was downloaded and recorded
    Downloaded {
        /// Local path
        path: String,
        /// Bytes written
        bytes: u64,
        /// Format tag
        format: String,
        /// Links moved from pending to downloaded
        released_links: u64,
    },
}

/// Download the file of `item_id` unless it is already present or being written
pub async fn run(ctx: &PipelineContext, item_id: ItemId) -> Result<DownloadReport> {
    let item = ctx
        .db
        .get_item(item_id)
        .await?
        .ok_or_else(|| Error::Validation(format!("item {} does not exist", item_id)))?;

    if item.is_downloaded() {
        tracing::debug!(item_id = %item_id, "Item already downloaded");
        return Ok(DownloadReport::AlreadyDownloaded);
    }

    let resource_ref = item
        .resource_ref
        .as_deref()
        .filter(|r| !r.is_empty())
        .ok_or_else(|| {
            Error::Validation(format!("item {} has no resolved resource reference", item_id))
        })?;

    let config = &ctx.config.download;
    let format = detect_format(resource_ref);
    let path = target_path(&config.download_dir, &item, &format);

    if is_downloading(&path, config.in_flight_check_interval).await? {
        tracing::info!(item_id = %item_id, path = %path.display(), "Download already in progress elsewhere, skipping");
        return Ok(DownloadReport::InFlight);
    }

    tracing::info!(item_id = %item_id, resource_ref, path = %path.display(), "Starting download");

    let guard = PartialFile::new(path.clone());
    let bytes = match stream_to_file(ctx, &item, resource_ref, &path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(item_id = %item_id, error = %e, "Download failed, discarding partial file");
            return Err(e);
        }
    };
    guard.commit();

    let path_str = path.to_string_lossy().into_owned();
    let released_links = ctx
        .db
        .mark_downloaded(item_id, &path_str, bytes as i64, &format)
        .await?;

    tracing::info!(
        item_id = %item_id,
        bytes,
        released_links,
        "Download complete"
    );

    Ok(DownloadReport::Downloaded {
        path: path_str,
        bytes,
        format,
        released_links,
    })
}

async fn stream_to_file(
    ctx: &PipelineContext,
    item: &Item,
    resource_ref: &str,
    path: &Path,
) -> Result<u64> {
    let config = &ctx.config.download;
    let remote = ctx.collaborators.transport.stream(resource_ref).await?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = tokio::fs::File::create(path).await?;
    let mut writer = tokio::io::BufWriter::with_capacity(config.chunk_size, file);

    let mut stream = remote.stream;
    let mut written: u64 = 0;
    let mut last_log = Instant::now();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        writer.write_all(&chunk).await?;
        written += chunk.len() as u64;

        if last_log.elapsed() >= config.progress_log_interval {
            last_log = Instant::now();
            match remote.content_length {
                Some(total) if total > 0 => tracing::info!(
                    item_id = %item.id,
                    written,
                    total,
                    percent = written * 100 / total,
                    "Download progress"
                ),
                _ => tracing::info!(item_id = %item.id, written, "Download progress"),
            }
        }
    }

    writer.flush().await?;
    writer.into_inner().sync_all().await?;

    match remote.content_length {
        Some(expected) if expected != written => {
            return Err(Error::Transient(format!(
                "body truncated: expected {} bytes, got {}",
                expected, written
            )));
        }
        _ => {}
    }
    if written == 0 {
        return Err(Error::ResourceNotFound(format!(
            "{} returned an empty body",
            resource_ref
        )));
    }

    Ok(written)
}

/// Whether some other writer is growing the file at `path`
///
/// Samples the size twice, `interval` apart. This is a best-effort heuristic, not a lock:
/// a writer slower than the interval looks stale (leading to a redundant download) and a
/// file that happens to change for another reason delays this attempt.
pub async fn is_downloading(path: &Path, interval: Duration) -> Result<bool> {
    let Some(before) = file_size(path).await? else {
        return Ok(false);
    };
    tokio::time::sleep(interval).await;
    let Some(after) = file_size(path).await? else {
        return Ok(false);
    };
    if before == after {
        tracing::debug!(path = %path.display(), size = before, "Found stale partial file");
    }
    Ok(before != after)
}

pub(super) async fn file_size(path: &Path) -> Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Format tag from the extension of a resource reference; `bin` when unrecognised
pub fn detect_format(resource_ref: &str) -> String {
    let path = url::Url::parse(resource_ref)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| resource_ref.to_string());

    Path::new(&path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .filter(|e| KNOWN_FORMATS.contains(&e.as_str()))
        .unwrap_or_else(|| "bin".to_string())
}

/// `<download_dir>/<series>/<id>-<slug>.<format>`
fn target_path(download_dir: &Path, item: &Item, format: &str) -> PathBuf {
    let slug: String = item
        .title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let slug: String = slug.chars().take(80).collect();

    download_dir
        .join(sanitize_component(&item.series))
        .join(format!("{}-{}.{}", item.id, slug, format))
}

fn sanitize_component(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Deletes the file at `path` on drop unless committed
pub(super) struct PartialFile {
    path: PathBuf,
    committed: bool,
}

impl PartialFile {
    pub(super) fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    pub(super) fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Removed partial file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove partial file")
            }
        }
    }
}
