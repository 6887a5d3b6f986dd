//! Distribute stage: send downloaded items to one recipient.

use super::PipelineContext;
use crate::collaborators::{Delivery, Envelope, EnvelopeEntry};
use crate::db::Item;
use crate::error::{Error, Result};
use crate::types::ItemId;
use serde::Serialize;
use std::path::Path;

/// Result of one distribution
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DistributeReport {
    /// None of the requested items has a downloaded file; nothing was sent
    NothingToSend,
    /// The message was delivered
    Sent {
        /// Items included in the message
        items: Vec<ItemId>,
        /// Links flipped from downloaded to distributed
        flipped: u64,
    },
}

/// Send every downloaded item among `item_ids` to `address` in one message
///
/// Item state is re-read from the store; only items with a file (byte size > 0) are sent.
/// Links flip to distributed only after the notifier confirms delivery.
pub async fn run(ctx: &PipelineContext, item_ids: &[ItemId], address: &str) -> Result<DistributeReport> {
    let address = address.trim();
    if address.is_empty() {
        return Err(Error::Validation("distribute needs a recipient address".into()));
    }
    if item_ids.is_empty() {
        return Err(Error::Validation("distribute needs at least one item".into()));
    }

    let mut ready = Vec::with_capacity(item_ids.len());
    for id in item_ids {
        match ctx.db.get_item(*id).await? {
            Some(item) if item.byte_size > 0 => ready.push(item),
            Some(_) => tracing::debug!(item_id = %id, "Skipping item without a downloaded file"),
            None => tracing::warn!(item_id = %id, "Skipping item that no longer exists"),
        }
    }
    if ready.is_empty() {
        tracing::debug!(address, "Nothing to distribute");
        return Ok(DistributeReport::NothingToSend);
    }

    let mut entries = Vec::with_capacity(ready.len());
    for item in &ready {
        entries.push(build_entry(ctx, item).await?);
    }

    let envelope = Envelope {
        to: address.to_string(),
        from_name: ctx.config.distribution.sender_name.clone(),
        subject: subject(&ready),
        entries,
    };

    if !ctx.collaborators.notifier.send(&envelope).await? {
        return Err(Error::Delivery(format!(
            "notifier did not deliver {} item(s) to {}",
            ready.len(),
            address
        )));
    }

    let sent: Vec<ItemId> = ready.iter().map(|i| i.id).collect();
    let flipped = ctx.db.mark_distributed(address, &sent).await?;
    tracing::info!(address, items = sent.len(), flipped, "Distributed items");

    Ok(DistributeReport::Sent {
        items: sent,
        flipped,
    })
}

/// File sent for an item: the 7z archive when one exists and is smaller, else the download
struct Payload<'a> {
    path: &'a str,
    format: &'a str,
    byte_size: i64,
}

async fn payload(item: &Item) -> Result<Payload<'_>> {
    if item.is_compressed() && item.compressed_size < item.byte_size {
        let archive = item.compressed_path.as_deref().unwrap_or_default();
        if tokio::fs::try_exists(archive).await? {
            return Ok(Payload {
                path: archive,
                format: "7z",
                byte_size: item.compressed_size,
            });
        }
        tracing::warn!(item_id = %item.id, archive, "Archive missing, sending the original file");
    }

    let local_path = item.local_path.as_deref().unwrap_or_default();
    if local_path.is_empty() || !tokio::fs::try_exists(local_path).await? {
        return Err(Error::FileMissing {
            path: local_path.into(),
        });
    }
    Ok(Payload {
        path: local_path,
        format: item.format.as_deref().unwrap_or("bin"),
        byte_size: item.byte_size,
    })
}

async fn build_entry(ctx: &PipelineContext, item: &Item) -> Result<EnvelopeEntry> {
    let Payload {
        path: local_path,
        format,
        byte_size,
    } = payload(item).await?;
    let path = Path::new(local_path);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{}.{}", item.id, format));

    let policy = &ctx.config.distribution;
    let delivery = if byte_size as u64 > policy.attachment_size_limit {
        let store = ctx.collaborators.object_store.as_ref().ok_or_else(|| {
            Error::config(
                format!(
                    "item {} is {} bytes, above the attachment limit, and no object store is configured",
                    item.id, byte_size
                ),
                "distribution.attachment_size_limit",
            )
        })?;
        let url = store.put(path, policy.link_expiry).await?;
        Delivery::Link {
            url,
            file_name,
            expires_in_secs: policy.link_expiry.as_secs(),
        }
    } else {
        Delivery::Attachment {
            path: local_path.to_string(),
            file_name,
            mime_type: mime_type(format),
        }
    };

    Ok(EnvelopeEntry {
        title: item.title.clone(),
        series: item.series.clone(),
        byte_size,
        delivery,
    })
}

fn subject(items: &[Item]) -> String {
    match items {
        [one] => format!("New issue: {}", one.title),
        many => format!("{} new issues", many.len()),
    }
}

/// MIME type for an attachment with the given format tag
pub fn mime_type(format: &str) -> String {
    let subtype = match format.to_ascii_lowercase().as_str() {
        "pdf" => "pdf",
        "epub" => "epub+zip",
        "mobi" => "x-mobipocket-ebook",
        "azw3" | "azw" => "vnd.amazon.ebook",
        "doc" => "msword",
        "docx" => "vnd.openxmlformats-officedocument.wordprocessingml.document",
        "rtf" => "rtf",
        "zip" | "cbz" => "zip",
        "rar" | "cbr" => "x-rar-compressed",
        "7z" => "x-7z-compressed",
        "gz" => "gzip",
        "djvu" => "vnd.djvu",
        "txt" => return "text/plain".to_string(),
        _ => "octet-stream",
    };
    format!("application/{}", subtype)
}
