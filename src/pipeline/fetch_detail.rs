//! FetchDetail stage: resolve an item's retrievable resource reference.

use super::PipelineContext;
use crate::error::{Error, Result};
use crate::queue::Job;
use crate::types::{ItemId, JobId};
use serde::Serialize;

/// Result of one detail resolution
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FetchDetailReport {
    /// The reference was already set; nothing was done
    AlreadyResolved,
    /// The reference was resolved and a download queued
    Resolved {
        /// The resolved reference
        resource_ref: String,
    },
}

/// Resolve and persist the resource reference of `item_id`, then queue its download
pub async fn run(ctx: &PipelineContext, job_id: &JobId, item_id: ItemId) -> Result<FetchDetailReport> {
    let item = ctx
        .db
        .get_item(item_id)
        .await?
        .ok_or_else(|| Error::Validation(format!("item {} does not exist", item_id)))?;

    if item.is_resolved() {
        tracing::debug!(item_id = %item_id, "Resource reference already resolved");
        return Ok(FetchDetailReport::AlreadyResolved);
    }

    let resource_ref = ctx.collaborators.source.resolve(&item).await?;
    if resource_ref.trim().is_empty() {
        return Err(Error::ResourceNotFound(format!(
            "no resource reference on detail page {}",
            item.detail_ref
        )));
    }

    if !ctx.db.set_resource_ref(item_id, &resource_ref).await? {
        // Another worker got there first
        return Ok(FetchDetailReport::AlreadyResolved);
    }
    tracing::info!(item_id = %item_id, resource_ref = %resource_ref, "Resolved resource reference");

    ctx.enqueue_child(job_id, Job::Download { item_id }).await?;

    Ok(FetchDetailReport::Resolved { resource_ref })
}
