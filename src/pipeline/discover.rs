//! Discover stage: page through a source and upsert items by detail reference.

use super::PipelineContext;
use crate::error::{Error, Result};
use crate::queue::Job;
use crate::state;
use crate::types::JobId;
use serde::Serialize;

/// What one discovery page produced
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DiscoverReport {
    /// Candidates returned by the source
    pub candidates: usize,
    /// Items created by this run
    pub created: usize,
    /// FetchDetail jobs newly queued for unresolved items
    pub fetch_enqueued: usize,
    /// Subscriber links created for new items
    pub links_created: u64,
}

/// Fetch one page for `series`, upsert every candidate, and queue detail resolution
///
/// The detail reference is the only idempotency boundary: running the same page twice
/// leaves the same rows behind.
pub async fn run(
    ctx: &PipelineContext,
    job_id: &JobId,
    series: &str,
    page: u32,
) -> Result<DiscoverReport> {
    if series.trim().is_empty() {
        return Err(Error::Validation("discover needs a series".into()));
    }

    tracing::debug!(series, page, "Discovering items");
    let drafts = ctx.collaborators.source.discover(series, page).await?;

    let mut report = DiscoverReport {
        candidates: drafts.len(),
        ..DiscoverReport::default()
    };

    for draft in drafts {
        if draft.detail_ref.trim().is_empty() {
            tracing::warn!(series, title = %draft.title, "Skipping candidate without detail reference");
            continue;
        }

        let item_series = draft
            .series
            .as_deref()
            .or_else(|| ctx.classifier.classify(&draft.title))
            .unwrap_or(series);

        let (item, created) = ctx
            .db
            .upsert_item(
                &draft.title,
                item_series,
                draft.publication_date,
                &draft.detail_ref,
            )
            .await?;

        if created {
            report.created += 1;
            report.links_created += state::link_new_item(&ctx.db, &item).await?;
            tracing::info!(item_id = %item.id, series = %item.series, title = %item.title, "Discovered new item");
        }

        if !item.is_resolved() {
            let result = ctx
                .enqueue_child(job_id, Job::FetchDetail { item_id: item.id })
                .await?;
            if matches!(result, crate::db::EnqueueResult::Created(_)) {
                report.fetch_enqueued += 1;
            }
        }
    }

    tracing::debug!(
        series,
        page,
        candidates = report.candidates,
        created = report.created,
        "Discovery page done"
    );
    Ok(report)
}
