//! Periodic triggers that re-enter the pipeline
//!
//! Each trigger runs on its own interval and only enqueues a sweep job. The sweep job,
//! run by a worker under the usual ledger and retry handling, fans out into one job per
//! item or subscriber, so a single failure never blocks unrelated work.
//!
//! | Trigger        | Sweep                    | Fans out into                                  |
//! |----------------|--------------------------|------------------------------------------------|
//! | discover       | [`Job::SweepDiscover`]    | Discover per known series and page             |
//! | fetch_detail   | [`Job::SweepFetchDetail`] | FetchDetail per unresolved item                |
//! | download       | [`Job::SweepDownload`]    | Download per resolved item without a file      |
//! | compress       | [`Job::SweepCompress`]    | Compress per downloaded file without archive   |
//! | distribute     | [`Job::SweepDistribute`]  | Distribute per (subscriber, series) batch      |
//! | reconcile      | [`Job::SweepReconcile`]   | Reconcile per subscriber                       |

use crate::config::Config;
use crate::db::{EnqueueResult, Item};
use crate::error::{Error, Result};
use crate::pipeline::PipelineContext;
use crate::query::{Filter, Query};
use crate::queue::{EnqueueOptions, Job, JobQueue};
use crate::types::JobId;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Jobs fanned out by one sweep
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Jobs newly queued
    pub enqueued: usize,
    /// Jobs skipped because an equivalent one was already queued or running
    pub duplicates: usize,
}

impl SweepReport {
    fn record(&mut self, result: &EnqueueResult) {
        match result {
            EnqueueResult::Created(_) => self.enqueued += 1,
            EnqueueResult::Duplicate(_) => self.duplicates += 1,
        }
    }
}

/// Interval-driven sweep triggers
pub struct Scheduler {
    queue: Arc<dyn JobQueue>,
    config: Arc<Config>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Create a scheduler that stops when `cancel` fires
    pub fn new(queue: Arc<dyn JobQueue>, config: Arc<Config>, cancel: CancellationToken) -> Self {
        Self {
            queue,
            config,
            cancel,
        }
    }

    /// Spawn one trigger task per sweep
    ///
    /// Every trigger fires once immediately, then on its interval.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let schedule = &self.config.schedule;
        if !schedule.enabled {
            tracing::info!("Periodic triggers disabled");
            return Vec::new();
        }

        [
            (Job::SweepDiscover, schedule.discover_interval),
            (Job::SweepFetchDetail, schedule.fetch_detail_interval),
            (Job::SweepDownload, schedule.download_interval),
            (Job::SweepCompress, schedule.compress_interval),
            (Job::SweepDistribute, schedule.distribute_interval),
            (Job::SweepReconcile, schedule.reconcile_interval),
        ]
        .into_iter()
        .map(|(job, period)| {
            tokio::spawn(trigger_loop(
                self.queue.clone(),
                job,
                period,
                self.cancel.clone(),
            ))
        })
        .collect()
    }
}

async fn trigger_loop(
    queue: Arc<dyn JobQueue>,
    job: Job,
    period: Duration,
    cancel: CancellationToken,
) {
    let name = job.name();
    tracing::info!(trigger = name, period_secs = period.as_secs(), "Trigger started");

    let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match queue.enqueue(&job, EnqueueOptions::default()).await {
            Ok(EnqueueResult::Created(id)) => {
                tracing::debug!(trigger = name, job_id = %id, "Sweep enqueued")
            }
            Ok(EnqueueResult::Duplicate(id)) => {
                tracing::debug!(trigger = name, job_id = %id, "Previous sweep still pending")
            }
            Err(Error::ShuttingDown) => break,
            Err(e) => tracing::warn!(trigger = name, error = %e, "Failed to enqueue sweep"),
        }
    }

    tracing::info!(trigger = name, "Trigger stopped");
}

/// Fan a sweep job out into per-item or per-subscriber jobs
pub(crate) async fn run_sweep(
    ctx: &PipelineContext,
    job_id: &JobId,
    sweep: &Job,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();

    match sweep {
        Job::SweepDiscover => {
            let pages = ctx.config.schedule.discover_pages.max(1);
            for series in ctx.config.series_names() {
                for page in 1..=pages {
                    let job = Job::Discover {
                        series: series.clone(),
                        page,
                    };
                    report.record(&ctx.enqueue_child(job_id, job).await?);
                }
            }
        }
        Job::SweepFetchDetail => {
            let query = Query::new()
                .filter("resource_ref", Filter::IsEmpty)
                .order_by("id", false);
            for item in ctx.db.query_many::<Item>(&query).await? {
                let job = Job::FetchDetail { item_id: item.id };
                report.record(&ctx.enqueue_child(job_id, job).await?);
            }
        }
        Job::SweepDownload => {
            let query = Query::new()
                .filter("resource_ref", Filter::IsNotEmpty)
                .eq("byte_size", 0)
                .order_by("id", false);
            for item in ctx.db.query_many::<Item>(&query).await? {
                let job = Job::Download { item_id: item.id };
                report.record(&ctx.enqueue_child(job_id, job).await?);
            }
        }
        Job::SweepCompress => {
            let compression = &ctx.config.compression;
            if !compression.enabled {
                tracing::debug!("Compression disabled, sweep skipped");
                return Ok(report);
            }
            let query = Query::new()
                .filter("local_path", Filter::IsNotEmpty)
                .eq("compressed_size", 0)
                .order_by("id", false);
            for item in ctx.db.query_many::<Item>(&query).await? {
                let eligible = item
                    .format
                    .as_deref()
                    .is_some_and(|format| compression.applies_to(format));
                if !item.is_downloaded() || !eligible {
                    continue;
                }
                let job = Job::Compress { item_id: item.id };
                report.record(&ctx.enqueue_child(job_id, job).await?);
            }
        }
        Job::SweepDistribute => {
            for batch in ctx.db.distribution_batches().await? {
                let job = Job::Distribute {
                    item_ids: batch.item_ids,
                    address: batch.address,
                };
                report.record(&ctx.enqueue_child(job_id, job).await?);
            }
        }
        Job::SweepReconcile => {
            for subscriber_id in ctx.db.list_subscriber_ids().await? {
                let job = Job::Reconcile { subscriber_id };
                report.record(&ctx.enqueue_child(job_id, job).await?);
            }
        }
        other => {
            return Err(Error::Validation(format!(
                "{} is not a sweep job",
                other.name()
            )));
        }
    }

    tracing::info!(
        sweep = sweep.name(),
        enqueued = report.enqueued,
        duplicates = report.duplicates,
        "Sweep fanned out"
    );
    Ok(report)
}
