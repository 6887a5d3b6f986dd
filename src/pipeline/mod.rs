//! Pipeline stages: discover, fetch-detail, download, compress, distribute
//!
//! Stages never talk to each other directly. Each one reads and writes the shared entities
//! through [`Database`] and enqueues the next stage only after its own writes commit.
//! Every stage is safe to re-run: a repeat call finds its work already done and returns
//! without side effects.
//!
//! ## Submodules
//!
//! - [`discover`] - page through a source and upsert items by detail reference
//! - [`fetch_detail`] - resolve an item's resource reference
//! - [`download`] - stream an item's file to local storage
//! - [`compress`] - pack a downloaded file into a smaller 7z archive
//! - [`distribute`] - send downloaded items to a subscriber

use crate::collaborators::{Notifier, ObjectStore, SourceConnector, Transport};
use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::queue::{ClaimedJob, EnqueueOptions, Job, JobQueue};
use crate::state::{self, SeriesClassifier};
use crate::types::JobId;
use crate::db::EnqueueResult;
use std::sync::Arc;

pub mod compress;
pub mod discover;
pub mod distribute;
pub mod download;
pub mod fetch_detail;

pub use compress::CompressReport;
pub use discover::DiscoverReport;
pub use distribute::DistributeReport;
pub use download::DownloadReport;
pub use fetch_detail::FetchDetailReport;

/// External systems the stages call
#[derive(Clone)]
pub struct Collaborators {
    /// Content source
    pub source: Arc<dyn SourceConnector>,
    /// Byte transport for downloads
    pub transport: Arc<dyn Transport>,
    /// Message delivery
    pub notifier: Arc<dyn Notifier>,
    /// Storage for files too large to attach; large files cannot be sent without it
    pub object_store: Option<Arc<dyn ObjectStore>>,
}

/// Everything a stage needs
pub struct PipelineContext {
    /// Shared persistent store
    pub db: Arc<Database>,
    /// Where follow-up jobs go
    pub queue: Arc<dyn JobQueue>,
    /// Process configuration
    pub config: Arc<Config>,
    /// External systems
    pub collaborators: Collaborators,
    /// Title-to-series rules
    pub classifier: SeriesClassifier,
}

impl PipelineContext {
    /// Build a context, compiling the series classification rules from `config`
    pub fn new(
        db: Arc<Database>,
        queue: Arc<dyn JobQueue>,
        config: Arc<Config>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let classifier = SeriesClassifier::new(&config.series)?;
        Ok(Self {
            db,
            queue,
            config,
            collaborators,
            classifier,
        })
    }

    /// Enqueue a follow-up job on behalf of `parent`
    pub(crate) async fn enqueue_child(&self, parent: &JobId, job: Job) -> Result<EnqueueResult> {
        self.queue.enqueue(&job, EnqueueOptions::child_of(parent)).await
    }
}

/// Run the handler for a claimed job and serialize its report for the ledger
pub async fn execute(ctx: &PipelineContext, claimed: &ClaimedJob) -> Result<serde_json::Value> {
    let job_id = &claimed.id;
    let value = match &claimed.job {
        Job::Discover { series, page } => {
            serde_json::to_value(discover::run(ctx, job_id, series, *page).await?)?
        }
        Job::FetchDetail { item_id } => {
            serde_json::to_value(fetch_detail::run(ctx, job_id, *item_id).await?)?
        }
        Job::Download { item_id } => serde_json::to_value(download::run(ctx, *item_id).await?)?,
        Job::Compress { item_id } => serde_json::to_value(compress::run(ctx, *item_id).await?)?,
        Job::Distribute { item_ids, address } => {
            serde_json::to_value(distribute::run(ctx, item_ids, address).await?)?
        }
        Job::Reconcile { subscriber_id } => {
            serde_json::to_value(state::check_subscriptions(&ctx.db, *subscriber_id).await?)?
        }
        sweep => serde_json::to_value(crate::scheduler::run_sweep(ctx, job_id, sweep).await?)?,
    };
    Ok(value)
}
