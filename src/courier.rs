//! Top-level facade owning the store, queue, worker pool, and scheduler
//!
//! Everything a host process needs goes through [`Courier`]: trigger entry points that
//! acknowledge with the enqueued job, read access through the query layer, and the
//! administrative operations on subscribers and items.

use crate::config::Config;
use crate::db::{Database, EnqueueResult, Item, Link, Subscriber, SubscriptionChange, TaskRecord};
use crate::error::{Error, Result};
use crate::ledger::Ledger;
use crate::pipeline::{Collaborators, PipelineContext};
use crate::query::Query;
use crate::queue::{EnqueueOptions, Job, JobQueue, SqliteJobQueue};
use crate::scheduler::Scheduler;
use crate::state::{self, ReconcileReport};
use crate::types::{ItemId, ItemState, JobId, LinkStatus, SubscriberId};
use crate::worker::Worker;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The issue courier
pub struct Courier {
    db: Arc<Database>,
    queue: Arc<SqliteJobQueue>,
    config: Arc<Config>,
    worker: Worker,
    scheduler: Scheduler,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Courier {
    /// Validate `config`, open the database, and wire up the pipeline
    ///
    /// Nothing runs until [`Courier::start`] is called.
    pub async fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.download.download_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create download directory '{}': {}",
                        config.download.download_dir.display(),
                        e
                    ),
                ))
            })?;

        let db = Arc::new(Database::new(&config.persistence.database_path).await?);
        let config = Arc::new(config);
        let queue = Arc::new(SqliteJobQueue::new(db.clone()));
        let ctx = Arc::new(PipelineContext::new(
            db.clone(),
            queue.clone(),
            config.clone(),
            collaborators,
        )?);
        let worker = Worker::new(queue.clone(), ctx, Arc::new(Ledger::new(db.clone())));
        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(queue.clone(), config.clone(), cancel.clone());

        tracing::info!(
            database = %config.persistence.database_path.display(),
            series = config.series.len(),
            "Courier initialized"
        );

        Ok(Self {
            db,
            queue,
            config,
            worker,
            scheduler,
            cancel,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Start the worker pool and the periodic triggers
    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            tracing::warn!("Courier already started");
            return;
        }
        handles.push(self.worker.start(self.cancel.clone()));
        handles.extend(self.scheduler.start());
        tracing::info!(tasks = handles.len(), "Courier started");
    }

    /// Stop accepting work, stop the triggers, and drain the worker pool
    ///
    /// A job that tries to enqueue a follow-up after the queue closes is released back to
    /// `queued` with its attempt count unchanged. Jobs still running when the drain times
    /// out keep their queue rows and are picked up again through lease recovery on the next
    /// start.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        self.queue.close();
        self.cancel.cancel();

        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.db.pool().close().await;
        tracing::info!("Shutdown complete");
        Ok(())
    }

    /// Shared configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Underlying store
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Worker that runs claimed jobs; [`Worker::run_once`] drives the queue by hand
    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    // --- Trigger entry points ---

    /// Queue an arbitrary job
    pub async fn enqueue(&self, job: &Job, options: EnqueueOptions) -> Result<EnqueueResult> {
        self.queue.enqueue(job, options).await
    }

    /// Queue discovery of one source page for a known series
    pub async fn enqueue_discover(&self, series: &str, page: u32) -> Result<EnqueueResult> {
        if !self.config.is_known_series(series) {
            return Err(Error::Validation(format!("unknown series '{}'", series)));
        }
        if page == 0 {
            return Err(Error::Validation("pages start at 1".into()));
        }
        let job = Job::Discover {
            series: series.to_string(),
            page,
        };
        self.enqueue(&job, EnqueueOptions::default()).await
    }

    /// Queue resolution of an item's resource reference
    pub async fn enqueue_fetch_detail(&self, item_id: ItemId) -> Result<EnqueueResult> {
        self.require_item(item_id).await?;
        self.enqueue(&Job::FetchDetail { item_id }, EnqueueOptions::default())
            .await
    }

    /// Queue the download of one item
    pub async fn enqueue_download(&self, item_id: ItemId) -> Result<EnqueueResult> {
        self.require_item(item_id).await?;
        self.enqueue(&Job::Download { item_id }, EnqueueOptions::default())
            .await
    }

    /// Queue 7z compression of one item's downloaded file
    pub async fn enqueue_compress(&self, item_id: ItemId) -> Result<EnqueueResult> {
        self.require_item(item_id).await?;
        self.enqueue(&Job::Compress { item_id }, EnqueueOptions::default())
            .await
    }

    /// Queue downloads for every item matching `query` that has a resolved reference
    pub async fn enqueue_download_where(&self, query: &Query) -> Result<Vec<EnqueueResult>> {
        let mut results = Vec::new();
        for item in self.db.query_many::<Item>(query).await? {
            if !item.is_resolved() {
                tracing::debug!(item_id = %item.id, "Skipping unresolved item in bulk download");
                continue;
            }
            let job = Job::Download { item_id: item.id };
            results.push(self.enqueue(&job, EnqueueOptions::default()).await?);
        }
        Ok(results)
    }

    /// Queue distribution of the given items to one address
    pub async fn enqueue_distribute(
        &self,
        item_ids: Vec<ItemId>,
        address: &str,
    ) -> Result<EnqueueResult> {
        let address = address.trim();
        if address.is_empty() {
            return Err(Error::Validation("distribute needs a recipient address".into()));
        }
        if item_ids.is_empty() {
            return Err(Error::Validation("distribute needs at least one item".into()));
        }
        let job = Job::Distribute {
            item_ids,
            address: address.to_string(),
        };
        self.enqueue(&job, EnqueueOptions::default()).await
    }

    /// Queue distribution of every item matching `query` to one address
    ///
    /// Returns `None` when the query matches nothing.
    pub async fn enqueue_distribute_where(
        &self,
        query: &Query,
        address: &str,
    ) -> Result<Option<EnqueueResult>> {
        let item_ids: Vec<ItemId> = self
            .db
            .query_many::<Item>(query)
            .await?
            .into_iter()
            .map(|i| i.id)
            .collect();
        if item_ids.is_empty() {
            return Ok(None);
        }
        self.enqueue_distribute(item_ids, address).await.map(Some)
    }

    /// Queue reconciliation of one subscriber's links
    pub async fn enqueue_reconcile(&self, subscriber_id: SubscriberId) -> Result<EnqueueResult> {
        self.require_subscriber(subscriber_id).await?;
        self.enqueue(&Job::Reconcile { subscriber_id }, EnqueueOptions::default())
            .await
    }

    // --- Read access ---

    /// Item by ID
    pub async fn get_item(&self, id: ItemId) -> Result<Option<Item>> {
        self.db.get_item(id).await
    }

    /// Items matching `query`
    pub async fn query_items(&self, query: &Query) -> Result<Vec<Item>> {
        self.db.query_many(query).await
    }

    /// Subscribers matching `query`
    pub async fn query_subscribers(&self, query: &Query) -> Result<Vec<Subscriber>> {
        self.db.query_many(query).await
    }

    /// Where an item stands in the pipeline
    pub async fn item_state(&self, id: ItemId) -> Result<ItemState> {
        let item = self.db.get_item(id).await?;
        let links = match &item {
            Some(_) => self.db.links_for_item(id).await?,
            None => Vec::new(),
        };
        Ok(ItemState::derive(item.as_ref(), &links))
    }

    /// Delivery links of one subscriber
    pub async fn links_for_subscriber(&self, id: SubscriberId) -> Result<Vec<Link>> {
        self.db.links_for_subscriber(id).await
    }

    /// Ledger record of one job
    pub async fn get_task(&self, id: &JobId) -> Result<Option<TaskRecord>> {
        self.db.get_task(id).await
    }

    /// Ledger records matching `query`
    pub async fn query_tasks(&self, query: &Query) -> Result<Vec<TaskRecord>> {
        self.db.query_many(query).await
    }

    /// Number of ledger records per status
    pub async fn task_status_summary(&self) -> Result<BTreeMap<String, i64>> {
        self.db.task_status_summary().await
    }

    /// Ledger records of the jobs fanned out by `parent`
    pub async fn child_tasks(&self, parent: &JobId) -> Result<Vec<TaskRecord>> {
        self.db.child_tasks(parent).await
    }

    /// Drop a ledger record
    pub async fn delete_task(&self, id: &JobId) -> Result<bool> {
        self.db.delete_task(id).await
    }

    // --- Administration ---

    /// Register a subscriber
    pub async fn create_subscriber(&self, address: &str) -> Result<SubscriberId> {
        let address = address.trim();
        if address.is_empty() {
            return Err(Error::Validation("subscriber address is empty".into()));
        }
        let id = self.db.insert_subscriber(address).await?;
        tracing::info!(subscriber_id = %id, address, "Subscriber created");
        Ok(id)
    }

    /// Subscribe to a known series and link its items
    ///
    /// `since` defaults to today (UTC). Re-adding the same series with the same date
    /// changes nothing. A different date replaces the entry; existing links keep their
    /// status and only missing links are created.
    pub async fn add_subscription(
        &self,
        subscriber_id: SubscriberId,
        series: &str,
        since: Option<NaiveDate>,
    ) -> Result<SubscriptionChange> {
        if !self.config.is_known_series(series) {
            return Err(Error::Validation(format!("unknown series '{}'", series)));
        }
        self.require_subscriber(subscriber_id).await?;

        let since = since.unwrap_or_else(|| chrono::Utc::now().date_naive());
        let change = self
            .db
            .upsert_subscription(subscriber_id, series, since)
            .await?;

        if change != SubscriptionChange::Unchanged {
            let report = state::check_subscriptions(&self.db, subscriber_id).await?;
            tracing::info!(
                subscriber_id = %subscriber_id,
                series,
                change = ?change,
                created = report.created,
                "Subscription saved"
            );
        }
        Ok(change)
    }

    /// Unsubscribe from a series, deleting that series' links
    ///
    /// Returns the number of links deleted, or `None` if there was no such subscription.
    pub async fn remove_subscription(
        &self,
        subscriber_id: SubscriberId,
        series: &str,
    ) -> Result<Option<u64>> {
        let removed = self.db.delete_subscription(subscriber_id, series).await?;
        if let Some(links) = removed {
            tracing::info!(subscriber_id = %subscriber_id, series, links, "Subscription removed");
        }
        Ok(removed)
    }

    /// Re-link one subscriber's items right away instead of through the queue
    pub async fn reconcile_now(&self, subscriber_id: SubscriberId) -> Result<ReconcileReport> {
        state::check_subscriptions(&self.db, subscriber_id).await
    }

    /// Delete a subscriber with its subscriptions and links
    pub async fn delete_subscriber(&self, id: SubscriberId) -> Result<bool> {
        self.db.delete_subscriber_cascade(id).await
    }

    /// Delete an item with its links; the local file is left in place
    pub async fn delete_item(&self, id: ItemId) -> Result<bool> {
        self.db.delete_item_cascade(id).await
    }

    /// Force a link into `status`, e.g. back to downloaded for a resend
    pub async fn reflag_link(
        &self,
        subscriber_id: SubscriberId,
        item_id: ItemId,
        status: LinkStatus,
    ) -> Result<bool> {
        let changed = self.db.reflag_link(subscriber_id, item_id, status).await?;
        if changed {
            tracing::info!(subscriber_id = %subscriber_id, item_id = %item_id, status = %status, "Link reflagged");
        }
        Ok(changed)
    }

    async fn require_item(&self, id: ItemId) -> Result<()> {
        match self.db.get_item(id).await? {
            Some(_) => Ok(()),
            None => Err(Error::Validation(format!("item {} does not exist", id))),
        }
    }

    async fn require_subscriber(&self, id: SubscriberId) -> Result<()> {
        match self.db.get_subscriber(id).await? {
            Some(_) => Ok(()),
            None => Err(Error::Validation(format!("subscriber {} does not exist", id))),
        }
    }
}
