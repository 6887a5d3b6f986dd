//! Durable job queue
//!
//! Jobs are rows in the `jobs` table. Enqueue is idempotent on a key (caller-supplied or
//! derived from the job's name and arguments), claim is a single atomic UPDATE, and a
//! crashed worker's job comes back once its lease lapses.

use crate::db::{Database, EnqueueResult, JobRow, NewJob};
use crate::error::{Error, Result};
use crate::types::{ItemId, JobId, SubscriberId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// One unit of pipeline work
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    /// Fetch one page of candidates for a series
    Discover {
        /// Series to discover
        series: String,
        /// Source page number (1-based)
        page: u32,
    },
    /// Resolve the resource reference of an item
    FetchDetail {
        /// Target item
        item_id: ItemId,
    },
    /// Materialize an item's file locally
    Download {
        /// Target item
        item_id: ItemId,
    },
    /// Pack an item's downloaded file into a 7z archive
    Compress {
        /// Target item
        item_id: ItemId,
    },
    /// Send downloaded items to one address
    Distribute {
        /// Items to send
        item_ids: Vec<ItemId>,
        /// Recipient address
        address: String,
    },
    /// Re-link a subscriber's items to their current subscriptions
    Reconcile {
        /// Target subscriber
        subscriber_id: SubscriberId,
    },
    /// Enqueue Discover for every known series
    SweepDiscover,
    /// Enqueue FetchDetail for every unresolved item
    SweepFetchDetail,
    /// Enqueue Download for every resolved item without a local file
    SweepDownload,
    /// Enqueue Distribute for every subscriber with downloaded links, per series
    SweepDistribute,
    /// Enqueue Reconcile for every subscriber
    SweepReconcile,
    /// Enqueue Compress for every downloaded item of an eligible format without an archive
    SweepCompress,
}

impl Job {
    /// Stable job name stored in the queue and the ledger
    pub fn name(&self) -> &'static str {
        match self {
            Job::Discover { .. } => "discover",
            Job::FetchDetail { .. } => "fetch_detail",
            Job::Download { .. } => "download",
            Job::Compress { .. } => "compress",
            Job::Distribute { .. } => "distribute",
            Job::Reconcile { .. } => "reconcile",
            Job::SweepDiscover => "sweep_discover",
            Job::SweepFetchDetail => "sweep_fetch_detail",
            Job::SweepDownload => "sweep_download",
            Job::SweepDistribute => "sweep_distribute",
            Job::SweepReconcile => "sweep_reconcile",
            Job::SweepCompress => "sweep_compress",
        }
    }

    /// Serialized payload
    pub fn to_args(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Default idempotency key: SHA-256 over the name and serialized payload
    pub fn dedup_key(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.name().as_bytes());
        hasher.update(b"\0");
        hasher.update(self.to_args()?.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Options for [`JobQueue::enqueue`]
#[derive(Clone, Debug, Default)]
pub struct EnqueueOptions {
    /// Explicit idempotency key; derived from the job when absent
    pub idempotency_key: Option<String>,
    /// Job that is enqueueing this one
    pub parent_id: Option<JobId>,
    /// Delay before the job becomes claimable
    pub delay: Duration,
}

impl EnqueueOptions {
    /// Options for a job fanned out by `parent`
    pub fn child_of(parent: &JobId) -> Self {
        Self {
            parent_id: Some(parent.clone()),
            ..Self::default()
        }
    }
}

/// Where pipeline stages and external callers put new work
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Queue `job`, or report the active job that already covers it
    async fn enqueue(&self, job: &Job, options: EnqueueOptions) -> Result<EnqueueResult>;
}

/// A job leased to this worker
#[derive(Clone, Debug)]
pub struct ClaimedJob {
    /// Job identifier
    pub id: JobId,
    /// Decoded payload
    pub job: Job,
    /// Serialized payload as stored
    pub args: String,
    /// Job that enqueued this one
    pub parent_id: Option<JobId>,
    /// Attempts already consumed before this one, per the queue row
    pub attempt: u32,
}

/// [`JobQueue`] stored in SQLite
pub struct SqliteJobQueue {
    db: Arc<Database>,
    accepting: AtomicBool,
}

impl SqliteJobQueue {
    /// Create a queue over `db`
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            accepting: AtomicBool::new(true),
        }
    }

    /// Stop accepting new jobs; later enqueues fail with [`Error::ShuttingDown`]
    pub fn close(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Lease the oldest due job for `lease`
    ///
    /// Rows whose payload no longer decodes are buried and skipped.
    pub async fn claim(&self, lease: Duration) -> Result<Option<ClaimedJob>> {
        loop {
            let now = chrono::Utc::now().timestamp();
            let lease_until = now + lease.as_secs() as i64;
            let Some(row) = self.db.claim_job(now, lease_until).await? else {
                return Ok(None);
            };

            match decode(&row) {
                Ok(claimed) => return Ok(Some(claimed)),
                Err(e) => {
                    tracing::error!(job_id = %row.id, job = %row.name, error = %e, "Burying undecodable job");
                    self.db.bury_job(&row.id, &e.ledger_text()).await?;
                }
            }
        }
    }

    /// Mark a claimed job as succeeded
    pub async fn complete(&self, id: &JobId) -> Result<()> {
        self.db.complete_job(id).await
    }

    /// Reschedule a claimed job after `countdown`, consuming one attempt
    pub async fn retry(&self, id: &JobId, countdown: Duration, error: &Error) -> Result<()> {
        let run_at = chrono::Utc::now().timestamp() + countdown.as_secs() as i64;
        self.db.reschedule_job(id, run_at, &error.ledger_text()).await
    }

    /// Hand a claimed job back untouched so the next start runs it again
    pub async fn release(&self, id: &JobId) -> Result<()> {
        self.db.release_job(id).await
    }

    /// Mark a claimed job as permanently failed
    pub async fn bury(&self, id: &JobId, error: &Error) -> Result<()> {
        self.db.bury_job(id, &error.ledger_text()).await
    }

    /// Re-queue jobs whose worker vanished
    pub async fn recover_expired(&self) -> Result<u64> {
        let recovered = self
            .db
            .recover_expired_leases(chrono::Utc::now().timestamp())
            .await?;
        if recovered > 0 {
            tracing::warn!(recovered, "Re-queued jobs with expired leases");
        }
        Ok(recovered)
    }
}

fn decode(row: &JobRow) -> Result<ClaimedJob> {
    let job: Job = serde_json::from_str(&row.args)?;
    Ok(ClaimedJob {
        id: row.id.clone(),
        job,
        args: row.args.clone(),
        parent_id: row.parent_id.clone(),
        attempt: u32::try_from(row.attempts).unwrap_or(u32::MAX),
    })
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, job: &Job, options: EnqueueOptions) -> Result<EnqueueResult> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let dedup_key = match options.idempotency_key {
            Some(key) => key,
            None => job.dedup_key()?,
        };
        let new_job = NewJob {
            id: JobId::generate(),
            name: job.name().to_string(),
            args: job.to_args()?,
            dedup_key,
            parent_id: options.parent_id,
            run_at: chrono::Utc::now().timestamp() + options.delay.as_secs() as i64,
        };

        let result = self.db.enqueue_job(&new_job).await?;
        match &result {
            EnqueueResult::Created(id) => {
                tracing::debug!(job_id = %id, job = job.name(), "Job enqueued")
            }
            EnqueueResult::Duplicate(id) => {
                tracing::debug!(job_id = %id, job = job.name(), "Job already queued")
            }
        }
        Ok(result)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobStatus;
    use tempfile::NamedTempFile;

    async fn queue() -> (NamedTempFile, Arc<Database>, SqliteJobQueue) {
        let temp_file = NamedTempFile::new().unwrap();
        let db = Arc::new(Database::new(temp_file.path()).await.unwrap());
        let queue = SqliteJobQueue::new(db.clone());
        (temp_file, db, queue)
    }

    #[test]
    fn payload_is_tagged_by_name() {
        let job = Job::Discover {
            series: "weekly".into(),
            page: 2,
        };
        assert_eq!(
            job.to_args().unwrap(),
            r#"{"job":"discover","series":"weekly","page":2}"#
        );
        assert_eq!(
            serde_json::from_str::<Job>(r#"{"job":"sweep_download"}"#).unwrap(),
            Job::SweepDownload
        );
    }

    #[test]
    fn dedup_key_depends_on_arguments() {
        let a = Job::Download { item_id: ItemId(1) }.dedup_key().unwrap();
        let b = Job::Download { item_id: ItemId(2) }.dedup_key().unwrap();
        let a2 = Job::Download { item_id: ItemId(1) }.dedup_key().unwrap();
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_while_active() {
        let (_tmp, db, queue) = queue().await;
        let job = Job::FetchDetail { item_id: ItemId(3) };

        let first = queue.enqueue(&job, EnqueueOptions::default()).await.unwrap();
        let second = queue.enqueue(&job, EnqueueOptions::default()).await.unwrap();
        assert!(matches!(first, EnqueueResult::Created(_)));
        assert_eq!(second, EnqueueResult::Duplicate(first.job_id().clone()));

        // Once finished, the same work may be queued again
        let claimed = queue.claim(Duration::from_secs(60)).await.unwrap().unwrap();
        queue.complete(&claimed.id).await.unwrap();
        let third = queue.enqueue(&job, EnqueueOptions::default()).await.unwrap();
        assert!(matches!(third, EnqueueResult::Created(_)));
        assert_ne!(third.job_id(), first.job_id());

        assert_eq!(db.count_active_jobs().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn explicit_key_overrides_derived_key() {
        let (_tmp, _db, queue) = queue().await;
        let options = || EnqueueOptions {
            idempotency_key: Some("resend-42".into()),
            ..EnqueueOptions::default()
        };

        let a = queue
            .enqueue(&Job::Download { item_id: ItemId(1) }, options())
            .await
            .unwrap();
        let b = queue
            .enqueue(&Job::Download { item_id: ItemId(2) }, options())
            .await
            .unwrap();
        assert!(matches!(a, EnqueueResult::Created(_)));
        assert!(matches!(b, EnqueueResult::Duplicate(_)));
    }

    #[tokio::test]
    async fn enqueue_writes_pending_ledger_record() {
        let (_tmp, db, queue) = queue().await;
        let parent = JobId::from("parent");
        let result = queue
            .enqueue(&Job::Download { item_id: ItemId(9) }, EnqueueOptions::child_of(&parent))
            .await
            .unwrap();

        let record = db.get_task(result.job_id()).await.unwrap().unwrap();
        assert_eq!(record.status, crate::types::TaskStatus::Pending);
        assert_eq!(record.name, "download");
        assert_eq!(record.parent_id, Some(parent.clone()));
        assert_eq!(db.child_tasks(&parent).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retry_consumes_an_attempt_and_delays() {
        let (_tmp, db, queue) = queue().await;
        queue
            .enqueue(&Job::SweepDownload, EnqueueOptions::default())
            .await
            .unwrap();

        let claimed = queue.claim(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(claimed.attempt, 0);
        assert_eq!(claimed.job, Job::SweepDownload);
        assert!(queue.claim(Duration::from_secs(60)).await.unwrap().is_none());

        queue
            .retry(&claimed.id, Duration::from_secs(3600), &Error::Transient("x".into()))
            .await
            .unwrap();
        let row = db.get_job(&claimed.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Queued);
        assert_eq!(row.attempts, 1);
        assert_eq!(
            row.last_error.as_deref(),
            Some("type: transient, message: transient failure: x")
        );

        // Not due for an hour
        assert!(queue.claim(Duration::from_secs(60)).await.unwrap().is_none());

        queue
            .retry(&claimed.id, Duration::ZERO, &Error::Transient("x".into()))
            .await
            .unwrap();
        let again = queue.claim(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(again.id, claimed.id);
        assert_eq!(again.attempt, 2);
    }

    #[tokio::test]
    async fn expired_lease_is_recovered_with_attempt_counted() {
        let (_tmp, db, queue) = queue().await;
        queue
            .enqueue(&Job::SweepReconcile, EnqueueOptions::default())
            .await
            .unwrap();

        let now = chrono::Utc::now().timestamp();
        let row = db.claim_job(now, now - 1).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Running);

        assert_eq!(queue.recover_expired().await.unwrap(), 1);
        let claimed = queue.claim(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(claimed.id, row.id);
        assert_eq!(claimed.attempt, 1);
    }

    #[tokio::test]
    async fn undecodable_rows_are_buried() {
        let (_tmp, db, queue) = queue().await;
        db.enqueue_job(&NewJob {
            id: JobId::from("broken"),
            name: "mystery".into(),
            args: r#"{"job":"no_such_job"}"#.into(),
            dedup_key: "broken".into(),
            parent_id: None,
            run_at: 0,
        })
        .await
        .unwrap();

        assert!(queue.claim(Duration::from_secs(60)).await.unwrap().is_none());
        let row = db.get_job(&JobId::from("broken")).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Dead);
    }

    #[tokio::test]
    async fn closed_queue_rejects_work() {
        let (_tmp, _db, queue) = queue().await;
        queue.close();
        let err = queue
            .enqueue(&Job::SweepDiscover, EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));
    }
}
