//! Worker pool: claims jobs from the queue and runs them under the retry policy
//!
//! A single dispatcher task claims jobs while a semaphore permit is free and spawns one
//! task per claimed job. Every attempt goes through the ledger hooks, is bounded by the
//! configured job timeout, and ends with the queue row completed, rescheduled, or buried.
//! A job whose follow-up enqueue hits a closed queue during shutdown is released instead:
//! its row goes back to `queued` with the attempt count unchanged.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::ledger::{JobLifecycle, TaskContext, observe};
use crate::pipeline::{self, PipelineContext};
use crate::queue::{ClaimedJob, SqliteJobQueue};
use crate::retry::{self, Outcome};
use crate::types::JobId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How often the dispatcher looks for jobs whose worker vanished
const LEASE_RECOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// How long shutdown waits for in-flight jobs before abandoning them to lease recovery
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// How one claimed job ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job finished and its row is marked succeeded
    Succeeded,
    /// The job failed transiently and was rescheduled
    Retrying {
        /// Delay before the next attempt
        countdown: Duration,
    },
    /// The job failed for good and its row is buried
    Failed,
    /// Shutdown closed the queue under the job; its row is queued again unchanged
    Released,
}

/// Runs claimed jobs
#[derive(Clone)]
pub struct Worker {
    queue: Arc<SqliteJobQueue>,
    ctx: Arc<PipelineContext>,
    lifecycle: Arc<dyn JobLifecycle>,
    config: Arc<Config>,
}

impl Worker {
    /// Create a worker over `queue`, running jobs against `ctx`
    pub fn new(
        queue: Arc<SqliteJobQueue>,
        ctx: Arc<PipelineContext>,
        lifecycle: Arc<dyn JobLifecycle>,
    ) -> Self {
        let config = ctx.config.clone();
        Self {
            queue,
            ctx,
            lifecycle,
            config,
        }
    }

    /// Start the dispatcher task
    ///
    /// The dispatcher keeps at most `worker.concurrency` jobs in flight, sleeps for
    /// `worker.poll_interval` when nothing is due, and returns once `cancel` fires and the
    /// in-flight jobs have finished (or the shutdown grace period runs out).
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let worker = self.clone();
        tokio::spawn(async move { worker.dispatch(cancel).await })
    }

    async fn dispatch(self, cancel: CancellationToken) {
        let concurrency = self.config.worker.concurrency.max(1);
        let poll_interval = self.config.worker.poll_interval;
        let lease = self.config.worker.lease();
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut last_recovery: Option<Instant> = None;

        tracing::info!(concurrency, "Worker started");

        loop {
            if last_recovery.is_none_or(|t| t.elapsed() >= LEASE_RECOVERY_INTERVAL) {
                if let Err(e) = self.queue.recover_expired().await {
                    tracing::warn!(error = %e, "Lease recovery failed");
                }
                last_recovery = Some(Instant::now());
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            match self.queue.claim(lease).await {
                Ok(Some(claimed)) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        worker.process(claimed).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(error = %e, "Failed to claim job");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }
            }
        }

        tracing::info!("Worker stopping, waiting for in-flight jobs");
        let all = u32::try_from(concurrency).unwrap_or(u32::MAX);
        match tokio::time::timeout(SHUTDOWN_GRACE, semaphore.acquire_many(all)).await {
            Ok(_) => tracing::info!("Worker stopped"),
            Err(_) => tracing::warn!(
                "Timeout waiting for in-flight jobs, leaving them to lease recovery"
            ),
        }
    }

    /// Claim and run at most one due job, waiting for it to finish
    ///
    /// Returns `None` when nothing is due.
    pub async fn run_once(&self) -> Result<Option<(JobId, JobOutcome)>> {
        let Some(claimed) = self.queue.claim(self.config.worker.lease()).await? else {
            return Ok(None);
        };
        let id = claimed.id.clone();
        let outcome = self.process(claimed).await;
        Ok(Some((id, outcome)))
    }

    async fn process(&self, claimed: ClaimedJob) -> JobOutcome {
        let task = TaskContext {
            id: claimed.id.clone(),
            name: claimed.job.name().to_string(),
            args: claimed.args.clone(),
            parent_id: claimed.parent_id.clone(),
        };
        observe("before_start", &task, self.lifecycle.before_start(&task).await);

        let retry_config = &self.config.retry;
        if claimed.attempt > retry_config.max_retries {
            // Only reachable when lease recovery pushed the count past the cap
            let error = Error::Other(format!(
                "retries exhausted after {} attempts",
                claimed.attempt
            ));
            return self.fail(&task, error).await;
        }

        let timeout = self.config.worker.job_timeout;
        tracing::debug!(job_id = %task.id, job = %task.name, attempt = claimed.attempt, "Running job");

        let outcome = retry::run_with_retry(retry_config, claimed.attempt, || async {
            match tokio::time::timeout(timeout, pipeline::execute(&self.ctx, &claimed)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    secs: timeout.as_secs(),
                }),
            }
        })
        .await;

        match outcome {
            Outcome::Done(value) => {
                if let Err(e) = self.queue.complete(&task.id).await {
                    tracing::error!(job_id = %task.id, error = %e, "Failed to mark job complete");
                }
                observe("on_success", &task, self.lifecycle.on_success(&task, &value).await);
                tracing::info!(job_id = %task.id, job = %task.name, "Job succeeded");
                JobOutcome::Succeeded
            }
            Outcome::Retry { countdown, error } => {
                if let Err(e) = self.queue.retry(&task.id, countdown, &error).await {
                    tracing::error!(job_id = %task.id, error = %e, "Failed to reschedule job");
                }
                observe("on_retry", &task, self.lifecycle.on_retry(&task, &error).await);
                JobOutcome::Retrying { countdown }
            }
            Outcome::Failed(Error::ShuttingDown) => self.release(&task).await,
            Outcome::Failed(error) => self.fail(&task, error).await,
        }
    }

    async fn release(&self, task: &TaskContext) -> JobOutcome {
        if let Err(e) = self.queue.release(&task.id).await {
            tracing::error!(job_id = %task.id, error = %e, "Failed to release job");
        }
        observe("on_release", task, self.lifecycle.on_release(task).await);
        tracing::info!(job_id = %task.id, job = %task.name, "Job released for the next start");
        JobOutcome::Released
    }

    async fn fail(&self, task: &TaskContext, error: Error) -> JobOutcome {
        if let Err(e) = self.queue.bury(&task.id, &error).await {
            tracing::error!(job_id = %task.id, error = %e, "Failed to bury job");
        }
        observe("on_failure", task, self.lifecycle.on_failure(task, &error).await);
        tracing::error!(job_id = %task.id, job = %task.name, error = %error, "Job failed");
        JobOutcome::Failed
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        Envelope, Notifier, RemoteFile, SourceConnector, Transport,
    };
    use crate::config::RetryConfig;
    use crate::db::{Database, Item, ItemDraft};
    use crate::ledger::Ledger;
    use crate::pipeline::Collaborators;
    use crate::queue::{EnqueueOptions, Job, JobQueue};
    use crate::types::{JobStatus, TaskStatus};
    use async_trait::async_trait;
    use tempfile::NamedTempFile;

    struct NoSource;

    #[async_trait]
    impl SourceConnector for NoSource {
        async fn discover(&self, _series: &str, _page: u32) -> Result<Vec<ItemDraft>> {
            Ok(Vec::new())
        }
        async fn resolve(&self, _item: &Item) -> Result<String> {
            Err(Error::Transient("detail page unavailable".into()))
        }
    }

    struct NoTransport;

    #[async_trait]
    impl Transport for NoTransport {
        async fn stream(&self, url: &str) -> Result<RemoteFile> {
            Err(Error::ResourceNotFound(url.to_string()))
        }
    }

    struct NoNotifier;

    #[async_trait]
    impl Notifier for NoNotifier {
        async fn send(&self, _envelope: &Envelope) -> Result<bool> {
            Ok(false)
        }
    }

    async fn worker(max_retries: u32) -> (NamedTempFile, Arc<Database>, Worker) {
        let temp_file = NamedTempFile::new().unwrap();
        let db = Arc::new(Database::new(temp_file.path()).await.unwrap());
        let mut config = Config::default();
        config.retry = RetryConfig {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        };
        let config = Arc::new(config);
        let queue = Arc::new(SqliteJobQueue::new(db.clone()));
        let collaborators = Collaborators {
            source: Arc::new(NoSource),
            transport: Arc::new(NoTransport),
            notifier: Arc::new(NoNotifier),
            object_store: None,
        };
        let ctx = Arc::new(
            PipelineContext::new(db.clone(), queue.clone(), config, collaborators).unwrap(),
        );
        let worker = Worker::new(queue, ctx, Arc::new(Ledger::new(db.clone())));
        (temp_file, db, worker)
    }

    #[tokio::test]
    async fn empty_queue_runs_nothing() {
        let (_tmp, _db, worker) = worker(3).await;
        assert!(worker.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_job_succeeds_and_is_recorded() {
        let (_tmp, db, worker) = worker(3).await;
        let enqueued = worker
            .queue
            .enqueue(&Job::SweepReconcile, EnqueueOptions::default())
            .await
            .unwrap();

        let (id, outcome) = worker.run_once().await.unwrap().unwrap();
        assert_eq!(&id, enqueued.job_id());
        assert_eq!(outcome, JobOutcome::Succeeded);

        let task = db.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(
            task.result.as_deref(),
            Some(r#"{"duplicates":0,"enqueued":0}"#)
        );
        assert_eq!(
            db.get_job(&id).await.unwrap().unwrap().status,
            JobStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn validation_failure_is_buried_without_retry() {
        let (_tmp, db, worker) = worker(3).await;
        let enqueued = worker
            .queue
            .enqueue(
                &Job::Download {
                    item_id: crate::types::ItemId(404),
                },
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let (_, outcome) = worker.run_once().await.unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::Failed);

        let task = db.get_task(enqueued.job_id()).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failure);
        assert!(task.error.unwrap().starts_with("type: validation_error"));
        assert_eq!(
            db.get_job(enqueued.job_id()).await.unwrap().unwrap().status,
            JobStatus::Dead
        );
    }

    #[tokio::test]
    async fn transient_failure_retries_up_to_cap() {
        let (_tmp, db, worker) = worker(2).await;
        let (item, _) = db
            .upsert_item(
                "Weekly 1",
                "weekly",
                chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                "detail-1",
            )
            .await
            .unwrap();
        let enqueued = worker
            .queue
            .enqueue(&Job::FetchDetail { item_id: item.id }, EnqueueOptions::default())
            .await
            .unwrap();
        let id = enqueued.job_id().clone();

        for _ in 0..2 {
            let (_, outcome) = worker.run_once().await.unwrap().unwrap();
            assert!(matches!(outcome, JobOutcome::Retrying { .. }));
            assert_eq!(
                db.get_task(&id).await.unwrap().unwrap().status,
                TaskStatus::Retry
            );
        }

        let (_, outcome) = worker.run_once().await.unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::Failed);
        let row = db.get_job(&id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Dead);
        assert_eq!(row.attempts, 2);
        assert!(worker.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn closed_queue_releases_job_without_spending_an_attempt() {
        let (_tmp, db, worker) = worker(3).await;
        db.insert_subscriber("a@example.com").await.unwrap();
        let enqueued = worker
            .queue
            .enqueue(&Job::SweepReconcile, EnqueueOptions::default())
            .await
            .unwrap();
        let id = enqueued.job_id().clone();

        // Shutdown starts while the sweep is about to fan out
        worker.queue.close();
        let (_, outcome) = worker.run_once().await.unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::Released);

        let row = db.get_job(&id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Queued);
        assert_eq!(row.attempts, 0);
        assert_eq!(row.last_error, None);
        assert_eq!(
            db.get_task(&id).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );

        // Due again at once for whichever process starts next
        let now = chrono::Utc::now().timestamp();
        let reclaimed = db.claim_job(now, now + 60).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, id);
        assert_eq!(reclaimed.attempts, 0);
    }

    #[tokio::test]
    async fn dispatcher_stops_on_cancel() {
        let (_tmp, db, worker) = worker(3).await;
        worker
            .queue
            .enqueue(&Job::SweepDistribute, EnqueueOptions::default())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = worker.start(cancel.clone());

        for _ in 0..100 {
            if db.count_active_jobs().await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(db.count_active_jobs().await.unwrap(), 0);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
