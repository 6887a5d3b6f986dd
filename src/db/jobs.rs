//! Durable job queue rows.
//!
//! A job row carries the runtime's attempt counter. Retries reschedule the same row
//! (same id, `attempts + 1`, later `run_at`), so the count survives process restarts.

use crate::error::DatabaseError;
use crate::types::{JobId, JobStatus, TaskStatus};
use crate::{Error, Result};

use super::{Database, JobRow};

const JOB_COLUMNS: &str = "id, name, args, dedup_key, parent_id, status, attempts, run_at, \
                           lease_until, last_error, created_at, updated_at";

/// New job to be inserted into the queue
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Job identifier
    pub id: JobId,
    /// Job name
    pub name: String,
    /// Serialized job payload
    pub args: String,
    /// Idempotency key
    pub dedup_key: String,
    /// Job that enqueued this one
    pub parent_id: Option<JobId>,
    /// Unix timestamp before which the job must not run
    pub run_at: i64,
}

/// Outcome of an enqueue
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnqueueResult {
    /// A new job was queued
    Created(JobId),
    /// An active job with the same idempotency key already exists
    Duplicate(JobId),
}

impl EnqueueResult {
    /// The id of the queued (new or existing) job
    pub fn job_id(&self) -> &JobId {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => id,
        }
    }
}

impl Database {
    /// Queue a job unless an active one shares its idempotency key
    ///
    /// A `pending` ledger record is written in the same transaction as the job row.
    pub async fn enqueue_job(&self, job: &NewJob) -> Result<EnqueueResult> {
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin transaction: {}",
                e
            )))
        })?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO jobs
                (id, name, args, dedup_key, parent_id, status, attempts, run_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.name)
        .bind(&job.args)
        .bind(&job.dedup_key)
        .bind(&job.parent_id)
        .bind(JobStatus::Queued)
        .bind(job.run_at)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to enqueue job: {}",
                e
            )))
        })?;

        if inserted.rows_affected() == 0 {
            let existing: Option<JobId> = sqlx::query_scalar(
                "SELECT id FROM jobs WHERE dedup_key = ? AND status IN (?, ?)",
            )
            .bind(&job.dedup_key)
            .bind(JobStatus::Queued)
            .bind(JobStatus::Running)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to look up duplicate job: {}",
                    e
                )))
            })?;

            return match existing {
                Some(id) => Ok(EnqueueResult::Duplicate(id)),
                None => Err(Error::Database(DatabaseError::ConstraintViolation(format!(
                    "job id {} already used",
                    job.id
                )))),
            };
        }

        sqlx::query(
            r#"
            INSERT INTO tasks (id, name, status, args, parent_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&job.id)
        .bind(&job.name)
        .bind(TaskStatus::Pending)
        .bind(&job.args)
        .bind(&job.parent_id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to record pending task: {}",
                e
            )))
        })?;

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit enqueue: {}",
                e
            )))
        })?;

        Ok(EnqueueResult::Created(job.id.clone()))
    }

    /// Atomically claim the oldest due job and lease it until `lease_until`
    pub async fn claim_job(&self, now: i64, lease_until: i64) -> Result<Option<JobRow>> {
        sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs SET status = ?, lease_until = ?, updated_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = ? AND run_at <= ?
                ORDER BY run_at ASC, created_at ASC, rowid ASC
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(JobStatus::Running)
        .bind(lease_until)
        .bind(now)
        .bind(JobStatus::Queued)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to claim job: {}",
                e
            )))
        })
    }

    /// Mark a running job as succeeded
    pub async fn complete_job(&self, id: &JobId) -> Result<()> {
        self.finish_job(id, JobStatus::Succeeded, None).await
    }

    /// Mark a job as permanently failed
    pub async fn bury_job(&self, id: &JobId, error: &str) -> Result<()> {
        self.finish_job(id, JobStatus::Dead, Some(error)).await
    }

    async fn finish_job(&self, id: &JobId, status: JobStatus, error: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET status = ?, lease_until = NULL,
                last_error = COALESCE(?, last_error), updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(error)
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to mark job {}: {}",
                status.as_str(),
                e
            )))
        })?;

        Ok(())
    }

    /// Put a failed job back in the queue for another attempt at `run_at`
    pub async fn reschedule_job(&self, id: &JobId, run_at: i64, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET status = ?, attempts = attempts + 1, run_at = ?,
                lease_until = NULL, last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(JobStatus::Queued)
        .bind(run_at)
        .bind(error)
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to reschedule job: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Put a running job back in the queue as it was, without consuming an attempt
    pub async fn release_job(&self, id: &JobId) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            UPDATE jobs SET status = ?, run_at = ?, lease_until = NULL, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(JobStatus::Queued)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(JobStatus::Running)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to release job: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Re-queue running jobs whose lease lapsed; the lost attempt still counts
    ///
    /// Returns the number of jobs recovered.
    pub async fn recover_expired_leases(&self, now: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = ?, attempts = attempts + 1, lease_until = NULL,
                last_error = 'type: timeout, message: worker lease expired', updated_at = ?
            WHERE status = ? AND lease_until < ?
            "#,
        )
        .bind(JobStatus::Queued)
        .bind(now)
        .bind(JobStatus::Running)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to recover expired leases: {}",
                e
            )))
        })?;

        Ok(result.rows_affected())
    }

    /// Get a job row by ID
    pub async fn get_job(&self, id: &JobId) -> Result<Option<JobRow>> {
        sqlx::query_as::<_, JobRow>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to get job: {}",
                    e
                )))
            })
    }

    /// Jobs in `status`, oldest first
    pub async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<JobRow>> {
        sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ? ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list jobs: {}",
                e
            )))
        })
    }

    /// Number of queued or running jobs
    pub async fn count_active_jobs(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status IN (?, ?)")
            .bind(JobStatus::Queued)
            .bind(JobStatus::Running)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count active jobs: {}",
                    e
                )))
            })
    }
}
