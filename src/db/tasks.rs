//! Task ledger records.
//!
//! Every write here is a single statement, so each lifecycle transition commits on its own.

use crate::error::DatabaseError;
use crate::types::{JobId, TaskStatus};
use crate::{Error, Result};
use std::collections::BTreeMap;

use super::{Database, TaskRecord};

const TASK_COLUMNS: &str = "id, name, status, args, result, error, started_at, completed_at, \
                            parent_id, created_at, updated_at";

impl Database {
    /// Create a `pending` record for a freshly enqueued job; no-op if it exists
    pub async fn insert_pending_task(
        &self,
        id: &JobId,
        name: &str,
        args: &str,
        parent_id: Option<&JobId>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO tasks (id, name, status, args, parent_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(TaskStatus::Pending)
        .bind(args)
        .bind(parent_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert task: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Get-or-create the record and mark it `started`
    pub async fn record_task_started(
        &self,
        id: &JobId,
        name: &str,
        args: &str,
        parent_id: Option<&JobId>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO tasks (id, name, status, args, started_at, parent_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                args = excluded.args,
                started_at = excluded.started_at,
                completed_at = NULL,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(TaskStatus::Started)
        .bind(args)
        .bind(now)
        .bind(parent_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to record task start: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Close the current attempt with `status`
    ///
    /// `result` and `error` overwrite the stored values only when given, so a retry
    /// transition leaves both untouched.
    pub async fn record_task_finished(
        &self,
        id: &JobId,
        name: &str,
        status: TaskStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO tasks (id, name, status, result, error, completed_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                result = COALESCE(excluded.result, tasks.result),
                error = COALESCE(excluded.error, tasks.error),
                completed_at = excluded.completed_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(status)
        .bind(result)
        .bind(error)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to record task {}: {}",
                status, e
            )))
        })?;

        Ok(())
    }

    /// Get a ledger record by job ID
    pub async fn get_task(&self, id: &JobId) -> Result<Option<TaskRecord>> {
        sqlx::query_as::<_, TaskRecord>(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to get task: {}",
                    e
                )))
            })
    }

    /// Records of jobs enqueued by `parent_id`, oldest first
    pub async fn child_tasks(&self, parent_id: &JobId) -> Result<Vec<TaskRecord>> {
        sqlx::query_as::<_, TaskRecord>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE parent_id = ? ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list child tasks: {}",
                e
            )))
        })
    }

    /// Number of records per status; every status is present, possibly with 0
    pub async fn task_status_summary(&self) -> Result<BTreeMap<String, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to summarize tasks: {}",
                        e
                    )))
                })?;

        let mut summary: BTreeMap<String, i64> = TaskStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        summary.extend(rows);
        Ok(summary)
    }

    /// Delete a ledger record; returns false if it did not exist
    pub async fn delete_task(&self, id: &JobId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete task: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }
}
