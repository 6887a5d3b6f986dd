//! Task ledger: persistent record of every job invocation
//!
//! The worker calls the [`JobLifecycle`] hooks around each attempt. The ledger is
//! observability, not a commit gate: a failing hook is logged and the job carries on
//! (see [`observe`]).

use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{JobId, TaskStatus};
use async_trait::async_trait;
use std::sync::Arc;

/// Identity of one job invocation as seen by the lifecycle hooks
#[derive(Clone, Debug, PartialEq)]
pub struct TaskContext {
    /// Job identifier
    pub id: JobId,
    /// Job name
    pub name: String,
    /// Serialized arguments
    pub args: String,
    /// Job that enqueued this one
    pub parent_id: Option<JobId>,
}

/// Hooks invoked by the worker around each job attempt
#[async_trait]
pub trait JobLifecycle: Send + Sync {
    /// Get-or-create the record, mark it started, persist the arguments
    async fn before_start(&self, ctx: &TaskContext) -> Result<()>;

    /// Mark the record successful and persist the serialized result
    async fn on_success(&self, ctx: &TaskContext, result: &serde_json::Value) -> Result<()>;

    /// Mark the record failed and persist the rendered error
    async fn on_failure(&self, ctx: &TaskContext, error: &Error) -> Result<()>;

    /// Mark the record as waiting for another attempt
    async fn on_retry(&self, ctx: &TaskContext, error: &Error) -> Result<()>;

    /// Mark the record pending again after shutdown interrupted the attempt
    async fn on_release(&self, _ctx: &TaskContext) -> Result<()> {
        Ok(())
    }
}

/// [`JobLifecycle`] backed by the `tasks` table
pub struct Ledger {
    db: Arc<Database>,
}

impl Ledger {
    /// Create a ledger over `db`
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl JobLifecycle for Ledger {
    async fn before_start(&self, ctx: &TaskContext) -> Result<()> {
        self.db
            .record_task_started(&ctx.id, &ctx.name, &ctx.args, ctx.parent_id.as_ref())
            .await
    }

    async fn on_success(&self, ctx: &TaskContext, result: &serde_json::Value) -> Result<()> {
        let result = serde_json::to_string(result)?;
        self.db
            .record_task_finished(&ctx.id, &ctx.name, TaskStatus::Success, Some(&result), None)
            .await
    }

    async fn on_failure(&self, ctx: &TaskContext, error: &Error) -> Result<()> {
        let text = error.ledger_text();
        self.db
            .record_task_finished(&ctx.id, &ctx.name, TaskStatus::Failure, None, Some(&text))
            .await
    }

    async fn on_retry(&self, ctx: &TaskContext, _error: &Error) -> Result<()> {
        self.db
            .record_task_finished(&ctx.id, &ctx.name, TaskStatus::Retry, None, None)
            .await
    }

    async fn on_release(&self, ctx: &TaskContext) -> Result<()> {
        self.db
            .record_task_finished(&ctx.id, &ctx.name, TaskStatus::Pending, None, None)
            .await
    }
}

/// Log a failed hook instead of propagating it
pub fn observe(hook: &'static str, ctx: &TaskContext, result: Result<()>) {
    if let Err(e) = result {
        tracing::error!(
            job_id = %ctx.id,
            job = %ctx.name,
            hook,
            error = %e,
            "Task ledger hook failed"
        );
    }
}
