//! Database layer for issue-courier
//!
//! Handles SQLite persistence for items, subscribers, delivery links, the task ledger,
//! and the durable job queue.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`items`] - Item upsert, detail/download bookkeeping, cascade delete
//! - [`subscribers`] - Subscribers and their subscriptions
//! - [`links`] - Per-(subscriber, item) delivery status
//! - [`tasks`] - Task ledger records
//! - [`jobs`] - Durable job queue rows
//!
//! Cascades are explicit: deleting an item or subscriber goes through
//! [`Database::delete_item_cascade`] / [`Database::delete_subscriber_cascade`], which
//! remove dependent links in the same transaction.

use crate::query::Queryable;
use crate::types::{ItemId, JobId, JobStatus, LinkStatus, SubscriberId, TaskStatus};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, sqlite::SqlitePool};

mod items;
mod jobs;
mod links;
mod migrations;
mod subscribers;
mod tasks;

pub use jobs::{EnqueueResult, NewJob};
pub use subscribers::SubscriptionChange;

/// Candidate item reported by a source connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDraft {
    /// Display title
    pub title: String,
    /// Series the source filed it under; classified from the title when absent
    pub series: Option<String>,
    /// Publication date
    pub publication_date: NaiveDate,
    /// Detail page reference (unique per item)
    pub detail_ref: String,
}

/// Item record from database
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Item {
    /// Unique database ID
    pub id: ItemId,
    /// Display title
    pub title: String,
    /// Logical series
    pub series: String,
    /// Publication date
    pub publication_date: NaiveDate,
    /// Detail page reference; the discovery idempotency key
    pub detail_ref: String,
    /// Retrievable resource reference, set once resolved
    pub resource_ref: Option<String>,
    /// Local file path, set once downloaded
    pub local_path: Option<String>,
    /// File size in bytes (0 until downloaded)
    pub byte_size: i64,
    /// Format tag (pdf, epub, ...)
    pub format: Option<String>,
    /// 7z archive of the downloaded file, set once compressed
    pub compressed_path: Option<String>,
    /// Archive size in bytes (0 until compressed)
    pub compressed_size: i64,
    /// Unix timestamp when the item was discovered
    pub created_at: i64,
    /// Unix timestamp of the last mutation
    pub updated_at: i64,
}

impl Item {
    /// Whether a local file has been recorded
    pub fn is_downloaded(&self) -> bool {
        self.byte_size > 0 && self.local_path.as_deref().is_some_and(|p| !p.is_empty())
    }

    /// Whether a compressed copy has been recorded
    pub fn is_compressed(&self) -> bool {
        self.compressed_size > 0 && self.compressed_path.as_deref().is_some_and(|p| !p.is_empty())
    }

    /// Whether the resource reference has been resolved
    pub fn is_resolved(&self) -> bool {
        self.resource_ref.as_deref().is_some_and(|r| !r.is_empty())
    }
}

impl Queryable for Item {
    const TABLE: &'static str = "items";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "title",
        "series",
        "publication_date",
        "detail_ref",
        "resource_ref",
        "local_path",
        "byte_size",
        "format",
        "compressed_path",
        "compressed_size",
        "created_at",
        "updated_at",
    ];
}

/// Subscriber record from database
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Subscriber {
    /// Unique database ID
    pub id: SubscriberId,
    /// Contact address (unique)
    pub address: String,
    /// Unix timestamp when the subscriber registered
    pub created_at: i64,
    /// Unix timestamp of the last mutation
    pub updated_at: i64,
}

impl Queryable for Subscriber {
    const TABLE: &'static str = "subscribers";
    const COLUMNS: &'static [&'static str] = &["id", "address", "created_at", "updated_at"];
}

/// One `{series, subscribed_since}` entry of a subscriber
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Subscription {
    /// Owning subscriber
    pub subscriber_id: SubscriberId,
    /// Subscribed series
    pub series: String,
    /// Items published before this date are not delivered
    pub subscribed_since: NaiveDate,
}

/// Subscriber-item link record from database
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Link {
    /// Unique database ID
    pub id: i64,
    /// Subscriber side
    pub subscriber_id: SubscriberId,
    /// Item side
    pub item_id: ItemId,
    /// Delivery status
    pub status: LinkStatus,
    /// Unix timestamp when the link was created
    pub created_at: i64,
    /// Unix timestamp of the last status change
    pub updated_at: i64,
}

/// Subscriber with downloaded items of one series waiting to be sent
#[derive(Debug, Clone, PartialEq)]
pub struct DistributionBatch {
    /// Recipient
    pub subscriber_id: SubscriberId,
    /// Recipient address
    pub address: String,
    /// Series the items belong to
    pub series: String,
    /// Items with a `downloaded` link for this subscriber
    pub item_ids: Vec<ItemId>,
}

/// Task ledger record from database
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Job identifier
    pub id: JobId,
    /// Job name (discover, fetch_detail, ...)
    pub name: String,
    /// Lifecycle status
    pub status: TaskStatus,
    /// Serialized arguments
    pub args: Option<String>,
    /// Serialized result
    pub result: Option<String>,
    /// `type: <code>, message: <text>` of the last failure
    pub error: Option<String>,
    /// Unix timestamp when the latest attempt started
    pub started_at: Option<i64>,
    /// Unix timestamp when the latest attempt ended
    pub completed_at: Option<i64>,
    /// Job that enqueued this one
    pub parent_id: Option<JobId>,
    /// Unix timestamp when the record was created
    pub created_at: i64,
    /// Unix timestamp of the last transition
    pub updated_at: i64,
}

impl Queryable for TaskRecord {
    const TABLE: &'static str = "tasks";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "name",
        "status",
        "args",
        "result",
        "error",
        "started_at",
        "completed_at",
        "parent_id",
        "created_at",
        "updated_at",
    ];
    const DEFAULT_ORDER: &'static str = "created_at";
}

/// Job queue row from database
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct JobRow {
    /// Job identifier (shared with the ledger record)
    pub id: JobId,
    /// Job name
    pub name: String,
    /// Serialized [`crate::queue::Job`]
    pub args: String,
    /// Idempotency key; unique among queued and running jobs
    pub dedup_key: String,
    /// Job that enqueued this one
    pub parent_id: Option<JobId>,
    /// Queue state
    pub status: JobStatus,
    /// Attempts already consumed (0 before the first run)
    pub attempts: i64,
    /// Unix timestamp before which the job is not claimed
    pub run_at: i64,
    /// Unix timestamp after which a running job is presumed abandoned
    pub lease_until: Option<i64>,
    /// Ledger text of the last failed attempt
    pub last_error: Option<String>,
    /// Unix timestamp when the job was enqueued
    pub created_at: i64,
    /// Unix timestamp of the last transition
    pub updated_at: i64,
}

/// Database handle for issue-courier
pub struct Database {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
