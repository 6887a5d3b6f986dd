//! Subscribers and their per-series subscriptions.

use crate::error::DatabaseError;
use crate::types::SubscriberId;
use crate::{Error, Result};
use chrono::NaiveDate;

use super::{Database, Subscriber, Subscription};

/// Effect of [`Database::upsert_subscription`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionChange {
    /// No entry existed for the series
    Added,
    /// An identical entry already existed
    Unchanged,
    /// The series was already subscribed with a different date
    Replaced,
}

impl Database {
    /// Register a subscriber
    pub async fn insert_subscriber(&self, address: &str) -> Result<SubscriberId> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            "INSERT INTO subscribers (address, created_at, updated_at) VALUES (?, ?, ?)",
        )
        .bind(address)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => Error::Database(
                DatabaseError::ConstraintViolation(format!(
                    "subscriber {} already exists",
                    address
                )),
            ),
            e => Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert subscriber: {}",
                e
            ))),
        })?;

        Ok(SubscriberId(result.last_insert_rowid()))
    }

    /// Get a subscriber by ID
    pub async fn get_subscriber(&self, id: SubscriberId) -> Result<Option<Subscriber>> {
        sqlx::query_as::<_, Subscriber>(
            "SELECT id, address, created_at, updated_at FROM subscribers WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get subscriber: {}",
                e
            )))
        })
    }

    /// Get a subscriber by contact address
    pub async fn get_subscriber_by_address(&self, address: &str) -> Result<Option<Subscriber>> {
        sqlx::query_as::<_, Subscriber>(
            "SELECT id, address, created_at, updated_at FROM subscribers WHERE address = ?",
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get subscriber by address: {}",
                e
            )))
        })
    }

    /// IDs of every subscriber
    pub async fn list_subscriber_ids(&self) -> Result<Vec<SubscriberId>> {
        sqlx::query_scalar::<_, SubscriberId>("SELECT id FROM subscribers ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to list subscribers: {}",
                    e
                )))
            })
    }

    /// A subscriber's subscriptions, ordered by series
    pub async fn subscriptions(&self, id: SubscriberId) -> Result<Vec<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            r#"
            SELECT subscriber_id, series, subscribed_since
            FROM subscriptions
            WHERE subscriber_id = ?
            ORDER BY series ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list subscriptions: {}",
                e
            )))
        })
    }

    /// Every subscription to `series`
    pub async fn subscriptions_for_series(&self, series: &str) -> Result<Vec<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            r#"
            SELECT subscriber_id, series, subscribed_since
            FROM subscriptions
            WHERE series = ?
            ORDER BY subscriber_id ASC
            "#,
        )
        .bind(series)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list series subscriptions: {}",
                e
            )))
        })
    }

    /// Subscribe to a series, keeping at most one entry per series
    pub async fn upsert_subscription(
        &self,
        id: SubscriberId,
        series: &str,
        since: NaiveDate,
    ) -> Result<SubscriptionChange> {
        let existing: Option<NaiveDate> = sqlx::query_scalar(
            "SELECT subscribed_since FROM subscriptions WHERE subscriber_id = ? AND series = ?",
        )
        .bind(id)
        .bind(series)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to read subscription: {}",
                e
            )))
        })?;

        if existing == Some(since) {
            return Ok(SubscriptionChange::Unchanged);
        }

        sqlx::query(
            r#"
            INSERT INTO subscriptions (subscriber_id, series, subscribed_since)
            VALUES (?, ?, ?)
            ON CONFLICT(subscriber_id, series) DO UPDATE SET subscribed_since = excluded.subscribed_since
            "#,
        )
        .bind(id)
        .bind(series)
        .bind(since)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to write subscription: {}",
                e
            )))
        })?;

        self.touch_subscriber(id).await?;

        Ok(if existing.is_some() {
            SubscriptionChange::Replaced
        } else {
            SubscriptionChange::Added
        })
    }

    /// Unsubscribe from a series and delete every link to an item of that series
    ///
    /// Returns `None` if the subscriber had no such subscription, otherwise the number of
    /// links deleted.
    pub async fn delete_subscription(&self, id: SubscriberId, series: &str) -> Result<Option<u64>> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin transaction: {}",
                e
            )))
        })?;

        let removed = sqlx::query("DELETE FROM subscriptions WHERE subscriber_id = ? AND series = ?")
            .bind(id)
            .bind(series)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete subscription: {}",
                    e
                )))
            })?;

        if removed.rows_affected() == 0 {
            return Ok(None);
        }

        let links = sqlx::query(
            r#"
            DELETE FROM links
            WHERE subscriber_id = ?
              AND item_id IN (SELECT id FROM items WHERE series = ?)
            "#,
        )
        .bind(id)
        .bind(series)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to delete subscription links: {}",
                e
            )))
        })?;

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit subscription removal: {}",
                e
            )))
        })?;

        self.touch_subscriber(id).await?;

        Ok(Some(links.rows_affected()))
    }

    /// Delete a subscriber with its subscriptions and links
    ///
    /// Returns false if the subscriber did not exist.
    pub async fn delete_subscriber_cascade(&self, id: SubscriberId) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin transaction: {}",
                e
            )))
        })?;

        for statement in [
            "DELETE FROM links WHERE subscriber_id = ?",
            "DELETE FROM subscriptions WHERE subscriber_id = ?",
        ] {
            sqlx::query(statement)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to delete subscriber dependents: {}",
                        e
                    )))
                })?;
        }

        let result = sqlx::query("DELETE FROM subscribers WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete subscriber: {}",
                    e
                )))
            })?;

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit subscriber deletion: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    async fn touch_subscriber(&self, id: SubscriberId) -> Result<()> {
        sqlx::query("UPDATE subscribers SET updated_at = ? WHERE id = ?")
            .bind(chrono::Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to touch subscriber: {}",
                    e
                )))
            })?;
        Ok(())
    }
}
