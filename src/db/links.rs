//! Subscriber-item delivery links.

use crate::error::DatabaseError;
use crate::state::assign_status;
use crate::types::{ItemId, LinkStatus, SubscriberId};
use crate::{Error, Result};
use sqlx::{QueryBuilder, Sqlite};

use super::{Database, DistributionBatch, Item, Link};

const LINK_COLUMNS: &str = "id, subscriber_id, item_id, status, created_at, updated_at";

impl Database {
    /// Create a link unless one already exists for the pair
    ///
    /// Returns true if this call created it.
    pub async fn insert_link(
        &self,
        subscriber_id: SubscriberId,
        item_id: ItemId,
        status: LinkStatus,
    ) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO links (subscriber_id, item_id, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(subscriber_id, item_id) DO NOTHING
            "#,
        )
        .bind(subscriber_id)
        .bind(item_id)
        .bind(status)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert link: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Link an item to a subscriber, classifying the link from the item's committed state
    ///
    /// The pending row is inserted first so the transaction holds the write lock before
    /// the item is read; a concurrent [`Database::mark_downloaded`] either commits before
    /// the read or flips this link when it runs after. Returns the status of the new link,
    /// or `None` if the pair was already linked.
    pub async fn link_item(
        &self,
        subscriber_id: SubscriberId,
        item_id: ItemId,
        subscribed_since: chrono::NaiveDate,
    ) -> Result<Option<LinkStatus>> {
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin transaction: {}",
                e
            )))
        })?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO links (subscriber_id, item_id, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(subscriber_id, item_id) DO NOTHING
            "#,
        )
        .bind(subscriber_id)
        .bind(item_id)
        .bind(LinkStatus::Pending)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert link: {}",
                e
            )))
        })?;

        if inserted.rows_affected() == 0 {
            return Ok(None);
        }

        let (publication_date, byte_size): (chrono::NaiveDate, i64) =
            sqlx::query_as("SELECT publication_date, byte_size FROM items WHERE id = ?")
                .bind(item_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to read linked item: {}",
                        e
                    )))
                })?;

        let status = assign_status(subscribed_since, publication_date, byte_size);
        if status != LinkStatus::Pending {
            sqlx::query(
                "UPDATE links SET status = ?, updated_at = ? WHERE subscriber_id = ? AND item_id = ?",
            )
            .bind(status)
            .bind(now)
            .bind(subscriber_id)
            .bind(item_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to classify link: {}",
                    e
                )))
            })?;
        }

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit link: {}",
                e
            )))
        })?;

        Ok(Some(status))
    }

    /// Get the link for a (subscriber, item) pair
    pub async fn get_link(
        &self,
        subscriber_id: SubscriberId,
        item_id: ItemId,
    ) -> Result<Option<Link>> {
        sqlx::query_as::<_, Link>(&format!(
            "SELECT {LINK_COLUMNS} FROM links WHERE subscriber_id = ? AND item_id = ?"
        ))
        .bind(subscriber_id)
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get link: {}",
                e
            )))
        })
    }

    /// All links of an item
    pub async fn links_for_item(&self, item_id: ItemId) -> Result<Vec<Link>> {
        sqlx::query_as::<_, Link>(&format!(
            "SELECT {LINK_COLUMNS} FROM links WHERE item_id = ? ORDER BY subscriber_id ASC"
        ))
        .bind(item_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list item links: {}",
                e
            )))
        })
    }

    /// All links of a subscriber
    pub async fn links_for_subscriber(&self, subscriber_id: SubscriberId) -> Result<Vec<Link>> {
        sqlx::query_as::<_, Link>(&format!(
            "SELECT {LINK_COLUMNS} FROM links WHERE subscriber_id = ? ORDER BY item_id ASC"
        ))
        .bind(subscriber_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list subscriber links: {}",
                e
            )))
        })
    }

    /// Delete a subscriber's links to items outside `series`
    ///
    /// Returns the number of links deleted.
    pub async fn delete_links_outside_series(
        &self,
        subscriber_id: SubscriberId,
        series: &[String],
    ) -> Result<u64> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM links WHERE subscriber_id = ");
        qb.push_bind(subscriber_id);
        if !series.is_empty() {
            qb.push(" AND item_id IN (SELECT id FROM items WHERE series NOT IN (");
            let mut separated = qb.separated(", ");
            for name in series {
                separated.push_bind(name.as_str());
            }
            separated.push_unseparated("))");
        }

        let result = qb.build().execute(&self.pool).await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to delete stale links: {}",
                e
            )))
        })?;

        Ok(result.rows_affected())
    }

    /// Items of `series` that have no link to the subscriber yet
    pub async fn unlinked_items(
        &self,
        subscriber_id: SubscriberId,
        series: &str,
    ) -> Result<Vec<Item>> {
        sqlx::query_as::<_, Item>(
            r#"
            SELECT id, title, series, publication_date, detail_ref, resource_ref,
                   local_path, byte_size, format, compressed_path, compressed_size,
                   created_at, updated_at
            FROM items
            WHERE series = ?
              AND id NOT IN (SELECT item_id FROM links WHERE subscriber_id = ?)
            ORDER BY publication_date ASC, id ASC
            "#,
        )
        .bind(series)
        .bind(subscriber_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list unlinked items: {}",
                e
            )))
        })
    }

    /// Flip the recipient's `downloaded` links for `item_ids` to `distributed`
    ///
    /// `pending` and already-distributed links are left alone. Returns the number flipped.
    pub async fn mark_distributed(&self, address: &str, item_ids: &[ItemId]) -> Result<u64> {
        if item_ids.is_empty() {
            return Ok(0);
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE links SET status = ");
        qb.push_bind(LinkStatus::Distributed)
            .push(", updated_at = ")
            .push_bind(chrono::Utc::now().timestamp())
            .push(" WHERE status = ")
            .push_bind(LinkStatus::Downloaded)
            .push(" AND subscriber_id IN (SELECT id FROM subscribers WHERE address = ")
            .push_bind(address)
            .push(") AND item_id IN (");
        let mut separated = qb.separated(", ");
        for id in item_ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = qb.build().execute(&self.pool).await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to mark links distributed: {}",
                e
            )))
        })?;

        Ok(result.rows_affected())
    }

    /// Force a link into `status`, bypassing the forward-only rule
    ///
    /// Operator tool for resends. Returns false if the link does not exist.
    pub async fn reflag_link(
        &self,
        subscriber_id: SubscriberId,
        item_id: ItemId,
        status: LinkStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE links SET status = ?, updated_at = ? WHERE subscriber_id = ? AND item_id = ?",
        )
        .bind(status)
        .bind(chrono::Utc::now().timestamp())
        .bind(subscriber_id)
        .bind(item_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to reflag link: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Downloaded-but-unsent items, grouped per (subscriber, series)
    pub async fn distribution_batches(&self) -> Result<Vec<DistributionBatch>> {
        let rows: Vec<(SubscriberId, String, String, ItemId)> = sqlx::query_as(
            r#"
            SELECT l.subscriber_id, s.address, i.series, i.id
            FROM links l
            JOIN items i ON i.id = l.item_id
            JOIN subscribers s ON s.id = l.subscriber_id
            WHERE l.status = ? AND i.byte_size > 0
            ORDER BY l.subscriber_id ASC, i.series ASC, i.publication_date ASC, i.id ASC
            "#,
        )
        .bind(LinkStatus::Downloaded)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list distribution batches: {}",
                e
            )))
        })?;

        let mut batches: Vec<DistributionBatch> = Vec::new();
        for (subscriber_id, address, series, item_id) in rows {
            match batches.last_mut() {
                Some(batch) if batch.subscriber_id == subscriber_id && batch.series == series => {
                    batch.item_ids.push(item_id);
                }
                _ => batches.push(DistributionBatch {
                    subscriber_id,
                    address,
                    series,
                    item_ids: vec![item_id],
                }),
            }
        }

        Ok(batches)
    }
}
