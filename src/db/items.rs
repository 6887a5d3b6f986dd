//! Item persistence: discovery upsert, detail/download bookkeeping, cascade delete.

use crate::error::DatabaseError;
use crate::types::{ItemId, LinkStatus};
use crate::{Error, Result};

use super::{Database, Item};

const ITEM_COLUMNS: &str = "id, title, series, publication_date, detail_ref, resource_ref, \
                            local_path, byte_size, format, compressed_path, compressed_size, \
                            created_at, updated_at";

impl Database {
    /// Insert an item unless one with the same detail reference exists
    ///
    /// Returns the stored row and whether it was created by this call. An existing row is
    /// returned unchanged; discovery never overwrites fields set by later stages.
    pub async fn upsert_item(
        &self,
        title: &str,
        series: &str,
        publication_date: chrono::NaiveDate,
        detail_ref: &str,
    ) -> Result<(Item, bool)> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO items (title, series, publication_date, detail_ref, byte_size, created_at, updated_at)
            VALUES (?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT(detail_ref) DO NOTHING
            "#,
        )
        .bind(title)
        .bind(series)
        .bind(publication_date)
        .bind(detail_ref)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to upsert item: {}",
                e
            )))
        })?;

        let created = result.rows_affected() > 0;
        let item = self
            .get_item_by_detail_ref(detail_ref)
            .await?
            .ok_or_else(|| {
                Error::Database(DatabaseError::NotFound(format!(
                    "item with detail reference {} vanished after upsert",
                    detail_ref
                )))
            })?;

        Ok((item, created))
    }

    /// Get an item by ID
    pub async fn get_item(&self, id: ItemId) -> Result<Option<Item>> {
        sqlx::query_as::<_, Item>(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to get item: {}",
                    e
                )))
            })
    }

    /// Get an item by its detail reference
    pub async fn get_item_by_detail_ref(&self, detail_ref: &str) -> Result<Option<Item>> {
        sqlx::query_as::<_, Item>(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE detail_ref = ?"
        ))
        .bind(detail_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get item by detail reference: {}",
                e
            )))
        })
    }

    /// All items of a series, oldest publication first
    pub async fn items_in_series(&self, series: &str) -> Result<Vec<Item>> {
        sqlx::query_as::<_, Item>(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE series = ? ORDER BY publication_date ASC, id ASC"
        ))
        .bind(series)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list items in series: {}",
                e
            )))
        })
    }

    /// Record the resolved resource reference
    ///
    /// Only fills an unset reference; returns false if the item already had one or is gone.
    pub async fn set_resource_ref(&self, id: ItemId, resource_ref: &str) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            UPDATE items SET resource_ref = ?, updated_at = ?
            WHERE id = ? AND (resource_ref IS NULL OR resource_ref = '')
            "#,
        )
        .bind(resource_ref)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to set resource reference: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a completed download and release every pending link of the item
    ///
    /// The item update and the `pending -> downloaded` link flip commit together. A
    /// compressed copy of an earlier file is forgotten.
    /// Returns the number of links that became ready to distribute.
    pub async fn mark_downloaded(
        &self,
        id: ItemId,
        local_path: &str,
        byte_size: i64,
        format: &str,
    ) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin transaction: {}",
                e
            )))
        })?;

        let updated = sqlx::query(
            r#"
            UPDATE items SET local_path = ?, byte_size = ?, format = ?,
                compressed_path = NULL, compressed_size = 0, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(local_path)
        .bind(byte_size)
        .bind(format)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to record download: {}",
                e
            )))
        })?;

        if updated.rows_affected() == 0 {
            return Err(Error::Database(DatabaseError::NotFound(format!(
                "item {}",
                id
            ))));
        }

        let flipped = sqlx::query(
            "UPDATE links SET status = ?, updated_at = ? WHERE item_id = ? AND status = ?",
        )
        .bind(LinkStatus::Downloaded)
        .bind(now)
        .bind(id)
        .bind(LinkStatus::Pending)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to release pending links: {}",
                e
            )))
        })?;

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit download: {}",
                e
            )))
        })?;

        Ok(flipped.rows_affected())
    }

    /// Record the 7z archive of the item's downloaded file
    ///
    /// Returns false if the item is gone or no longer has a file.
    pub async fn mark_compressed(
        &self,
        id: ItemId,
        compressed_path: &str,
        compressed_size: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE items SET compressed_path = ?, compressed_size = ?, updated_at = ?
            WHERE id = ? AND byte_size > 0
            "#,
        )
        .bind(compressed_path)
        .bind(compressed_size)
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to record compression: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete an item together with all of its links
    ///
    /// Returns false if the item did not exist.
    pub async fn delete_item_cascade(&self, id: ItemId) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin transaction: {}",
                e
            )))
        })?;

        sqlx::query("DELETE FROM links WHERE item_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete item links: {}",
                    e
                )))
            })?;

        let result = sqlx::query("DELETE FROM items WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete item: {}",
                    e
                )))
            })?;

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit item deletion: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }
}
