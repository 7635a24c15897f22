//! SQLite-backed `EventStorage`: a single `events` table doubling as both
//! the durable queue and the checkout marker. A row is only removed once
//! the consumer acknowledges it, giving at-least-once delivery across a
//! restart.
//!
//! Uses `sqlx`'s runtime query API (`sqlx::query`/`query_as`) rather than
//! the `query!`/`query_as!` compile-time macros, since those require either
//! a live database at build time or a checked-in `sqlx-data.json` (see
//! DESIGN.md).

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::error::StorageError;

use super::EventStorage;

pub struct SqliteStorage {
    pool: SqlitePool,
    max_records_count: i64,
    batch_size: i64,
}

impl SqliteStorage {
    pub async fn new(
        data_file_path: &Path,
        max_records_count: usize,
        batch_size: usize,
    ) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(data_file_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (\
                id INTEGER PRIMARY KEY AUTOINCREMENT, \
                payload BLOB NOT NULL, \
                checked_out INTEGER NOT NULL DEFAULT 0\
            )",
        )
        .execute(&pool)
        .await?;

        Ok(SqliteStorage {
            pool,
            max_records_count: max_records_count as i64,
            batch_size: batch_size as i64,
        })
    }

    async fn count(&self) -> Result<i64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }
}

#[async_trait]
impl EventStorage for SqliteStorage {
    async fn put(&self, bytes: Vec<u8>) -> Result<bool, StorageError> {
        if self.count().await? >= self.max_records_count {
            return Ok(false);
        }
        sqlx::query("INSERT INTO events (payload, checked_out) VALUES (?, 0)")
            .bind(bytes)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    async fn get_event_pack(&self) -> Result<Vec<Vec<u8>>, StorageError> {
        let checked_out = sqlx::query(
            "SELECT payload FROM events WHERE checked_out = 1 ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        if !checked_out.is_empty() {
            return Ok(checked_out
                .into_iter()
                .map(|row| row.get::<Vec<u8>, _>("payload"))
                .collect());
        }

        let to_check_out: Vec<i64> = sqlx::query(
            "SELECT id FROM events WHERE checked_out = 0 ORDER BY id ASC LIMIT ?",
        )
        .bind(self.batch_size)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| row.get::<i64, _>("id"))
        .collect();

        if to_check_out.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut payloads = Vec::with_capacity(to_check_out.len());
        for id in to_check_out {
            sqlx::query("UPDATE events SET checked_out = 1 WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            let row = sqlx::query("SELECT payload FROM events WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
            payloads.push(row.get::<Vec<u8>, _>("payload"));
        }
        tx.commit().await?;

        Ok(payloads)
    }

    async fn event_pack_processing_done(&self) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM events WHERE checked_out = 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), StorageError> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_rejects_once_capacity_is_reached() {
        crate::test_log::init();
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::new(&dir.path().join("events.db"), 2, 10)
            .await
            .unwrap();

        assert!(storage.put(vec![1]).await.unwrap());
        assert!(storage.put(vec![2]).await.unwrap());
        assert!(!storage.put(vec![3]).await.unwrap());
    }

    #[tokio::test]
    async fn checkout_is_idempotent_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::new(&dir.path().join("events.db"), 10, 2)
            .await
            .unwrap();
        for i in 0..3u8 {
            storage.put(vec![i]).await.unwrap();
        }

        let first = storage.get_event_pack().await.unwrap();
        assert_eq!(first, vec![vec![0], vec![1]]);

        let again = storage.get_event_pack().await.unwrap();
        assert_eq!(again, first);

        storage.event_pack_processing_done().await.unwrap();
        let next = storage.get_event_pack().await.unwrap();
        assert_eq!(next, vec![vec![2]]);
    }
}
