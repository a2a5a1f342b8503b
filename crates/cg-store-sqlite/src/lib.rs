#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cg-store-sqlite** – read-only attachment to an aggregator's embedded
//! SQLite activity database, for the database-import flow.
//!
//! Media-activity aggregators such as Tautulli keep their own playback
//! history in a local SQLite file (a `session_history` table, one row per
//! playback). The importer attaches that file read-only and streams
//! through it in ascending-`id` batches rather than loading it whole,
//! so very large histories can be imported without a bespoke driver.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

/// Errors reading from an attached activity database.
#[derive(Debug, thiserror::Error)]
pub enum ImportSourceError {
    /// The underlying SQLite connection or query failed.
    #[error("activity database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One playback row as it exists in the source aggregator's schema,
/// before normalization into a canonical event.
#[derive(Debug, Clone, PartialEq)]
pub struct RawImportRecord {
    /// Row id in the source database; batching cursors on this.
    pub id: i64,
    /// Session key assigned by the media server.
    pub session_key: Option<String>,
    /// Playback start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Playback stop time, if the session has ended.
    pub stopped_at: Option<DateTime<Utc>>,
    /// Numeric user id in the source schema; `0` means absent.
    pub user_id: i64,
    /// Display username.
    pub username: Option<String>,
    /// Client IP address. `"N/A"` means absent, same as live ingress.
    pub ip_address: Option<String>,
    /// `movie`, `episode`, `track`, etc.
    pub media_type: Option<String>,
    /// Title of the media played.
    pub title: Option<String>,
    /// Show title, for episodes.
    pub grandparent_title: Option<String>,
    /// Season title, for episodes.
    pub parent_title: Option<String>,
    /// Media-server instance identifier, if recorded.
    pub server_id: Option<String>,
    /// Player application name.
    pub player: Option<String>,
    /// Client platform.
    pub platform: Option<String>,
    /// `direct play`, `copy`, or `transcode`.
    pub transcode_decision: Option<String>,
}

/// Streams an attached activity database in ascending-`id` batches.
///
/// A batch reader never re-orders or skips rows: `read_batch(since_id,
/// limit)` always returns the next `limit` rows with `id > since_id`,
/// strictly ascending by `id`.
#[async_trait]
pub trait BatchReader: Send + Sync {
    /// Read up to `limit` rows with `id` strictly greater than `since_id`,
    /// ordered ascending by `id`.
    async fn read_batch(
        &self,
        since_id: i64,
        limit: i64,
    ) -> Result<Vec<RawImportRecord>, ImportSourceError>;
}

/// A read-only attachment to a Tautulli-style `session_history` database.
pub struct SqliteBatchReader {
    pool: SqlitePool,
}

impl SqliteBatchReader {
    /// Attaches the activity database at `path` read-only. The file must
    /// already exist; this never creates or migrates a schema — that
    /// would defeat the point of treating it as foreign, aggregator-owned
    /// storage.
    pub async fn attach<P: AsRef<Path>>(path: P) -> Result<Self, ImportSourceError> {
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            path.as_ref().display()
        ))?
        .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Wraps an already-open pool, e.g. a shared in-memory database in
    /// tests.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BatchReader for SqliteBatchReader {
    async fn read_batch(
        &self,
        since_id: i64,
        limit: i64,
    ) -> Result<Vec<RawImportRecord>, ImportSourceError> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_key, started_at, stopped_at, user_id, username,
                   ip_address, media_type, title, grandparent_title, parent_title,
                   server_id, player, platform, transcode_decision
            FROM session_history
            WHERE id > ?
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(since_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| RawImportRecord {
                id: row.get("id"),
                session_key: row.get("session_key"),
                started_at: row
                    .get::<Option<i64>, _>("started_at")
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
                stopped_at: row
                    .get::<Option<i64>, _>("stopped_at")
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
                user_id: row.get::<Option<i64>, _>("user_id").unwrap_or(0),
                username: row.get("username"),
                ip_address: row.get("ip_address"),
                media_type: row.get("media_type"),
                title: row.get("title"),
                grandparent_title: row.get("grandparent_title"),
                parent_title: row.get("parent_title"),
                server_id: row.get("server_id"),
                player: row.get("player"),
                platform: row.get("platform"),
                transcode_decision: row.get("transcode_decision"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        sqlx::query(
            r#"
            CREATE TABLE session_history (
                id INTEGER PRIMARY KEY,
                session_key TEXT,
                started_at INTEGER,
                stopped_at INTEGER,
                user_id INTEGER,
                username TEXT,
                ip_address TEXT,
                media_type TEXT,
                title TEXT,
                grandparent_title TEXT,
                parent_title TEXT,
                server_id TEXT,
                player TEXT,
                platform TEXT,
                transcode_decision TEXT
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        for i in 1..=5i64 {
            sqlx::query(
                r#"INSERT INTO session_history
                   (id, session_key, started_at, user_id, username, ip_address, media_type, title)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(i)
            .bind(format!("session-{i}"))
            .bind(1_700_000_000_i64 + i)
            .bind(100 + i)
            .bind(format!("user-{i}"))
            .bind("10.0.0.1")
            .bind("episode")
            .bind(format!("Title {i}"))
            .execute(&pool)
            .await
            .unwrap();
        }

        pool
    }

    #[tokio::test]
    async fn reads_strictly_ascending_batches() {
        let reader = SqliteBatchReader::from_pool(seeded_pool().await);

        let first = reader.read_batch(0, 2).await.unwrap();
        assert_eq!(first.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);

        let second = reader.read_batch(2, 2).await.unwrap();
        assert_eq!(second.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 4]);

        let third = reader.read_batch(4, 2).await.unwrap();
        assert_eq!(third.iter().map(|r| r.id).collect::<Vec<_>>(), vec![5]);

        let past_end = reader.read_batch(5, 2).await.unwrap();
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn maps_columns_into_raw_records() {
        let reader = SqliteBatchReader::from_pool(seeded_pool().await);
        let batch = reader.read_batch(0, 1).await.unwrap();
        let record = &batch[0];

        assert_eq!(record.id, 1);
        assert_eq!(record.session_key.as_deref(), Some("session-1"));
        assert_eq!(record.user_id, 101);
        assert_eq!(record.username.as_deref(), Some("user-1"));
        assert_eq!(record.ip_address.as_deref(), Some("10.0.0.1"));
        assert_eq!(record.media_type.as_deref(), Some("episode"));
        assert_eq!(record.title.as_deref(), Some("Title 1"));
        assert!(record.started_at.is_some());
    }

    #[tokio::test]
    async fn attach_rejects_a_nonexistent_file() {
        let result = SqliteBatchReader::attach("/nonexistent/path/to/activity.db").await;
        assert!(result.is_err());
    }
}
