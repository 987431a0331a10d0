use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite, Transaction,
};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

use shared::{
    domain::{CollaboratorId, EntryId, LogId, Visibility, WriteSeq},
    error::StoreError,
    order::{OrderMap, RankPatch, RankSlot},
    protocol::LogSummary,
};

mod memory;
pub use memory::MemoryStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Remote document holding the order of every log. Each successful write is
/// atomic and is assigned the next write sequence of that log.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Current order of `log_id`. A log that was never written is empty.
    async fn get(&self, log_id: &LogId) -> StoreResult<OrderMap>;
    /// Overwrites the order: live entries of `order` are rewritten, everything
    /// else becomes a tombstone.
    async fn set(&self, log_id: &LogId, order: &OrderMap) -> StoreResult<WriteSeq>;
    async fn merge(&self, log_id: &LogId, patch: &RankPatch) -> StoreResult<WriteSeq>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every connection to an in-memory url opens a separate database.
        let max_connections = if database_url.starts_with("sqlite::memory:") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Sets the sibling fields of a log document, creating the log if needed.
    pub async fn describe_log(
        &self,
        log_id: &LogId,
        name: &str,
        visibility: Visibility,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO logs (log_id, name, visibility, seq, updated_at) VALUES (?, ?, ?, 0, ?)
             ON CONFLICT(log_id) DO UPDATE SET name = excluded.name, visibility = excluded.visibility",
        )
        .bind(log_id.as_str())
        .bind(name)
        .bind(visibility.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to describe log {log_id}"))?;
        Ok(())
    }

    pub async fn list_logs(&self) -> Result<Vec<LogSummary>> {
        let rows = sqlx::query(
            "SELECT l.log_id, l.name, l.visibility, l.seq, l.updated_at,
                    (SELECT COUNT(*) FROM log_ranks r WHERE r.log_id = l.log_id AND r.removed = 0)
             FROM logs l
             ORDER BY l.log_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list logs")?;

        rows.into_iter()
            .map(|row| -> Result<LogSummary> {
                let visibility: String = row.try_get(2)?;
                Ok(LogSummary {
                    log_id: LogId(row.try_get(0)?),
                    name: row.try_get(1)?,
                    visibility: Visibility::parse(&visibility).unwrap_or_default(),
                    seq: row.try_get::<i64, _>(3)? as u64,
                    updated_at: row.try_get::<DateTime<Utc>, _>(4)?,
                    entry_count: row.try_get::<i64, _>(5)? as usize,
                })
            })
            .collect()
    }

    async fn write_patch(
        &self,
        log_id: &LogId,
        patch: &RankPatch,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> std::result::Result<WriteSeq, sqlx::Error> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO logs (log_id, seq, updated_at) VALUES (?, 0, ?)
             ON CONFLICT(log_id) DO NOTHING",
        )
        .bind(log_id.as_str())
        .bind(now)
        .execute(&mut **tx)
        .await?;

        let seq: i64 = sqlx::query_scalar(
            "UPDATE logs SET seq = seq + 1, updated_by = ?, updated_at = ?
             WHERE log_id = ?
             RETURNING seq",
        )
        .bind(patch.author.as_ref().map(CollaboratorId::as_str))
        .bind(now)
        .bind(log_id.as_str())
        .fetch_one(&mut **tx)
        .await?;

        for (entry_id, rank) in &patch.upserts {
            sqlx::query(
                "INSERT INTO log_ranks (log_id, entry_id, rank, seq, removed) VALUES (?, ?, ?, ?, 0)
                 ON CONFLICT(log_id, entry_id) DO UPDATE SET
                    rank = excluded.rank,
                    seq = excluded.seq,
                    removed = 0",
            )
            .bind(log_id.as_str())
            .bind(entry_id.as_str())
            .bind(*rank)
            .bind(seq)
            .execute(&mut **tx)
            .await?;
        }

        for entry_id in &patch.removals {
            sqlx::query(
                "INSERT INTO log_ranks (log_id, entry_id, rank, seq, removed) VALUES (?, ?, NULL, ?, 1)
                 ON CONFLICT(log_id, entry_id) DO UPDATE SET
                    rank = NULL,
                    seq = excluded.seq,
                    removed = 1",
            )
            .bind(log_id.as_str())
            .bind(entry_id.as_str())
            .bind(seq)
            .execute(&mut **tx)
            .await?;
        }

        Ok(seq as WriteSeq)
    }

    async fn commit_patch(&self, log_id: &LogId, patch: &RankPatch) -> StoreResult<WriteSeq> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| classify("failed to open transaction", err))?;
        let seq = self
            .write_patch(log_id, patch, &mut tx)
            .await
            .map_err(|err| classify("failed to write ranks", err))?;
        tx.commit()
            .await
            .map_err(|err| classify("failed to commit ranks", err))?;
        debug!(%log_id, seq, changed = patch.len(), "ranks committed");
        Ok(seq)
    }
}

#[async_trait]
impl DocumentStore for Storage {
    async fn get(&self, log_id: &LogId) -> StoreResult<OrderMap> {
        let seq: Option<i64> = sqlx::query_scalar("SELECT seq FROM logs WHERE log_id = ?")
            .bind(log_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| classify("failed to load log", err))?;
        let Some(seq) = seq else {
            return Ok(OrderMap::new());
        };

        let rows = sqlx::query(
            "SELECT entry_id, rank, seq, removed FROM log_ranks WHERE log_id = ?",
        )
        .bind(log_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|err| classify("failed to load ranks", err))?;

        let slots = rows
            .into_iter()
            .map(|row| -> std::result::Result<(EntryId, RankSlot), sqlx::Error> {
                let entry_id: String = row.try_get(0)?;
                let rank: Option<i64> = row.try_get(1)?;
                let slot_seq = row.try_get::<i64, _>(2)? as WriteSeq;
                let removed: bool = row.try_get(3)?;
                let slot = match rank {
                    Some(rank) if !removed => RankSlot::Live {
                        rank,
                        seq: slot_seq,
                    },
                    _ => RankSlot::Removed { seq: slot_seq },
                };
                Ok((EntryId(entry_id), slot))
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
            .map_err(|err| classify("failed to decode ranks", err))?;

        Ok(OrderMap::from_slots(slots, seq as WriteSeq))
    }

    async fn set(&self, log_id: &LogId, order: &OrderMap) -> StoreResult<WriteSeq> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| classify("failed to open transaction", err))?;

        let live: Vec<String> =
            sqlx::query_scalar("SELECT entry_id FROM log_ranks WHERE log_id = ? AND removed = 0")
                .bind(log_id.as_str())
                .fetch_all(&mut *tx)
                .await
                .map_err(|err| classify("failed to load live entries", err))?;

        let patch = RankPatch {
            upserts: order
                .live()
                .map(|(entry_id, rank)| (entry_id.clone(), rank))
                .collect(),
            removals: live
                .into_iter()
                .map(EntryId)
                .filter(|entry_id| !order.contains(entry_id))
                .collect::<BTreeSet<_>>(),
            author: None,
        };

        let seq = self
            .write_patch(log_id, &patch, &mut tx)
            .await
            .map_err(|err| classify("failed to overwrite ranks", err))?;
        tx.commit()
            .await
            .map_err(|err| classify("failed to commit ranks", err))?;
        debug!(%log_id, seq, entries = patch.upserts.len(), "order replaced");
        Ok(seq)
    }

    async fn merge(&self, log_id: &LogId, patch: &RankPatch) -> StoreResult<WriteSeq> {
        self.commit_patch(log_id, patch).await
    }
}

fn classify(context: &str, err: sqlx::Error) -> StoreError {
    let transient = match &err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::WorkerCrashed => true,
        // SQLITE_BUSY / SQLITE_LOCKED
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    };
    if transient {
        StoreError::unavailable(format!("{context}: {err}"))
    } else {
        StoreError::rejected(format!("{context}: {err}"))
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
