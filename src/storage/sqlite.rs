//! Embedded SQLite storage
//!
//! WAL journaling so readers never block the writer, `synchronous = FULL`
//! so an acknowledged append survives power loss, and an FTS5 index kept
//! in step with `audit_log` by triggers.

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::audit::entry::AuditEntry;
use crate::error::StorageResult;
use crate::storage::row::{
    into_entries, into_key_versions, metadata_column, qualified_columns, to_i64, AuditRow,
    CheckpointRow, KeyVersionRow, ENTRY_COLUMNS,
};
use crate::storage::{
    prune_boundary, search_terms, AuditStorage, ChainSnapshot, KeyVersion, Pagination,
    PruneCheckpoint, QueryFilter, QueryResult, RetentionPolicy, SequenceRange, SortOrder,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Connect to a `sqlite:` URL, creating the database file if missing
    pub async fn connect(database_url: &str, max_connections: u32) -> StorageResult<Self> {
        if database_url.contains(":memory:") {
            return Self::new_in_memory().await;
        }
        let options = SqliteConnectOptions::from_str(database_url)?;
        Self::with_options(options, max_connections).await
    }

    /// Open (or create) a database file
    pub async fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let options = SqliteConnectOptions::new().filename(path.as_ref());
        Self::with_options(options, 5).await
    }

    /// Private in-memory database. A single connection holds it alive.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::migrate(pool).await
    }

    async fn with_options(options: SqliteConnectOptions, max_connections: u32) -> StorageResult<Self> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(BUSY_TIMEOUT);
        let filename = options.get_filename().display().to_string();
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        info!("Opened SQLite audit store at {}", filename);
        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> StorageResult<Self> {
        sqlx::migrate!("./migrations/sqlite").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Underlying pool, for maintenance tooling and tests
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn select(filter: &QueryFilter, projection: &str) -> QueryBuilder<'static, Sqlite> {
        let mut qb = QueryBuilder::new(format!("SELECT {} FROM audit_log WHERE 1=1", projection));
        if let Some(from) = filter.from {
            qb.push(" AND timestamp >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            qb.push(" AND timestamp <= ").push_bind(to);
        }
        if !filter.levels.is_empty() {
            qb.push(" AND level IN (");
            let mut levels = qb.separated(", ");
            for level in &filter.levels {
                levels.push_bind(level.as_str());
            }
            levels.push_unseparated(")");
        }
        if !filter.events.is_empty() {
            qb.push(" AND event IN (");
            let mut events = qb.separated(", ");
            for event in &filter.events {
                events.push_bind(event.clone());
            }
            events.push_unseparated(")");
        }
        if let Some(user_id) = &filter.user_id {
            qb.push(" AND user_id = ").push_bind(user_id.clone());
        }
        if let Some(task_id) = &filter.task_id {
            qb.push(" AND task_id = ").push_bind(task_id.clone());
        }
        if let Some(correlation_id) = &filter.correlation_id {
            qb.push(" AND correlation_id = ").push_bind(correlation_id.clone());
        }
        qb
    }

    async fn read_checkpoint<'e, E>(executor: E) -> StorageResult<Option<PruneCheckpoint>>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, CheckpointRow>(
            "SELECT sequence, hash, pruned_at, entries_pruned FROM audit_checkpoint WHERE singleton = 1",
        )
        .fetch_optional(executor)
        .await?
        .map(CheckpointRow::into_checkpoint)
        .transpose()
    }

    async fn read_range<'e, E>(executor: E, range: SequenceRange) -> StorageResult<Vec<AuditEntry>>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let rows = sqlx::query_as::<_, AuditRow>(&format!(
            "SELECT {} FROM audit_log WHERE sequence >= ? AND sequence <= ? ORDER BY sequence ASC",
            ENTRY_COLUMNS
        ))
        .bind(to_i64(range.from.unwrap_or(0)))
        .bind(range.to.map_or(i64::MAX, to_i64))
        .fetch_all(executor)
        .await?;
        into_entries(rows)
    }

    async fn select_where(&self, clause: &str, value: &str) -> StorageResult<Vec<AuditEntry>> {
        let rows = sqlx::query_as::<_, AuditRow>(&format!(
            "SELECT {} FROM audit_log WHERE {} = ? ORDER BY sequence ASC",
            ENTRY_COLUMNS, clause
        ))
        .bind(value)
        .fetch_all(&self.pool)
        .await?;
        into_entries(rows)
    }
}

#[async_trait]
impl AuditStorage for SqliteStorage {
    async fn append(&self, entry: &AuditEntry) -> StorageResult<u64> {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_log
            (id, event, level, message, user_id, task_id, correlation_id, metadata,
             timestamp, integrity_version, signature, previous_entry_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.event)
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(&entry.user_id)
        .bind(&entry.task_id)
        .bind(&entry.correlation_id)
        .bind(metadata_column(entry)?)
        .bind(entry.timestamp)
        .bind(i64::from(entry.integrity.version))
        .bind(&entry.integrity.signature)
        .bind(&entry.integrity.previous_entry_hash)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid().max(0) as u64)
    }

    async fn get_last(&self) -> StorageResult<Option<AuditEntry>> {
        sqlx::query_as::<_, AuditRow>(&format!(
            "SELECT {} FROM audit_log ORDER BY sequence DESC LIMIT 1",
            ENTRY_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await?
        .map(AuditRow::into_entry)
        .transpose()
    }

    async fn iterate(&self, range: SequenceRange) -> StorageResult<Vec<AuditEntry>> {
        Self::read_range(&self.pool, range).await
    }

    async fn checkpoint(&self) -> StorageResult<Option<PruneCheckpoint>> {
        Self::read_checkpoint(&self.pool).await
    }

    async fn snapshot(&self, range: SequenceRange) -> StorageResult<ChainSnapshot> {
        let mut tx = self.pool.begin().await?;
        let checkpoint = Self::read_checkpoint(&mut *tx).await?;
        let entries = Self::read_range(&mut *tx, range).await?;
        tx.commit().await?;
        Ok(ChainSnapshot {
            checkpoint,
            entries,
        })
    }

    async fn count(&self) -> StorageResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn get_by_id(&self, id: &str) -> StorageResult<Option<AuditEntry>> {
        Ok(self.select_where("id", id).await?.into_iter().next())
    }

    async fn get_by_sequence(&self, sequence: u64) -> StorageResult<Option<AuditEntry>> {
        sqlx::query_as::<_, AuditRow>(&format!(
            "SELECT {} FROM audit_log WHERE sequence = ?",
            ENTRY_COLUMNS
        ))
        .bind(to_i64(sequence))
        .fetch_optional(&self.pool)
        .await?
        .map(AuditRow::into_entry)
        .transpose()
    }

    async fn get_by_task_id(&self, task_id: &str) -> StorageResult<Vec<AuditEntry>> {
        self.select_where("task_id", task_id).await
    }

    async fn get_by_correlation_id(&self, correlation_id: &str) -> StorageResult<Vec<AuditEntry>> {
        self.select_where("correlation_id", correlation_id).await
    }

    async fn query(
        &self,
        filter: &QueryFilter,
        page: Pagination,
        order: SortOrder,
    ) -> StorageResult<QueryResult> {
        let page = page.normalized();

        let mut count = Self::select(filter, "COUNT(*)");
        let total: i64 = count
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;

        let mut qb = Self::select(filter, ENTRY_COLUMNS);
        qb.push(format!(" ORDER BY sequence {}", order.sql()));
        qb.push(" LIMIT ").push_bind(i64::from(page.limit));
        qb.push(" OFFSET ").push_bind(to_i64(page.offset));
        let rows = qb.build_query_as::<AuditRow>().fetch_all(&self.pool).await?;

        Ok(QueryResult {
            entries: into_entries(rows)?,
            total: total.max(0) as u64,
            limit: page.limit,
            offset: page.offset,
        })
    }

    async fn search_full_text(&self, text: &str, page: Pagination) -> StorageResult<QueryResult> {
        let page = page.normalized();
        let terms = search_terms(text);
        if terms.is_empty() {
            return Ok(QueryResult::empty(page));
        }
        // Quoted terms are matched literally and ANDed together.
        let expression = terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" ");

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM audit_log_fts WHERE audit_log_fts MATCH ?")
                .bind(&expression)
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query_as::<_, AuditRow>(&format!(
            r#"
            SELECT {}
            FROM audit_log_fts
            JOIN audit_log a ON a.sequence = audit_log_fts.rowid
            WHERE audit_log_fts MATCH ?
            ORDER BY bm25(audit_log_fts), a.sequence DESC
            LIMIT ? OFFSET ?
            "#,
            qualified_columns("a")
        ))
        .bind(&expression)
        .bind(i64::from(page.limit))
        .bind(to_i64(page.offset))
        .fetch_all(&self.pool)
        .await?;

        Ok(QueryResult {
            entries: into_entries(rows)?,
            total: total.max(0) as u64,
            limit: page.limit,
            offset: page.offset,
        })
    }

    async fn enforce_retention(&self, policy: &RetentionPolicy, now_ms: i64) -> StorageResult<u64> {
        if policy.is_noop() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;

        let by_age: Option<i64> = match policy.cutoff_ms(now_ms) {
            Some(cutoff) => {
                sqlx::query_scalar("SELECT MAX(sequence) FROM audit_log WHERE timestamp <= ?")
                    .bind(cutoff)
                    .fetch_one(&mut *tx)
                    .await?
            }
            None => None,
        };
        let by_count: Option<i64> = match policy.max_entries {
            Some(max) => {
                sqlx::query_scalar(
                    "SELECT sequence FROM audit_log ORDER BY sequence DESC LIMIT 1 OFFSET ?",
                )
                .bind(to_i64(max))
                .fetch_optional(&mut *tx)
                .await?
            }
            None => None,
        };

        let Some(cut) = prune_boundary(
            by_age.map(|s| s.max(0) as u64),
            by_count.map(|s| s.max(0) as u64),
        ) else {
            return Ok(0);
        };

        let Some(boundary) = sqlx::query_as::<_, AuditRow>(&format!(
            "SELECT {} FROM audit_log WHERE sequence = ?",
            ENTRY_COLUMNS
        ))
        .bind(to_i64(cut))
        .fetch_optional(&mut *tx)
        .await?
        .map(AuditRow::into_entry)
        .transpose()?
        else {
            return Ok(0);
        };

        let deleted = sqlx::query("DELETE FROM audit_log WHERE sequence <= ?")
            .bind(to_i64(cut))
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let previous = Self::read_checkpoint(&mut *tx).await?;
        let checkpoint = PruneCheckpoint::after(&boundary, deleted, previous.as_ref(), now_ms);
        sqlx::query(
            r#"
            INSERT INTO audit_checkpoint (singleton, sequence, hash, pruned_at, entries_pruned)
            VALUES (1, ?, ?, ?, ?)
            ON CONFLICT (singleton) DO UPDATE SET
                sequence = excluded.sequence,
                hash = excluded.hash,
                pruned_at = excluded.pruned_at,
                entries_pruned = excluded.entries_pruned
            "#,
        )
        .bind(to_i64(checkpoint.sequence))
        .bind(&checkpoint.hash)
        .bind(checkpoint.pruned_at)
        .bind(to_i64(checkpoint.entries_pruned))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(
            "Pruned {} audit entries through sequence {}",
            deleted, checkpoint.sequence
        );
        Ok(deleted)
    }

    async fn key_versions(&self) -> StorageResult<Vec<KeyVersion>> {
        let rows = sqlx::query_as::<_, KeyVersionRow>(
            "SELECT version, fingerprint, registered_at FROM audit_signing_keys ORDER BY version ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        into_key_versions(rows)
    }

    async fn register_key_version(&self, key: &KeyVersion) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO audit_signing_keys (version, fingerprint, registered_at) VALUES (?, ?, ?)",
        )
        .bind(i64::from(key.version))
        .bind(&key.fingerprint)
        .bind(key.registered_at)
        .execute(&self.pool)
        .await?;
        info!("Registered audit signing key version {}", key.version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::{AuditDraft, Level};
    use serde_json::json;

    fn entry(id: &str, event: &str, message: &str, timestamp: i64) -> AuditEntry {
        AuditDraft::new(event, Level::Info, message).into_unsigned(id.to_string(), timestamp)
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        let mut first = entry("a", "auth_success", "login", 10);
        first.user_id = Some("u1".to_string());
        first.metadata = json!({"ip": "10.0.0.1", "nested": {"k": [1, 2]}})
            .as_object()
            .cloned();

        assert_eq!(storage.append(&first).await.unwrap(), 1);
        assert_eq!(storage.append(&entry("b", "e", "m", 11)).await.unwrap(), 2);

        let stored = storage.get_by_id("a").await.unwrap().unwrap();
        assert_eq!(stored.sequence, 1);
        assert_eq!(stored.metadata, first.metadata);
        assert_eq!(stored.user_id.as_deref(), Some("u1"));
        assert_eq!(storage.get_last().await.unwrap().unwrap().id, "b");
        assert!(storage.get_by_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_is_conflict() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        storage.append(&entry("a", "e", "m", 1)).await.unwrap();
        let err = storage.append(&entry("a", "e", "m", 2)).await.unwrap_err();
        assert!(matches!(err, crate::error::StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_filtered_query() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        for i in 0..6 {
            let mut e = entry(&format!("id-{i}"), "tick", "m", i);
            if i % 2 == 0 {
                e.level = Level::Warn;
            }
            storage.append(&e).await.unwrap();
        }

        let filter = QueryFilter {
            levels: vec![Level::Warn],
            from: Some(1),
            ..Default::default()
        };
        let result = storage
            .query(&filter, Pagination::default(), SortOrder::Asc)
            .await
            .unwrap();
        assert_eq!(result.total, 2);
        let ids: Vec<_> = result.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["id-2", "id-4"]);
    }

    #[tokio::test]
    async fn test_fts_follows_inserts_and_deletes() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        storage
            .append(&entry("a", "code_executed", "sandbox ran python", 1))
            .await
            .unwrap();
        storage
            .append(&entry("b", "auth_failure", "bad password", 2))
            .await
            .unwrap();

        let hits = storage
            .search_full_text("python", Pagination::default())
            .await
            .unwrap();
        assert_eq!(hits.total, 1);
        assert_eq!(hits.entries[0].id, "a");

        let policy = RetentionPolicy {
            max_age_days: None,
            max_entries: Some(1),
        };
        assert_eq!(storage.enforce_retention(&policy, 100).await.unwrap(), 1);

        let hits = storage
            .search_full_text("python", Pagination::default())
            .await
            .unwrap();
        assert_eq!(hits.total, 0);

        let checkpoint = storage.checkpoint().await.unwrap().unwrap();
        assert_eq!(checkpoint.sequence, 1);
        assert_eq!(checkpoint.entries_pruned, 1);
    }

    #[tokio::test]
    async fn test_sequences_not_reused_after_pruning() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        for i in 0..3 {
            storage
                .append(&entry(&format!("id-{i}"), "tick", "m", i))
                .await
                .unwrap();
        }
        let policy = RetentionPolicy {
            max_age_days: None,
            max_entries: Some(0),
        };
        assert_eq!(storage.enforce_retention(&policy, 100).await.unwrap(), 3);
        assert_eq!(storage.count().await.unwrap(), 0);
        assert_eq!(storage.append(&entry("next", "tick", "m", 9)).await.unwrap(), 4);
    }
}
