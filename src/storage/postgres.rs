//! PostgreSQL storage
//!
//! Full-text search runs on a generated `tsvector` column with a GIN index.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info};

use crate::audit::entry::AuditEntry;
use crate::error::StorageResult;
use crate::storage::row::{
    into_entries, into_key_versions, metadata_column, to_i64, AuditRow, CheckpointRow,
    KeyVersionRow, ENTRY_COLUMNS,
};
use crate::storage::{
    prune_boundary, AuditStorage, ChainSnapshot, KeyVersion, Pagination, PruneCheckpoint,
    QueryFilter, QueryResult, RetentionPolicy, SequenceRange, SortOrder,
};

pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub async fn connect(database_url: &str, max_connections: u32) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        info!("Connected to PostgreSQL audit store");
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and run pending migrations
    pub async fn from_pool(pool: PgPool) -> StorageResult<Self> {
        sqlx::migrate!("./migrations/postgres").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn select(filter: &QueryFilter, projection: &str) -> QueryBuilder<'static, Postgres> {
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
        E: sqlx::Executor<'e, Database = Postgres>,
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
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let rows = sqlx::query_as::<_, AuditRow>(&format!(
            "SELECT {} FROM audit_log WHERE sequence >= $1 AND sequence <= $2 ORDER BY sequence ASC",
            ENTRY_COLUMNS
        ))
        .bind(to_i64(range.from.unwrap_or(0)))
        .bind(range.to.map_or(i64::MAX, to_i64))
        .fetch_all(executor)
        .await?;
        into_entries(rows)
    }

    async fn select_where(&self, column: &str, value: &str) -> StorageResult<Vec<AuditEntry>> {
        let rows = sqlx::query_as::<_, AuditRow>(&format!(
            "SELECT {} FROM audit_log WHERE {} = $1 ORDER BY sequence ASC",
            ENTRY_COLUMNS, column
        ))
        .bind(value)
        .fetch_all(&self.pool)
        .await?;
        into_entries(rows)
    }
}

#[async_trait]
impl AuditStorage for PostgresStorage {
    async fn append(&self, entry: &AuditEntry) -> StorageResult<u64> {
        // Sequences continue past the pruning checkpoint so they are never reused.
        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO audit_log
            (sequence, id, event, level, message, user_id, task_id, correlation_id, metadata,
             timestamp, integrity_version, signature, previous_entry_hash)
            VALUES (
                (SELECT GREATEST(
                    COALESCE(MAX(sequence), 0),
                    COALESCE((SELECT sequence FROM audit_checkpoint WHERE singleton = 1), 0)
                ) + 1 FROM audit_log),
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12
            )
            RETURNING sequence
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
        .fetch_one(&self.pool)
        .await?;

        Ok(sequence.max(0) as u64)
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
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;
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
            "SELECT {} FROM audit_log WHERE sequence = $1",
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
        // The `simple` parser tokenizes the query exactly as it tokenized the
        // indexed text, so hosts and addresses like `10.0.0.1` stay whole.
        let query_text = text.trim();
        if query_text.is_empty() {
            return Ok(QueryResult::empty(page));
        }

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM audit_log WHERE search_vector @@ plainto_tsquery('simple', $1)",
        )
        .bind(query_text)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query_as::<_, AuditRow>(&format!(
            r#"
            SELECT {}
            FROM audit_log
            WHERE search_vector @@ plainto_tsquery('simple', $1)
            ORDER BY ts_rank(search_vector, plainto_tsquery('simple', $1)) DESC, sequence DESC
            LIMIT $2 OFFSET $3
            "#,
            ENTRY_COLUMNS
        ))
        .bind(query_text)
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
                sqlx::query_scalar("SELECT MAX(sequence) FROM audit_log WHERE timestamp <= $1")
                    .bind(cutoff)
                    .fetch_one(&mut *tx)
                    .await?
            }
            None => None,
        };
        let by_count: Option<i64> = match policy.max_entries {
            Some(max) => {
                sqlx::query_scalar(
                    "SELECT sequence FROM audit_log ORDER BY sequence DESC LIMIT 1 OFFSET $1",
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
            "SELECT {} FROM audit_log WHERE sequence = $1",
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

        let deleted = sqlx::query("DELETE FROM audit_log WHERE sequence <= $1")
            .bind(to_i64(cut))
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let previous = Self::read_checkpoint(&mut *tx).await?;
        let checkpoint = PruneCheckpoint::after(&boundary, deleted, previous.as_ref(), now_ms);
        sqlx::query(
            r#"
            INSERT INTO audit_checkpoint (singleton, sequence, hash, pruned_at, entries_pruned)
            VALUES (1, $1, $2, $3, $4)
            ON CONFLICT (singleton) DO UPDATE SET
                sequence = EXCLUDED.sequence,
                hash = EXCLUDED.hash,
                pruned_at = EXCLUDED.pruned_at,
                entries_pruned = EXCLUDED.entries_pruned
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
            "INSERT INTO audit_signing_keys (version, fingerprint, registered_at) VALUES ($1, $2, $3)",
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
