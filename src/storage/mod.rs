//! Audit Storage
//!
//! The storage contract the audit chain relies on, plus its in-memory,
//! embedded SQLite and PostgreSQL implementations.

pub mod memory;
pub mod postgres;
pub mod sqlite;

mod row;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::audit::entry::{AuditEntry, Level};
use crate::audit::hasher::SigningKey;
use crate::error::StorageResult;

pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;
pub use sqlite::SqliteStorage;

/// Default page size for `query` and `search_full_text`.
pub const DEFAULT_PAGE_LIMIT: u32 = 100;

/// Hard cap on page size.
pub const MAX_PAGE_LIMIT: u32 = 1000;

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Durable, ordered, append-only store for audit entries.
///
/// Implementations must support concurrent readers alongside the single
/// writer, and must keep their full-text index in step with every insert
/// and delete.
#[async_trait]
pub trait AuditStorage: Send + Sync {
    /// Append an entry and return the sequence assigned to it
    async fn append(&self, entry: &AuditEntry) -> StorageResult<u64>;

    /// Newest entry by sequence
    async fn get_last(&self) -> StorageResult<Option<AuditEntry>>;

    /// Entries within `range`, ascending by sequence
    async fn iterate(&self, range: SequenceRange) -> StorageResult<Vec<AuditEntry>>;

    /// Current pruning checkpoint, if retention has ever pruned
    async fn checkpoint(&self) -> StorageResult<Option<PruneCheckpoint>>;

    /// Checkpoint and entries read from one consistent view.
    ///
    /// The default reads them separately; transactional backends override.
    async fn snapshot(&self, range: SequenceRange) -> StorageResult<ChainSnapshot> {
        let checkpoint = self.checkpoint().await?;
        let entries = self.iterate(range).await?;
        Ok(ChainSnapshot {
            checkpoint,
            entries,
        })
    }

    async fn count(&self) -> StorageResult<u64>;

    async fn get_by_id(&self, id: &str) -> StorageResult<Option<AuditEntry>>;

    async fn get_by_sequence(&self, sequence: u64) -> StorageResult<Option<AuditEntry>>;

    async fn get_by_task_id(&self, task_id: &str) -> StorageResult<Vec<AuditEntry>>;

    async fn get_by_correlation_id(&self, correlation_id: &str) -> StorageResult<Vec<AuditEntry>>;

    /// Filtered, paginated listing
    async fn query(
        &self,
        filter: &QueryFilter,
        page: Pagination,
        order: SortOrder,
    ) -> StorageResult<QueryResult>;

    /// Relevance-ranked search over event, message and metadata
    async fn search_full_text(&self, text: &str, page: Pagination) -> StorageResult<QueryResult>;

    /// Delete the oldest entries the policy no longer retains and advance
    /// the pruning checkpoint in the same unit of work. Returns the number
    /// of entries deleted.
    async fn enforce_retention(&self, policy: &RetentionPolicy, now_ms: i64) -> StorageResult<u64>;

    /// Signing key versions this store has seen, ascending by version
    async fn key_versions(&self) -> StorageResult<Vec<KeyVersion>>;

    /// Record a key version. Versions are permanent: registering one that
    /// already exists is a `Conflict`.
    async fn register_key_version(&self, key: &KeyVersion) -> StorageResult<()>;
}

/// Inclusive sequence bounds; `None` is unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRange {
    pub from: Option<u64>,
    pub to: Option<u64>,
}

impl SequenceRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn starting_at(sequence: u64) -> Self {
        Self {
            from: Some(sequence),
            to: None,
        }
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.from.map_or(true, |from| sequence >= from) && self.to.map_or(true, |to| sequence <= to)
    }

    pub fn is_full(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }
}

/// Trusted boundary left behind by retention pruning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneCheckpoint {
    /// Sequence of the last pruned entry.
    pub sequence: u64,
    /// Digest of the last pruned entry.
    pub hash: String,
    /// Epoch milliseconds of the pruning run.
    pub pruned_at: i64,
    /// Entries pruned over the store's lifetime.
    pub entries_pruned: u64,
}

impl PruneCheckpoint {
    /// Checkpoint for pruning everything up to and including `boundary`
    pub fn after(
        boundary: &AuditEntry,
        deleted: u64,
        previous: Option<&PruneCheckpoint>,
        now_ms: i64,
    ) -> Self {
        Self {
            sequence: boundary.sequence,
            hash: crate::audit::hasher::digest(
                boundary,
                &boundary.integrity.previous_entry_hash,
            ),
            pruned_at: now_ms,
            entries_pruned: previous.map_or(0, |p| p.entries_pruned) + deleted,
        }
    }
}

/// A signing key version as the store remembers it. Only the key's
/// fingerprint is kept, never the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyVersion {
    pub version: u32,
    pub fingerprint: String,
    /// Epoch milliseconds.
    pub registered_at: i64,
}

impl KeyVersion {
    pub fn new(version: u32, key: &SigningKey, registered_at: i64) -> Self {
        Self {
            version,
            fingerprint: key.fingerprint(),
            registered_at,
        }
    }
}

/// Checkpoint plus entries as seen at one instant
#[derive(Debug, Clone, Default)]
pub struct ChainSnapshot {
    pub checkpoint: Option<PruneCheckpoint>,
    pub entries: Vec<AuditEntry>,
}

/// Filters for `query`; empty vectors and `None` match everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFilter {
    /// Inclusive lower bound, epoch milliseconds.
    pub from: Option<i64>,
    /// Inclusive upper bound, epoch milliseconds.
    pub to: Option<i64>,
    #[serde(default)]
    pub levels: Vec<Level>,
    #[serde(default)]
    pub events: Vec<String>,
    pub user_id: Option<String>,
    pub task_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl QueryFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.from.map_or(true, |from| entry.timestamp >= from)
            && self.to.map_or(true, |to| entry.timestamp <= to)
            && (self.levels.is_empty() || self.levels.contains(&entry.level))
            && (self.events.is_empty() || self.events.iter().any(|e| *e == entry.event))
            && optional_eq(&self.user_id, &entry.user_id)
            && optional_eq(&self.task_id, &entry.task_id)
            && optional_eq(&self.correlation_id, &entry.correlation_id)
    }
}

fn optional_eq(wanted: &Option<String>, actual: &Option<String>) -> bool {
    match wanted {
        Some(w) => actual.as_deref() == Some(w.as_str()),
        None => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u64,
}

impl Pagination {
    /// Page with `limit` clamped to `1..=MAX_PAGE_LIMIT`
    pub fn new(limit: Option<u32>, offset: Option<u64>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }

    pub(crate) fn normalized(self) -> Self {
        Self::new(Some(self.limit), Some(self.offset))
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Ordering by insertion sequence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub(crate) fn sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub entries: Vec<AuditEntry>,
    pub total: u64,
    pub limit: u32,
    pub offset: u64,
}

impl QueryResult {
    pub(crate) fn empty(page: Pagination) -> Self {
        Self {
            entries: Vec::new(),
            total: 0,
            limit: page.limit,
            offset: page.offset,
        }
    }
}

/// Age- and count-based retention. Both limits may apply at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    pub max_age_days: Option<u32>,
    pub max_entries: Option<u64>,
}

impl RetentionPolicy {
    /// Entries with `timestamp <= cutoff` are expired
    pub fn cutoff_ms(&self, now_ms: i64) -> Option<i64> {
        self.max_age_days
            .map(|days| now_ms - i64::from(days) * MS_PER_DAY)
    }

    pub fn is_noop(&self) -> bool {
        self.max_age_days.is_none() && self.max_entries.is_none()
    }
}

/// Newest sequence to prune given the age-based and count-based candidates
pub(crate) fn prune_boundary(by_age: Option<u64>, by_count: Option<u64>) -> Option<u64> {
    match (by_age, by_count) {
        (Some(a), Some(c)) => Some(a.max(c)),
        (a, c) => a.or(c),
    }
}

/// Lowercased alphanumeric terms, the unit both text indexes agree on
pub(crate) fn search_terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}
