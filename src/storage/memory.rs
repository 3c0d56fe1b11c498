//! In-memory audit storage, for tests and ephemeral deployments.

use async_trait::async_trait;
use std::cmp::Ordering;
use tokio::sync::RwLock;

use crate::audit::entry::AuditEntry;
use crate::error::{StorageError, StorageResult};
use crate::storage::{
    prune_boundary, search_terms, AuditStorage, ChainSnapshot, KeyVersion, Pagination,
    PruneCheckpoint, QueryFilter, QueryResult, RetentionPolicy, SequenceRange, SortOrder,
};

pub(crate) struct MemoryState {
    /// Ascending by sequence.
    pub(crate) entries: Vec<AuditEntry>,
    pub(crate) next_sequence: u64,
    pub(crate) checkpoint: Option<PruneCheckpoint>,
    /// Ascending by version.
    pub(crate) key_versions: Vec<KeyVersion>,
}

/// Vec-backed storage behind a `RwLock`; readers never block each other.
pub struct MemoryStorage {
    pub(crate) state: RwLock<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState {
                entries: Vec::new(),
                next_sequence: 1,
                checkpoint: None,
                key_versions: Vec::new(),
            }),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage").finish_non_exhaustive()
    }
}

fn page_of(entries: Vec<AuditEntry>, page: Pagination) -> QueryResult {
    let total = entries.len() as u64;
    let entries = entries
        .into_iter()
        .skip(usize::try_from(page.offset).unwrap_or(usize::MAX))
        .take(page.limit as usize)
        .collect();
    QueryResult {
        entries,
        total,
        limit: page.limit,
        offset: page.offset,
    }
}

fn term_frequency(entry: &AuditEntry, terms: &[String]) -> Option<usize> {
    let mut document = search_terms(&entry.event);
    document.extend(search_terms(&entry.message));
    if let Some(metadata) = entry.metadata_text() {
        document.extend(search_terms(&metadata));
    }

    let mut score = 0;
    for term in terms {
        let hits = document.iter().filter(|t| *t == term).count();
        if hits == 0 {
            return None;
        }
        score += hits;
    }
    Some(score)
}

#[async_trait]
impl AuditStorage for MemoryStorage {
    async fn append(&self, entry: &AuditEntry) -> StorageResult<u64> {
        let mut state = self.state.write().await;
        if state.entries.iter().any(|e| e.id == entry.id) {
            return Err(StorageError::Conflict(format!(
                "duplicate entry id {}",
                entry.id
            )));
        }
        let sequence = state.next_sequence;
        let mut stored = entry.clone();
        stored.sequence = sequence;
        state.entries.push(stored);
        state.next_sequence += 1;
        Ok(sequence)
    }

    async fn get_last(&self) -> StorageResult<Option<AuditEntry>> {
        Ok(self.state.read().await.entries.last().cloned())
    }

    async fn iterate(&self, range: SequenceRange) -> StorageResult<Vec<AuditEntry>> {
        Ok(self
            .state
            .read()
            .await
            .entries
            .iter()
            .filter(|e| range.contains(e.sequence))
            .cloned()
            .collect())
    }

    async fn checkpoint(&self) -> StorageResult<Option<PruneCheckpoint>> {
        Ok(self.state.read().await.checkpoint.clone())
    }

    async fn snapshot(&self, range: SequenceRange) -> StorageResult<ChainSnapshot> {
        let state = self.state.read().await;
        Ok(ChainSnapshot {
            checkpoint: state.checkpoint.clone(),
            entries: state
                .entries
                .iter()
                .filter(|e| range.contains(e.sequence))
                .cloned()
                .collect(),
        })
    }

    async fn count(&self) -> StorageResult<u64> {
        Ok(self.state.read().await.entries.len() as u64)
    }

    async fn get_by_id(&self, id: &str) -> StorageResult<Option<AuditEntry>> {
        Ok(self
            .state
            .read()
            .await
            .entries
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    async fn get_by_sequence(&self, sequence: u64) -> StorageResult<Option<AuditEntry>> {
        Ok(self
            .state
            .read()
            .await
            .entries
            .iter()
            .find(|e| e.sequence == sequence)
            .cloned())
    }

    async fn get_by_task_id(&self, task_id: &str) -> StorageResult<Vec<AuditEntry>> {
        Ok(self
            .state
            .read()
            .await
            .entries
            .iter()
            .filter(|e| e.task_id.as_deref() == Some(task_id))
            .cloned()
            .collect())
    }

    async fn get_by_correlation_id(&self, correlation_id: &str) -> StorageResult<Vec<AuditEntry>> {
        Ok(self
            .state
            .read()
            .await
            .entries
            .iter()
            .filter(|e| e.correlation_id.as_deref() == Some(correlation_id))
            .cloned()
            .collect())
    }

    async fn query(
        &self,
        filter: &QueryFilter,
        page: Pagination,
        order: SortOrder,
    ) -> StorageResult<QueryResult> {
        let page = page.normalized();
        let state = self.state.read().await;
        let mut matched: Vec<AuditEntry> = state
            .entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        if order == SortOrder::Desc {
            matched.reverse();
        }
        Ok(page_of(matched, page))
    }

    async fn search_full_text(&self, text: &str, page: Pagination) -> StorageResult<QueryResult> {
        let page = page.normalized();
        let terms = search_terms(text);
        if terms.is_empty() {
            return Ok(QueryResult::empty(page));
        }

        let state = self.state.read().await;
        let mut scored: Vec<(usize, &AuditEntry)> = state
            .entries
            .iter()
            .filter_map(|e| term_frequency(e, &terms).map(|score| (score, e)))
            .collect();
        scored.sort_by(|(sa, a), (sb, b)| match sb.cmp(sa) {
            Ordering::Equal => b.sequence.cmp(&a.sequence),
            other => other,
        });

        Ok(page_of(
            scored.into_iter().map(|(_, e)| e.clone()).collect(),
            page,
        ))
    }

    async fn enforce_retention(&self, policy: &RetentionPolicy, now_ms: i64) -> StorageResult<u64> {
        let mut state = self.state.write().await;

        let by_age = policy.cutoff_ms(now_ms).and_then(|cutoff| {
            state
                .entries
                .iter()
                .filter(|e| e.timestamp <= cutoff)
                .map(|e| e.sequence)
                .max()
        });
        let by_count = policy.max_entries.and_then(|max| {
            let max = usize::try_from(max).unwrap_or(usize::MAX);
            state
                .entries
                .len()
                .checked_sub(max.saturating_add(1))
                .map(|idx| state.entries[idx].sequence)
        });

        let Some(boundary_sequence) = prune_boundary(by_age, by_count) else {
            return Ok(0);
        };
        let Some(boundary) = state
            .entries
            .iter()
            .find(|e| e.sequence == boundary_sequence)
            .cloned()
        else {
            return Ok(0);
        };

        let before = state.entries.len();
        state.entries.retain(|e| e.sequence > boundary_sequence);
        let deleted = (before - state.entries.len()) as u64;

        let checkpoint =
            PruneCheckpoint::after(&boundary, deleted, state.checkpoint.as_ref(), now_ms);
        state.checkpoint = Some(checkpoint);
        Ok(deleted)
    }

    async fn key_versions(&self) -> StorageResult<Vec<KeyVersion>> {
        Ok(self.state.read().await.key_versions.clone())
    }

    async fn register_key_version(&self, key: &KeyVersion) -> StorageResult<()> {
        let mut state = self.state.write().await;
        match state
            .key_versions
            .binary_search_by_key(&key.version, |k| k.version)
        {
            Ok(_) => Err(StorageError::Conflict(format!(
                "key version {} already registered",
                key.version
            ))),
            Err(index) => {
                state.key_versions.insert(index, key.clone());
                Ok(())
            }
        }
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
    async fn test_append_assigns_sequences() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.append(&entry("a", "e", "m", 1)).await.unwrap(), 1);
        assert_eq!(storage.append(&entry("b", "e", "m", 2)).await.unwrap(), 2);
        assert_eq!(storage.count().await.unwrap(), 2);
        assert_eq!(storage.get_last().await.unwrap().unwrap().id, "b");
        assert_eq!(storage.get_by_sequence(1).await.unwrap().unwrap().id, "a");
    }

    #[tokio::test]
    async fn test_duplicate_id_conflicts() {
        let storage = MemoryStorage::new();
        storage.append(&entry("a", "e", "m", 1)).await.unwrap();
        let err = storage.append(&entry("a", "e", "m", 2)).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_key_versions_are_permanent() {
        let storage = MemoryStorage::new();
        let record = |version, fingerprint: &str| KeyVersion {
            version,
            fingerprint: fingerprint.to_string(),
            registered_at: 0,
        };
        storage.register_key_version(&record(2, "bb")).await.unwrap();
        storage.register_key_version(&record(1, "aa")).await.unwrap();

        let err = storage.register_key_version(&record(2, "cc")).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        let versions = storage.key_versions().await.unwrap();
        assert_eq!(versions, vec![record(1, "aa"), record(2, "bb")]);
    }

    #[tokio::test]
    async fn test_query_orders_and_pages() {
        let storage = MemoryStorage::new();
        for i in 0..5 {
            storage
                .append(&entry(&format!("id-{i}"), "tick", "m", i))
                .await
                .unwrap();
        }

        let result = storage
            .query(
                &QueryFilter::default(),
                Pagination::new(Some(2), Some(1)),
                SortOrder::Desc,
            )
            .await
            .unwrap();
        assert_eq!(result.total, 5);
        let ids: Vec<_> = result.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["id-3", "id-2"]);

        let result = storage
            .query(&QueryFilter::default(), Pagination::default(), SortOrder::Asc)
            .await
            .unwrap();
        assert_eq!(result.entries.first().unwrap().id, "id-0");
    }

    #[tokio::test]
    async fn test_full_text_ranking() {
        let storage = MemoryStorage::new();
        storage
            .append(&entry("a", "code_executed", "sandbox ran python", 1))
            .await
            .unwrap();
        storage
            .append(&entry("b", "code_executed", "sandbox ran sandbox cleanup", 2))
            .await
            .unwrap();
        let mut with_meta = entry("c", "auth_success", "login", 3);
        with_meta.metadata = Some(
            json!({"note": "sandbox"})
                .as_object()
                .cloned()
                .unwrap_or_default(),
        );
        storage.append(&with_meta).await.unwrap();

        let result = storage
            .search_full_text("sandbox", Pagination::default())
            .await
            .unwrap();
        let ids: Vec<_> = result.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);

        let result = storage
            .search_full_text("sandbox python", Pagination::default())
            .await
            .unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(result.entries[0].id, "a");

        let result = storage
            .search_full_text("nonexistent", Pagination::default())
            .await
            .unwrap();
        assert!(result.entries.is_empty());
    }

    #[tokio::test]
    async fn test_retention_by_count_writes_checkpoint() {
        let storage = MemoryStorage::new();
        for i in 0..5 {
            storage
                .append(&entry(&format!("id-{i}"), "tick", "m", i))
                .await
                .unwrap();
        }

        let policy = RetentionPolicy {
            max_age_days: None,
            max_entries: Some(2),
        };
        assert_eq!(storage.enforce_retention(&policy, 100).await.unwrap(), 3);
        assert_eq!(storage.count().await.unwrap(), 2);

        let checkpoint = storage.checkpoint().await.unwrap().unwrap();
        assert_eq!(checkpoint.sequence, 3);
        assert_eq!(checkpoint.entries_pruned, 3);

        assert_eq!(storage.enforce_retention(&policy, 100).await.unwrap(), 0);

        // Sequences continue past the pruned range.
        assert_eq!(storage.append(&entry("next", "tick", "m", 6)).await.unwrap(), 6);
    }
}
