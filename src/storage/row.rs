use crate::audit::entry::{AuditEntry, Integrity, Level, Metadata};
use crate::error::{StorageError, StorageResult};
use crate::storage::{KeyVersion, PruneCheckpoint};

/// Column list shared by every `SELECT` that decodes into `AuditRow`.
pub(crate) const ENTRY_COLUMNS: &str = "sequence, id, event, level, message, user_id, task_id, \
     correlation_id, metadata, timestamp, integrity_version, signature, previous_entry_hash";

/// `ENTRY_COLUMNS` qualified with a table alias, for joins
pub(crate) fn qualified_columns(alias: &str) -> String {
    ENTRY_COLUMNS
        .split(',')
        .map(|column| format!("{}.{}", alias, column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// One `audit_log` row as both SQL backends store it
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct AuditRow {
    pub sequence: i64,
    pub id: String,
    pub event: String,
    pub level: String,
    pub message: String,
    pub user_id: Option<String>,
    pub task_id: Option<String>,
    pub correlation_id: Option<String>,
    pub metadata: Option<String>,
    pub timestamp: i64,
    pub integrity_version: i64,
    pub signature: String,
    pub previous_entry_hash: String,
}

impl AuditRow {
    pub fn into_entry(self) -> StorageResult<AuditEntry> {
        let level: Level = self.level.parse().map_err(|e: String| {
            StorageError::Corrupt(format!("entry {}: {}", self.id, e))
        })?;
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str::<Metadata>)
            .transpose()
            .map_err(|e| StorageError::Corrupt(format!("entry {} metadata: {}", self.id, e)))?;
        let sequence = u64::try_from(self.sequence)
            .map_err(|_| StorageError::Corrupt(format!("entry {} has negative sequence", self.id)))?;
        let version = u32::try_from(self.integrity_version).map_err(|_| {
            StorageError::Corrupt(format!("entry {} has invalid key version", self.id))
        })?;

        Ok(AuditEntry {
            id: self.id,
            sequence,
            event: self.event,
            level,
            message: self.message,
            user_id: self.user_id,
            task_id: self.task_id,
            correlation_id: self.correlation_id,
            metadata,
            timestamp: self.timestamp,
            integrity: Integrity {
                version,
                signature: self.signature,
                previous_entry_hash: self.previous_entry_hash,
            },
        })
    }
}

pub(crate) fn into_entries(rows: Vec<AuditRow>) -> StorageResult<Vec<AuditEntry>> {
    rows.into_iter().map(AuditRow::into_entry).collect()
}

/// Metadata column value for an entry
pub(crate) fn metadata_column(entry: &AuditEntry) -> StorageResult<Option<String>> {
    entry
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StorageError::Corrupt(format!("entry {} metadata: {}", entry.id, e)))
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct CheckpointRow {
    pub sequence: i64,
    pub hash: String,
    pub pruned_at: i64,
    pub entries_pruned: i64,
}

impl CheckpointRow {
    pub fn into_checkpoint(self) -> StorageResult<PruneCheckpoint> {
        Ok(PruneCheckpoint {
            sequence: u64::try_from(self.sequence)
                .map_err(|_| StorageError::Corrupt("checkpoint sequence is negative".to_string()))?,
            hash: self.hash,
            pruned_at: self.pruned_at,
            entries_pruned: u64::try_from(self.entries_pruned).map_err(|_| {
                StorageError::Corrupt("checkpoint prune count is negative".to_string())
            })?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct KeyVersionRow {
    pub version: i64,
    pub fingerprint: String,
    pub registered_at: i64,
}

impl KeyVersionRow {
    pub fn into_key_version(self) -> StorageResult<KeyVersion> {
        Ok(KeyVersion {
            version: u32::try_from(self.version).map_err(|_| {
                StorageError::Corrupt(format!("invalid key version {}", self.version))
            })?,
            fingerprint: self.fingerprint,
            registered_at: self.registered_at,
        })
    }
}

pub(crate) fn into_key_versions(rows: Vec<KeyVersionRow>) -> StorageResult<Vec<KeyVersion>> {
    rows.into_iter().map(KeyVersionRow::into_key_version).collect()
}

/// Bind-friendly conversion; sequences never approach `i64::MAX`
pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
