//! Chain State
//!
//! The head of the hash chain and the signing keys, owned by the single
//! writer task. Nothing else mutates it.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::entry::{AuditDraft, AuditEntry};
use crate::audit::hasher::{self, KeyRing, SigningKey, GENESIS_HASH};
use crate::error::{AuditError, AuditResult};
use crate::storage::{AuditStorage, KeyVersion, RetentionPolicy};

#[derive(Debug)]
pub struct ChainState {
    last_hash: String,
    last_sequence: u64,
    keys: Arc<RwLock<KeyRing>>,
}

impl ChainState {
    /// Resume from storage: the newest entry's digest, else the pruning
    /// checkpoint, else genesis.
    ///
    /// Fails with `InvalidSigningKey` when the key ring cannot resolve every
    /// key version the store has used.
    pub async fn load(
        storage: &dyn AuditStorage,
        keys: Arc<RwLock<KeyRing>>,
    ) -> AuditResult<Self> {
        let last = storage.get_last().await?;
        reconcile_keys(storage, &*keys.read().await, last.as_ref()).await?;

        let (last_hash, last_sequence) = match last {
            Some(last) => (
                hasher::digest(&last, &last.integrity.previous_entry_hash),
                last.sequence,
            ),
            None => match storage.checkpoint().await? {
                Some(checkpoint) => (checkpoint.hash, checkpoint.sequence),
                None => (GENESIS_HASH.to_string(), 0),
            },
        };

        info!(
            "Loaded audit chain head at sequence {} ({})",
            last_sequence,
            &last_hash[..12.min(last_hash.len())]
        );
        Ok(Self {
            last_hash,
            last_sequence,
            keys,
        })
    }

    pub fn last_hash(&self) -> &str {
        &self.last_hash
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Build, link, sign and persist one entry.
    ///
    /// Chain state only advances once storage has acknowledged the write.
    pub async fn append(
        &mut self,
        storage: &dyn AuditStorage,
        draft: AuditDraft,
    ) -> AuditResult<AuditEntry> {
        let mut entry = draft.into_unsigned(
            Uuid::now_v7().to_string(),
            Utc::now().timestamp_millis(),
        );
        entry.integrity.previous_entry_hash = self.last_hash.clone();
        let digest = hasher::digest(&entry, &self.last_hash);

        {
            let keys = self.keys.read().await;
            let (version, key) = keys.active().ok_or_else(|| {
                AuditError::InvalidSigningKey("no active signing key".to_string())
            })?;
            entry.integrity.version = version;
            entry.integrity.signature = hasher::sign(&digest, key);
        }

        let sequence = storage.append(&entry).await?;
        if sequence != self.last_sequence + 1 {
            warn!(
                "Audit entry {} stored at sequence {}, expected {}",
                entry.id,
                sequence,
                self.last_sequence + 1
            );
        }
        entry.sequence = sequence;
        self.last_hash = digest;
        self.last_sequence = sequence;

        debug!("Appended audit entry {}", entry.summary());
        Ok(entry)
    }

    /// Make `key` the active signing key and return its version.
    ///
    /// The version is recorded in storage before any entry can carry it,
    /// so a version number is never handed out twice.
    pub async fn rotate_key(
        &mut self,
        storage: &dyn AuditStorage,
        key: SigningKey,
    ) -> AuditResult<u32> {
        let mut keys = self.keys.write().await;
        let record = KeyVersion::new(keys.next_version(), &key, Utc::now().timestamp_millis());
        storage.register_key_version(&record).await?;
        let version = keys.rotate(key);
        info!("Rotated audit signing key to version {}", version);
        Ok(version)
    }

    /// Prune per `policy`. The head survives pruning: if the newest entry
    /// is pruned, the checkpoint carries its digest.
    pub async fn retain(
        &mut self,
        storage: &dyn AuditStorage,
        policy: &RetentionPolicy,
        now_ms: i64,
    ) -> AuditResult<u64> {
        let deleted = storage.enforce_retention(policy, now_ms).await?;
        if deleted > 0 {
            info!("Retention pruned {} audit entries", deleted);
        }
        Ok(deleted)
    }
}

/// Check `keys` against the versions recorded in storage, then record any
/// configured version the store has not seen.
///
/// Every recorded version must be present with the same fingerprint, and the
/// newest entry's version must resolve. Otherwise entries already written
/// would stop verifying, or a version number would be reused for a
/// different key.
async fn reconcile_keys(
    storage: &dyn AuditStorage,
    keys: &KeyRing,
    last: Option<&AuditEntry>,
) -> AuditResult<()> {
    let recorded = storage.key_versions().await?;
    for record in &recorded {
        match keys.get(record.version) {
            None => {
                return Err(AuditError::InvalidSigningKey(format!(
                    "key version {} was used by this audit store but is not configured",
                    record.version
                )))
            }
            Some(key) if key.fingerprint() != record.fingerprint => {
                return Err(AuditError::InvalidSigningKey(format!(
                    "configured key version {} differs from the key this audit store recorded",
                    record.version
                )))
            }
            Some(_) => {}
        }
    }

    if let Some(last) = last {
        if keys.get(last.integrity.version).is_none() {
            return Err(AuditError::InvalidSigningKey(format!(
                "newest audit entry is signed with key version {} which is not configured",
                last.integrity.version
            )));
        }
    }

    let now_ms = Utc::now().timestamp_millis();
    for version in keys.versions() {
        if recorded.iter().any(|r| r.version == version) {
            continue;
        }
        if let Some(key) = keys.get(version) {
            storage
                .register_key_version(&KeyVersion::new(version, key, now_ms))
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::Level;
    use crate::storage::MemoryStorage;

    fn keys() -> Arc<RwLock<KeyRing>> {
        Arc::new(RwLock::new(KeyRing::new(
            SigningKey::new("chain-state-test-key-0123456789abcdef").unwrap(),
        )))
    }

    #[tokio::test]
    async fn test_fresh_chain_starts_at_genesis() {
        let storage = MemoryStorage::new();
        let state = ChainState::load(&storage, keys()).await.unwrap();
        assert_eq!(state.last_hash(), GENESIS_HASH);
        assert_eq!(state.last_sequence(), 0);
    }

    #[tokio::test]
    async fn test_append_links_entries() {
        let storage = MemoryStorage::new();
        let mut state = ChainState::load(&storage, keys()).await.unwrap();

        let first = state
            .append(&storage, AuditDraft::new("a", Level::Info, "first"))
            .await
            .unwrap();
        let second = state
            .append(&storage, AuditDraft::new("b", Level::Info, "second"))
            .await
            .unwrap();

        assert_eq!(first.sequence, 1);
        assert_eq!(first.integrity.previous_entry_hash, GENESIS_HASH);
        assert_eq!(first.integrity.version, 1);
        assert_eq!(
            second.integrity.previous_entry_hash,
            hasher::digest(&first, GENESIS_HASH)
        );
        assert_eq!(state.last_sequence(), 2);

        let reloaded = ChainState::load(&storage, keys()).await.unwrap();
        assert_eq!(reloaded.last_hash(), state.last_hash());
    }

    #[tokio::test]
    async fn test_head_survives_full_prune() {
        let storage = MemoryStorage::new();
        let mut state = ChainState::load(&storage, keys()).await.unwrap();
        for i in 0..3 {
            state
                .append(&storage, AuditDraft::new("tick", Level::Debug, format!("{i}")))
                .await
                .unwrap();
        }
        let head = state.last_hash().to_string();

        let policy = RetentionPolicy {
            max_age_days: None,
            max_entries: Some(0),
        };
        assert_eq!(state.retain(&storage, &policy, 0).await.unwrap(), 3);

        let reloaded = ChainState::load(&storage, keys()).await.unwrap();
        assert_eq!(reloaded.last_hash(), head);
        assert_eq!(reloaded.last_sequence(), 3);
    }

    #[tokio::test]
    async fn test_load_records_configured_keys() {
        let storage = MemoryStorage::new();
        let ring = keys();
        ChainState::load(&storage, ring.clone()).await.unwrap();

        let recorded = storage.key_versions().await.unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].version, 1);
        assert_eq!(
            recorded[0].fingerprint,
            ring.read().await.get(1).unwrap().fingerprint()
        );
    }

    #[tokio::test]
    async fn test_rotation_is_recorded_before_use() {
        let storage = MemoryStorage::new();
        let mut state = ChainState::load(&storage, keys()).await.unwrap();
        let rotated = SigningKey::new("chain-state-rotated-key-fedcba987654").unwrap();

        assert_eq!(state.rotate_key(&storage, rotated.clone()).await.unwrap(), 2);
        let entry = state
            .append(&storage, AuditDraft::new("a", Level::Info, "after rotation"))
            .await
            .unwrap();
        assert_eq!(entry.integrity.version, 2);

        let versions: Vec<_> = storage
            .key_versions()
            .await
            .unwrap()
            .into_iter()
            .map(|k| k.version)
            .collect();
        assert_eq!(versions, vec![1, 2]);

        // The original ring no longer covers what the store has used.
        let err = ChainState::load(&storage, keys()).await.unwrap_err();
        assert!(matches!(err, AuditError::InvalidSigningKey(_)));

        let mut full =
            KeyRing::new(SigningKey::new("chain-state-test-key-0123456789abcdef").unwrap());
        full.rotate(rotated);
        let reloaded = ChainState::load(&storage, Arc::new(RwLock::new(full))).await.unwrap();
        assert_eq!(reloaded.last_hash(), state.last_hash());
    }

    #[tokio::test]
    async fn test_changed_key_material_is_rejected() {
        let storage = MemoryStorage::new();
        ChainState::load(&storage, keys()).await.unwrap();

        let other = Arc::new(RwLock::new(KeyRing::new(
            SigningKey::new("a-different-key-for-version-one-000000").unwrap(),
        )));
        let err = ChainState::load(&storage, other).await.unwrap_err();
        assert!(matches!(err, AuditError::InvalidSigningKey(_)));
    }

    #[tokio::test]
    async fn test_unresolvable_newest_entry_is_rejected() {
        let storage = MemoryStorage::new();
        let mut entry = AuditDraft::new("a", Level::Info, "signed elsewhere")
            .into_unsigned("id-1".to_string(), 1);
        entry.integrity.version = 4;
        storage.append(&entry).await.unwrap();

        let err = ChainState::load(&storage, keys()).await.unwrap_err();
        assert!(matches!(err, AuditError::InvalidSigningKey(_)));
    }
}
