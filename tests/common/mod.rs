#![allow(dead_code)]

use audit_chain::audit::{AuditChain, AuditDraft, KeyRing, Level, SigningKey};
use audit_chain::storage::{AuditStorage, MemoryStorage, SqliteStorage};
use std::sync::Arc;
use tempfile::TempDir;

pub const TEST_KEY: &str = "integration-test-signing-key-0123456789abcdef";
pub const ROTATED_KEY: &str = "integration-test-rotated-key-fedcba9876543210";

pub fn test_keys() -> KeyRing {
    KeyRing::new(SigningKey::new(TEST_KEY).expect("valid test key"))
}

/// Setup an initialized chain over in-memory storage
pub async fn setup_memory_chain() -> Arc<AuditChain> {
    let chain = Arc::new(AuditChain::new(Arc::new(MemoryStorage::new()), test_keys()));
    chain.initialize().await.expect("Failed to initialize chain");
    chain
}

/// SQLite store in a temporary directory. Keep the `TempDir` alive for
/// the duration of the test.
pub async fn setup_sqlite_storage() -> (Arc<SqliteStorage>, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let storage = SqliteStorage::open(dir.path().join("audit.db"))
        .await
        .expect("Failed to open SQLite store");
    (Arc::new(storage), dir)
}

/// Setup an initialized chain over a temporary SQLite file
pub async fn setup_sqlite_chain() -> (Arc<AuditChain>, Arc<SqliteStorage>, TempDir) {
    let (storage, dir) = setup_sqlite_storage().await;
    let chain = Arc::new(AuditChain::new(
        storage.clone() as Arc<dyn AuditStorage>,
        test_keys(),
    ));
    chain.initialize().await.expect("Failed to initialize chain");
    (chain, storage, dir)
}

/// Record `count` simple entries and return their ids in order
pub async fn record_entries(chain: &AuditChain, count: usize) -> Vec<String> {
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let entry = chain
            .record(
                AuditDraft::new("task_executed", Level::Info, format!("task {} finished", i))
                    .task_id(format!("task-{}", i % 3)),
            )
            .await
            .expect("Failed to record entry");
        ids.push(entry.id);
    }
    ids
}
