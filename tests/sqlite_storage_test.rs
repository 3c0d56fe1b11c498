mod common;

use audit_chain::audit::{AuditChain, AuditDraft, Level};
use audit_chain::storage::{AuditStorage, RetentionPolicy, SequenceRange, SqliteStorage};
use common::*;
use std::sync::Arc;

#[tokio::test]
async fn test_file_store_uses_wal() {
    let (storage, _dir) = setup_sqlite_storage().await;
    let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
        .fetch_one(storage.pool())
        .await
        .unwrap();
    assert_eq!(mode.to_lowercase(), "wal");
}

#[tokio::test]
async fn test_checkpoint_survives_reopen() {
    let (storage, dir) = setup_sqlite_storage().await;
    let chain = AuditChain::new(storage.clone(), test_keys());
    chain.initialize().await.unwrap();
    record_entries(&chain, 6).await;
    chain
        .enforce_retention(RetentionPolicy {
            max_age_days: None,
            max_entries: Some(2),
        })
        .await
        .unwrap();

    let reopened = SqliteStorage::open(dir.path().join("audit.db")).await.unwrap();
    let checkpoint = reopened.checkpoint().await.unwrap().unwrap();
    assert_eq!(checkpoint.sequence, 4);
    assert_eq!(checkpoint.entries_pruned, 4);

    let snapshot = reopened.snapshot(SequenceRange::all()).await.unwrap();
    assert_eq!(snapshot.checkpoint, Some(checkpoint.clone()));
    let sequences: Vec<_> = snapshot.entries.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![5, 6]);
    assert_eq!(
        snapshot.entries[0].integrity.previous_entry_hash,
        checkpoint.hash
    );
}

#[tokio::test]
async fn test_repeated_pruning_accumulates() {
    let (storage, _dir) = setup_sqlite_storage().await;
    let chain = AuditChain::new(storage.clone(), test_keys());
    chain.initialize().await.unwrap();

    let keep_one = RetentionPolicy {
        max_age_days: None,
        max_entries: Some(1),
    };
    record_entries(&chain, 3).await;
    assert_eq!(chain.enforce_retention(keep_one).await.unwrap(), 2);
    record_entries(&chain, 3).await;
    assert_eq!(chain.enforce_retention(keep_one).await.unwrap(), 3);

    let checkpoint = storage.checkpoint().await.unwrap().unwrap();
    assert_eq!(checkpoint.sequence, 5);
    assert_eq!(checkpoint.entries_pruned, 5);
    assert!(chain.verify().await.unwrap().valid);
}

#[tokio::test]
async fn test_readers_see_writes_while_writer_runs() {
    let (storage, _dir) = setup_sqlite_storage().await;
    let chain = Arc::new(AuditChain::new(storage.clone(), test_keys()));
    chain.initialize().await.unwrap();

    let writer = {
        let chain = chain.clone();
        tokio::spawn(async move {
            for i in 0..25 {
                chain
                    .record(AuditDraft::new("tick", Level::Trace, format!("{}", i)))
                    .await
                    .unwrap();
            }
        })
    };

    let mut last_seen = 0;
    while !writer.is_finished() {
        let count = storage.count().await.unwrap();
        assert!(count >= last_seen);
        last_seen = count;
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();

    assert_eq!(storage.count().await.unwrap(), 25);
    assert!(chain.verify().await.unwrap().valid);
}
