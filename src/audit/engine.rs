//! Audit Chain Engine
//!
//! `AuditChain` is the one handle producers and readers share. Writes
//! (appends, key rotation, retention) are funnelled through a bounded queue
//! into a single writer task that owns the chain head, so hash links are
//! assigned strictly in the order entries are persisted. Reads go straight
//! to storage.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::audit::chain::ChainState;
use crate::audit::entry::{AuditDraft, AuditEntry};
use crate::audit::hasher::{KeyRing, SigningKey};
use crate::audit::verify::{self, ChainIssue, VerificationResult};
use crate::error::{AuditError, AuditResult, StorageError};
use crate::storage::{
    AuditStorage, Pagination, PruneCheckpoint, QueryFilter, QueryResult, RetentionPolicy,
    SequenceRange, SortOrder,
};

/// Default capacity of the writer queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Lifecycle of an `AuditChain`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Uninitialized,
    Initialized,
    /// A write collided with foreign data; writes are refused until
    /// `initialize` reloads the chain head.
    Faulted,
}

/// Outcome of the most recent full verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationSummary {
    pub valid: bool,
    pub entries_checked: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ChainIssue>,
    /// Epoch milliseconds.
    pub verified_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditStats {
    pub entries_count: u64,
    /// `None` until a full verification has run.
    pub chain_valid: Option<bool>,
    pub last_verification: Option<VerificationSummary>,
    pub signing_key_version: u32,
    pub last_checkpoint: Option<PruneCheckpoint>,
}

enum WriteCommand {
    Append {
        draft: AuditDraft,
        reply: oneshot::Sender<AuditResult<AuditEntry>>,
    },
    RotateKey {
        key: SigningKey,
        reply: oneshot::Sender<AuditResult<u32>>,
    },
    Retain {
        policy: RetentionPolicy,
        now_ms: i64,
        reply: oneshot::Sender<AuditResult<u64>>,
    },
}

struct WriterHandle {
    tx: mpsc::Sender<WriteCommand>,
    faulted: Arc<AtomicBool>,
}

/// Tamper-evident audit chain over a pluggable storage backend
pub struct AuditChain {
    storage: Arc<dyn AuditStorage>,
    keys: Arc<RwLock<KeyRing>>,
    writer: Mutex<Option<WriterHandle>>,
    /// Newest sequence acknowledged by storage.
    head: Arc<AtomicU64>,
    last_verification: RwLock<Option<VerificationSummary>>,
    queue_capacity: usize,
}

impl AuditChain {
    pub fn new(storage: Arc<dyn AuditStorage>, keys: KeyRing) -> Self {
        Self {
            storage,
            keys: Arc::new(RwLock::new(keys)),
            writer: Mutex::new(None),
            head: Arc::new(AtomicU64::new(0)),
            last_verification: RwLock::new(None),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Load the chain head from storage and start the writer.
    ///
    /// Idempotent while healthy. On a faulted chain this reloads the head
    /// and replaces the writer.
    pub async fn initialize(&self) -> AuditResult<()> {
        let mut writer = self.writer.lock().await;
        if let Some(handle) = writer.as_ref() {
            if !handle.faulted.load(Ordering::SeqCst) {
                return Ok(());
            }
            warn!("Re-initializing faulted audit chain");
        }

        let state = ChainState::load(self.storage.as_ref(), self.keys.clone()).await?;
        self.head.store(state.last_sequence(), Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let faulted = Arc::new(AtomicBool::new(false));
        tokio::spawn(run_writer(
            state,
            self.storage.clone(),
            rx,
            faulted.clone(),
            self.head.clone(),
        ));

        *writer = Some(WriterHandle { tx, faulted });
        info!(
            "Audit chain initialized at sequence {}",
            self.head.load(Ordering::SeqCst)
        );
        Ok(())
    }

    pub async fn state(&self) -> EngineState {
        match self.writer.lock().await.as_ref() {
            None => EngineState::Uninitialized,
            Some(handle) if handle.faulted.load(Ordering::SeqCst) => EngineState::Faulted,
            Some(_) => EngineState::Initialized,
        }
    }

    async fn sender(&self) -> AuditResult<mpsc::Sender<WriteCommand>> {
        match self.writer.lock().await.as_ref() {
            None => Err(AuditError::NotInitialized),
            Some(handle) if handle.faulted.load(Ordering::SeqCst) => Err(
                AuditError::ChainFaulted("re-initialize the audit chain to resume writes".to_string()),
            ),
            Some(handle) => Ok(handle.tx.clone()),
        }
    }

    async fn ensure_initialized(&self) -> AuditResult<()> {
        if self.writer.lock().await.is_none() {
            return Err(AuditError::NotInitialized);
        }
        Ok(())
    }

    async fn submit<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<AuditResult<T>>) -> WriteCommand,
    ) -> AuditResult<T> {
        let tx = self.sender().await?;
        let (reply, rx) = oneshot::channel();
        tx.send(command(reply))
            .await
            .map_err(|_| AuditError::ChainFaulted("audit writer has stopped".to_string()))?;
        rx.await
            .map_err(|_| AuditError::ChainFaulted("audit writer dropped the request".to_string()))?
    }

    /// Append one entry to the chain and return it as stored
    pub async fn record(&self, draft: AuditDraft) -> AuditResult<AuditEntry> {
        self.submit(|reply| WriteCommand::Append { draft, reply })
            .await
    }

    /// Verify the whole chain
    pub async fn verify(&self) -> AuditResult<VerificationResult> {
        self.verify_range(SequenceRange::all()).await
    }

    /// Verify entries within `range`. Only full scans update the cached
    /// result reported by `get_stats`.
    pub async fn verify_range(&self, range: SequenceRange) -> AuditResult<VerificationResult> {
        self.ensure_initialized().await?;
        let keys = self.keys.read().await.clone();
        // Read the head before the snapshot so concurrent appends cannot
        // look like a truncated tail.
        let known_head = self.head.load(Ordering::SeqCst);

        let result = match self.storage.snapshot(verify::scan_range(range)).await {
            Ok(snapshot) => verify::verify_snapshot(&snapshot, range, &keys, Some(known_head)),
            Err(StorageError::Corrupt(msg)) => {
                warn!("Audit chain contains an undecodable entry: {}", msg);
                VerificationResult::invalid(0, None, ChainIssue::TamperedEntry, msg)
            }
            Err(e) => {
                error!("Audit verification could not read storage: {}", e);
                return Err(AuditError::StorageUnavailable(e.to_string()));
            }
        };

        if range.is_full() {
            *self.last_verification.write().await = Some(VerificationSummary {
                valid: result.valid,
                entries_checked: result.entries_checked,
                reason: result.reason,
                verified_at: Utc::now().timestamp_millis(),
            });
        }
        Ok(result)
    }

    /// Rotate to `new_key` and return its version. Entries signed under
    /// earlier versions keep verifying.
    pub async fn update_signing_key(&self, new_key: impl Into<String>) -> AuditResult<u32> {
        let key = SigningKey::new(new_key)?;
        self.submit(|reply| WriteCommand::RotateKey { key, reply })
            .await
    }

    pub async fn get_stats(&self) -> AuditResult<AuditStats> {
        let entries_count = self.storage.count().await?;
        let last_checkpoint = self.storage.checkpoint().await?;
        let last_verification = self.last_verification.read().await.clone();
        Ok(AuditStats {
            entries_count,
            chain_valid: last_verification.as_ref().map(|v| v.valid),
            last_verification,
            signing_key_version: self.keys.read().await.active_version(),
            last_checkpoint,
        })
    }

    pub async fn get_by_id(&self, id: &str) -> AuditResult<Option<AuditEntry>> {
        Ok(self.storage.get_by_id(id).await?)
    }

    pub async fn get_by_task_id(&self, task_id: &str) -> AuditResult<Vec<AuditEntry>> {
        Ok(self.storage.get_by_task_id(task_id).await?)
    }

    pub async fn get_by_correlation_id(&self, correlation_id: &str) -> AuditResult<Vec<AuditEntry>> {
        Ok(self.storage.get_by_correlation_id(correlation_id).await?)
    }

    pub async fn query(
        &self,
        filter: &QueryFilter,
        page: Pagination,
        order: SortOrder,
    ) -> AuditResult<QueryResult> {
        Ok(self.storage.query(filter, page, order).await?)
    }

    pub async fn search_full_text(&self, text: &str, page: Pagination) -> AuditResult<QueryResult> {
        Ok(self.storage.search_full_text(text, page).await?)
    }

    /// Prune per `policy`, serialized with appends. Returns entries deleted.
    pub async fn enforce_retention(&self, policy: RetentionPolicy) -> AuditResult<u64> {
        let now_ms = Utc::now().timestamp_millis();
        self.submit(|reply| WriteCommand::Retain {
            policy,
            now_ms,
            reply,
        })
        .await
    }

    pub fn storage(&self) -> &Arc<dyn AuditStorage> {
        &self.storage
    }
}

async fn run_writer(
    mut state: ChainState,
    storage: Arc<dyn AuditStorage>,
    mut rx: mpsc::Receiver<WriteCommand>,
    faulted: Arc<AtomicBool>,
    head: Arc<AtomicU64>,
) {
    while let Some(command) = rx.recv().await {
        let refused = || AuditError::ChainFaulted("audit chain is faulted".to_string());
        let is_faulted = faulted.load(Ordering::SeqCst);

        match command {
            WriteCommand::Append { draft, reply } => {
                let result = if is_faulted {
                    Err(refused())
                } else {
                    state.append(storage.as_ref(), draft).await
                };
                match &result {
                    Ok(entry) => head.store(entry.sequence, Ordering::SeqCst),
                    Err(AuditError::ChainFaulted(msg)) if !is_faulted => {
                        error!("Audit append faulted the chain: {}", msg);
                        faulted.store(true, Ordering::SeqCst);
                    }
                    Err(e) => warn!("Audit append failed: {}", e),
                }
                let _ = reply.send(result);
            }
            WriteCommand::RotateKey { key, reply } => {
                let result = if is_faulted {
                    Err(refused())
                } else {
                    state.rotate_key(storage.as_ref(), key).await
                };
                let _ = reply.send(result);
            }
            WriteCommand::Retain {
                policy,
                now_ms,
                reply,
            } => {
                let result = if is_faulted {
                    Err(refused())
                } else {
                    state.retain(storage.as_ref(), &policy, now_ms).await
                };
                if let Err(e) = &result {
                    warn!("Audit retention failed: {}", e);
                }
                let _ = reply.send(result);
            }
        }
    }
    info!(
        "Audit writer stopped at sequence {}",
        state.last_sequence()
    );
}
