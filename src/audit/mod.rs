//! Audit Chain
//!
//! Tamper-evident, append-only audit log: every entry is hash-linked to
//! its predecessor and signed with a versioned HMAC key.

pub mod chain;
pub mod engine;
pub mod entry;
pub mod hasher;
pub mod verify;

pub use engine::{AuditChain, AuditStats, EngineState, VerificationSummary};
pub use entry::{AuditDraft, AuditEntry, Integrity, Level, Metadata};
pub use hasher::{KeyRing, SigningKey, GENESIS_HASH};
pub use verify::{ChainIssue, VerificationResult};
