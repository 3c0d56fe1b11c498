pub mod api;
pub mod audit;
pub mod config;
pub mod error;
pub mod storage;

pub use audit::{AuditChain, AuditDraft, AuditEntry, Level};
pub use error::{AuditError, StorageError};
