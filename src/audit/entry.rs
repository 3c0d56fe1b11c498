//! Audit Entry
//!
//! Defines the immutable audit record, its severity levels, the
//! tamper-evidence envelope, and the draft callers submit to `record`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Open, schemaless event detail. Any JSON object is accepted.
pub type Metadata = Map<String, Value>;

/// Severity of an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "fatal" => Ok(Level::Fatal),
            _ => Err(format!("Unknown audit level: {}", s)),
        }
    }
}

/// Tamper-evidence envelope attached to every persisted entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Integrity {
    /// Version of the signing key that produced `signature`.
    pub version: u32,
    /// Hex HMAC-SHA256 over this entry's digest.
    pub signature: String,
    /// Digest of the preceding entry, or the genesis hash.
    pub previous_entry_hash: String,
}

/// One immutable record of a security-relevant event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    /// Storage-assigned insertion position, starting at 1.
    pub sequence: u64,
    pub event: String,
    pub level: Level,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// Epoch milliseconds, assigned at append time.
    pub timestamp: i64,
    pub integrity: Integrity,
}

impl AuditEntry {
    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "#{} {} [{}] {}",
            self.sequence, self.event, self.level, self.message
        )
    }

    /// Serialized metadata as indexed by full-text search
    pub fn metadata_text(&self) -> Option<String> {
        self.metadata
            .as_ref()
            .map(|m| Value::Object(m.clone()).to_string())
    }
}

/// What a caller hands to `AuditChain::record`.
///
/// Identity, timestamp, sequence and integrity are filled in by the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditDraft {
    pub event: String,
    pub level: Level,
    pub message: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl AuditDraft {
    /// Create a new draft
    pub fn new(event: impl Into<String>, level: Level, message: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            level,
            message: message.into(),
            user_id: None,
            task_id: None,
            correlation_id: None,
            metadata: None,
        }
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Attach metadata. Non-object values are stored under a `value` key.
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(match metadata {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        });
        self
    }

    /// Turn the draft into an entry that still lacks its integrity envelope
    pub(crate) fn into_unsigned(self, id: String, timestamp: i64) -> AuditEntry {
        AuditEntry {
            id,
            sequence: 0,
            event: self.event,
            level: self.level,
            message: self.message,
            user_id: self.user_id,
            task_id: self.task_id,
            correlation_id: self.correlation_id,
            metadata: self.metadata,
            timestamp,
            integrity: Integrity {
                version: 0,
                signature: String::new(),
                previous_entry_hash: String::new(),
            },
        }
    }
}
