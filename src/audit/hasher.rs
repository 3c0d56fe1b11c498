//! Hashing and Signing
//!
//! Digest layout (bytes, in order):
//!   1. canonical JSON of the entry fields, excluding `sequence` and
//!      `integrity`; object keys sorted at every depth, absent optionals
//!      omitted
//!   2. the separator `|`
//!   3. the previous entry's digest as lowercase hex
//!
//! The digest is SHA-256, the signature HMAC-SHA256 over the digest's hex
//! text, both hex-encoded.

use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::audit::entry::AuditEntry;
use crate::error::{AuditError, AuditResult};

type HmacSha256 = Hmac<Sha256>;

/// Previous-hash sentinel for the first entry of a chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const FINGERPRINT_LABEL: &[u8] = b"audit-chain/key-fingerprint/v1";

/// Shortest accepted signing key, in characters.
pub const MIN_SIGNING_KEY_LEN: usize = 32;

/// Compute the chain digest of `entry` linked to `previous_hash`
pub fn digest(entry: &AuditEntry, previous_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_fields(entry).as_bytes());
    hasher.update(b"|");
    hasher.update(previous_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Sign a digest with `key`
pub fn sign(digest: &str, key: &SigningKey) -> String {
    let mut mac = key.mac();
    mac.update(digest.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Check `signature` against `digest` in constant time
pub fn verify_signature(digest: &str, signature: &str, key: &SigningKey) -> bool {
    let Ok(tag) = hex::decode(signature) else {
        return false;
    };
    let mut mac = key.mac();
    mac.update(digest.as_bytes());
    mac.verify_slice(&tag).is_ok()
}

fn canonical_fields(entry: &AuditEntry) -> String {
    let mut fields = Map::new();
    fields.insert("id".to_string(), Value::String(entry.id.clone()));
    fields.insert("event".to_string(), Value::String(entry.event.clone()));
    fields.insert("level".to_string(), Value::String(entry.level.to_string()));
    fields.insert("message".to_string(), Value::String(entry.message.clone()));
    if let Some(user_id) = &entry.user_id {
        fields.insert("userId".to_string(), Value::String(user_id.clone()));
    }
    if let Some(task_id) = &entry.task_id {
        fields.insert("taskId".to_string(), Value::String(task_id.clone()));
    }
    if let Some(correlation_id) = &entry.correlation_id {
        fields.insert(
            "correlationId".to_string(),
            Value::String(correlation_id.clone()),
        );
    }
    if let Some(metadata) = &entry.metadata {
        fields.insert("metadata".to_string(), Value::Object(metadata.clone()));
    }
    fields.insert("timestamp".to_string(), Value::from(entry.timestamp));

    let mut out = String::new();
    write_canonical(&Value::Object(fields), &mut out);
    out
}

// Key order must not depend on serde_json's map feature flags.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (key, val)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(val, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Secret used to sign entries. Never printed.
#[derive(Clone)]
pub struct SigningKey(String);

impl SigningKey {
    /// Validate and wrap key material
    pub fn new(material: impl Into<String>) -> AuditResult<Self> {
        let material = material.into();
        if material.trim().is_empty() {
            return Err(AuditError::InvalidSigningKey(
                "signing key must not be empty".to_string(),
            ));
        }
        if material.chars().count() < MIN_SIGNING_KEY_LEN {
            return Err(AuditError::InvalidSigningKey(format!(
                "signing key must be at least {} characters",
                MIN_SIGNING_KEY_LEN
            )));
        }
        Ok(Self(material))
    }

    /// Stable public identifier for this key, safe to persist.
    ///
    /// HMAC of a fixed label, so the key cannot be recovered from it.
    pub fn fingerprint(&self) -> String {
        let mut mac = self.mac();
        mac.update(FINGERPRINT_LABEL);
        hex::encode(mac.finalize().into_bytes())
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length.
        HmacSha256::new_from_slice(self.0.as_bytes())
            .unwrap_or_else(|_| unreachable!("HMAC-SHA256 accepts any key length"))
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

/// Versioned signing keys.
///
/// The highest version signs new entries; every older version stays
/// resolvable so entries signed before a rotation keep verifying.
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    keys: BTreeMap<u32, SigningKey>,
}

impl KeyRing {
    /// Key ring holding a single key as version 1
    pub fn new(key: SigningKey) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(1, key);
        Self { keys }
    }

    /// Key ring from explicit `(version, key)` pairs, e.g. from configuration
    pub fn from_versions(
        versions: impl IntoIterator<Item = (u32, SigningKey)>,
    ) -> AuditResult<Self> {
        let mut keys = BTreeMap::new();
        for (version, key) in versions {
            if version == 0 {
                return Err(AuditError::InvalidSigningKey(
                    "key versions start at 1".to_string(),
                ));
            }
            if keys.insert(version, key).is_some() {
                return Err(AuditError::InvalidSigningKey(format!(
                    "duplicate key version {}",
                    version
                )));
            }
        }
        if keys.is_empty() {
            return Err(AuditError::InvalidSigningKey(
                "at least one signing key is required".to_string(),
            ));
        }
        Ok(Self { keys })
    }

    /// Active `(version, key)`; `None` only for an empty ring
    pub fn active(&self) -> Option<(u32, &SigningKey)> {
        self.keys.iter().next_back().map(|(v, k)| (*v, k))
    }

    pub fn active_version(&self) -> u32 {
        self.active().map(|(v, _)| v).unwrap_or(0)
    }

    pub fn get(&self, version: u32) -> Option<&SigningKey> {
        self.keys.get(&version)
    }

    /// Version the next rotation will assign
    pub fn next_version(&self) -> u32 {
        self.active_version() + 1
    }

    /// Add `key` as the next version and return that version
    pub fn rotate(&mut self, key: SigningKey) -> u32 {
        let version = self.next_version();
        self.keys.insert(version, key);
        version
    }

    pub fn versions(&self) -> Vec<u32> {
        self.keys.keys().copied().collect()
    }
}
