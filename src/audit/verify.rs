//! Audit Chain Verification
//!
//! Replays a snapshot of the chain in sequence order and reports the first
//! place where the sequence, the hash link or the signature breaks.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use crate::audit::entry::AuditEntry;
use crate::audit::hasher::{self, KeyRing, GENESIS_HASH};
use crate::storage::{ChainSnapshot, SequenceRange};

/// Kind of integrity violation found by verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainIssue {
    /// `previousEntryHash` does not match the preceding digest.
    TamperedEntry,
    /// The signature does not verify under the entry's key version.
    SignatureMismatch,
    /// A sequence number is missing or out of place.
    SequenceGap,
}

impl fmt::Display for ChainIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChainIssue::TamperedEntry => "TamperedEntry",
            ChainIssue::SignatureMismatch => "SignatureMismatch",
            ChainIssue::SequenceGap => "SequenceGap",
        };
        f.write_str(name)
    }
}

/// Verification result with detailed information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub valid: bool,
    pub entries_checked: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_invalid_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ChainIssue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VerificationResult {
    pub fn valid(entries_checked: u64) -> Self {
        Self {
            valid: true,
            entries_checked,
            first_invalid_id: None,
            reason: None,
            error: None,
        }
    }

    pub fn invalid(
        entries_checked: u64,
        first_invalid_id: Option<String>,
        reason: ChainIssue,
        error: impl Into<String>,
    ) -> Self {
        Self {
            valid: false,
            entries_checked,
            first_invalid_id,
            reason: Some(reason),
            error: Some(error.into()),
        }
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        if self.valid {
            format!("Audit chain is valid ({} entries)", self.entries_checked)
        } else {
            format!(
                "Audit chain is invalid after {} entries: {} at {}: {}",
                self.entries_checked,
                self.reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "Unknown".to_string()),
                self.first_invalid_id.as_deref().unwrap_or("end of chain"),
                self.error.as_deref().unwrap_or("no detail")
            )
        }
    }
}

/// Storage range to read for verifying `range`: one entry earlier, so the
/// entry before `from` can anchor the scan.
pub fn scan_range(range: SequenceRange) -> SequenceRange {
    SequenceRange {
        from: range.from.map(|from| from.saturating_sub(1)),
        to: range.to,
    }
}

/// Verify `snapshot`, which must have been read with `scan_range(range)`.
///
/// `known_head` is the newest sequence the writer has acknowledged; for
/// open-ended ranges a snapshot ending before it means the tail was removed.
pub fn verify_snapshot(
    snapshot: &ChainSnapshot,
    range: SequenceRange,
    keys: &KeyRing,
    known_head: Option<u64>,
) -> VerificationResult {
    let start = range.from.unwrap_or(1).max(1);
    let entries = &snapshot.entries;

    let (mut prev_sequence, mut expected_hash) = match &snapshot.checkpoint {
        Some(checkpoint) if start - 1 <= checkpoint.sequence => {
            (checkpoint.sequence, checkpoint.hash.clone())
        }
        _ if start == 1 => (0, GENESIS_HASH.to_string()),
        _ => match entries.iter().find(|e| e.sequence == start - 1) {
            Some(anchor) => (
                anchor.sequence,
                hasher::digest(anchor, &anchor.integrity.previous_entry_hash),
            ),
            None => match entries.iter().find(|e| e.sequence >= start) {
                Some(first) => (start - 1, first.integrity.previous_entry_hash.clone()),
                None => return VerificationResult::valid(0),
            },
        },
    };

    let mut checked = 0u64;
    let anchor_sequence = prev_sequence;
    for entry in entries.iter().filter(|e| e.sequence > anchor_sequence) {
        if range.to.is_some_and(|to| entry.sequence > to) {
            break;
        }
        if let Err(result) = check_entry(entry, prev_sequence, &expected_hash, keys, checked) {
            warn!("{}", result.summary());
            return result;
        }
        expected_hash = hasher::digest(entry, &entry.integrity.previous_entry_hash);
        prev_sequence = entry.sequence;
        checked += 1;
    }

    if range.to.is_none() {
        if let Some(head) = known_head {
            if prev_sequence < head {
                let result = VerificationResult::invalid(
                    checked,
                    None,
                    ChainIssue::SequenceGap,
                    format!(
                        "chain ends at sequence {} but sequence {} was written",
                        prev_sequence, head
                    ),
                );
                warn!("{}", result.summary());
                return result;
            }
        }
    }

    info!("Audit chain verification successful: {} entries", checked);
    VerificationResult::valid(checked)
}

fn check_entry(
    entry: &AuditEntry,
    prev_sequence: u64,
    expected_hash: &str,
    keys: &KeyRing,
    checked: u64,
) -> Result<(), VerificationResult> {
    let invalid = |reason, error: String| {
        VerificationResult::invalid(checked, Some(entry.id.clone()), reason, error)
    };

    if entry.sequence != prev_sequence + 1 {
        return Err(invalid(
            ChainIssue::SequenceGap,
            format!(
                "expected sequence {}, found {}",
                prev_sequence + 1,
                entry.sequence
            ),
        ));
    }

    if entry.integrity.previous_entry_hash != expected_hash {
        return Err(invalid(
            ChainIssue::TamperedEntry,
            format!(
                "sequence {} does not link to the preceding entry",
                entry.sequence
            ),
        ));
    }

    let digest = hasher::digest(entry, &entry.integrity.previous_entry_hash);
    let signature_ok = keys
        .get(entry.integrity.version)
        .is_some_and(|key| hasher::verify_signature(&digest, &entry.integrity.signature, key));
    if !signature_ok {
        return Err(invalid(
            ChainIssue::SignatureMismatch,
            format!(
                "signature of sequence {} does not verify under key version {}",
                entry.sequence, entry.integrity.version
            ),
        ));
    }

    Ok(())
}
