//! Evidence Chain: hash-linked ordering of a task's evidence records.
//!
//! Each entry stores the record digest (SHA-256 over the record with its
//! verdict removed) and a rolling link `H(prev_link || digest)`. Re-deriving
//! the links detects edits, gaps, and reorderings.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::evidence::EvidenceRecord;
use crate::core::types::SCHEMA_VERSION;

/// Link value preceding the first entry.
pub const GENESIS: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub id: String,
    pub sequence: u64,
    pub digest: String,
    pub link: String,
}

/// Persisted chain document (`evidence/<task>.chain.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceChain {
    pub schema_version: u32,
    pub task_id: String,
    pub entries: Vec<ChainEntry>,
}

impl EvidenceChain {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            task_id: task_id.into(),
            entries: Vec::new(),
        }
    }

    pub fn head(&self) -> &str {
        self.entries.last().map_or(GENESIS, |entry| entry.link.as_str())
    }

    /// Append `record`, linking it to the current head.
    pub fn append(&mut self, record: &EvidenceRecord) -> &ChainEntry {
        let digest = record_digest(record);
        let link = link_hash(self.head(), &digest);
        self.entries.push(ChainEntry {
            id: record.id.clone(),
            sequence: record.sequence,
            digest,
            link,
        });
        &self.entries[self.entries.len() - 1]
    }
}

/// Digest of a record's content. The verdict is excluded so attaching it
/// does not change the digest.
pub fn record_digest(record: &EvidenceRecord) -> String {
    let mut unverdicted = record.clone();
    unverdicted.verdict = None;
    // Struct serialization has a fixed field order, so the bytes are canonical.
    let bytes = serde_json::to_vec(&unverdicted).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

pub fn link_hash(prev: &str, digest: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev.as_bytes());
    hasher.update(digest.as_bytes());
    hex::encode(hasher.finalize())
}

/// Result of re-deriving a chain against the stored records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub task_id: String,
    pub entries: usize,
    pub intact: bool,
    /// Index of the first entry that failed to re-derive.
    pub break_at: Option<usize>,
    pub reason: Option<String>,
    /// Record ids at or after the break.
    pub unverifiable: Vec<String>,
}

/// Re-derive `chain` from `records`.
///
/// A record whose digest or link no longer matches, a sequence gap, a
/// reordering, or a length mismatch breaks the chain at that position; every
/// record from there on is unverifiable.
pub fn verify(chain: &EvidenceChain, records: &[EvidenceRecord]) -> ChainReport {
    let mut prev = GENESIS.to_string();
    let mut failure: Option<(usize, String)> = None;

    for (index, record) in records.iter().enumerate() {
        let expected_seq = index as u64 + 1;
        let Some(entry) = chain.entries.get(index) else {
            failure = Some((index, format!("record '{}' has no chain entry", record.id)));
            break;
        };
        if record.sequence != expected_seq {
            failure = Some((
                index,
                format!(
                    "record '{}' has sequence {} where {} was expected",
                    record.id, record.sequence, expected_seq
                ),
            ));
            break;
        }
        if entry.id != record.id || entry.sequence != record.sequence {
            failure = Some((
                index,
                format!("chain entry '{}' does not match record '{}'", entry.id, record.id),
            ));
            break;
        }
        let digest = record_digest(record);
        if digest != entry.digest {
            failure = Some((index, format!("record '{}' content changed", record.id)));
            break;
        }
        let link = link_hash(&prev, &digest);
        if link != entry.link {
            failure = Some((index, format!("link for '{}' does not re-derive", record.id)));
            break;
        }
        prev = link;
    }

    if failure.is_none() && chain.entries.len() > records.len() {
        let index = records.len();
        failure = Some((
            index,
            format!("chain entry '{}' has no stored record", chain.entries[index].id),
        ));
    }

    match failure {
        None => ChainReport {
            task_id: chain.task_id.clone(),
            entries: chain.entries.len(),
            intact: true,
            break_at: None,
            reason: None,
            unverifiable: Vec::new(),
        },
        Some((index, reason)) => {
            let mut unverifiable: Vec<String> =
                records.iter().skip(index).map(|r| r.id.clone()).collect();
            for entry in chain.entries.iter().skip(index) {
                if !unverifiable.contains(&entry.id) {
                    unverifiable.push(entry.id.clone());
                }
            }
            ChainReport {
                task_id: chain.task_id.clone(),
                entries: chain.entries.len(),
                intact: false,
                break_at: Some(index),
                reason: Some(reason),
                unverifiable,
            }
        }
    }
}
