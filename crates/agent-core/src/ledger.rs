use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

/// One gateway call. The hash covers the entry's fields and the previous
/// entry's hash, so entries cannot be edited or reordered unnoticed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub function_name: String,
    pub outcome: String,
    pub message: String,
    pub hash: String,
}

impl LedgerEntry {
    fn content_hash(&self, prev_hash: Option<&str>) -> String {
        hash_json(&json!({
            "prev": prev_hash,
            "sequence": self.sequence,
            "timestamp_ms": self.timestamp_ms,
            "function": self.function_name,
            "outcome": self.outcome,
            "message": self.message,
        }))
    }
}

/// Hash-chained record of every call that went through the gateway.
#[derive(Debug, Default)]
pub struct InvocationLedger {
    entries: Vec<LedgerEntry>,
}

impl InvocationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, function_name: &str, outcome: &str, message: &str) -> &LedgerEntry {
        let prev_hash = self.entries.last().map(|entry| entry.hash.clone());
        let mut entry = LedgerEntry {
            sequence: self.entries.len() as u64 + 1,
            timestamp_ms: now_ms(),
            function_name: function_name.to_string(),
            outcome: outcome.to_string(),
            message: message.to_string(),
            hash: String::new(),
        };
        entry.hash = entry.content_hash(prev_hash.as_deref());
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn root_hash(&self) -> Option<String> {
        compute_root_hash(&self.entries)
    }

    pub fn is_intact(&self) -> bool {
        verify(&self.entries)
    }
}

/// Root over a list of entries, recomputed from their fields. Stored hashes
/// are ignored, so edits to any field change the result.
fn compute_root_hash(entries: &[LedgerEntry]) -> Option<String> {
    let mut prev: Option<String> = None;
    for entry in entries {
        prev = Some(entry.content_hash(prev.as_deref()));
    }
    let tip = prev?;

    let mut digest = Sha256::new();
    digest.update(b"invocation-ledger-v1");
    digest.update((entries.len() as u64).to_be_bytes());
    digest.update(tip.as_bytes());
    Some(hex::encode(digest.finalize()))
}

/// True when every stored hash matches the chain rebuilt from the fields.
fn verify(entries: &[LedgerEntry]) -> bool {
    let mut prev: Option<&str> = None;
    for entry in entries {
        if entry.content_hash(prev) != entry.hash {
            return false;
        }
        prev = Some(&entry.hash);
    }
    true
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

fn hash_json(value: &serde_json::Value) -> String {
    let mut sha = Sha256::new();
    sha.update(serde_json::to_vec(value).unwrap_or_default());
    hex::encode(sha.finalize())
}
