//! Tamper-evident audit trail mirror.
//!
//! The `AuditLog` table (control-db) is the system of record; every writer
//! inserts a row there inside its own transaction. This crate maintains an
//! optional append-only JSON Lines mirror of that same stream with a SHA-256
//! hash chain, so the trail can be exported and verified offline without
//! trusting the database to not have been edited out-of-band.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use control_schemas::RunId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Append-only audit mirror writer. Writes JSON Lines, one event per line,
/// each carrying `hash_prev`/`hash_self` so tampering with any past line
/// breaks every hash after it.
pub struct AuditWriter {
    path: PathBuf,
    last_hash: Option<String>,
}

impl AuditWriter {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create_dir_all {parent:?}"))?;
        }
        Ok(Self {
            path,
            last_hash: None,
        })
    }

    /// Resume an existing log: restore the hash of its last line so the
    /// next append continues the chain instead of restarting it.
    pub fn set_last_hash(&mut self, last_hash: Option<String>) {
        self.last_hash = last_hash;
    }

    pub fn last_hash(&self) -> Option<String> {
        self.last_hash.clone()
    }

    pub fn append(
        &mut self,
        actor: &str,
        action: &str,
        payload_hash: &str,
        run_id: Option<RunId>,
        slot_id: Option<String>,
        commit_sha: Option<String>,
        trace_id: Option<String>,
    ) -> Result<AuditEntry> {
        let mut entry = AuditEntry {
            actor: actor.to_string(),
            action: action.to_string(),
            payload_hash: payload_hash.to_string(),
            run_id,
            slot_id,
            commit_sha,
            trace_id,
            timestamp: Utc::now(),
            hash_prev: self.last_hash.clone(),
            hash_self: None,
        };

        let self_hash = compute_entry_hash(&entry)?;
        entry.hash_self = Some(self_hash.clone());
        self.last_hash = Some(self_hash);

        let line = canonical_json_line(&entry)?;
        append_line(&self.path, &line)?;

        Ok(entry)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub actor: String,
    pub action: String,
    pub payload_hash: String,
    pub run_id: Option<RunId>,
    pub slot_id: Option<String>,
    pub commit_sha: Option<String>,
    pub trace_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open audit mirror {path:?}"))?;
    f.write_all(line.as_bytes()).context("write audit line")?;
    f.write_all(b"\n").context("write newline")?;
    Ok(())
}

fn canonical_json_line<T: Serialize>(v: &T) -> Result<String> {
    let raw = serde_json::to_value(v).context("serialize audit entry")?;
    let sorted = sort_keys(&raw);
    serde_json::to_string(&sorted).context("json stringify")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Hash is computed over the canonical form with `hash_self` cleared, so
/// the hash never references itself.
pub fn compute_entry_hash(entry: &AuditEntry) -> Result<String> {
    let mut clone = entry.clone();
    clone.hash_self = None;
    let canonical = canonical_json_line(&clone)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Valid { lines: usize },
    Broken { line: usize, reason: String },
}

pub fn verify_hash_chain(path: impl AsRef<Path>) -> Result<VerifyResult> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read audit mirror {:?}", path.as_ref()))?;
    verify_hash_chain_str(&content)
}

pub fn verify_hash_chain_str(content: &str) -> Result<VerifyResult> {
    let mut prev_hash: Option<String> = None;
    let mut line_count = 0usize;

    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let entry: AuditEntry = serde_json::from_str(trimmed)
            .with_context(|| format!("parse audit entry at line {}", i + 1))?;
        line_count += 1;

        if entry.hash_prev != prev_hash {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: format!(
                    "hash_prev mismatch: expected {:?}, got {:?}",
                    prev_hash, entry.hash_prev
                ),
            });
        }

        if let Some(ref claimed) = entry.hash_self {
            let recomputed = compute_entry_hash(&entry)?;
            if *claimed != recomputed {
                return Ok(VerifyResult::Broken {
                    line: i + 1,
                    reason: format!("hash_self mismatch: claimed {claimed}, recomputed {recomputed}"),
                });
            }
        }

        prev_hash = entry.hash_self.clone();
    }

    Ok(VerifyResult::Valid { lines: line_count })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_of_three_entries_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let mut w = AuditWriter::new(&path).unwrap();

        w.append("state-machine", "run.transition", "abc123", None, None, None, None)
            .unwrap();
        w.append("lease-manager", "slot.acquire", "def456", None, None, None, None)
            .unwrap();
        w.append("merge-gate", "run.merge", "ghi789", None, None, None, None)
            .unwrap();

        let result = verify_hash_chain(&path).unwrap();
        assert_eq!(result, VerifyResult::Valid { lines: 3 });
    }

    #[test]
    fn tampered_line_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let mut w = AuditWriter::new(&path).unwrap();
        w.append("state-machine", "run.transition", "abc123", None, None, None, None)
            .unwrap();
        w.append("lease-manager", "slot.acquire", "def456", None, None, None, None)
            .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let tampered = content.replace("def456", "000000");
        fs::write(&path, tampered).unwrap();

        match verify_hash_chain(&path).unwrap() {
            VerifyResult::Broken { line, .. } => assert_eq!(line, 2),
            VerifyResult::Valid { .. } => panic!("expected tamper to be detected"),
        }
    }

    #[test]
    fn resuming_a_log_continues_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let mut w1 = AuditWriter::new(&path).unwrap();
        w1.append("state-machine", "run.transition", "abc123", None, None, None, None)
            .unwrap();
        let last = w1.last_hash();

        let mut w2 = AuditWriter::new(&path).unwrap();
        w2.set_last_hash(last);
        w2.append("lease-manager", "slot.acquire", "def456", None, None, None, None)
            .unwrap();

        let result = verify_hash_chain(&path).unwrap();
        assert_eq!(result, VerifyResult::Valid { lines: 2 });
    }
}
