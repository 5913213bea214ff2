//! `run_id` is an opaque string, not a surrogate integer: callers mint it,
//! the store only ever compares and stores it verbatim.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque run identifier. Must match `[A-Za-z0-9-]+`; enforced at the
/// boundary (`RunId::parse`), not re-validated on every internal pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        if raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            Some(RunId(raw.to_string()))
        } else {
            None
        }
    }

    /// Mint a fresh opaque id. No RNG beyond `Uuid::new_v4` — callers that
    /// need deterministic ids (tests, replays) should go through `parse`.
    pub fn generate() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn branch_name(&self) -> String {
        format!("codex/run-{}", self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_illegal_characters() {
        assert!(RunId::parse("abc/def").is_none());
        assert!(RunId::parse("").is_none());
        assert!(RunId::parse("run-1_a").is_none());
    }

    #[test]
    fn parse_accepts_alphanumeric_and_hyphen() {
        let id = RunId::parse("R1-abc-123").unwrap();
        assert_eq!(id.as_str(), "R1-abc-123");
    }

    #[test]
    fn branch_name_is_canonical() {
        let id = RunId::parse("R1").unwrap();
        assert_eq!(id.branch_name(), "codex/run-R1");
    }
}
