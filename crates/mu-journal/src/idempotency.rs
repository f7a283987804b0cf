//! Exactly-once command acceptance across retries.
//!
//! A live claim binds (idempotency_key, fingerprint) to the first command id
//! that won it. Same key + same fingerprint within the TTL is a duplicate;
//! same key + different fingerprint is a conflict; an expired claim is
//! logically absent and the key can be rewon.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Result;
use crate::jsonl;

pub const IDEMPOTENCY_FILE: &str = "idempotency.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdempotencyClaimRecord {
    pub idempotency_key: String,
    pub fingerprint: String,
    /// First claimant within the TTL.
    pub command_id: String,
    pub created_at_ms: i64,
    pub last_seen_ms: i64,
    pub expires_at_ms: i64,
}

impl IdempotencyClaimRecord {
    pub fn is_live(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// Outcome of one claim attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// No live record existed; this caller wins the key.
    Created,
    /// A live record with a matching fingerprint exists.
    Duplicate { command_id: String },
    /// A live record with a different fingerprint exists — reject.
    Conflict { command_id: String },
}

/// Append-only ledger with an in-memory fold (latest record per key).
/// Mutations must run inside the serialized lane.
pub struct IdempotencyLedger {
    path: PathBuf,
    claims: HashMap<String, IdempotencyClaimRecord>,
}

impl IdempotencyLedger {
    pub fn open(store_dir: &Path) -> Result<Self> {
        let path = store_dir.join(IDEMPOTENCY_FILE);
        let records: Vec<IdempotencyClaimRecord> = jsonl::read_records(&path)?;
        let mut claims = HashMap::new();
        for record in records {
            claims.insert(record.idempotency_key.clone(), record);
        }
        debug!(claims = claims.len(), path = %path.display(), "idempotency ledger loaded");
        Ok(Self { path, claims })
    }

    /// Attempt to claim `key` for `command_id`.
    ///
    /// A duplicate refreshes `last_seen_ms` (appended so the refresh is
    /// durable). A conflict leaves the ledger untouched.
    pub fn claim(
        &mut self,
        key: &str,
        fingerprint: &str,
        command_id: &str,
        ttl_ms: i64,
        now_ms: i64,
    ) -> Result<ClaimOutcome> {
        if let Some(existing) = self.claims.get(key) {
            if existing.is_live(now_ms) {
                if existing.fingerprint == fingerprint {
                    let mut refreshed = existing.clone();
                    refreshed.last_seen_ms = now_ms;
                    jsonl::append_record(&self.path, &refreshed)?;
                    let winner = refreshed.command_id.clone();
                    self.claims.insert(key.to_string(), refreshed);
                    return Ok(ClaimOutcome::Duplicate { command_id: winner });
                }
                return Ok(ClaimOutcome::Conflict {
                    command_id: existing.command_id.clone(),
                });
            }
        }

        let record = IdempotencyClaimRecord {
            idempotency_key: key.to_string(),
            fingerprint: fingerprint.to_string(),
            command_id: command_id.to_string(),
            created_at_ms: now_ms,
            last_seen_ms: now_ms,
            expires_at_ms: now_ms + ttl_ms,
        };
        jsonl::append_record(&self.path, &record)?;
        self.claims.insert(key.to_string(), record);
        Ok(ClaimOutcome::Created)
    }

    /// Live claim for `key`, if any.
    pub fn get_live(&self, key: &str, now_ms: i64) -> Option<&IdempotencyClaimRecord> {
        self.claims.get(key).filter(|c| c.is_live(now_ms))
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(dir: &Path) -> IdempotencyLedger {
        IdempotencyLedger::open(dir).unwrap()
    }

    #[test]
    fn first_claim_wins_then_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let mut led = ledger(dir.path());

        let out = led.claim("k1", "fp-a", "cmd-1", 1_000, 0).unwrap();
        assert_eq!(out, ClaimOutcome::Created);

        let out = led.claim("k1", "fp-a", "cmd-2", 1_000, 500).unwrap();
        assert_eq!(
            out,
            ClaimOutcome::Duplicate {
                command_id: "cmd-1".into()
            }
        );
        // last_seen refreshed.
        assert_eq!(led.get_live("k1", 500).unwrap().last_seen_ms, 500);
    }

    #[test]
    fn different_fingerprint_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let mut led = ledger(dir.path());
        led.claim("k1", "fp-a", "cmd-1", 1_000, 0).unwrap();

        let out = led.claim("k1", "fp-B", "cmd-2", 1_000, 10).unwrap();
        assert_eq!(
            out,
            ClaimOutcome::Conflict {
                command_id: "cmd-1".into()
            }
        );
    }

    #[test]
    fn expired_claim_can_be_rewon() {
        let dir = tempfile::tempdir().unwrap();
        let mut led = ledger(dir.path());
        led.claim("k1", "fp-a", "cmd-1", 1_000, 0).unwrap();

        // At exactly expires_at_ms the claim is dead.
        let out = led.claim("k1", "fp-B", "cmd-2", 1_000, 1_000).unwrap();
        assert_eq!(out, ClaimOutcome::Created);
        assert_eq!(led.get_live("k1", 1_001).unwrap().command_id, "cmd-2");
    }

    #[test]
    fn reload_preserves_live_claims() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut led = ledger(dir.path());
            led.claim("k1", "fp-a", "cmd-1", 10_000, 0).unwrap();
            led.claim("k2", "fp-b", "cmd-2", 10, 0).unwrap();
        }
        let led = ledger(dir.path());
        assert!(led.get_live("k1", 5_000).is_some());
        // k2 expired; logically absent.
        assert!(led.get_live("k2", 5_000).is_none());
    }
}
