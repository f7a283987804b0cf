use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use mu_core::types::OutboxId;
use mu_journal::jsonl;

use crate::error::{OutboxError, Result};
use crate::types::{OutboundEnvelope, OutboxRecord, OutboxState};

pub const OUTBOX_FILE: &str = "outbox.jsonl";

/// Outbox store over `outbox.jsonl`. Append-only: every state change writes
/// a full record row; loading folds the latest row per outbox id.
/// Mutations run inside the serialized lane.
pub struct OutboxStore {
    path: PathBuf,
    records: HashMap<String, OutboxRecord>,
}

impl OutboxStore {
    pub fn open(store_dir: &Path) -> Result<Self> {
        let path = store_dir.join(OUTBOX_FILE);
        let rows: Vec<OutboxRecord> = jsonl::read_records(&path)?;
        let mut records = HashMap::new();
        for row in rows {
            records.insert(row.outbox_id.0.clone(), row);
        }
        debug!(records = records.len(), path = %path.display(), "outbox store loaded");
        Ok(Self { path, records })
    }

    /// Enqueue an envelope. Two enqueues with the same dedupe key coalesce:
    /// if a non-dead-letter record already carries the key, that record is
    /// returned and nothing is written.
    pub fn enqueue(
        &mut self,
        envelope: OutboundEnvelope,
        dedupe_key: &str,
        max_attempts: u32,
        now_ms: i64,
    ) -> Result<OutboxRecord> {
        self.enqueue_status(envelope, dedupe_key, max_attempts, now_ms)
            .map(|(record, _)| record)
    }

    /// As [`enqueue`](Self::enqueue), also reporting whether a new record
    /// was created (`false` = coalesced onto an existing one).
    pub fn enqueue_status(
        &mut self,
        envelope: OutboundEnvelope,
        dedupe_key: &str,
        max_attempts: u32,
        now_ms: i64,
    ) -> Result<(OutboxRecord, bool)> {
        if let Some(existing) = self
            .records
            .values()
            .find(|r| r.dedupe_key == dedupe_key && r.state != OutboxState::DeadLetter)
        {
            debug!(dedupe_key, outbox_id = %existing.outbox_id, "enqueue coalesced");
            return Ok((existing.clone(), false));
        }

        let record = OutboxRecord {
            outbox_id: OutboxId::new(),
            dedupe_key: dedupe_key.to_string(),
            envelope,
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            next_attempt_at_ms: now_ms,
            state: OutboxState::Pending,
            replay_of_outbox_id: None,
            created_at_ms: now_ms,
            last_error: None,
        };
        self.persist(record.clone())?;
        Ok((record, true))
    }

    /// Pending records whose attempt time has arrived, oldest first.
    pub fn due(&self, now_ms: i64) -> Vec<OutboxRecord> {
        let mut due: Vec<OutboxRecord> = self
            .records
            .values()
            .filter(|r| r.is_due(now_ms))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.next_attempt_at_ms
                .cmp(&b.next_attempt_at_ms)
                .then(a.created_at_ms.cmp(&b.created_at_ms))
        });
        due
    }

    pub fn mark_delivered(&mut self, outbox_id: &str, attempt_count: u32) -> Result<()> {
        let mut record = self.must_get(outbox_id)?.clone();
        record.state = OutboxState::Delivered;
        record.attempt_count = attempt_count;
        record.last_error = None;
        self.persist(record)
    }

    /// Record a failed attempt; dead-letters once the budget is spent.
    pub fn mark_retry(
        &mut self,
        outbox_id: &str,
        error: &str,
        next_attempt_at_ms: i64,
    ) -> Result<OutboxRecord> {
        let mut record = self.must_get(outbox_id)?.clone();
        record.attempt_count += 1;
        record.last_error = Some(error.to_string());
        if record.attempt_count >= record.max_attempts {
            record.state = OutboxState::DeadLetter;
            record.last_error = Some(format!("retry_budget_exhausted: {error}"));
            warn!(outbox_id, attempts = record.attempt_count, "outbox record dead-lettered");
        } else {
            record.next_attempt_at_ms = next_attempt_at_ms;
        }
        self.persist(record.clone())?;
        Ok(record)
    }

    pub fn mark_dropped(&mut self, outbox_id: &str, reason: &str) -> Result<OutboxRecord> {
        let mut record = self.must_get(outbox_id)?.clone();
        record.state = OutboxState::DeadLetter;
        record.last_error = Some(reason.to_string());
        self.persist(record.clone())?;
        Ok(record)
    }

    /// Replay a dead-lettered record: fresh pending record, zeroed attempts,
    /// same envelope and dedupe key, correlation preserved.
    pub fn replay(&mut self, outbox_id: &str, now_ms: i64) -> Result<OutboxRecord> {
        let original = self.must_get(outbox_id)?.clone();
        if original.state != OutboxState::DeadLetter {
            return Err(OutboxError::NotDeadLetter {
                outbox_id: outbox_id.to_string(),
            });
        }
        let record = OutboxRecord {
            outbox_id: OutboxId::new(),
            dedupe_key: original.dedupe_key.clone(),
            envelope: original.envelope.clone(),
            attempt_count: 0,
            max_attempts: original.max_attempts,
            next_attempt_at_ms: now_ms,
            state: OutboxState::Pending,
            replay_of_outbox_id: Some(original.outbox_id.0.clone()),
            created_at_ms: now_ms,
            last_error: None,
        };
        info!(outbox_id = %record.outbox_id, replay_of = %original.outbox_id, "outbox record replayed");
        self.persist(record.clone())?;
        Ok(record)
    }

    pub fn get(&self, outbox_id: &str) -> Option<&OutboxRecord> {
        self.records.get(outbox_id)
    }

    pub fn dead_letters(&self) -> Vec<OutboxRecord> {
        let mut out: Vec<OutboxRecord> = self
            .records
            .values()
            .filter(|r| r.state == OutboxState::DeadLetter)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms));
        out
    }

    pub fn pending_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.state == OutboxState::Pending)
            .count()
    }

    fn must_get(&self, outbox_id: &str) -> Result<&OutboxRecord> {
        self.records.get(outbox_id).ok_or_else(|| OutboxError::NotFound {
            outbox_id: outbox_id.to_string(),
        })
    }

    fn persist(&mut self, record: OutboxRecord) -> Result<()> {
        jsonl::append_record(&self.path, &record)?;
        self.records.insert(record.outbox_id.0.clone(), record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EnvelopeKind;
    use mu_core::types::Correlation;
    use mu_core::Channel;

    fn envelope(kind: EnvelopeKind) -> OutboundEnvelope {
        OutboundEnvelope {
            channel: Channel::Slack,
            channel_tenant_id: "T1".into(),
            channel_conversation_id: "C1".into(),
            kind,
            body: "status · completed".into(),
            correlation: Correlation {
                command_id: Some("cmd-1".into()),
                ..Correlation::default()
            },
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn enqueue_dedupes_live_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = OutboxStore::open(dir.path()).unwrap();
        let a = store.enqueue(envelope(EnvelopeKind::Ack), "k1", 3, 0).unwrap();
        let b = store.enqueue(envelope(EnvelopeKind::Ack), "k1", 3, 5).unwrap();
        assert_eq!(a.outbox_id, b.outbox_id);
        assert_eq!(store.pending_count(), 1);
    }

    #[test]
    fn retry_budget_exhaustion_dead_letters() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = OutboxStore::open(dir.path()).unwrap();
        let rec = store.enqueue(envelope(EnvelopeKind::Result), "k1", 3, 0).unwrap();
        let id = rec.outbox_id.0.clone();

        for attempt in 1..=2 {
            let r = store.mark_retry(&id, "http 503", attempt * 100).unwrap();
            assert_eq!(r.state, OutboxState::Pending);
        }
        let r = store.mark_retry(&id, "http 503", 300).unwrap();
        assert_eq!(r.state, OutboxState::DeadLetter);
        assert_eq!(r.attempt_count, 3);
        assert!(r.last_error.as_deref().unwrap().starts_with("retry_budget_exhausted"));
    }

    #[test]
    fn replay_preserves_correlation_and_links_original() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = OutboxStore::open(dir.path()).unwrap();
        let rec = store.enqueue(envelope(EnvelopeKind::Result), "k1", 1, 0).unwrap();
        let id = rec.outbox_id.0.clone();
        store.mark_retry(&id, "boom", 100).unwrap();

        let replayed = store.replay(&id, 1_000).unwrap();
        assert_eq!(replayed.replay_of_outbox_id.as_deref(), Some(id.as_str()));
        assert_eq!(
            replayed.envelope.correlation.command_id.as_deref(),
            Some("cmd-1")
        );
        assert_eq!(replayed.attempt_count, 0);
        assert!(replayed.is_due(1_000));
    }

    #[test]
    fn replay_of_live_record_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = OutboxStore::open(dir.path()).unwrap();
        let rec = store.enqueue(envelope(EnvelopeKind::Ack), "k1", 3, 0).unwrap();
        assert!(store.replay(rec.outbox_id.as_str(), 10).is_err());
    }

    #[test]
    fn reload_folds_latest_state() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let mut store = OutboxStore::open(dir.path()).unwrap();
            let rec = store.enqueue(envelope(EnvelopeKind::Ack), "k1", 3, 0).unwrap();
            store.mark_delivered(rec.outbox_id.as_str(), 1).unwrap();
            rec.outbox_id.0
        };
        let store = OutboxStore::open(dir.path()).unwrap();
        assert_eq!(store.get(&id).unwrap().state, OutboxState::Delivered);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn due_orders_by_attempt_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = OutboxStore::open(dir.path()).unwrap();
        let a = store.enqueue(envelope(EnvelopeKind::Ack), "k1", 3, 50).unwrap();
        let b = store.enqueue(envelope(EnvelopeKind::Ack), "k2", 3, 10).unwrap();
        let due = store.due(100);
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].outbox_id, b.outbox_id);
        assert_eq!(due[1].outbox_id, a.outbox_id);
        assert!(store.due(5).is_empty());
    }
}
