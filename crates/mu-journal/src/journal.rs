//! The append-only command journal. Entry order is the sole source of truth:
//! loading folds `command.lifecycle` entries per command id and the latest
//! snapshot wins. `domain.mutating` entries are the audit trail of side
//! effects and are never folded into command state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use mu_core::types::Correlation;
use mu_core::{CommandRecord, CommandState};

use crate::error::Result;
use crate::jsonl;

pub const JOURNAL_FILE: &str = "commands.jsonl";

/// One journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum JournalEntry {
    /// Full command snapshot after a lifecycle transition.
    #[serde(rename = "command.lifecycle")]
    CommandLifecycle {
        event_type: String,
        at_ms: i64,
        command: CommandRecord,
    },
    /// Auditable side effect emitted by a mutation handler, appended before
    /// the final lifecycle transition of its command.
    #[serde(rename = "domain.mutating")]
    DomainMutating {
        command_id: String,
        event_type: String,
        state: CommandState,
        correlation: Correlation,
        payload: serde_json::Value,
        at_ms: i64,
    },
}

impl JournalEntry {
    pub fn command_id(&self) -> &str {
        match self {
            JournalEntry::CommandLifecycle { command, .. } => command.command_id.as_str(),
            JournalEntry::DomainMutating { command_id, .. } => command_id,
        }
    }
}

/// In-memory index over the on-disk journal. All mutations must run inside
/// the serialized lane; this type does no locking of its own.
pub struct CommandJournal {
    path: PathBuf,
    /// Latest snapshot per command id.
    index: HashMap<String, CommandRecord>,
}

impl CommandJournal {
    /// Open (or create) the journal under `store_dir` and fold existing
    /// entries into the index.
    pub fn open(store_dir: &Path) -> Result<Self> {
        let path = store_dir.join(JOURNAL_FILE);
        let entries: Vec<JournalEntry> = jsonl::read_records(&path)?;
        let mut index = HashMap::new();
        for entry in &entries {
            if let JournalEntry::CommandLifecycle { command, .. } = entry {
                index.insert(command.command_id.0.clone(), command.clone());
            }
        }
        debug!(commands = index.len(), path = %path.display(), "command journal loaded");
        Ok(Self { path, index })
    }

    /// Append a lifecycle entry for `record`'s current state.
    pub fn append_lifecycle(&mut self, record: &CommandRecord, at_ms: i64) -> Result<()> {
        let entry = JournalEntry::CommandLifecycle {
            event_type: format!("command.{}", record.state.as_str()),
            at_ms,
            command: record.clone(),
        };
        jsonl::append_record(&self.path, &entry)?;
        self.index
            .insert(record.command_id.0.clone(), record.clone());
        Ok(())
    }

    /// Append a domain mutating event correlated to a command.
    pub fn append_mutating(
        &mut self,
        command_id: &str,
        event_type: &str,
        state: CommandState,
        correlation: &Correlation,
        payload: serde_json::Value,
        at_ms: i64,
    ) -> Result<()> {
        let entry = JournalEntry::DomainMutating {
            command_id: command_id.to_string(),
            event_type: event_type.to_string(),
            state,
            correlation: correlation.clone(),
            payload,
            at_ms,
        };
        jsonl::append_record(&self.path, &entry)
    }

    pub fn get(&self, command_id: &str) -> Option<&CommandRecord> {
        self.index.get(command_id)
    }

    /// All commands currently in `state` (index scan; the journal is the
    /// bottleneck long before this is).
    pub fn in_state(&self, state: CommandState) -> Vec<CommandRecord> {
        let mut out: Vec<CommandRecord> = self
            .index
            .values()
            .filter(|r| r.state == state)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms));
        out
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Full ordered history for one command (lifecycle + mutating events),
    /// re-read from disk so audit sees exactly what is durable.
    pub fn history(&self, command_id: &str) -> Result<Vec<JournalEntry>> {
        let entries: Vec<JournalEntry> = jsonl::read_records(&self.path)?;
        Ok(entries
            .into_iter()
            .filter(|e| e.command_id() == command_id)
            .collect())
    }
}
