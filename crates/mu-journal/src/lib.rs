//! Durable state of the control plane: the append-only command journal, the
//! idempotency ledger, and the writer lock that makes this process the only
//! legal writer for a repo.
//!
//! Every store here is newline-delimited JSON, append-only by contract.
//! Rewrites never happen; state is reconstructed by folding lines in order.

pub mod error;
pub mod idempotency;
pub mod journal;
pub mod jsonl;
pub mod lane;
pub mod lock;

pub use error::{JournalError, Result};
pub use idempotency::{ClaimOutcome, IdempotencyClaimRecord, IdempotencyLedger};
pub use journal::{CommandJournal, JournalEntry};
pub use lane::SerializedMutationExecutor;
pub use lock::{LockOwner, WriterLock};
