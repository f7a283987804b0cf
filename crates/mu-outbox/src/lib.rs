//! Durable at-least-once reply delivery: the outbox store, the retry/DLQ
//! dispatcher, and the interaction presenter that renders compact ACKs and
//! detailed bodies.

pub mod dispatcher;
pub mod error;
pub mod present;
pub mod store;
pub mod types;

pub use dispatcher::{Deliverer, OutboxDispatcher};
pub use error::{OutboxError, Result};
pub use present::InteractionMessage;
pub use store::OutboxStore;
pub use types::{DeliveryOutcome, EnvelopeKind, OutboundEnvelope, OutboxRecord, OutboxState};
