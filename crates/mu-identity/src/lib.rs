//! Identity bindings: who a channel actor is, what scopes they hold, and at
//! what assurance tier. Bindings live in `identities.jsonl`; the resolver is
//! the hot path consulted on every inbound command.

pub mod error;
pub mod link;
pub mod store;
pub mod types;

pub use error::{IdentityError, Result};
pub use link::{LinkCodeRegistry, PendingLink};
pub use store::IdentityStore;
pub use types::IdentityBinding;
