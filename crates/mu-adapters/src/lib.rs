//! Adapter ingress: per-channel signature verification and normalization of
//! transport payloads into the canonical [`mu_core::InboundEnvelope`].
//!
//! Adapters are transport-agnostic — the gateway hands them lowercased
//! headers and the raw body; they hand back an envelope or a typed
//! rejection. The actual HTTP plumbing lives in the gateway crate.

pub mod discord;
pub mod error;
pub mod markdown;
pub mod neovim;
pub mod set;
pub mod slack;
pub mod telegram;
pub mod verify;

pub use error::{AdapterError, Result};
pub use set::{AckContext, Adapter, AdapterSet, BindingLookup, ControlPlaneAdapterSpec};
