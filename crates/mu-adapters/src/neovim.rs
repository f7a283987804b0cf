//! Neovim editor ingress. Trusted-ish local surface: JSON payload with a
//! shared secret in `x-mu-neovim-secret`.

use std::collections::HashMap;

use mu_core::{Channel, InboundEnvelope};
use uuid::Uuid;

use crate::error::{AdapterError, Result};
use crate::set::{build_envelope, BindingLookup};
use crate::verify::verify_shared_secret;

pub const SECRET_HEADER: &str = "x-mu-neovim-secret";

pub struct NeovimAdapter {
    shared_secret: String,
}

impl NeovimAdapter {
    pub fn new(shared_secret: String) -> Self {
        Self { shared_secret }
    }

    pub fn verify_and_normalize(
        &self,
        headers: &HashMap<String, String>,
        body: &[u8],
        now_ms: i64,
        repo_root: &str,
        bindings: &dyn BindingLookup,
    ) -> Result<InboundEnvelope> {
        verify_shared_secret(&self.shared_secret, headers.get(SECRET_HEADER).map(|s| s.as_str()))?;

        let payload: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| AdapterError::PayloadInvalid(format!("invalid JSON: {e}")))?;

        let actor = payload
            .get("actor_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::PayloadInvalid("missing actor_id".to_string()))?;
        let text = payload
            .get("command_text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::PayloadInvalid("missing command_text".to_string()))?;
        let request_id = payload
            .get("request_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("nvim-{}", Uuid::new_v4()));
        let session = payload
            .get("session_id")
            .and_then(|v| v.as_str())
            .unwrap_or("editor");

        build_envelope(
            Channel::Neovim,
            "local",
            session,
            actor,
            text,
            &request_id,
            &request_id,
            &format!("neovim:{request_id}"),
            now_ms,
            repo_root,
            bindings,
        )
    }
}
