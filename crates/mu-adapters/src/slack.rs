//! Slack slash-command ingress. Form-encoded payload, `v0:` timestamped
//! HMAC signature, 5-minute staleness window.

use std::collections::HashMap;

use mu_core::{Channel, InboundEnvelope};
use tracing::debug;

use crate::error::{AdapterError, Result};
use crate::set::{build_envelope, BindingLookup};
use crate::verify::verify_timestamped_hmac;

pub const SIGNATURE_HEADER: &str = "x-slack-signature";
pub const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

pub struct SlackAdapter {
    signing_secret: String,
}

impl SlackAdapter {
    pub fn new(signing_secret: String) -> Self {
        Self { signing_secret }
    }

    pub fn verify_and_normalize(
        &self,
        headers: &HashMap<String, String>,
        body: &[u8],
        now_ms: i64,
        repo_root: &str,
        bindings: &dyn BindingLookup,
    ) -> Result<InboundEnvelope> {
        let timestamp = headers
            .get(TIMESTAMP_HEADER)
            .ok_or_else(|| AdapterError::SignatureInvalid("missing timestamp header".to_string()))?;
        let signature = headers
            .get(SIGNATURE_HEADER)
            .ok_or_else(|| AdapterError::SignatureInvalid("missing signature header".to_string()))?;
        verify_timestamped_hmac(&self.signing_secret, timestamp, signature, body, now_ms)?;

        let form = parse_form(body)?;
        let team = required(&form, "team_id")?;
        let channel_id = required(&form, "channel_id")?;
        let user = required(&form, "user_id")?;
        let trigger = required(&form, "trigger_id")?;
        let text = form.get("text").cloned().unwrap_or_default();
        let slash = form
            .get("command")
            .cloned()
            .unwrap_or_else(|| "/mu".to_string());
        let command_text = format!("{slash} {text}");

        // Slack resends with a retry header; the trigger id pins the retry
        // to the original idempotency claim.
        let retry = headers
            .get("x-slack-retry-num")
            .cloned()
            .unwrap_or_else(|| "0".to_string());
        debug!(team = %team, trigger = %trigger, retry = %retry, "slack request verified");

        build_envelope(
            Channel::Slack,
            &team,
            &channel_id,
            &user,
            &command_text,
            &trigger,
            &format!("{trigger}:{retry}"),
            &format!("slack:{team}:{trigger}"),
            now_ms,
            repo_root,
            bindings,
        )
    }
}

fn required(form: &HashMap<String, String>, key: &str) -> Result<String> {
    form.get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| AdapterError::PayloadInvalid(format!("missing form field {key}")))
}

/// Minimal application/x-www-form-urlencoded parser: `+` is space, `%XX`
/// percent-escapes, pairs split on `&` and `=`.
pub fn parse_form(body: &[u8]) -> Result<HashMap<String, String>> {
    let text = std::str::from_utf8(body)
        .map_err(|_| AdapterError::PayloadInvalid("body is not utf-8".to_string()))?;
    let mut form = HashMap::new();
    for pair in text.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        form.insert(percent_decode(key)?, percent_decode(value)?);
    }
    Ok(form)
}

fn percent_decode(input: &str) -> Result<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hex = input
                    .get(i + 1..i + 3)
                    .ok_or_else(|| AdapterError::PayloadInvalid("truncated percent escape".to_string()))?;
                let byte = u8::from_str_radix(hex, 16).map_err(|_| {
                    AdapterError::PayloadInvalid(format!("bad percent escape %{hex}"))
                })?;
                out.push(byte);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| AdapterError::PayloadInvalid("escape produced invalid utf-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::sign_timestamped;
    use mu_core::AssuranceTier;

    struct NoBindings;
    impl BindingLookup for NoBindings {
        fn lookup(&self, _channel: Channel, _actor_id: &str) -> Option<(String, AssuranceTier)> {
            None
        }
    }

    fn slack_body() -> Vec<u8> {
        b"team_id=T1&channel_id=C1&user_id=U1&trigger_id=trig-9&command=%2Fmu&text=issue+close+mu-1"
            .to_vec()
    }

    fn signed_headers(secret: &str, body: &[u8], now_ms: i64) -> HashMap<String, String> {
        let ts = now_ms / 1000;
        let mut headers = HashMap::new();
        headers.insert(TIMESTAMP_HEADER.to_string(), ts.to_string());
        headers.insert(
            SIGNATURE_HEADER.to_string(),
            sign_timestamped(secret, ts, body),
        );
        headers
    }

    #[test]
    fn verified_request_normalizes() {
        let adapter = SlackAdapter::new("secret".to_string());
        let body = slack_body();
        let headers = signed_headers("secret", &body, 1_000_000);

        let env = adapter
            .verify_and_normalize(&headers, &body, 1_000_000, "/repo", &NoBindings)
            .unwrap();
        assert_eq!(env.channel, Channel::Slack);
        assert_eq!(env.command_text, "/mu issue close mu-1");
        assert_eq!(env.target_type, "issue close");
        assert_eq!(env.target_id.as_deref(), Some("mu-1"));
        assert_eq!(env.idempotency_key, "slack:T1:trig-9");
        assert_eq!(env.actor_binding_id, "unlinked:slack:U1");
        assert_eq!(env.assurance_tier, AssuranceTier::TierC);
        env.validate().unwrap();
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let adapter = SlackAdapter::new("secret".to_string());
        let body = slack_body();
        let headers = signed_headers("other", &body, 1_000_000);
        let err = adapter
            .verify_and_normalize(&headers, &body, 1_000_000, "/repo", &NoBindings)
            .unwrap_err();
        assert_eq!(err.code(), "adapter_signature_invalid");
        assert_eq!(err.http_status(), 401);
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let adapter = SlackAdapter::new("secret".to_string());
        let body = slack_body();
        let headers = signed_headers("secret", &body, 1_000_000);
        // Clock 10 minutes ahead of the signature.
        let err = adapter
            .verify_and_normalize(&headers, &body, 1_000_000 + 600_000, "/repo", &NoBindings)
            .unwrap_err();
        assert_eq!(err.code(), "adapter_timestamp_stale");
    }

    #[test]
    fn form_parsing_decodes_escapes() {
        let form = parse_form(b"a=1+2&b=%2Fmu&empty=").unwrap();
        assert_eq!(form["a"], "1 2");
        assert_eq!(form["b"], "/mu");
        assert_eq!(form["empty"], "");
    }
}
