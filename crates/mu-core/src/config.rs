use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 7171;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Store directory relative to the repo root.
pub const DEFAULT_STORE_DIR: &str = ".mu/control-plane";

/// Top-level config (mu.toml + MU_* env overrides), injected at boot.
/// Nothing outside config loading reads the process environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuConfig {
    /// Repository this control plane is scoped to.
    #[serde(default = "default_repo_root")]
    pub repo_root: String,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub adapters: AdaptersConfig,
    #[serde(default)]
    pub operator: OperatorConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub runs: RunsConfig,
    #[serde(default)]
    pub programs: ProgramsConfig,
    #[serde(default)]
    pub cli: CliConfig,
}

impl Default for MuConfig {
    fn default() -> Self {
        Self {
            repo_root: default_repo_root(),
            gateway: GatewayConfig::default(),
            store: StoreConfig::default(),
            adapters: AdaptersConfig::default(),
            operator: OperatorConfig::default(),
            pipeline: PipelineConfig::default(),
            safety: SafetyConfig::default(),
            outbox: OutboxConfig::default(),
            runs: RunsConfig::default(),
            programs: ProgramsConfig::default(),
            cli: CliConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory for writer.lock and the *.jsonl stores, relative to
    /// `repo_root` unless absolute.
    #[serde(default = "default_store_dir")]
    pub dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
        }
    }
}

/// Per-adapter secret material. A `None` slot means the adapter is not
/// configured and its route rejects traffic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdaptersConfig {
    pub slack: Option<SlackAdapterConfig>,
    pub discord: Option<DiscordAdapterConfig>,
    pub telegram: Option<TelegramAdapterConfig>,
    pub neovim: Option<NeovimAdapterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackAdapterConfig {
    pub signing_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordAdapterConfig {
    pub signing_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramAdapterConfig {
    pub webhook_secret: Option<String>,
    /// Used by the delivery transport, not by ingress verification.
    pub bot_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeovimAdapterConfig {
    pub shared_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "bool_true")]
    pub run_triggers_enabled: bool,
    pub provider: Option<String>,
    pub model: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            run_triggers_enabled: true,
            provider: None,
            model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// How long an awaiting_confirmation command stays confirmable.
    #[serde(default = "default_confirmation_ttl_ms")]
    pub confirmation_ttl_ms: i64,
    /// How long an idempotency claim stays live.
    #[serde(default = "default_idempotency_ttl_ms")]
    pub idempotency_ttl_ms: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confirmation_ttl_ms: default_confirmation_ttl_ms(),
            idempotency_ttl_ms: default_idempotency_ttl_ms(),
        }
    }
}

/// What to do with a mutation that lands on a full rate window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowBehavior {
    Defer,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_window_ms")]
    pub window_ms: i64,
    #[serde(default = "default_actor_limit")]
    pub actor_limit: u32,
    #[serde(default = "default_channel_limit")]
    pub channel_limit: u32,
    #[serde(default = "default_overflow_behavior")]
    pub overflow_behavior: OverflowBehavior,
    #[serde(default = "default_defer_ms")]
    pub defer_ms: i64,
    /// Global mutation kill-switch. `false` denies every mutating command.
    #[serde(default = "bool_true")]
    pub mutations_enabled: bool,
    /// Channels whose mutations are switched off.
    #[serde(default)]
    pub disabled_channels: Vec<String>,
    /// Ops classes whose mutations are switched off.
    #[serde(default)]
    pub disabled_classes: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            actor_limit: default_actor_limit(),
            channel_limit: default_channel_limit(),
            overflow_behavior: default_overflow_behavior(),
            defer_ms: default_defer_ms(),
            mutations_enabled: true,
            disabled_channels: vec![],
            disabled_classes: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: i64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: i64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Attempt budgets per envelope kind.
    #[serde(default = "default_max_attempts_ack")]
    pub max_attempts_ack: u32,
    #[serde(default = "default_max_attempts_lifecycle")]
    pub max_attempts_lifecycle: u32,
    #[serde(default = "default_max_attempts_result")]
    pub max_attempts_result: u32,
    #[serde(default = "default_max_attempts_error")]
    pub max_attempts_error: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            delivery_timeout_ms: default_delivery_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts_ack: default_max_attempts_ack(),
            max_attempts_lifecycle: default_max_attempts_lifecycle(),
            max_attempts_result: default_max_attempts_result(),
            max_attempts_error: default_max_attempts_error(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunsConfig {
    /// Ring-buffer size per stdio stream. Clamped to a floor of 50 at use.
    #[serde(default = "default_max_stored_lines")]
    pub max_stored_lines: usize,
    /// Finished jobs kept for inspection; running jobs are never pruned.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// Grace between SIGINT and SIGKILL on interrupt.
    #[serde(default = "default_hard_kill_after_ms")]
    pub hard_kill_after_ms: u64,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            max_stored_lines: default_max_stored_lines(),
            max_history: default_max_history(),
            hard_kill_after_ms: default_hard_kill_after_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramsConfig {
    /// Bound on the minute-granular cron scan (≈2 years by default).
    #[serde(default = "default_cron_horizon_minutes")]
    pub cron_horizon_minutes: u32,
}

impl Default for ProgramsConfig {
    fn default() -> Self {
        Self {
            cron_horizon_minutes: default_cron_horizon_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Path to the mu CLI binary; resolved on PATH when unset.
    pub binary: Option<String>,
    #[serde(default = "default_cli_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            binary: None,
            timeout_ms: default_cli_timeout_ms(),
        }
    }
}

impl MuConfig {
    /// Load from a TOML file with MU_* env var overrides, then normalize
    /// secrets (trim, empty → None).
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(|| "mu.toml".to_string());

        let mut config: MuConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("MU_").split("_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;
        config.normalize();
        Ok(config)
    }

    /// Trim secret material; empty strings collapse to None so "configured
    /// with a blank secret" can never pass verification accidentally.
    pub fn normalize(&mut self) {
        if let Some(slack) = &mut self.adapters.slack {
            normalize_secret(&mut slack.signing_secret);
        }
        if let Some(discord) = &mut self.adapters.discord {
            normalize_secret(&mut discord.signing_secret);
        }
        if let Some(telegram) = &mut self.adapters.telegram {
            normalize_secret(&mut telegram.webhook_secret);
            normalize_secret(&mut telegram.bot_token);
        }
        if let Some(neovim) = &mut self.adapters.neovim {
            normalize_secret(&mut neovim.shared_secret);
        }
    }

    /// Absolute path of the control-plane store directory.
    pub fn store_path(&self) -> PathBuf {
        let dir = PathBuf::from(&self.store.dir);
        if dir.is_absolute() {
            dir
        } else {
            PathBuf::from(&self.repo_root).join(dir)
        }
    }
}

fn normalize_secret(slot: &mut Option<String>) {
    if let Some(s) = slot {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            *slot = None;
        } else if trimmed.len() != s.len() {
            *slot = Some(trimmed.to_string());
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_repo_root() -> String {
    ".".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_store_dir() -> String {
    DEFAULT_STORE_DIR.to_string()
}
fn default_confirmation_ttl_ms() -> i64 {
    5 * 60 * 1000
}
fn default_idempotency_ttl_ms() -> i64 {
    10 * 60 * 1000
}
fn default_window_ms() -> i64 {
    60_000
}
fn default_actor_limit() -> u32 {
    30
}
fn default_channel_limit() -> u32 {
    120
}
fn default_overflow_behavior() -> OverflowBehavior {
    OverflowBehavior::Defer
}
fn default_defer_ms() -> i64 {
    5_000
}
fn default_delivery_timeout_ms() -> u64 {
    10_000
}
fn default_backoff_base_ms() -> i64 {
    500
}
fn default_backoff_cap_ms() -> i64 {
    60_000
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_max_attempts_ack() -> u32 {
    3
}
fn default_max_attempts_lifecycle() -> u32 {
    4
}
fn default_max_attempts_result() -> u32 {
    6
}
fn default_max_attempts_error() -> u32 {
    6
}
fn default_max_stored_lines() -> usize {
    1_000
}
fn default_max_history() -> usize {
    200
}
fn default_hard_kill_after_ms() -> u64 {
    5_000
}
fn default_cron_horizon_minutes() -> u32 {
    2 * 366 * 24 * 60
}
fn default_cli_timeout_ms() -> u64 {
    120_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = MuConfig::default();
        assert_eq!(cfg.gateway.port, DEFAULT_PORT);
        assert_eq!(cfg.pipeline.confirmation_ttl_ms, 300_000);
        assert_eq!(cfg.safety.overflow_behavior, OverflowBehavior::Defer);
        assert!(cfg.safety.mutations_enabled);
        assert_eq!(cfg.outbox.max_attempts_result, 6);
    }

    #[test]
    fn blank_secrets_normalize_to_none() {
        let mut cfg = MuConfig::default();
        cfg.adapters.slack = Some(SlackAdapterConfig {
            signing_secret: Some("   ".to_string()),
        });
        cfg.adapters.neovim = Some(NeovimAdapterConfig {
            shared_secret: Some("  s3cret  ".to_string()),
        });
        cfg.normalize();
        assert!(cfg.adapters.slack.as_ref().unwrap().signing_secret.is_none());
        assert_eq!(
            cfg.adapters.neovim.as_ref().unwrap().shared_secret.as_deref(),
            Some("s3cret")
        );
    }

    #[test]
    fn store_path_joins_repo_root() {
        let mut cfg = MuConfig::default();
        cfg.repo_root = "/srv/repo".to_string();
        assert_eq!(
            cfg.store_path(),
            PathBuf::from("/srv/repo/.mu/control-plane")
        );
    }
}
