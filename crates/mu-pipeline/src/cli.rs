//! The CLI bridge: journaled commands that resolve to `mu` CLI invocations
//! (issue/forum operations, run triggers) go through an allowlisted runner
//! with a per-invocation timeout.

use async_trait::async_trait;
use regex_lite::Regex;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use mu_core::config::CliConfig;
use mu_core::CommandRecord;

use crate::handlers::{CommandHandler, HandlerOutcome, ReplayMutationEvent};

/// First-argv tokens the bridge will ever execute. Anything else is a
/// validation failure before a process is spawned.
pub const CLI_ALLOWLIST: &[&str] = &["issue", "forum", "_run-direct", "resume", "status"];

/// Keep result payloads bounded; full output belongs to the run supervisor.
const MAX_CAPTURED_OUTPUT: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct CliInvocationPlan {
    pub argv: Vec<String>,
    pub command_kind: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliOutcomeKind {
    Completed,
    Nonzero,
    Timeout,
    ValidationFailed,
    SpawnFailed,
}

impl CliOutcomeKind {
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            CliOutcomeKind::Completed => None,
            CliOutcomeKind::Nonzero => Some("cli_nonzero"),
            CliOutcomeKind::Timeout => Some("cli_timeout"),
            CliOutcomeKind::ValidationFailed => Some("cli_validation_failed"),
            CliOutcomeKind::SpawnFailed => Some("mu_server_not_running"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CliInvocation {
    pub kind: CliOutcomeKind,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub run_root_id: Option<String>,
}

/// Seam for running the mu CLI. The subprocess implementation is the
/// production one; tests script invocations.
#[async_trait]
pub trait MuCliRunner: Send + Sync {
    async fn run(&self, plan: &CliInvocationPlan) -> CliInvocation;
}

/// Runs the real `mu` binary with a timeout and bounded capture.
pub struct SubprocessCliRunner {
    config: CliConfig,
}

impl SubprocessCliRunner {
    pub fn new(config: CliConfig) -> Arc<Self> {
        Arc::new(Self { config })
    }

    fn resolve_binary(&self) -> Option<String> {
        if let Some(binary) = &self.config.binary {
            return Some(binary.clone());
        }
        which::which("mu")
            .ok()
            .map(|p| p.display().to_string())
    }
}

#[async_trait]
impl MuCliRunner for SubprocessCliRunner {
    async fn run(&self, plan: &CliInvocationPlan) -> CliInvocation {
        if !plan
            .argv
            .first()
            .is_some_and(|first| CLI_ALLOWLIST.contains(&first.as_str()))
        {
            warn!(argv = ?plan.argv, "cli invocation refused by allowlist");
            return CliInvocation {
                kind: CliOutcomeKind::ValidationFailed,
                stdout: String::new(),
                stderr: format!("argv not allowlisted: {:?}", plan.argv),
                exit_code: None,
                run_root_id: None,
            };
        }

        let Some(binary) = self.resolve_binary() else {
            return CliInvocation {
                kind: CliOutcomeKind::SpawnFailed,
                stdout: String::new(),
                stderr: "mu binary not found".to_string(),
                exit_code: None,
                run_root_id: None,
            };
        };

        debug!(binary = %binary, argv = ?plan.argv, "spawning mu cli");
        let child = Command::new(&binary)
            .args(&plan.argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                return CliInvocation {
                    kind: CliOutcomeKind::SpawnFailed,
                    stdout: String::new(),
                    stderr: format!("spawn failed: {e}"),
                    exit_code: None,
                    run_root_id: None,
                }
            }
        };

        let timeout = Duration::from_millis(self.config.timeout_ms.max(1));
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return CliInvocation {
                    kind: CliOutcomeKind::SpawnFailed,
                    stdout: String::new(),
                    stderr: format!("wait failed: {e}"),
                    exit_code: None,
                    run_root_id: None,
                }
            }
            Err(_) => {
                return CliInvocation {
                    kind: CliOutcomeKind::Timeout,
                    stdout: String::new(),
                    stderr: format!("timed out after {}ms", self.config.timeout_ms),
                    exit_code: None,
                    run_root_id: None,
                }
            }
        };

        let stdout = truncate(String::from_utf8_lossy(&output.stdout).into_owned());
        let stderr = truncate(String::from_utf8_lossy(&output.stderr).into_owned());
        let exit_code = output.status.code();
        let run_root_id = extract_run_root(&stdout);

        CliInvocation {
            kind: if output.status.success() {
                CliOutcomeKind::Completed
            } else {
                CliOutcomeKind::Nonzero
            },
            stdout,
            stderr,
            exit_code,
            run_root_id,
        }
    }
}

/// Pull the orchestrator root id (`Root: mu-...`) out of CLI output.
pub fn extract_run_root(text: &str) -> Option<String> {
    // Compiled per call; the bridge runs a handful of times a minute at most.
    let re = Regex::new(r"(?i)\bRoot:\s*(mu-[a-z0-9-]+)\b").ok()?;
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn truncate(mut s: String) -> String {
    if s.len() > MAX_CAPTURED_OUTPUT {
        s.truncate(MAX_CAPTURED_OUTPUT);
        s.push_str("\n[truncated]");
    }
    s
}

/// Domain handler that maps a command record onto a CLI invocation and
/// journals `cli.invocation.*` mutating events around it.
pub struct CliBridgeHandler {
    runner: Arc<dyn MuCliRunner>,
}

impl CliBridgeHandler {
    pub fn new(runner: Arc<dyn MuCliRunner>) -> Arc<Self> {
        Arc::new(Self { runner })
    }

    /// `issue close mu-1 --reason done` → `["issue", "close", "mu-1",
    /// "--reason", "done"]`.
    fn plan_for(record: &CommandRecord) -> CliInvocationPlan {
        let mut argv: Vec<String> = record
            .target_type
            .split_whitespace()
            .map(|t| t.to_string())
            .collect();
        if let Some(target_id) = &record.target_id {
            argv.push(target_id.clone());
        }
        argv.extend(record.command_args.iter().cloned());
        CliInvocationPlan {
            argv,
            command_kind: record.target_type.clone(),
        }
    }
}

#[async_trait]
impl CommandHandler for CliBridgeHandler {
    async fn handle(&self, record: &CommandRecord) -> HandlerOutcome {
        let plan = Self::plan_for(record);
        let invocation_id = format!("cli-{}", Uuid::new_v4());

        let mut events = vec![ReplayMutationEvent::new(
            "cli.invocation.started",
            serde_json::json!({
                "cli_invocation_id": invocation_id,
                "cli_command_kind": plan.command_kind,
                "argv": plan.argv,
            }),
        )];

        let invocation = self.runner.run(&plan).await;

        match invocation.kind.error_code() {
            None => {
                events.push(ReplayMutationEvent::new(
                    "cli.invocation.completed",
                    serde_json::json!({
                        "cli_invocation_id": invocation_id,
                        "exit_code": invocation.exit_code,
                        "run_root_id": invocation.run_root_id,
                    }),
                ));
                HandlerOutcome::Completed {
                    result: serde_json::json!({
                        "cli_invocation_id": invocation_id,
                        "cli_command_kind": plan.command_kind,
                        "exit_code": invocation.exit_code,
                        "stdout": invocation.stdout,
                        "run_root_id": invocation.run_root_id,
                    }),
                    error_code: None,
                    events,
                }
            }
            Some(code) => {
                events.push(ReplayMutationEvent::new(
                    "cli.invocation.failed",
                    serde_json::json!({
                        "cli_invocation_id": invocation_id,
                        "error_code": code,
                        "exit_code": invocation.exit_code,
                        "stderr": invocation.stderr,
                    }),
                ));
                HandlerOutcome::Failed {
                    error_code: code.to_string(),
                    events,
                }
            }
        }
    }
}
