use std::collections::{BTreeSet, HashMap};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use mu_core::config::RunsConfig;
use mu_core::types::{Correlation, JobId};
use mu_core::Clock;

use crate::error::{Result, RunError};
use crate::parse::{LineMatcher, LineRing, LineSignal};
use crate::types::{
    ControlPlaneRunEvent, RunEventType, RunMode, RunRoute, RunSnapshot, RunSource, RunStatus,
};

/// Everything a launch needs beyond the mode-specific argument.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub max_steps: u32,
    pub command_id: Option<String>,
    pub correlation: Correlation,
    pub route: Option<RunRoute>,
    pub source_is_api: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterruptOutcome {
    pub ok: bool,
    pub reason: Option<String>,
}

struct JobState {
    snapshot: RunSnapshot,
    stdout: LineRing,
    stderr: LineRing,
    log_hints: BTreeSet<String>,
    interrupt_requested: bool,
    next_seq: u64,
    correlation: Correlation,
    route: Option<RunRoute>,
}

struct Inner {
    jobs: HashMap<String, JobState>,
}

/// One subprocess per run job. The supervisor owns every snapshot; the
/// pipeline and HTTP surface read through it by job or root id.
pub struct RunSupervisor {
    /// The orchestration runner binary (the mu CLI).
    program: String,
    config: RunsConfig,
    clock: Arc<dyn Clock>,
    events: mpsc::UnboundedSender<ControlPlaneRunEvent>,
    inner: Arc<Mutex<Inner>>,
}

impl RunSupervisor {
    pub fn new(
        program: impl Into<String>,
        config: RunsConfig,
        clock: Arc<dyn Clock>,
        events: mpsc::UnboundedSender<ControlPlaneRunEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            program: program.into(),
            config,
            clock,
            events,
            inner: Arc::new(Mutex::new(Inner {
                jobs: HashMap::new(),
            })),
        })
    }

    /// `mu _run-direct <prompt> --max-steps N --raw-stream`.
    pub fn launch_start(self: &Arc<Self>, prompt: &str, opts: LaunchOptions) -> Result<RunSnapshot> {
        let argv = vec![
            "_run-direct".to_string(),
            prompt.to_string(),
            "--max-steps".to_string(),
            opts.max_steps.to_string(),
            "--raw-stream".to_string(),
        ];
        self.launch(RunMode::RunStart, argv, Some(prompt.to_string()), None, opts)
    }

    /// `mu resume <root_issue_id> --max-steps N --raw-stream`.
    pub fn launch_resume(
        self: &Arc<Self>,
        root_issue_id: &str,
        opts: LaunchOptions,
    ) -> Result<RunSnapshot> {
        let argv = vec![
            "resume".to_string(),
            root_issue_id.to_string(),
            "--max-steps".to_string(),
            opts.max_steps.to_string(),
            "--raw-stream".to_string(),
        ];
        self.launch(
            RunMode::RunResume,
            argv,
            None,
            Some(root_issue_id.to_string()),
            opts,
        )
    }

    fn launch(
        self: &Arc<Self>,
        mode: RunMode,
        argv: Vec<String>,
        prompt: Option<String>,
        root_issue_id: Option<String>,
        opts: LaunchOptions,
    ) -> Result<RunSnapshot> {
        let now = self.clock.now_ms();
        let mut child = Command::new(&self.program)
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunError::Spawn(e.to_string()))?;

        let job_id = JobId::new();
        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunError::Spawn("stdout not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunError::Spawn("stderr not piped".to_string()))?;

        let snapshot = RunSnapshot {
            job_id: job_id.clone(),
            mode,
            status: RunStatus::Running,
            prompt,
            root_issue_id,
            max_steps: opts.max_steps,
            command_id: opts.command_id.clone(),
            source: if opts.source_is_api {
                RunSource::Api
            } else {
                RunSource::Command
            },
            started_at_ms: now,
            updated_at_ms: now,
            finished_at_ms: None,
            exit_code: None,
            pid,
            last_progress: None,
        };
        info!(job_id = %job_id, mode = ?mode, pid = ?pid, "run launched");

        {
            let mut inner = self.inner.lock().unwrap();
            inner.jobs.insert(
                job_id.0.clone(),
                JobState {
                    snapshot: snapshot.clone(),
                    stdout: LineRing::new(self.config.max_stored_lines),
                    stderr: LineRing::new(self.config.max_stored_lines),
                    log_hints: BTreeSet::new(),
                    interrupt_requested: false,
                    next_seq: 0,
                    correlation: opts.correlation.clone(),
                    route: opts.route.clone(),
                },
            );
        }
        self.emit(&job_id.0, RunEventType::RunStarted, serde_json::json!({
            "mode": mode,
            "pid": pid,
        }));
        self.prune_history();

        // One reader task per stream; a waiter task settles the status.
        tokio::spawn(Self::consume_stream(self.clone(), job_id.0.clone(), stdout, false));
        tokio::spawn(Self::consume_stream(self.clone(), job_id.0.clone(), stderr, true));
        let supervisor = self.clone();
        let waiter_job = job_id.0.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            supervisor.finalize(&waiter_job, status.ok().and_then(|s| s.code()));
        });

        Ok(snapshot)
    }

    async fn consume_stream<R: AsyncRead + Unpin + Send + 'static>(
        supervisor: Arc<Self>,
        job_id: String,
        stream: R,
        is_stderr: bool,
    ) {
        let matcher = LineMatcher::new();
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            supervisor.ingest_line(&job_id, &matcher, line, is_stderr);
        }
        debug!(job_id = %job_id, stderr = is_stderr, "run stream closed");
    }

    fn ingest_line(&self, job_id: &str, matcher: &LineMatcher, line: String, is_stderr: bool) {
        let signal = matcher.classify(&line);
        let now = self.clock.now_ms();

        let event = {
            let mut inner = self.inner.lock().unwrap();
            let Some(job) = inner.jobs.get_mut(job_id) else {
                return;
            };
            if is_stderr {
                job.stderr.push(line);
            } else {
                job.stdout.push(line);
            }
            job.snapshot.updated_at_ms = now;

            match signal {
                LineSignal::RootDiscovered(root) => {
                    if job.snapshot.root_issue_id.as_deref() != Some(root.as_str()) {
                        job.snapshot.root_issue_id = Some(root.clone());
                        Some((
                            RunEventType::RunRootDiscovered,
                            serde_json::json!({"root_issue_id": root}),
                        ))
                    } else {
                        None
                    }
                }
                LineSignal::Progress(progress) => {
                    job.snapshot.last_progress = Some(progress.clone());
                    Some((
                        RunEventType::RunProgress,
                        serde_json::json!({"progress": progress}),
                    ))
                }
                LineSignal::LogHint(hint) => {
                    job.log_hints.insert(hint);
                    None
                }
                LineSignal::Plain => None,
            }
        };

        if let Some((event_type, payload)) = event {
            self.emit(job_id, event_type, payload);
        }
    }

    fn finalize(&self, job_id: &str, exit_code: Option<i32>) {
        let now = self.clock.now_ms();
        let (event_type, payload) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(job) = inner.jobs.get_mut(job_id) else {
                return;
            };
            job.snapshot.exit_code = exit_code;
            job.snapshot.finished_at_ms = Some(now);
            job.snapshot.updated_at_ms = now;
            job.snapshot.status = if job.interrupt_requested {
                RunStatus::Cancelled
            } else if exit_code == Some(0) {
                RunStatus::Completed
            } else {
                RunStatus::Failed
            };
            info!(job_id = %job_id, status = ?job.snapshot.status, exit_code = ?exit_code, "run finished");
            let event_type = match job.snapshot.status {
                RunStatus::Completed => RunEventType::RunCompleted,
                RunStatus::Cancelled => RunEventType::RunCancelled,
                _ => RunEventType::RunFailed,
            };
            (
                event_type,
                serde_json::json!({
                    "exit_code": exit_code,
                    "root_issue_id": job.snapshot.root_issue_id,
                    "last_progress": job.snapshot.last_progress,
                }),
            )
        };
        self.emit(job_id, event_type, payload);
    }

    /// SIGINT now, SIGKILL after the configured grace if the process is
    /// still alive. Selector is a job id or a root issue id.
    pub fn interrupt(
        self: &Arc<Self>,
        job_id: Option<&str>,
        root_issue_id: Option<&str>,
    ) -> InterruptOutcome {
        let target = {
            let inner = self.inner.lock().unwrap();
            inner
                .jobs
                .values()
                .filter(|j| j.snapshot.status == RunStatus::Running)
                .find(|j| {
                    job_id.is_some_and(|id| j.snapshot.job_id.as_str() == id)
                        || root_issue_id
                            .is_some_and(|root| j.snapshot.root_issue_id.as_deref() == Some(root))
                })
                .map(|j| (j.snapshot.job_id.0.clone(), j.snapshot.pid))
        };

        let Some((job_id, pid)) = target else {
            return InterruptOutcome {
                ok: false,
                reason: Some("no running job matches".to_string()),
            };
        };
        let Some(pid) = pid else {
            return InterruptOutcome {
                ok: false,
                reason: Some("job has no pid".to_string()),
            };
        };

        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(job) = inner.jobs.get_mut(&job_id) {
                job.interrupt_requested = true;
            }
        }
        info!(job_id = %job_id, pid, "interrupting run (SIGINT)");
        signal(pid, libc::SIGINT);

        let supervisor = self.clone();
        let grace = Duration::from_millis(self.config.hard_kill_after_ms);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let still_running = {
                let inner = supervisor.inner.lock().unwrap();
                inner
                    .jobs
                    .get(&job_id)
                    .map(|j| j.snapshot.status == RunStatus::Running)
                    .unwrap_or(false)
            };
            if still_running {
                warn!(job_id = %job_id, pid, "run survived SIGINT grace; sending SIGKILL");
                signal(pid, libc::SIGKILL);
            }
        });

        InterruptOutcome {
            ok: true,
            reason: None,
        }
    }

    pub fn snapshot(&self, job_id: &str) -> Option<RunSnapshot> {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .get(job_id)
            .map(|j| j.snapshot.clone())
    }

    pub fn snapshot_by_root(&self, root_issue_id: &str) -> Option<RunSnapshot> {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .values()
            .find(|j| j.snapshot.root_issue_id.as_deref() == Some(root_issue_id))
            .map(|j| j.snapshot.clone())
    }

    /// All snapshots, newest launch first.
    pub fn list(&self) -> Vec<RunSnapshot> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<RunSnapshot> = inner.jobs.values().map(|j| j.snapshot.clone()).collect();
        out.sort_by(|a, b| b.started_at_ms.cmp(&a.started_at_ms));
        out
    }

    pub fn stored_output(&self, job_id: &str) -> Option<(Vec<String>, Vec<String>, Vec<String>)> {
        let inner = self.inner.lock().unwrap();
        inner.jobs.get(job_id).map(|j| {
            (
                j.stdout.to_vec(),
                j.stderr.to_vec(),
                j.log_hints.iter().cloned().collect(),
            )
        })
    }

    fn emit(&self, job_id: &str, event_type: RunEventType, payload: serde_json::Value) {
        let event = {
            let mut inner = self.inner.lock().unwrap();
            let Some(job) = inner.jobs.get_mut(job_id) else {
                return;
            };
            let seq = job.next_seq;
            job.next_seq += 1;
            let mut correlation = job.correlation.clone();
            correlation.run_root_id = job
                .snapshot
                .root_issue_id
                .clone()
                .or(correlation.run_root_id);
            ControlPlaneRunEvent {
                job_id: job.snapshot.job_id.clone(),
                seq,
                event_type,
                payload,
                correlation,
                route: job.route.clone(),
                at_ms: self.clock.now_ms(),
            }
        };
        // The receiver side may already be gone during shutdown.
        if self.events.send(event).is_err() {
            debug!(job_id, "run event receiver closed; event dropped");
        }
    }

    /// Keep at most `max_history` jobs, never pruning running ones.
    fn prune_history(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.jobs.len() <= self.config.max_history {
            return;
        }
        let mut terminal: Vec<(String, i64)> = inner
            .jobs
            .values()
            .filter(|j| j.snapshot.status.is_terminal())
            .map(|j| (j.snapshot.job_id.0.clone(), j.snapshot.started_at_ms))
            .collect();
        terminal.sort_by_key(|(_, started)| *started);
        let excess = inner.jobs.len().saturating_sub(self.config.max_history);
        for (job_id, _) in terminal.into_iter().take(excess) {
            inner.jobs.remove(&job_id);
        }
    }
}

fn signal(pid: u32, sig: libc::c_int) {
    if pid == 0 || pid > i32::MAX as u32 {
        return;
    }
    unsafe {
        libc::kill(pid as libc::pid_t, sig);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mu_core::SystemClock;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &std::path::Path, body: &str) -> String {
        let path = dir.join("fake-mu");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.display().to_string()
    }

    fn supervisor(
        program: String,
        config: RunsConfig,
    ) -> (
        Arc<RunSupervisor>,
        mpsc::UnboundedReceiver<ControlPlaneRunEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            RunSupervisor::new(program, config, Arc::new(SystemClock), tx),
            rx,
        )
    }

    async fn wait_terminal(sup: &Arc<RunSupervisor>, job_id: &str) -> RunSnapshot {
        for _ in 0..200 {
            if let Some(snap) = sup.snapshot(job_id) {
                if snap.status.is_terminal() {
                    return snap;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {job_id} never reached a terminal status");
    }

    #[tokio::test]
    async fn run_streams_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(
            dir.path(),
            "echo 'Root: mu-test-1'\necho 'Step 1/2 planning'\necho 'logs: /tmp/run.log'\necho 'Done 2/2 all good'",
        );
        let (sup, mut rx) = supervisor(program, RunsConfig::default());

        let snap = sup
            .launch_start("build the thing", LaunchOptions {
                max_steps: 2,
                ..Default::default()
            })
            .unwrap();
        let done = wait_terminal(&sup, snap.job_id.as_str()).await;

        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.exit_code, Some(0));
        assert_eq!(done.root_issue_id.as_deref(), Some("mu-test-1"));
        assert!(done.last_progress.as_deref().unwrap().starts_with("Done 2/2"));

        let (stdout, _stderr, hints) = sup.stored_output(snap.job_id.as_str()).unwrap();
        assert_eq!(stdout.len(), 4);
        assert_eq!(hints, vec!["/tmp/run.log".to_string()]);

        // Exactly one terminal event, with sequence-numbered dedupe keys.
        let mut terminal_events = 0;
        let mut seen_types = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.dedupe_key(), format!("run-event:{}:{}", event.job_id, event.seq));
            if matches!(
                event.event_type,
                RunEventType::RunCompleted | RunEventType::RunFailed | RunEventType::RunCancelled
            ) {
                terminal_events += 1;
            }
            seen_types.push(event.event_type);
        }
        assert_eq!(terminal_events, 1);
        assert!(seen_types.contains(&RunEventType::RunRootDiscovered));
        assert!(seen_types.contains(&RunEventType::RunProgress));
    }

    #[tokio::test]
    async fn nonzero_exit_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "echo oops >&2\nexit 3");
        let (sup, _rx) = supervisor(program, RunsConfig::default());
        let snap = sup
            .launch_resume("mu-root-x", LaunchOptions {
                max_steps: 1,
                ..Default::default()
            })
            .unwrap();
        let done = wait_terminal(&sup, snap.job_id.as_str()).await;
        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.exit_code, Some(3));
        let (_stdout, stderr, _hints) = sup.stored_output(snap.job_id.as_str()).unwrap();
        assert_eq!(stderr, vec!["oops".to_string()]);
    }

    #[tokio::test]
    async fn interrupt_cancels_by_job_id() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "sleep 30");
        let (sup, mut rx) = supervisor(program, RunsConfig::default());
        let snap = sup
            .launch_start("long", LaunchOptions {
                max_steps: 1,
                ..Default::default()
            })
            .unwrap();

        // Give the process a moment to exist before signalling it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let outcome = sup.interrupt(Some(snap.job_id.as_str()), None);
        assert!(outcome.ok);

        let done = wait_terminal(&sup, snap.job_id.as_str()).await;
        assert_eq!(done.status, RunStatus::Cancelled);

        let mut cancelled = 0;
        while let Ok(event) = rx.try_recv() {
            if event.event_type == RunEventType::RunCancelled {
                cancelled += 1;
            }
        }
        assert_eq!(cancelled, 1);
    }

    #[tokio::test]
    async fn hard_kill_fires_when_sigint_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "trap '' INT\nsleep 30");
        let mut config = RunsConfig::default();
        config.hard_kill_after_ms = 200;
        let (sup, _rx) = supervisor(program, config);
        let snap = sup
            .launch_start("stubborn", LaunchOptions {
                max_steps: 1,
                ..Default::default()
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sup.interrupt(Some(snap.job_id.as_str()), None).ok);

        let done = wait_terminal(&sup, snap.job_id.as_str()).await;
        assert_eq!(done.status, RunStatus::Cancelled);
        // Killed by signal — no exit code.
        assert_eq!(done.exit_code, None);
    }

    #[tokio::test]
    async fn interrupt_unknown_job_reports_reason() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "true");
        let (sup, _rx) = supervisor(program, RunsConfig::default());
        let outcome = sup.interrupt(Some("job-nope"), None);
        assert!(!outcome.ok);
        assert!(outcome.reason.is_some());
    }
}
