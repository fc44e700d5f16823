//! The process supervisor: spawn, stream, stop, reap.
//!
//! One dispatch = one child process. The supervisor builds the kind's
//! argument vector, spawns the CLI with stdout/stderr piped, parses stdout
//! line by line into typed events (persisting each one), watches stop
//! conditions, and assembles the normalized [`AgentResult`] after exit.
//!
//! Reaping is unconditional: `kill_on_drop` covers panics and cancellation
//! unwinds, and every ordinary path waits on the child explicitly. A stop
//! condition sends a polite SIGTERM first and force-kills after the grace
//! window.

use crate::classify::{classify_exit, classify_spawn_error};
use crate::kinds::cli_for;
use async_trait::async_trait;
use conductor_core::{
    AgentResult, AgentRunner, EngineError, InvocationSpec, Result, RunContext, StopEvaluator,
    StopReason, StopTrigger, StreamEventKind,
};
use serde_json::Value;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Shortest and longest allowed grace windows between SIGTERM and SIGKILL.
const MIN_GRACE: Duration = Duration::from_millis(250);
const MAX_GRACE: Duration = Duration::from_secs(5);

/// Time allowed for draining buffered stdout after the child exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Supervises one child process per dispatch.
pub struct ProcessSupervisor {
    grace: Duration,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            grace: Duration::from_secs(1),
        }
    }

    /// Grace window between polite termination and force-kill, clamped to
    /// [250ms, 5s].
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace.clamp(MIN_GRACE, MAX_GRACE);
        self
    }

    /// Politely terminate, then force-kill after the grace window.
    async fn terminate(&self, child: &mut Child) -> Option<ExitStatus> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Some(pid) = child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        match timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => {
                warn!("child ignored termination; force-killing");
                let _ = child.kill().await;
                child.try_wait().ok().flatten()
            }
        }
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep until the next stop-condition deadline, or forever when none.
async fn until_deadline(deadline: Option<Duration>) {
    match deadline {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending::<()>().await,
    }
}

#[async_trait]
impl AgentRunner for ProcessSupervisor {
    async fn run(&self, spec: InvocationSpec, ctx: &RunContext) -> Result<AgentResult> {
        let started = Instant::now();
        let cli = cli_for(spec.kind);
        let args = cli.build_args(&spec);

        // `command_path` lets hosts point a kind at a specific binary.
        let command = spec
            .options
            .get("command_path")
            .and_then(Value::as_str)
            .unwrap_or_else(|| cli.command())
            .to_string();

        let mut cmd = Command::new(&command);
        cmd.args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if cli.prompt_via_stdin() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        if spec.use_subscription {
            cmd.env_remove(spec.kind.api_key_env());
        }

        debug!(kind = %spec.kind, command = %command, args = ?args, "spawning agent");
        let mut child = cmd.spawn().map_err(|e| classify_spawn_error(spec.kind, &e))?;

        if cli.prompt_via_stdin() {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(spec.prompt.as_bytes()).await;
                // Dropping closes the pipe so the child sees EOF.
            }
        }

        let stdout = child.stdout.take().ok_or_else(|| EngineError::AgentFailed {
            message: "failed to capture child stdout".into(),
        })?;
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut evaluator = StopEvaluator::new(spec.stop_conditions.clone(), spec.timeout_ms);
        let mut session = spec.resume_session.clone();
        let mut reasoning = String::new();
        let mut stream_error: Option<String> = None;
        let mut stop: Option<StopTrigger> = None;

        'read: loop {
            let deadline = evaluator.next_deadline();
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        for event in cli.parse_line(&line) {
                            if let Some(s) = event.session() {
                                session = Some(s.to_string());
                            }
                            if event.kind == StreamEventKind::Reasoning {
                                if let Some(text) = event.text() {
                                    reasoning.push_str(text);
                                }
                            }
                            if event.kind == StreamEventKind::Error {
                                stream_error = event
                                    .payload
                                    .get("message")
                                    .and_then(Value::as_str)
                                    .map(str::to_string);
                            }
                            ctx.emit(&event).await?;
                            if let Some(trigger) = evaluator.observe(&event) {
                                debug!(trigger = ?trigger, "stop condition tripped");
                                stop = Some(trigger);
                                break 'read;
                            }
                        }
                    }
                    Ok(None) => break 'read,
                    Err(e) => {
                        warn!(error = %e, "stdout read failed; draining");
                        break 'read;
                    }
                },
                _ = ctx.cancel.cancelled() => {
                    self.terminate(&mut child).await;
                    let _ = stderr_task.await;
                    return Err(EngineError::Cancelled);
                }
                _ = until_deadline(deadline) => {
                    stop = evaluator
                        .check_deadline()
                        .or(Some(StopTrigger::TimeLimit { ms: 0 }));
                    break 'read;
                }
            }
        }

        // Stop tripped: polite terminate then force-kill. Otherwise wait for
        // a natural exit.
        let exit = match stop {
            Some(_) => self.terminate(&mut child).await,
            None => child.wait().await.ok(),
        };

        // Draining: finish reading whatever stdout buffered before exit.
        // Stop conditions no longer apply.
        while let Ok(Ok(Some(line))) = timeout(DRAIN_TIMEOUT, lines.next_line()).await {
            for event in cli.parse_line(&line) {
                if let Some(s) = event.session() {
                    session = Some(s.to_string());
                }
                ctx.emit(&event).await?;
                let _ = evaluator.observe(&event);
            }
        }

        let stderr_text = stderr_task.await.unwrap_or_default();

        if stop.is_none() {
            if let Some(status) = exit {
                if !status.success() {
                    return Err(classify_exit(spec.kind, status.code(), &stderr_text));
                }
            }
            if evaluator.accumulated_text().is_empty() {
                if let Some(message) = stream_error {
                    return Err(EngineError::AgentFailed { message });
                }
            }
        }

        // A tripped per-invocation timeout is reported as a timeout, not a
        // plain stop.
        if let Some(StopTrigger::TimeLimit { ms }) = &stop {
            if spec.timeout_ms == Some(*ms) {
                return Err(EngineError::Timeout { ms: *ms });
            }
        }

        Ok(AgentResult {
            output: evaluator.accumulated_text().to_string(),
            reasoning: (!reasoning.is_empty()).then_some(reasoning),
            structured: None,
            tokens_used: evaluator.tokens(),
            turns_used: evaluator.turns(),
            stop_reason: match stop {
                Some(_) => StopReason::StopCondition,
                None => StopReason::Completed,
            },
            duration_ms: started.elapsed().as_millis() as u64,
            exit_code: exit.and_then(|s| s.code()),
            session,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use conductor_core::AgentKind;
    use conductor_store::ExecutionLog;
    use serde_json::json;
    use std::sync::Arc;

    async fn ctx() -> RunContext {
        let log = Arc::new(ExecutionLog::in_memory().await.unwrap());
        RunContext::new("exec", log)
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_installed() {
        let supervisor = ProcessSupervisor::new();
        let spec = InvocationSpec::new(AgentKind::Claude, "hi")
            .with_option("command_path", json!("/definitely/not/a/binary"));
        let err = supervisor.run(spec, &ctx().await).await.unwrap_err();
        assert_eq!(err.tag(), "agent.not-installed");
    }

    #[tokio::test]
    async fn test_echo_child_is_reaped_and_succeeds() {
        // /bin/echo prints the argv and exits 0; every line lands as a raw
        // event and the dispatch completes cleanly.
        let supervisor = ProcessSupervisor::new();
        let spec = InvocationSpec::new(AgentKind::Claude, "hi")
            .with_option("command_path", json!("/bin/echo"));
        let result = supervisor.run(spec, &ctx().await).await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stop_reason, StopReason::Completed);
    }

    #[tokio::test]
    async fn test_grace_window_is_clamped() {
        let fast = ProcessSupervisor::new().with_grace(Duration::from_millis(1));
        assert_eq!(fast.grace, MIN_GRACE);
        let slow = ProcessSupervisor::new().with_grace(Duration::from_secs(60));
        assert_eq!(slow.grace, MAX_GRACE);
    }
}
