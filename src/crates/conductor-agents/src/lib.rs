//! # conductor-agents - Agent CLI Adapters and Process Supervisor
//!
//! Concrete [`AgentRunner`](conductor_core::AgentRunner) implementation for
//! driving external AI coding agents as child processes. Each supported kind
//! (claude, codex, amp, opencode, pi) gets an adapter with a pure argument
//! builder, a line-to-events stream parser, and shared error detection; the
//! [`ProcessSupervisor`] owns the child for the duration of one dispatch and
//! guarantees it is reaped on every exit path.
//!
//! # Example
//!
//! ```rust,no_run
//! use conductor_agents::ProcessSupervisor;
//! use conductor_core::{AgentKind, AgentRunner, InvocationSpec, RunContext};
//! use conductor_store::ExecutionLog;
//! use std::sync::Arc;
//!
//! # async fn example() -> conductor_core::Result<()> {
//! let log = Arc::new(ExecutionLog::in_memory().await?);
//! let ctx = RunContext::new("execution-id", log);
//! let supervisor = ProcessSupervisor::new();
//!
//! let spec = InvocationSpec::new(AgentKind::Claude, "Say hello.")
//!     .with_model("claude-sonnet-4");
//! let result = supervisor.run(spec, &ctx).await?;
//! println!("{}", result.output);
//! # Ok(())
//! # }
//! ```

pub mod classify;
pub mod kinds;
pub mod supervisor;

pub use classify::{classify_exit, classify_spawn_error};
pub use kinds::{cli_for, AgentCli, AmpCli, ClaudeCli, CodexCli, OpencodeCli, PiCli};
pub use supervisor::ProcessSupervisor;
