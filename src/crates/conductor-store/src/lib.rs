//! # conductor-store - Durable Execution Log
//!
//! Embedded relational log for the conductor runtime. Every run of a plan
//! writes its full history here: the execution row itself, each agent
//! invocation, every reconciled frame, every parsed stream event, the mutable
//! state cells that drive plan control flow, and rate-limit snapshots from
//! the governor.
//!
//! The log is a **stable external interface**: downstream viewers and
//! dashboards read the SQLite file directly, so table and column names only
//! change through append-only migrations.
//!
//! # Concurrency
//!
//! One writer, many readers. [`ExecutionLog`] serializes all mutations behind
//! a single async lock, which is what makes frame indices dense, event
//! sequences gap-free, and state-cell writes observable in commit order —
//! the engine's reconciliation loop depends on all three.
//!
//! # Example
//!
//! ```rust,no_run
//! use conductor_store::{ExecutionLog, ExecutionStatus};
//!
//! # async fn example() -> conductor_store::Result<()> {
//! let log = ExecutionLog::open("sqlite:conductor.db").await?;
//! let execution = log.begin_execution("nightly-refactor", None).await?;
//!
//! let frame = log.append_frame(&execution, "<orchestration/>").await?;
//! assert_eq!(frame, 0);
//!
//! log.finish_execution(&execution, ExecutionStatus::Succeeded, None).await?;
//! log.close().await;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod models;
pub mod store;

pub use error::{Result, StoreError};
pub use models::{
    ExecutionRow, ExecutionStatus, FrameRow, InvocationRow, InvocationStatus,
    RateLimitSnapshot, RateLimitSnapshotRow, StateCellRow, StreamEventRow,
};
pub use store::{ExecutionLog, InvocationFinish};
