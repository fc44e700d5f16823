//! Row models for the execution log.
//!
//! All timestamp columns are ISO8601 strings due to SQLite type limitations.
//! Status columns are stored as lowercase strings; the enum wrappers here are
//! the only place the string forms are spelled out.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Terminal status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(ExecutionStatus::Running),
            "succeeded" => Some(ExecutionStatus::Succeeded),
            "failed" => Some(ExecutionStatus::Failed),
            "cancelled" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }
}

/// Lifecycle status of a single agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl InvocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationStatus::Pending => "pending",
            InvocationStatus::Running => "running",
            InvocationStatus::Succeeded => "succeeded",
            InvocationStatus::Failed => "failed",
            InvocationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(InvocationStatus::Pending),
            "running" => Some(InvocationStatus::Running),
            "succeeded" => Some(InvocationStatus::Succeeded),
            "failed" => Some(InvocationStatus::Failed),
            "cancelled" => Some(InvocationStatus::Cancelled),
            _ => None,
        }
    }
}

/// One run of a plan. Created when the engine starts, sealed when it exits,
/// immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionRow {
    /// Unique execution identifier (UUID string).
    pub id: String,

    /// Logical plan name.
    pub plan_name: String,

    /// Source path of the plan document, when run from a file.
    pub plan_path: Option<String>,

    /// running | succeeded | failed | cancelled
    pub status: String,

    /// Optional aggregate result blob (JSON string).
    pub result: Option<String>,

    /// Wall-clock start (ISO8601 string).
    pub started_at: String,

    /// Wall-clock end; None while running.
    pub finished_at: Option<String>,
}

impl ExecutionRow {
    pub fn status(&self) -> Option<ExecutionStatus> {
        ExecutionStatus::parse(&self.status)
    }
}

/// One dispatched agent node.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvocationRow {
    /// Unique invocation identifier (UUID string).
    pub id: String,

    /// Owning execution.
    pub execution_id: String,

    /// Author-order sequence within the execution.
    pub seq: i64,

    /// Agent kind: claude | codex | amp | opencode | pi
    pub kind: String,

    /// Model identifier passed to the agent CLI.
    pub model: Option<String>,

    /// Full prompt text.
    pub prompt: String,

    /// Fingerprint of the structured-output schema, when one was requested.
    pub schema_fingerprint: Option<String>,

    /// pending | running | succeeded | failed | cancelled
    pub status: String,

    /// Cumulative input tokens reported by the agent stream.
    pub input_tokens: i64,

    /// Cumulative output tokens reported by the agent stream.
    pub output_tokens: i64,

    /// Number of turn boundaries observed.
    pub turn_count: i64,

    /// Final output text.
    pub output: Option<String>,

    /// Parsed structured payload (JSON string), when schema validation passed.
    pub structured: Option<String>,

    /// Error message, populated on failure.
    pub error: Option<String>,

    /// Vendor-assigned session identifier, used for resumption.
    pub session_id: Option<String>,

    /// Invocation start (ISO8601 string).
    pub started_at: String,

    /// Invocation end; None while running.
    pub finished_at: Option<String>,
}

impl InvocationRow {
    pub fn status(&self) -> Option<InvocationStatus> {
        InvocationStatus::parse(&self.status)
    }
}

/// One serialized snapshot of the reconciled plan tree.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FrameRow {
    /// Owning execution.
    pub execution_id: String,

    /// Dense monotonic index starting at 0.
    pub frame_index: i64,

    /// Serialized tree document (XML).
    pub document: String,

    /// Creation timestamp (ISO8601 string).
    pub created_at: String,
}

/// One parsed record from an agent's stdout stream.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StreamEventRow {
    /// Owning invocation.
    pub invocation_id: String,

    /// Dense per-invocation sequence starting at 0.
    pub seq: i64,

    /// Event kind discriminator.
    pub kind: String,

    /// Event payload (JSON string).
    pub payload: String,

    /// Arrival timestamp (ISO8601 string).
    pub created_at: String,
}

/// A named mutable JSON value scoped to an execution.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StateCellRow {
    /// Owning execution.
    pub execution_id: String,

    /// Cell key.
    pub key: String,

    /// JSON value (string form).
    pub value: String,

    /// Free-form tag identifying the last writer.
    pub updated_by: String,

    /// Last write timestamp (ISO8601 string).
    pub updated_at: String,
}

/// A point-in-time observation of a provider budget.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RateLimitSnapshotRow {
    /// Row id (autoincrement).
    pub id: i64,

    pub provider: String,
    pub model: String,

    pub requests_limit: i64,
    pub requests_remaining: i64,
    pub requests_reset_at: Option<String>,

    pub input_tokens_limit: i64,
    pub input_tokens_remaining: i64,
    pub input_tokens_reset_at: Option<String>,

    pub output_tokens_limit: i64,
    pub output_tokens_remaining: i64,
    pub output_tokens_reset_at: Option<String>,

    /// Vendor tier name, when known.
    pub tier: Option<String>,

    /// Observation timestamp (ISO8601 string).
    pub captured_at: String,
}

/// Snapshot fields as the governor hands them over (without the row id).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub provider: String,
    pub model: String,

    pub requests_limit: i64,
    pub requests_remaining: i64,
    pub requests_reset_at: Option<String>,

    pub input_tokens_limit: i64,
    pub input_tokens_remaining: i64,
    pub input_tokens_reset_at: Option<String>,

    pub output_tokens_limit: i64,
    pub output_tokens_remaining: i64,
    pub output_tokens_reset_at: Option<String>,

    pub tier: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_status_round_trip() {
        for status in [
            ExecutionStatus::Running,
            ExecutionStatus::Succeeded,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(ExecutionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ExecutionStatus::parse("bogus"), None);
    }

    #[test]
    fn test_invocation_status_round_trip() {
        for status in [
            InvocationStatus::Pending,
            InvocationStatus::Running,
            InvocationStatus::Succeeded,
            InvocationStatus::Failed,
            InvocationStatus::Cancelled,
        ] {
            assert_eq!(InvocationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(InvocationStatus::parse(""), None);
    }
}
