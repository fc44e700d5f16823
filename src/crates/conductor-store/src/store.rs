//! The execution log itself.
//!
//! One [`ExecutionLog`] wraps a SQLite pool plus a single async write lock.
//! Every mutation goes through that lock, so frame indices, event sequences,
//! and state-cell updates are globally ordered per execution. Readers run
//! concurrently against the pool.

use crate::error::{Result, StoreError};
use crate::models::{
    ExecutionRow, ExecutionStatus, FrameRow, InvocationRow, InvocationStatus,
    RateLimitSnapshot, RateLimitSnapshotRow, StateCellRow, StreamEventRow,
};
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Completion fields for an agent invocation.
#[derive(Debug, Clone, Default)]
pub struct InvocationFinish {
    pub status: Option<InvocationStatus>,
    pub output: Option<String>,
    pub structured: Option<Value>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub turn_count: i64,
    pub error: Option<String>,
    pub session_id: Option<String>,
}

impl InvocationFinish {
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            status: Some(InvocationStatus::Succeeded),
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(InvocationStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Durable execution log backed by a single SQLite file (or `:memory:` for
/// tests). Schema is applied on open from the embedded migration scripts.
pub struct ExecutionLog {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl ExecutionLog {
    /// Open (creating if missing) a log at the given SQLite URL, e.g.
    /// `sqlite:conductor.db` or `sqlite::memory:`.
    pub async fn open(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // A shared in-memory database only exists per-connection; a pool of
        // one keeps every reader on the same database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(url = database_url, "execution log opened");

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    /// Open an in-memory log. Used by tests and `--mock` dry runs.
    pub async fn in_memory() -> Result<Self> {
        Self::open("sqlite::memory:").await
    }

    /// Flush and release the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // --- executions ---

    /// Create a new execution with status `running` and return its id.
    pub async fn begin_execution(
        &self,
        plan_name: &str,
        plan_path: Option<&str>,
    ) -> Result<String> {
        let _guard = self.write_lock.lock().await;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO executions (id, plan_name, plan_path, status, started_at)
             VALUES (?, ?, ?, 'running', ?)",
        )
        .bind(&id)
        .bind(plan_name)
        .bind(plan_path)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        debug!(execution = %id, plan = plan_name, "execution started");
        Ok(id)
    }

    /// Seal an execution. Idempotent: the first call wins, later calls are
    /// no-ops.
    pub async fn finish_execution(
        &self,
        id: &str,
        status: ExecutionStatus,
        result: Option<&Value>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        let result_json = result.map(|v| v.to_string());
        sqlx::query(
            "UPDATE executions SET status = ?, result = ?, finished_at = ?
             WHERE id = ? AND finished_at IS NULL",
        )
        .bind(status.as_str())
        .bind(result_json)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRow>> {
        let row = sqlx::query_as::<_, ExecutionRow>("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_executions(&self) -> Result<Vec<ExecutionRow>> {
        let rows =
            sqlx::query_as::<_, ExecutionRow>("SELECT * FROM executions ORDER BY started_at DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    // --- agent invocations ---

    /// Record the start of an agent invocation and return its id.
    pub async fn begin_invocation(
        &self,
        execution_id: &str,
        kind: &str,
        model: Option<&str>,
        prompt: &str,
        schema_fingerprint: Option<&str>,
    ) -> Result<String> {
        let _guard = self.write_lock.lock().await;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let seq: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM agent_invocations WHERE execution_id = ?",
        )
        .bind(execution_id)
        .fetch_one(&self.pool)
        .await?;
        sqlx::query(
            "INSERT INTO agent_invocations
             (id, execution_id, seq, kind, model, prompt, schema_fingerprint, status, started_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'running', ?)",
        )
        .bind(&id)
        .bind(execution_id)
        .bind(seq)
        .bind(kind)
        .bind(model)
        .bind(prompt)
        .bind(schema_fingerprint)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        debug!(invocation = %id, kind, "invocation started");
        Ok(id)
    }

    /// Record the completion of an agent invocation.
    pub async fn finish_invocation(&self, id: &str, finish: InvocationFinish) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        let status = finish.status.unwrap_or(InvocationStatus::Succeeded);
        let structured = finish.structured.map(|v| v.to_string());
        sqlx::query(
            "UPDATE agent_invocations
             SET status = ?, output = ?, structured = ?, input_tokens = ?,
                 output_tokens = ?, turn_count = ?, error = ?, session_id = ?,
                 finished_at = ?
             WHERE id = ? AND finished_at IS NULL",
        )
        .bind(status.as_str())
        .bind(finish.output)
        .bind(structured)
        .bind(finish.input_tokens)
        .bind(finish.output_tokens)
        .bind(finish.turn_count)
        .bind(finish.error)
        .bind(finish.session_id)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_invocation(&self, id: &str) -> Result<Option<InvocationRow>> {
        let row =
            sqlx::query_as::<_, InvocationRow>("SELECT * FROM agent_invocations WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    /// Invocations for an execution in author (dispatch) order.
    pub async fn list_invocations(&self, execution_id: &str) -> Result<Vec<InvocationRow>> {
        let rows = sqlx::query_as::<_, InvocationRow>(
            "SELECT * FROM agent_invocations WHERE execution_id = ? ORDER BY seq ASC",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // --- frames ---

    /// Append a serialized tree snapshot; returns the assigned frame index.
    /// Indices are dense per execution, starting at 0.
    pub async fn append_frame(&self, execution_id: &str, document: &str) -> Result<i64> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        let index: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(frame_index) + 1, 0) FROM frames WHERE execution_id = ?",
        )
        .bind(execution_id)
        .fetch_one(&self.pool)
        .await?;
        sqlx::query(
            "INSERT INTO frames (execution_id, frame_index, document, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(execution_id)
        .bind(index)
        .bind(document)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(index)
    }

    pub async fn list_frames(&self, execution_id: &str) -> Result<Vec<FrameRow>> {
        let rows = sqlx::query_as::<_, FrameRow>(
            "SELECT * FROM frames WHERE execution_id = ? ORDER BY frame_index ASC",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // --- stream events ---

    /// Append a parsed stream event; assigns the next per-invocation
    /// sequence number and returns it.
    pub async fn append_event(
        &self,
        invocation_id: &str,
        kind: &str,
        payload: &Value,
    ) -> Result<i64> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        let seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM stream_events WHERE invocation_id = ?",
        )
        .bind(invocation_id)
        .fetch_one(&self.pool)
        .await?;
        sqlx::query(
            "INSERT INTO stream_events (invocation_id, seq, kind, payload, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(invocation_id)
        .bind(seq)
        .bind(kind)
        .bind(payload.to_string())
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(seq)
    }

    /// Events for an invocation in arrival order.
    pub async fn list_events(&self, invocation_id: &str) -> Result<Vec<StreamEventRow>> {
        let rows = sqlx::query_as::<_, StreamEventRow>(
            "SELECT * FROM stream_events WHERE invocation_id = ? ORDER BY seq ASC",
        )
        .bind(invocation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // --- state cells ---

    pub async fn state_get(&self, execution_id: &str, key: &str) -> Result<Option<Value>> {
        let row = sqlx::query_as::<_, StateCellRow>(
            "SELECT * FROM state_cells WHERE execution_id = ? AND key = ?",
        )
        .bind(execution_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(cell) => Ok(Some(serde_json::from_str(&cell.value)?)),
            None => Ok(None),
        }
    }

    /// Upsert a state cell. Writes are serialized by the store lock so later
    /// reconciliation passes observe them in commit order.
    pub async fn state_set(
        &self,
        execution_id: &str,
        key: &str,
        value: &Value,
        updated_by: &str,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO state_cells (execution_id, key, value, updated_by, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (execution_id, key)
             DO UPDATE SET value = excluded.value, updated_by = excluded.updated_by,
                           updated_at = excluded.updated_at",
        )
        .bind(execution_id)
        .bind(key)
        .bind(value.to_string())
        .bind(updated_by)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        debug!(execution = execution_id, key, by = updated_by, "state cell written");
        Ok(())
    }

    /// All cells for an execution as a map. This is the snapshot the
    /// reconciler reads at the start of each pass.
    pub async fn state_snapshot(&self, execution_id: &str) -> Result<HashMap<String, Value>> {
        let rows = sqlx::query_as::<_, StateCellRow>(
            "SELECT * FROM state_cells WHERE execution_id = ?",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        let mut map = HashMap::with_capacity(rows.len());
        for cell in rows {
            map.insert(cell.key.clone(), serde_json::from_str(&cell.value)?);
        }
        Ok(map)
    }

    // --- rate-limit snapshots ---

    /// Append-only record of a provider budget observation.
    pub async fn record_rate_limit(&self, snapshot: &RateLimitSnapshot) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO rate_limit_snapshots
             (provider, model,
              requests_limit, requests_remaining, requests_reset_at,
              input_tokens_limit, input_tokens_remaining, input_tokens_reset_at,
              output_tokens_limit, output_tokens_remaining, output_tokens_reset_at,
              tier, captured_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&snapshot.provider)
        .bind(&snapshot.model)
        .bind(snapshot.requests_limit)
        .bind(snapshot.requests_remaining)
        .bind(&snapshot.requests_reset_at)
        .bind(snapshot.input_tokens_limit)
        .bind(snapshot.input_tokens_remaining)
        .bind(&snapshot.input_tokens_reset_at)
        .bind(snapshot.output_tokens_limit)
        .bind(snapshot.output_tokens_remaining)
        .bind(&snapshot.output_tokens_reset_at)
        .bind(&snapshot.tier)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_rate_limits(
        &self,
        provider: &str,
        model: &str,
    ) -> Result<Vec<RateLimitSnapshotRow>> {
        let rows = sqlx::query_as::<_, RateLimitSnapshotRow>(
            "SELECT * FROM rate_limit_snapshots
             WHERE provider = ? AND model = ? ORDER BY id ASC",
        )
        .bind(provider)
        .bind(model)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

impl std::fmt::Debug for ExecutionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionLog").finish_non_exhaustive()
    }
}

// Surfaced so callers can distinguish "row missing" from I/O failure.
impl ExecutionLog {
    /// Fetch an execution, erroring if absent.
    pub async fn require_execution(&self, id: &str) -> Result<ExecutionRow> {
        self.get_execution(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("execution {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn open_log() -> ExecutionLog {
        ExecutionLog::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_begin_and_finish_execution() {
        let log = open_log().await;
        let id = log.begin_execution("hello", Some("plans/hello.yaml")).await.unwrap();

        let row = log.require_execution(&id).await.unwrap();
        assert_eq!(row.status(), Some(ExecutionStatus::Running));
        assert!(row.finished_at.is_none());

        log.finish_execution(&id, ExecutionStatus::Succeeded, Some(&json!({"ok": true})))
            .await
            .unwrap();
        let row = log.require_execution(&id).await.unwrap();
        assert_eq!(row.status(), Some(ExecutionStatus::Succeeded));
        assert!(row.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_finish_execution_first_call_wins() {
        let log = open_log().await;
        let id = log.begin_execution("p", None).await.unwrap();

        log.finish_execution(&id, ExecutionStatus::Failed, None).await.unwrap();
        log.finish_execution(&id, ExecutionStatus::Succeeded, None).await.unwrap();

        let row = log.require_execution(&id).await.unwrap();
        assert_eq!(row.status(), Some(ExecutionStatus::Failed));
    }

    #[tokio::test]
    async fn test_invocations_ordered_by_seq() {
        let log = open_log().await;
        let exec = log.begin_execution("p", None).await.unwrap();

        let a = log.begin_invocation(&exec, "claude", Some("sonnet"), "first", None).await.unwrap();
        let b = log.begin_invocation(&exec, "codex", None, "second", None).await.unwrap();

        log.finish_invocation(&a, InvocationFinish::succeeded("A")).await.unwrap();
        log.finish_invocation(&b, InvocationFinish::failed("boom")).await.unwrap();

        let rows = log.list_invocations(&exec).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].seq, 0);
        assert_eq!(rows[0].kind, "claude");
        assert_eq!(rows[0].output.as_deref(), Some("A"));
        assert_eq!(rows[1].seq, 1);
        assert_eq!(rows[1].status(), Some(InvocationStatus::Failed));
        assert_eq!(rows[1].error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_frame_indices_dense_from_zero() {
        let log = open_log().await;
        let exec = log.begin_execution("p", None).await.unwrap();

        for i in 0..4 {
            let idx = log.append_frame(&exec, "<orchestration/>").await.unwrap();
            assert_eq!(idx, i);
        }

        let frames = log.list_frames(&exec).await.unwrap();
        let indices: Vec<i64> = frames.iter().map(|f| f.frame_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_event_sequences_dense_per_invocation() {
        let log = open_log().await;
        let exec = log.begin_execution("p", None).await.unwrap();
        let a = log.begin_invocation(&exec, "claude", None, "x", None).await.unwrap();
        let b = log.begin_invocation(&exec, "claude", None, "y", None).await.unwrap();

        for i in 0..3 {
            let seq = log.append_event(&a, "text-delta", &json!({"text": "hi"})).await.unwrap();
            assert_eq!(seq, i);
        }
        let seq = log.append_event(&b, "token-usage", &json!({"output": 5})).await.unwrap();
        assert_eq!(seq, 0);

        let events = log.list_events(&a).await.unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_state_cells_upsert_and_snapshot() {
        let log = open_log().await;
        let exec = log.begin_execution("p", None).await.unwrap();

        assert!(log.state_get(&exec, "phase").await.unwrap().is_none());

        log.state_set(&exec, "phase", &json!("a"), "phase-a").await.unwrap();
        log.state_set(&exec, "phase", &json!("b"), "phase-a:on_finished").await.unwrap();
        log.state_set(&exec, "count", &json!(3), "loop").await.unwrap();

        assert_eq!(log.state_get(&exec, "phase").await.unwrap(), Some(json!("b")));

        let snapshot = log.state_snapshot(&exec).await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["phase"], json!("b"));
        assert_eq!(snapshot["count"], json!(3));
    }

    #[tokio::test]
    async fn test_rate_limit_snapshots_append_only() {
        let log = open_log().await;
        let snapshot = RateLimitSnapshot {
            provider: "anthropic".into(),
            model: "claude-sonnet".into(),
            requests_limit: 100,
            requests_remaining: 42,
            ..Default::default()
        };
        log.record_rate_limit(&snapshot).await.unwrap();
        log.record_rate_limit(&snapshot).await.unwrap();

        let rows = log.list_rate_limits("anthropic", "claude-sonnet").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].id < rows[1].id);
        assert_eq!(rows[0].requests_remaining, 42);
    }

    #[tokio::test]
    async fn test_on_disk_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.db");
        let url = format!("sqlite:{}", path.display());

        let exec = {
            let log = ExecutionLog::open(&url).await.unwrap();
            let exec = log.begin_execution("p", None).await.unwrap();
            log.append_frame(&exec, "<orchestration/>").await.unwrap();
            log.close().await;
            exec
        };

        let log = ExecutionLog::open(&url).await.unwrap();
        let frames = log.list_frames(&exec).await.unwrap();
        assert_eq!(frames.len(), 1);
    }
}
