//! Middleware: composable wrappers around a single agent invocation.
//!
//! A [`Middleware`] is a plain data value — a name plus optional
//! `wrap_execute` / `wrap_stream` functions — and a chain is an ordered list
//! composed like an onion: the first middleware is outermost, and the
//! innermost `next` is the configured [`AgentRunner`].
//!
//! The engine's default chain is:
//!
//! ```text
//! schema_retry → logging → rate_limit → (user middlewares) → schema_finalize → runner
//! ```
//!
//! so each schema re-dispatch gets its own invocation row, while validation
//! retries *within* one dispatch (the `retry` middleware) reuse the row.

use crate::error::{EngineError, Result};
use crate::events::StreamEvent;
use crate::json_extract::extract_json;
use crate::runner::{AgentResult, AgentRunner, InvocationSpec, RunContext, StopReason};
use conductor_store::{InvocationFinish, InvocationStatus};
use conductor_governor::{Governor, TokenUsage};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Wrapper around the whole invocation.
pub type ExecuteWrapper = Arc<
    dyn for<'a> Fn(Next<'a>, InvocationSpec, &'a RunContext) -> BoxFuture<'a, Result<AgentResult>>
        + Send
        + Sync,
>;

/// Wrapper around each parsed stream event.
pub type StreamWrapper = Arc<dyn Fn(StreamEvent) -> StreamEvent + Send + Sync>;

/// A named pair of optional wrappers.
#[derive(Clone)]
pub struct Middleware {
    pub name: String,
    pub wrap_execute: Option<ExecuteWrapper>,
    pub wrap_stream: Option<StreamWrapper>,
}

impl Middleware {
    pub fn execute<F>(name: impl Into<String>, wrap: F) -> Self
    where
        F: for<'a> Fn(Next<'a>, InvocationSpec, &'a RunContext) -> BoxFuture<'a, Result<AgentResult>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            wrap_execute: Some(Arc::new(wrap)),
            wrap_stream: None,
        }
    }

    pub fn stream<F>(name: impl Into<String>, wrap: F) -> Self
    where
        F: Fn(StreamEvent) -> StreamEvent + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            wrap_execute: None,
            wrap_stream: Some(Arc::new(wrap)),
        }
    }
}

impl std::fmt::Debug for Middleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Middleware")
            .field("name", &self.name)
            .field("wrap_execute", &self.wrap_execute.is_some())
            .field("wrap_stream", &self.wrap_stream.is_some())
            .finish()
    }
}

/// The rest of the chain from some middleware's point of view.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Middleware],
    runner: &'a dyn AgentRunner,
}

impl<'a> Next<'a> {
    pub fn run(self, spec: InvocationSpec, ctx: &'a RunContext) -> BoxFuture<'a, Result<AgentResult>> {
        match self.chain.split_first() {
            Some((middleware, rest)) => {
                let next = Next {
                    chain: rest,
                    runner: self.runner,
                };
                match &middleware.wrap_execute {
                    Some(wrap) => wrap(next, spec, ctx),
                    None => next.run(spec, ctx),
                }
            }
            None => self.runner.run(spec, ctx),
        }
    }
}

/// An ordered middleware list. Index 0 is outermost.
#[derive(Clone, Debug, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Middleware>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, middleware: Middleware) {
        self.middlewares.push(middleware);
    }

    pub fn with(mut self, middleware: Middleware) -> Self {
        self.push(middleware);
        self
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Run one invocation through the chain down to `runner`.
    pub async fn execute(
        &self,
        runner: &dyn AgentRunner,
        spec: InvocationSpec,
        ctx: &RunContext,
    ) -> Result<AgentResult> {
        Next {
            chain: &self.middlewares,
            runner,
        }
        .run(spec, ctx)
        .await
    }

    /// Fold one stream event through every `wrap_stream`, in order.
    pub fn apply_stream(&self, event: StreamEvent) -> StreamEvent {
        self.middlewares.iter().fold(event, |event, middleware| {
            match &middleware.wrap_stream {
                Some(wrap) => wrap(event),
                None => event,
            }
        })
    }
}

// --- core-provided middlewares ---

/// Records the invocation begin/finish rows around the rest of the chain.
/// Writes only through the context's store handle.
pub fn logging() -> Middleware {
    Middleware::execute("logging", |next, spec, ctx| {
        Box::pin(async move {
            let kind = spec.kind;
            let model = spec.model.clone();
            let prompt = spec.prompt.clone();
            let fingerprint = spec.schema_fingerprint();

            let invocation_id = ctx
                .log
                .begin_invocation(
                    &ctx.execution_id,
                    kind.as_str(),
                    model.as_deref(),
                    &prompt,
                    fingerprint.as_deref(),
                )
                .await?;
            ctx.set_invocation_id(&invocation_id);
            debug!(invocation = %invocation_id, kind = %kind, "dispatch begun");

            let outcome = next.run(spec, ctx).await;

            let finish = match &outcome {
                Ok(result) => InvocationFinish {
                    status: Some(match result.stop_reason {
                        StopReason::Completed | StopReason::StopCondition => {
                            InvocationStatus::Succeeded
                        }
                        StopReason::Error => InvocationStatus::Failed,
                        StopReason::Cancelled => InvocationStatus::Cancelled,
                    }),
                    output: Some(result.output.clone()),
                    structured: result.structured.clone(),
                    input_tokens: result.tokens_used.input as i64,
                    output_tokens: result.tokens_used.output as i64,
                    turn_count: result.turns_used as i64,
                    error: None,
                    session_id: result.session.clone(),
                },
                Err(error) => InvocationFinish {
                    status: Some(match error {
                        EngineError::Cancelled => InvocationStatus::Cancelled,
                        _ => InvocationStatus::Failed,
                    }),
                    error: Some(format!("{}: {}", error.tag(), error)),
                    ..Default::default()
                },
            };
            ctx.log.finish_invocation(&invocation_id, finish).await?;

            outcome
        })
    })
}

/// Gates the dispatch through the rate governor before running it, and logs
/// the estimated spend afterwards.
pub fn rate_limit(governor: Arc<Governor>) -> Middleware {
    Middleware::execute("rate-limit", move |next, spec, ctx| {
        let governor = Arc::clone(&governor);
        Box::pin(async move {
            let provider = spec.kind.provider();
            let model = spec.model.clone().unwrap_or_default();
            let applied = governor.acquire(provider, &model).await?;
            if !applied.is_zero() {
                debug!(provider, model = %model, delay_ms = applied.as_millis() as u64, "dispatch throttled");
            }
            // Child CLIs surface no response headers; refreshed budgets come
            // from the governor's own probes.
            let outcome = next.run(spec, ctx).await;
            if let Ok(result) = &outcome {
                let usage = TokenUsage {
                    input: result.tokens_used.input,
                    output: result.tokens_used.output,
                };
                if let Some(cost) = governor.estimate_cost(provider, &model, usage) {
                    debug!(provider, model = %model, cost_usd = cost.total, "estimated dispatch spend");
                }
            }
            outcome
        })
    })
}

/// Validation predicate over a finished result.
pub type ValidateFn = Arc<dyn Fn(&AgentResult) -> bool + Send + Sync>;

/// Backoff between retry attempts: exponential with optional jitter.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 60_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryBackoff {
    /// No waiting between attempts.
    pub fn none() -> Self {
        Self {
            initial_ms: 0,
            max_ms: 0,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay before the given retry attempt (0-based).
    pub fn delay(&self, attempt: u32) -> std::time::Duration {
        let base = (self.initial_ms as f64 * self.multiplier.powi(attempt as i32)) as u64;
        let mut delay_ms = base.min(self.max_ms);
        if self.jitter && delay_ms > 0 {
            // Up to 25% extra, spreading simultaneous retries apart.
            let extra = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            delay_ms += extra;
        }
        std::time::Duration::from_millis(delay_ms)
    }
}

/// Re-runs the inner chain until `validate` passes or retries are spent,
/// without waiting between attempts. Retries reuse the same invocation row
/// (place this inside `logging`).
pub fn retry(validate: ValidateFn, max_retries: u32) -> Middleware {
    retry_with(validate, max_retries, RetryBackoff::none())
}

/// [`retry`] with a backoff schedule between attempts.
pub fn retry_with(validate: ValidateFn, max_retries: u32, backoff: RetryBackoff) -> Middleware {
    Middleware::execute("retry", move |next, spec, ctx| {
        let validate = Arc::clone(&validate);
        let backoff = backoff.clone();
        Box::pin(async move {
            let mut attempt = 0u32;
            loop {
                let result = next.run(spec.clone(), ctx).await?;
                if validate(&result) {
                    return Ok(result);
                }
                if attempt >= max_retries {
                    warn!(attempts = attempt + 1, "validation never passed; returning last result");
                    return Ok(result);
                }
                let wait = backoff.delay(attempt);
                attempt += 1;
                debug!(attempt, wait_ms = wait.as_millis() as u64, "validation failed; retrying dispatch");
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }
        })
    })
}

/// Outermost schema loop: on a schema-validation failure, re-dispatch with a
/// resume hint until `schema_retries` is exhausted.
pub fn schema_retry() -> Middleware {
    Middleware::execute("schema-retry", |next, spec, ctx| {
        Box::pin(async move {
            let mut retries = spec.schema_retries;
            let mut spec = spec;
            loop {
                match next.run(spec.clone(), ctx).await {
                    Err(EngineError::SchemaValidation {
                        message,
                        output,
                        session,
                    }) if retries > 0 => {
                        retries -= 1;
                        debug!(remaining = retries, "structured output invalid; re-dispatching");
                        spec = resume_spec(spec, &message, &output, session);
                    }
                    outcome => return outcome,
                }
            }
        })
    })
}

/// Build the re-dispatch spec for a failed schema validation: resume the
/// vendor session when one is known, otherwise a compact retry prompt that
/// echoes the previous output (up to 1000 characters) and the error.
fn resume_spec(
    mut spec: InvocationSpec,
    error: &str,
    previous_output: &str,
    session: Option<String>,
) -> InvocationSpec {
    let truncated: String = previous_output.chars().take(1000).collect();
    if let Some(session) = session {
        spec.resume_session = Some(session);
        spec.prompt = format!(
            "Your previous reply did not match the required JSON schema: {error}. \
             Reply again with only a JSON value that matches the schema."
        );
    } else {
        spec.prompt = format!(
            "Your previous reply was:\n{truncated}\n\n\
             It did not match the required JSON schema: {error}. \
             Reply again with only a JSON value that matches the schema."
        );
    }
    spec
}

/// Innermost schema step: extract, parse, and validate the structured
/// payload from the finished output.
pub fn schema_finalize() -> Middleware {
    Middleware::execute("schema", |next, spec, ctx| {
        Box::pin(async move {
            let schema = spec.schema.clone();
            let session_hint = spec.resume_session.clone();
            let mut result = next.run(spec, ctx).await?;
            let Some(schema) = schema else {
                return Ok(result);
            };
            match validate_structured(&schema, &result.output) {
                Ok(value) => {
                    result.structured = Some(value);
                    Ok(result)
                }
                Err(message) => Err(EngineError::SchemaValidation {
                    message,
                    session: result.session.clone().or(session_hint),
                    output: result.output,
                }),
            }
        })
    })
}

/// Extract the first balanced JSON span from `output`, parse it, and check
/// it against `schema`. Returns the parsed value or a validation message.
pub fn validate_structured(schema: &Value, output: &str) -> std::result::Result<Value, String> {
    let span =
        extract_json(output).ok_or_else(|| "no JSON object or array found in output".to_string())?;
    let value: Value = serde_json::from_str(span)
        .map_err(|e| format!("extracted span is not valid JSON: {e}"))?;

    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| format!("schema failed to compile: {e}"))?;
    let messages: Vec<String> = match compiled.validate(&value) {
        Ok(()) => Vec::new(),
        Err(errors) => errors.map(|e| e.to_string()).collect(),
    };
    if !messages.is_empty() {
        return Err(messages.join("; "));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::AgentKind;
    use async_trait::async_trait;
    use conductor_store::ExecutionLog;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Unit runner: pops scripted outputs, counts calls.
    struct ScriptRunner {
        outputs: Mutex<Vec<String>>,
        calls: AtomicU32,
    }

    impl ScriptRunner {
        fn new(outputs: Vec<&str>) -> Self {
            Self {
                outputs: Mutex::new(outputs.into_iter().rev().map(String::from).collect()),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl AgentRunner for ScriptRunner {
        async fn run(&self, _spec: InvocationSpec, _ctx: &RunContext) -> Result<AgentResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let output = self
                .outputs
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| "done".to_string());
            Ok(AgentResult::completed(output))
        }
    }

    async fn test_ctx() -> (Arc<ExecutionLog>, RunContext, String) {
        let log = Arc::new(ExecutionLog::in_memory().await.unwrap());
        let execution = log.begin_execution("test", None).await.unwrap();
        let ctx = RunContext::new(execution.clone(), Arc::clone(&log));
        (log, ctx, execution)
    }

    fn spec() -> InvocationSpec {
        InvocationSpec::new(AgentKind::Claude, "say hello").with_model("sonnet")
    }

    #[tokio::test]
    async fn test_empty_chain_reaches_runner() {
        let (_log, ctx, _) = test_ctx().await;
        let runner = ScriptRunner::new(vec!["hi"]);
        let chain = MiddlewareChain::new();
        let result = chain.execute(&runner, spec(), &ctx).await.unwrap();
        assert_eq!(result.output, "hi");
    }

    #[tokio::test]
    async fn test_logging_records_begin_and_finish() {
        let (log, ctx, execution) = test_ctx().await;
        let runner = ScriptRunner::new(vec!["hello"]);
        let chain = MiddlewareChain::new().with(logging());

        chain.execute(&runner, spec(), &ctx).await.unwrap();

        let rows = log.list_invocations(&execution).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, "claude");
        assert_eq!(rows[0].output.as_deref(), Some("hello"));
        assert_eq!(rows[0].status.as_str(), "succeeded");
        assert!(rows[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn test_retry_reuses_one_invocation_row() {
        let (log, ctx, execution) = test_ctx().await;
        let runner = ScriptRunner::new(vec!["bad", "bad", "good"]);
        let validate: ValidateFn = Arc::new(|result| result.output == "good");

        // Order per the composition contract: one store-begin before any
        // retry, one store-finish after retries settle.
        let chain = MiddlewareChain::new()
            .with(logging())
            .with(retry(validate, 5));

        let result = chain.execute(&runner, spec(), &ctx).await.unwrap();
        assert_eq!(result.output, "good");
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);

        let rows = log.list_invocations(&execution).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].output.as_deref(), Some("good"));
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max() {
        let (_log, ctx, _) = test_ctx().await;
        let runner = ScriptRunner::new(vec!["bad", "bad", "bad", "bad"]);
        let validate: ValidateFn = Arc::new(|_| false);
        let chain = MiddlewareChain::new().with(retry(validate, 2));

        let result = chain.execute(&runner, spec(), &ctx).await.unwrap();
        assert_eq!(result.output, "bad");
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_onion_ordering() {
        let (_log, ctx, _) = test_ctx().await;
        let runner = ScriptRunner::new(vec!["x"]);
        let trace: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let mark = |label_in: &'static str, label_out: &'static str, trace: Arc<Mutex<Vec<&'static str>>>| {
            Middleware::execute(label_in, move |next, spec, ctx| {
                let trace = Arc::clone(&trace);
                Box::pin(async move {
                    trace.lock().unwrap().push(label_in);
                    let result = next.run(spec, ctx).await;
                    trace.lock().unwrap().push(label_out);
                    result
                })
            })
        };

        let chain = MiddlewareChain::new()
            .with(mark("outer-in", "outer-out", Arc::clone(&trace)))
            .with(mark("inner-in", "inner-out", Arc::clone(&trace)));
        chain.execute(&runner, spec(), &ctx).await.unwrap();

        assert_eq!(
            *trace.lock().unwrap(),
            vec!["outer-in", "inner-in", "inner-out", "outer-out"]
        );
    }

    #[tokio::test]
    async fn test_schema_finalize_attaches_structured() {
        let (_log, ctx, _) = test_ctx().await;
        let runner = ScriptRunner::new(vec![r#"Done: {"ok": true}"#]);
        let chain = MiddlewareChain::new().with(schema_finalize());
        let spec = spec().with_schema(
            json!({"type": "object", "properties": {"ok": {"type": "boolean"}}, "required": ["ok"]}),
            0,
        );

        let result = chain.execute(&runner, spec, &ctx).await.unwrap();
        assert_eq!(result.structured, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_schema_retry_redispatches_with_new_rows() {
        let (log, ctx, execution) = test_ctx().await;
        // First reply has a type mismatch; the retry gets it right.
        let runner = ScriptRunner::new(vec![r#"Sure, here: {ok: "yes"}"#, r#"{"ok": true}"#]);
        let chain = MiddlewareChain::new()
            .with(schema_retry())
            .with(logging())
            .with(schema_finalize());
        let spec = spec().with_schema(
            json!({"type": "object", "properties": {"ok": {"type": "boolean"}}, "required": ["ok"]}),
            1,
        );

        let result = chain.execute(&runner, spec, &ctx).await.unwrap();
        assert_eq!(result.structured, Some(json!({"ok": true})));

        // Two distinct dispatches recorded.
        let rows = log.list_invocations(&execution).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status.as_str(), "failed");
        assert!(rows[0].error.as_deref().unwrap().contains("schema-validation"));
        assert_eq!(rows[1].status.as_str(), "succeeded");
        // The retry prompt echoes the previous output.
        assert!(rows[1].prompt.contains(r#"{ok: "yes"}"#));
    }

    #[tokio::test]
    async fn test_schema_retry_final_failure_is_typed() {
        let (_log, ctx, _) = test_ctx().await;
        let runner = ScriptRunner::new(vec!["no json", "still no json"]);
        let chain = MiddlewareChain::new()
            .with(schema_retry())
            .with(schema_finalize());
        let spec = spec().with_schema(json!({"type": "object"}), 1);

        let err = chain.execute(&runner, spec, &ctx).await.unwrap_err();
        assert_eq!(err.tag(), "schema-validation");
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retry_backoff_grows_and_clamps() {
        let backoff = RetryBackoff {
            initial_ms: 100,
            max_ms: 1_000,
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(backoff.delay(0), std::time::Duration::from_millis(100));
        assert_eq!(backoff.delay(1), std::time::Duration::from_millis(200));
        assert_eq!(backoff.delay(2), std::time::Duration::from_millis(400));
        assert_eq!(backoff.delay(10), std::time::Duration::from_millis(1_000));
        assert_eq!(RetryBackoff::none().delay(5), std::time::Duration::ZERO);
    }

    #[test]
    fn test_retry_backoff_jitter_bounded() {
        let backoff = RetryBackoff {
            initial_ms: 100,
            max_ms: 1_000,
            multiplier: 2.0,
            jitter: true,
        };
        for _ in 0..50 {
            let delay = backoff.delay(0).as_millis() as u64;
            assert!((100..=125).contains(&delay));
        }
    }

    #[test]
    fn test_validate_structured_idempotent() {
        let schema = json!({"type": "object", "properties": {"n": {"type": "integer"}}});
        let output = r#"result: {"n": 42}"#;
        let first = validate_structured(&schema, output).unwrap();
        let second = validate_structured(&schema, output).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, json!({"n": 42}));
    }

    #[test]
    fn test_apply_stream_folds_in_order() {
        let upper = Middleware::stream("upper", |event| {
            match event.text() {
                Some(text) => StreamEvent::text_delta(text.to_uppercase()),
                None => event,
            }
        });
        let bang = Middleware::stream("bang", |event| {
            match event.text() {
                Some(text) => StreamEvent::text_delta(format!("{text}!")),
                None => event,
            }
        });
        let chain = MiddlewareChain::new().with(upper).with(bang);
        let out = chain.apply_stream(StreamEvent::text_delta("hi"));
        assert_eq!(out.text(), Some("HI!"));
    }
}
