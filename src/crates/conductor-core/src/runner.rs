//! The dispatch seam: invocation specs, results, and the `AgentRunner` trait.
//!
//! The engine never talks to a child process directly. It builds an
//! [`InvocationSpec`], wraps the configured [`AgentRunner`] in the middleware
//! chain, and awaits an [`AgentResult`]. The process supervisor implements
//! this trait for real CLIs; the mock runner implements it for tests and
//! `--mock` runs.

use crate::error::Result;
use crate::events::StreamEvent;
use crate::stop::StopCondition;
use async_trait::async_trait;
use conductor_store::ExecutionLog;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

/// The external CLIs a dispatch can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKind {
    Claude,
    Codex,
    Amp,
    Opencode,
    Pi,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
            AgentKind::Amp => "amp",
            AgentKind::Opencode => "opencode",
            AgentKind::Pi => "pi",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "claude" => Some(AgentKind::Claude),
            "codex" => Some(AgentKind::Codex),
            "amp" => Some(AgentKind::Amp),
            "opencode" => Some(AgentKind::Opencode),
            "pi" => Some(AgentKind::Pi),
            _ => None,
        }
    }

    /// Command name looked up on the system path.
    pub fn command(&self) -> &'static str {
        self.as_str()
    }

    /// Provider key for the rate-limit governor.
    pub fn provider(&self) -> &'static str {
        match self {
            AgentKind::Claude => "anthropic",
            AgentKind::Codex => "openai",
            AgentKind::Amp => "amp",
            AgentKind::Opencode => "opencode",
            AgentKind::Pi => "pi",
        }
    }

    /// Canonical API-key environment variable, stripped from the child's
    /// environment when subscription credentials are requested.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            AgentKind::Claude => "ANTHROPIC_API_KEY",
            AgentKind::Codex => "OPENAI_API_KEY",
            AgentKind::Amp => "AMP_API_KEY",
            AgentKind::Opencode => "OPENCODE_API_KEY",
            AgentKind::Pi => "PI_API_KEY",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to dispatch one agent node.
#[derive(Debug, Clone)]
pub struct InvocationSpec {
    pub kind: AgentKind,
    pub prompt: String,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub stop_conditions: Vec<StopCondition>,
    /// JSON schema for structured output, when requested.
    pub schema: Option<Value>,
    pub schema_retries: u32,
    pub working_dir: Option<PathBuf>,
    /// Hard per-invocation timeout; lowered onto a `time-limit` stop
    /// condition by the supervisor.
    pub timeout_ms: Option<u64>,
    /// Pass-through provider options the kind's argv builder understands.
    /// Unknown keys are ignored.
    pub options: Map<String, Value>,
    /// Strip the vendor API key so the CLI uses subscription credentials.
    pub use_subscription: bool,
    /// Vendor session to resume, when re-dispatching.
    pub resume_session: Option<String>,
}

impl InvocationSpec {
    pub fn new(kind: AgentKind, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            prompt: prompt.into(),
            model: None,
            system_prompt: None,
            stop_conditions: Vec::new(),
            schema: None,
            schema_retries: 0,
            working_dir: None,
            timeout_ms: None,
            options: Map::new(),
            use_subscription: false,
            resume_session: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_schema(mut self, schema: Value, retries: u32) -> Self {
        self.schema = Some(schema);
        self.schema_retries = retries;
        self
    }

    pub fn with_stop(mut self, condition: StopCondition) -> Self {
        self.stop_conditions.push(condition);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Stable fingerprint of the schema, recorded on the invocation row.
    pub fn schema_fingerprint(&self) -> Option<String> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let schema = self.schema.as_ref()?;
        let mut hasher = DefaultHasher::new();
        schema.to_string().hash(&mut hasher);
        Some(format!("{:016x}", hasher.finish()))
    }
}

/// Why an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    StopCondition,
    Error,
    Cancelled,
}

/// Token counters accumulated from the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TokensUsed {
    pub input: u64,
    pub output: u64,
}

/// Normalized outcome of one dispatch.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AgentResult {
    pub output: String,
    pub reasoning: Option<String>,
    pub structured: Option<Value>,
    pub tokens_used: TokensUsed,
    pub turns_used: u32,
    pub stop_reason: StopReason,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub session: Option<String>,
}

impl AgentResult {
    /// A bare successful result with the given output text.
    pub fn completed(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            reasoning: None,
            structured: None,
            tokens_used: TokensUsed::default(),
            turns_used: 0,
            stop_reason: StopReason::Completed,
            duration_ms: 0,
            exit_code: Some(0),
            session: None,
        }
    }
}

/// Callback invoked for every parsed stream event.
pub type EventCallback = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

/// Per-dispatch context handed down the middleware chain to the runner.
///
/// The invocation id is set by the logging middleware once it has created
/// the row; event appends before that point (unit harnesses without the
/// logging middleware) skip the store and only hit the callback.
#[derive(Clone)]
pub struct RunContext {
    pub execution_id: String,
    invocation: Arc<RwLock<Option<String>>>,
    pub log: Arc<ExecutionLog>,
    pub cancel: CancellationToken,
    pub on_event: Option<EventCallback>,
}

impl RunContext {
    pub fn new(execution_id: impl Into<String>, log: Arc<ExecutionLog>) -> Self {
        Self {
            execution_id: execution_id.into(),
            invocation: Arc::new(RwLock::new(None)),
            log,
            cancel: CancellationToken::new(),
            on_event: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_event_callback(mut self, callback: EventCallback) -> Self {
        self.on_event = Some(callback);
        self
    }

    /// Current invocation row id, once the logging middleware assigned one.
    pub fn invocation_id(&self) -> Option<String> {
        self.invocation.read().expect("invocation lock poisoned").clone()
    }

    /// Bind this context to an invocation row. Re-dispatches rebind.
    pub fn set_invocation_id(&self, id: &str) {
        *self.invocation.write().expect("invocation lock poisoned") = Some(id.to_string());
    }

    /// Persist one stream event and fan it out to the callback. Returns the
    /// assigned sequence number when the event was persisted.
    pub async fn emit(&self, event: &StreamEvent) -> Result<Option<i64>> {
        let seq = match self.invocation_id() {
            Some(invocation_id) => Some(
                self.log
                    .append_event(&invocation_id, event.kind.as_str(), &event.payload)
                    .await?,
            ),
            None => None,
        };
        if let Some(callback) = &self.on_event {
            callback(event);
        }
        Ok(seq)
    }
}

/// The thing that actually runs one invocation: the process supervisor in
/// production, a scripted mock in tests.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, spec: InvocationSpec, ctx: &RunContext) -> Result<AgentResult>;
}
