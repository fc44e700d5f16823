//! Error taxonomy for the orchestration engine.
//!
//! Agent-level variants surface to the plan's `on_error` callback and are
//! recorded on the invocation row; the engine keeps going unless a global
//! stop condition escalates. `Io` and `PlanInvalid` are fatal: they abort the
//! run and seal the execution `failed`.

use thiserror::Error;

/// Convenience result type using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// All errors the engine and its collaborators can produce.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The execution log is unavailable (disk full, corrupt file, ...).
    /// Fatal: seals the execution `failed` and exits 1.
    #[error("store failure: {0}")]
    Io(#[from] conductor_store::StoreError),

    /// The agent kind's command could not be launched.
    #[error("agent '{kind}' is not installed: {message}")]
    AgentNotInstalled { kind: String, message: String },

    /// The vendor rejected credentials.
    #[error("authentication failed for provider '{provider}': {message}")]
    Auth { provider: String, message: String },

    /// The vendor rate-limited the request, or the governor refused to block.
    #[error("rate limited: {message}")]
    RateLimited { message: String },

    /// The invocation's `time-limit` stop condition tripped.
    #[error("agent timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// A stop condition other than time tripped. This is a normal
    /// termination, reported so callers can distinguish it from failure.
    #[error("stopped by condition: {condition}")]
    StopCondition { condition: String },

    /// Structured output could not be parsed or validated after all retries.
    /// Carries the raw output and session id so a retry dispatch can build
    /// its resume hint.
    #[error("schema validation failed: {message}")]
    SchemaValidation {
        message: String,
        output: String,
        session: Option<String>,
    },

    /// The reconciler hit an unknown node kind, a cyclic component, or an
    /// otherwise malformed plan. Fatal.
    #[error("invalid plan: {0}")]
    PlanInvalid(String),

    /// The external cancel token fired.
    #[error("execution cancelled")]
    Cancelled,

    /// An effect node named a handler nobody registered.
    #[error("no effect handler registered for '{0}'")]
    UnregisteredEffect(String),

    /// A registered effect handler failed.
    #[error("effect '{name}' failed: {message}")]
    EffectFailed { name: String, message: String },

    /// Any other agent failure, with captured stderr.
    #[error("agent failed: {message}")]
    AgentFailed { message: String },
}

impl EngineError {
    /// Short tag used on invocation rows and in CLI summaries.
    pub fn tag(&self) -> &'static str {
        match self {
            EngineError::Io(_) => "fatal.io",
            EngineError::AgentNotInstalled { .. } => "agent.not-installed",
            EngineError::Auth { .. } => "agent.auth",
            EngineError::RateLimited { .. } => "agent.rate-limited",
            EngineError::Timeout { .. } => "agent.timeout",
            EngineError::StopCondition { .. } => "agent.stop-condition",
            EngineError::SchemaValidation { .. } => "schema-validation",
            EngineError::PlanInvalid(_) => "plan.invalid",
            EngineError::Cancelled => "cancelled",
            EngineError::UnregisteredEffect(_) => "effect.unregistered",
            EngineError::EffectFailed { .. } => "effect.failed",
            EngineError::AgentFailed { .. } => "agent.failed",
        }
    }

    /// Fatal errors abort the engine; the rest surface to the plan.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Io(_)
                | EngineError::PlanInvalid(_)
                | EngineError::UnregisteredEffect(_)
                | EngineError::EffectFailed { .. }
        )
    }
}

impl From<conductor_governor::GovernorError> for EngineError {
    fn from(err: conductor_governor::GovernorError) -> Self {
        match err {
            conductor_governor::GovernorError::Store(e) => EngineError::Io(e),
            other => EngineError::RateLimited {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags() {
        assert_eq!(
            EngineError::AgentNotInstalled {
                kind: "claude".into(),
                message: "exit 127".into()
            }
            .tag(),
            "agent.not-installed"
        );
        assert_eq!(EngineError::Cancelled.tag(), "cancelled");
        assert_eq!(EngineError::PlanInvalid("x".into()).tag(), "plan.invalid");
    }

    #[test]
    fn test_fatality() {
        assert!(EngineError::PlanInvalid("x".into()).is_fatal());
        assert!(EngineError::UnregisteredEffect("commit".into()).is_fatal());
        assert!(!EngineError::Cancelled.is_fatal());
        assert!(!EngineError::AgentFailed { message: "x".into() }.is_fatal());
    }
}
