//! Effect handlers: the engine's seam to its host.
//!
//! Side-effect nodes (`commit`, `snapshot`, `worktree`, `review`) describe
//! work; the engine never executes them itself. The host registers a handler
//! per effect name, and an unregistered name is a typed error on first
//! dispatch.

use crate::error::{EngineError, Result};
use crate::middleware::BoxFuture;
use conductor_store::ExecutionLog;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// What an effect node asked for.
#[derive(Debug, Clone)]
pub struct EffectSpec {
    /// Handler name, e.g. `commit` or `worktree.create`.
    pub name: String,
    /// The node's props, verbatim.
    pub args: Value,
    /// Resolved path of the node that produced this effect.
    pub node_path: String,
}

/// Host context handed to handlers.
#[derive(Clone)]
pub struct EffectContext {
    pub execution_id: String,
    pub log: Arc<ExecutionLog>,
    /// Working directory the run was started from.
    pub working_dir: std::path::PathBuf,
}

/// An effect handler: `(spec, context) → Result<Value>`.
pub type EffectHandler =
    Arc<dyn Fn(EffectSpec, EffectContext) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Registry of effect handlers, keyed by name.
#[derive(Clone, Default)]
pub struct EffectRegistry {
    handlers: HashMap<String, EffectHandler>,
}

impl EffectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Later registrations replace earlier ones.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(EffectSpec, EffectContext) -> BoxFuture<'static, Result<Value>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Run one effect through its handler.
    pub async fn run(&self, spec: EffectSpec, ctx: EffectContext) -> Result<Value> {
        let handler = self
            .handlers
            .get(&spec.name)
            .ok_or_else(|| EngineError::UnregisteredEffect(spec.name.clone()))?;
        debug!(effect = %spec.name, node = %spec.node_path, "running effect");
        let name = spec.name.clone();
        handler(spec, ctx).await.map_err(|e| match e {
            err @ EngineError::UnregisteredEffect(_) => err,
            err => EngineError::EffectFailed {
                name,
                message: err.to_string(),
            },
        })
    }
}

impl std::fmt::Debug for EffectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("EffectRegistry").field("handlers", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_ctx() -> EffectContext {
        let log = Arc::new(ExecutionLog::in_memory().await.unwrap());
        EffectContext {
            execution_id: "exec".into(),
            log,
            working_dir: std::env::temp_dir(),
        }
    }

    fn spec(name: &str) -> EffectSpec {
        EffectSpec {
            name: name.into(),
            args: json!({"message": "checkpoint"}),
            node_path: "orchestration:0/commit:0".into(),
        }
    }

    #[tokio::test]
    async fn test_registered_handler_runs() {
        let mut registry = EffectRegistry::new();
        registry.register("commit", |spec, _ctx| {
            Box::pin(async move {
                let message = spec.args.get("message").cloned().unwrap_or(Value::Null);
                Ok(json!({"committed": message}))
            })
        });

        let result = registry.run(spec("commit"), test_ctx().await).await.unwrap();
        assert_eq!(result, json!({"committed": "checkpoint"}));
    }

    #[tokio::test]
    async fn test_unregistered_effect_is_typed_error() {
        let registry = EffectRegistry::new();
        let err = registry.run(spec("worktree.create"), test_ctx().await).await.unwrap_err();
        assert!(matches!(err, EngineError::UnregisteredEffect(name) if name == "worktree.create"));
    }

    #[tokio::test]
    async fn test_handler_failure_is_wrapped() {
        let mut registry = EffectRegistry::new();
        registry.register("commit", |_spec, _ctx| {
            Box::pin(async move {
                Err(EngineError::AgentFailed {
                    message: "git exploded".into(),
                })
            })
        });

        let err = registry.run(spec("commit"), test_ctx().await).await.unwrap_err();
        assert!(matches!(err, EngineError::EffectFailed { ref name, .. } if name == "commit"));
    }
}
