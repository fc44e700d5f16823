//! # conductor-core - Plan Tree, Reconciler, and Engine
//!
//! The execution core of the conductor runtime. It turns a declarative plan
//! tree into a stream of persisted frames, driving external AI coding agents
//! through phased, possibly concurrent work.
//!
//! ## The render loop
//!
//! A plan is a rose tree of [`PlanNode`]s ([`tree`]). Each reconciliation
//! pass ([`reconcile`]) is a pure function of the plan plus a state-cell
//! snapshot from the execution log: function components run, predicates
//! elide subtrees, and every node gets a stable path. The engine
//! ([`engine::Engine`]) persists each pass as an XML frame ([`frame`]),
//! dispatches newly visible agent nodes through the middleware chain
//! ([`middleware`]) to the configured [`AgentRunner`], commits the state
//! writes their callbacks queue, and repeats until a pass finds nothing left
//! to do.
//!
//! Control flow is always expressed through state cells: callbacks write,
//! the next pass observes. There is no hidden scheduling.
//!
//! ## Dispatch path
//!
//! ```text
//! engine ─► schema_retry ─► logging ─► rate_limit ─► schema_finalize ─► runner
//!                │              │            │                │
//!                │              ▼            ▼                ▼
//!                │         invocation    governor      JSON extract +
//!                │            rows        acquire      schema validate
//!                ▼
//!         re-dispatch with resume hint on validation failure
//! ```
//!
//! The runner seam ([`runner::AgentRunner`]) is implemented by the process
//! supervisor in `conductor-agents` and by the scripted [`mock::MockRunner`]
//! for tests and `--mock` runs.

pub mod effects;
pub mod engine;
pub mod error;
pub mod events;
pub mod frame;
pub mod json_extract;
pub mod middleware;
pub mod mock;
pub mod reconcile;
pub mod runner;
pub mod state;
pub mod stop;
pub mod tree;

pub use effects::{EffectContext, EffectHandler, EffectRegistry, EffectSpec};
pub use engine::{Engine, EngineConfig, ExecutionReport};
pub use error::{EngineError, Result};
pub use events::{StreamEvent, StreamEventKind};
pub use json_extract::extract_json;
pub use middleware::{
    logging, rate_limit, retry, retry_with, schema_finalize, schema_retry, validate_structured,
    Middleware, MiddlewareChain, Next, RetryBackoff,
};
pub use mock::{MockResponse, MockRunner};
pub use reconcile::{reconcile, DispatchLedger, NodeRecord, ResolvedNode};
pub use runner::{
    AgentKind, AgentResult, AgentRunner, InvocationSpec, RunContext, StopReason, TokensUsed,
};
pub use state::{StateSnapshot, StateWrite, StateWriter};
pub use stop::{StopCondition, StopEvaluator, StopTrigger};
pub use tree::{Handlers, NodeKind, PlanNode, Predicate, RenderContext};
