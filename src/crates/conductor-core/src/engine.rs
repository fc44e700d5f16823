//! The orchestration engine: the outermost loop.
//!
//! Each pass: take a state snapshot, reconcile, persist the frame, run newly
//! visible effects and dispatches, commit the state writes their callbacks
//! queued, repeat. The run ends when a pass finds nothing to do — no new
//! dispatches, no effects, no detached subagents in flight — at which point
//! the frame just written is the terminal frame.
//!
//! Dispatches inside a `parallel` group run concurrently (bounded by the
//! engine's concurrency cap and the governor); everything else runs
//! sequentially in author order. A `subagent` is spawned as a detached task
//! and its result lands in the state cell the author named.

use crate::effects::{EffectContext, EffectRegistry, EffectSpec};
use crate::error::{EngineError, Result};
use crate::frame;
use crate::middleware::{
    logging, rate_limit, schema_finalize, schema_retry, Middleware, MiddlewareChain,
};
use crate::reconcile::{reconcile, DispatchLedger, NodeRecord, ResolvedNode};
use crate::runner::{AgentKind, AgentResult, AgentRunner, InvocationSpec, RunContext};
use crate::state::{StateSnapshot, StateWriter};
use crate::stop::StopCondition;
use crate::tree::{Handlers, NodeKind, PlanNode};
use conductor_governor::Governor;
use conductor_store::{ExecutionLog, ExecutionStatus, InvocationStatus};
use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Engine-level knobs.
#[derive(Clone)]
pub struct EngineConfig {
    /// Reconciliation passes before the run is declared stuck.
    pub max_iterations: u32,
    /// Concurrent dispatches inside parallel groups.
    pub concurrency: usize,
    /// Force parallel groups to run one at a time.
    pub sequential: bool,
    /// Execution-level stop conditions, evaluated after each pass.
    pub global_stop: Vec<StopCondition>,
    /// Global wall-clock limit; lowered onto a `time-limit` stop condition.
    pub time_limit_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            concurrency: 4,
            sequential: false,
            global_stop: Vec::new(),
            time_limit_ms: None,
        }
    }
}

/// Summary of one finished run.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub frames: usize,
    pub invocations: usize,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// The top-level orchestrator.
pub struct Engine {
    log: Arc<ExecutionLog>,
    runner: Arc<dyn AgentRunner>,
    governor: Option<Arc<Governor>>,
    effects: EffectRegistry,
    extra_middlewares: Vec<Middleware>,
    config: EngineConfig,
    cancel: CancellationToken,
    working_dir: PathBuf,
}

impl Engine {
    pub fn new(log: Arc<ExecutionLog>, runner: Arc<dyn AgentRunner>) -> Self {
        Self {
            log,
            runner,
            governor: None,
            effects: EffectRegistry::new(),
            extra_middlewares: Vec::new(),
            config: EngineConfig::default(),
            cancel: CancellationToken::new(),
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn with_governor(mut self, governor: Arc<Governor>) -> Self {
        self.governor = Some(governor);
        self
    }

    pub fn with_effects(mut self, effects: EffectRegistry) -> Self {
        self.effects = effects;
        self
    }

    pub fn with_middleware(mut self, middleware: Middleware) -> Self {
        self.extra_middlewares.push(middleware);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = dir;
        self
    }

    /// Token that cancels the whole run when triggered.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn log(&self) -> &Arc<ExecutionLog> {
        &self.log
    }

    /// Run a plan to completion. The report carries the sealed status; `Err`
    /// is reserved for failures the engine could not even record.
    pub async fn run(
        &self,
        plan: &PlanNode,
        plan_name: &str,
        plan_path: Option<&str>,
    ) -> Result<ExecutionReport> {
        let execution_id = self.log.begin_execution(plan_name, plan_path).await?;
        info!(execution = %execution_id, plan = plan_name, "execution started");

        let outcome = self.run_inner(plan, &execution_id).await;

        let (status, result, error) = match outcome {
            Ok(RunOutcome { status, result }) => (status, result, None),
            Err(EngineError::Cancelled) => (ExecutionStatus::Cancelled, None, Some("cancelled".to_string())),
            Err(e) => {
                error!(execution = %execution_id, error = %e, "execution failed");
                (ExecutionStatus::Failed, None, Some(format!("{}: {}", e.tag(), e)))
            }
        };

        self.log
            .finish_execution(&execution_id, status, result.as_ref())
            .await?;

        let frames = self.log.list_frames(&execution_id).await?.len();
        let invocations = self.log.list_invocations(&execution_id).await?.len();
        info!(execution = %execution_id, status = status.as_str(), frames, invocations, "execution sealed");

        Ok(ExecutionReport {
            execution_id,
            status,
            frames,
            invocations,
            result,
            error,
        })
    }

    async fn run_inner(&self, plan: &PlanNode, execution_id: &str) -> Result<RunOutcome> {
        let mut ledger = DispatchLedger::default();
        let mut detached: JoinSet<DetachedOutcome> = JoinSet::new();
        let mut globals = GlobalProgress::new();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));

        let mut pass: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if pass >= self.config.max_iterations {
                return Err(EngineError::PlanInvalid(format!(
                    "no stabilization after {} reconciliation passes",
                    self.config.max_iterations
                )));
            }
            if let Some(stopped_by) = self.check_global_stops(&globals) {
                info!(execution = %execution_id, condition = %stopped_by, "global stop condition tripped");
                return Ok(RunOutcome {
                    status: ExecutionStatus::Succeeded,
                    result: Some(json!({ "stopped_by": stopped_by })),
                });
            }

            let snapshot = StateSnapshot::new(self.log.state_snapshot(execution_id).await?);
            let resolved = reconcile(plan, &snapshot, &ledger)?;
            let document = frame::serialize(&resolved);
            let frame_index = self.log.append_frame(execution_id, &document).await?;
            debug!(execution = %execution_id, frame = frame_index, pass, "frame appended");

            let mut work = Work::default();
            collect_work(&resolved, &ledger, None, &mut work);

            if work.effects.is_empty() && work.dispatches.is_empty() {
                if detached.is_empty() {
                    // Terminal frame already written; the run has stabilized.
                    break;
                }
                // Only detached subagents remain: wait for one, then
                // re-render so the pass observes its state-cell write.
                tokio::select! {
                    joined = detached.join_next() => {
                        if let Some(joined) = joined {
                            self.absorb_detached(joined, &mut ledger, execution_id, &mut globals).await?;
                        }
                    }
                    _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                }
                pass += 1;
                continue;
            }

            // Effects run sequentially in author order. A failing or
            // unregistered effect is fatal: the host integration is broken.
            for effect in &work.effects {
                ledger.insert(effect.path.clone(), NodeRecord::running(None));
                let spec = EffectSpec {
                    name: effect.name.clone(),
                    args: Value::Object(effect.args.clone()),
                    node_path: effect.path.clone(),
                };
                let ctx = EffectContext {
                    execution_id: execution_id.to_string(),
                    log: Arc::clone(&self.log),
                    working_dir: self.working_dir.clone(),
                };
                let value = self.effects.run(spec, ctx).await?;
                ledger.insert(
                    effect.path.clone(),
                    NodeRecord {
                        status: InvocationStatus::Succeeded,
                        invocation_id: None,
                        output: scalar_summary(&value),
                        error: None,
                    },
                );
            }

            // Detached subagents spawn immediately and outlive the pass.
            for item in &work.dispatches {
                if item.detach_cell.is_none() {
                    continue;
                }
                ledger.insert(item.path.clone(), NodeRecord::running(None));
                if let Some(inner) = &item.inner_path {
                    ledger.insert(inner.clone(), NodeRecord::running(None));
                }
                let future = self.dispatch_future(item.clone(), execution_id.to_string());
                let item = item.clone();
                detached.spawn(async move {
                    let (outcome, invocation_id) = future.await;
                    DetachedOutcome {
                        item,
                        outcome,
                        invocation_id,
                    }
                });
            }

            // Everything else runs now, honoring parallel grouping.
            for unit in schedule(&work.dispatches, self.config.sequential) {
                match unit {
                    Unit::Seq(item) => {
                        let (outcome, invocation_id) =
                            self.dispatch_future(item.clone(), execution_id.to_string()).await;
                        self.settle(execution_id, &item, outcome, invocation_id, &mut ledger, &mut globals)
                            .await?;
                    }
                    Unit::Group(items) => {
                        let futures = items.iter().map(|item| {
                            let semaphore = Arc::clone(&semaphore);
                            let future = self.dispatch_future(item.clone(), execution_id.to_string());
                            async move {
                                let _permit = semaphore.acquire().await.expect("semaphore closed");
                                future.await
                            }
                        });
                        let results = join_all(futures).await;
                        for (item, (outcome, invocation_id)) in items.iter().zip(results) {
                            self.settle(execution_id, item, outcome, invocation_id, &mut ledger, &mut globals)
                                .await?;
                        }
                    }
                }
            }

            // Absorb any detached work that finished meanwhile.
            while let Some(joined) = detached.try_join_next() {
                self.absorb_detached(joined, &mut ledger, execution_id, &mut globals).await?;
            }

            pass += 1;
        }

        let status = if globals.unhandled_failures == 0 {
            ExecutionStatus::Succeeded
        } else {
            ExecutionStatus::Failed
        };
        Ok(RunOutcome {
            status,
            result: None,
        })
    }

    /// Build the future for one dispatch. Everything is owned so the future
    /// can also be spawned as a detached task.
    fn dispatch_future(
        &self,
        item: DispatchItem,
        execution_id: String,
    ) -> impl std::future::Future<Output = (Result<AgentResult>, Option<String>)> + Send + 'static
    {
        let runner = Arc::clone(&self.runner);
        let log = Arc::clone(&self.log);
        let cancel = self.cancel.child_token();
        let chain = self.build_chain();
        async move {
            let spec = match build_spec(&item) {
                Ok(spec) => spec,
                Err(e) => return (Err(e), None),
            };
            let ctx = RunContext::new(execution_id, log).with_cancel(cancel);
            let outcome = chain.execute(runner.as_ref(), spec, &ctx).await;
            let invocation_id = ctx.invocation_id();
            (outcome, invocation_id)
        }
    }

    fn build_chain(&self) -> MiddlewareChain {
        let mut chain = MiddlewareChain::new().with(schema_retry()).with(logging());
        if let Some(governor) = &self.governor {
            chain.push(rate_limit(Arc::clone(governor)));
        }
        for middleware in &self.extra_middlewares {
            chain.push(middleware.clone());
        }
        chain.with(schema_finalize())
    }

    /// Record a finished dispatch: ledger entry, completion callbacks, and
    /// the state writes those callbacks queued.
    async fn settle(
        &self,
        execution_id: &str,
        item: &DispatchItem,
        outcome: Result<AgentResult>,
        invocation_id: Option<String>,
        ledger: &mut DispatchLedger,
        globals: &mut GlobalProgress,
    ) -> Result<()> {
        match outcome {
            Ok(result) => {
                globals.absorb(&result);
                ledger.insert(
                    item.path.clone(),
                    NodeRecord {
                        status: InvocationStatus::Succeeded,
                        invocation_id,
                        output: Some(result.output.clone()),
                        error: None,
                    },
                );
                if let Some(handler) = &item.handlers.on_finished {
                    let mut writer = StateWriter::new(format!("{}:on_finished", item.path));
                    handler(&result, &mut writer);
                    self.commit_writes(execution_id, writer).await?;
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
            Err(e) => {
                warn!(node = %item.path, error = %e, "dispatch failed; execution continues");
                ledger.insert(
                    item.path.clone(),
                    NodeRecord {
                        status: InvocationStatus::Failed,
                        invocation_id,
                        output: None,
                        error: Some(e.to_string()),
                    },
                );
                match &item.handlers.on_error {
                    Some(handler) => {
                        let mut writer = StateWriter::new(format!("{}:on_error", item.path));
                        handler(&e, &mut writer);
                        self.commit_writes(execution_id, writer).await?;
                    }
                    None => globals.unhandled_failures += 1,
                }
                Ok(())
            }
        }
    }

    async fn commit_writes(&self, execution_id: &str, writer: StateWriter) -> Result<()> {
        for write in writer.into_writes() {
            self.log
                .state_set(execution_id, &write.key, &write.value, &write.trigger)
                .await?;
        }
        Ok(())
    }

    /// Fold a completed subagent back in: state cell, ledger, globals.
    async fn absorb_detached(
        &self,
        joined: std::result::Result<DetachedOutcome, tokio::task::JoinError>,
        ledger: &mut DispatchLedger,
        execution_id: &str,
        globals: &mut GlobalProgress,
    ) -> Result<()> {
        let DetachedOutcome {
            item,
            outcome,
            invocation_id,
        } = joined.map_err(|e| EngineError::AgentFailed {
            message: format!("subagent task panicked: {e}"),
        })?;

        let cell = item.detach_cell.clone().unwrap_or_default();
        let (record, cell_value) = match &outcome {
            Ok(result) => (
                NodeRecord {
                    status: InvocationStatus::Succeeded,
                    invocation_id,
                    output: Some(result.output.clone()),
                    error: None,
                },
                json!({ "status": "succeeded", "output": result.output }),
            ),
            Err(e) => (
                NodeRecord {
                    status: InvocationStatus::Failed,
                    invocation_id,
                    output: None,
                    error: Some(e.to_string()),
                },
                json!({ "status": "failed", "error": e.to_string() }),
            ),
        };

        if let Ok(result) = &outcome {
            globals.absorb(result);
        }

        // The parent observes the result on the pass after this commit.
        self.log
            .state_set(execution_id, &cell, &cell_value, &format!("{}:subagent", item.path))
            .await?;
        if let Some(inner) = &item.inner_path {
            ledger.insert(inner.clone(), record.clone());
        }
        ledger.insert(item.path.clone(), record);
        Ok(())
    }

    fn check_global_stops(&self, globals: &GlobalProgress) -> Option<String> {
        let elapsed_ms = globals.started.elapsed().as_millis() as u64;
        if let Some(limit) = self.config.time_limit_ms {
            if elapsed_ms >= limit {
                return Some(format!("time-limit {limit}ms"));
            }
        }
        for condition in &self.config.global_stop {
            let tripped = match condition {
                StopCondition::TokenLimit(n) => globals.output_tokens > *n,
                StopCondition::TimeLimit(ms) => elapsed_ms >= *ms,
                StopCondition::OutputMatches(re) => re.is_match(&globals.text),
                StopCondition::TurnLimit(_) => false,
                StopCondition::Custom { predicate, .. } => {
                    let mut partial = AgentResult::completed(globals.text.clone());
                    partial.tokens_used.output = globals.output_tokens;
                    predicate(&partial)
                }
            };
            if tripped {
                return Some(condition.describe());
            }
        }
        None
    }
}

struct RunOutcome {
    status: ExecutionStatus,
    result: Option<Value>,
}

/// Execution-level accumulators for global stop conditions.
struct GlobalProgress {
    started: Instant,
    text: String,
    output_tokens: u64,
    unhandled_failures: u32,
}

impl GlobalProgress {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            text: String::new(),
            output_tokens: 0,
            unhandled_failures: 0,
        }
    }

    fn absorb(&mut self, result: &AgentResult) {
        self.text.push_str(&result.output);
        self.output_tokens += result.tokens_used.output;
    }
}

struct DetachedOutcome {
    item: DispatchItem,
    outcome: Result<AgentResult>,
    invocation_id: Option<String>,
}

/// One dispatchable agent node, lifted out of the resolved tree.
#[derive(Clone)]
struct DispatchItem {
    path: String,
    kind: AgentKind,
    prompt: String,
    props: Map<String, Value>,
    handlers: Handlers,
    /// Target state cell for subagent results.
    detach_cell: Option<String>,
    /// Path of the agent leaf inside a subagent wrapper.
    inner_path: Option<String>,
    /// Nearest enclosing parallel group, when any.
    group: Option<String>,
}

#[derive(Default)]
struct Work {
    effects: Vec<EffectItem>,
    dispatches: Vec<DispatchItem>,
}

struct EffectItem {
    path: String,
    name: String,
    args: Map<String, Value>,
}

/// Walk the resolved tree collecting not-yet-run effects and dispatches, in
/// document order.
fn collect_work(
    node: &ResolvedNode,
    ledger: &DispatchLedger,
    group: Option<&str>,
    out: &mut Work,
) {
    match node.kind {
        NodeKind::Agent(kind) => {
            if ledger.get(&node.path).is_none() {
                out.dispatches.push(DispatchItem {
                    path: node.path.clone(),
                    kind,
                    prompt: node.prompt.clone().unwrap_or_default(),
                    props: node.props.clone(),
                    handlers: node.handlers.clone(),
                    detach_cell: None,
                    inner_path: None,
                    group: group.map(str::to_string),
                });
            }
        }
        NodeKind::Subagent => {
            if ledger.get(&node.path).is_none() {
                let Some(inner) = node.children.iter().find(|c| c.kind.is_agent()) else {
                    return;
                };
                let NodeKind::Agent(kind) = inner.kind else { return };
                let cell = node
                    .props
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("subagent")
                    .to_string();
                // Merge: the inner agent's props carry the dispatch options.
                let mut props = inner.props.clone();
                for (k, v) in &node.props {
                    props.entry(k.clone()).or_insert_with(|| v.clone());
                }
                out.dispatches.push(DispatchItem {
                    path: node.path.clone(),
                    kind,
                    prompt: inner.prompt.clone().unwrap_or_default(),
                    props,
                    handlers: node.handlers.clone(),
                    detach_cell: Some(cell),
                    inner_path: Some(inner.path.clone()),
                    group: group.map(str::to_string),
                });
            }
            // Never descend: the inner agent is dispatched via the wrapper.
        }
        NodeKind::Worktree | NodeKind::Review | NodeKind::Commit | NodeKind::Snapshot => {
            if ledger.get(&node.path).is_none() {
                out.effects.push(EffectItem {
                    path: node.path.clone(),
                    name: effect_name(node),
                    args: node.props.clone(),
                });
            }
        }
        NodeKind::Parallel => {
            for child in &node.children {
                collect_work(child, ledger, Some(&node.path), out);
            }
        }
        _ => {
            for child in &node.children {
                collect_work(child, ledger, group, out);
            }
        }
    }
}

/// Short text form of an effect result for frame content.
fn scalar_summary(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Handler name for an effect node.
fn effect_name(node: &ResolvedNode) -> String {
    match node.kind {
        NodeKind::Commit => "commit".to_string(),
        NodeKind::Snapshot => "snapshot".to_string(),
        NodeKind::Review => "review.post".to_string(),
        NodeKind::Worktree => {
            match node.props.get("action").and_then(Value::as_str) {
                Some("remove") => "worktree.remove".to_string(),
                _ => "worktree.create".to_string(),
            }
        }
        _ => node.kind.tag().to_string(),
    }
}

enum Unit {
    Seq(DispatchItem),
    Group(Vec<DispatchItem>),
}

/// Order dispatches into execution units: consecutive members of the same
/// parallel group coalesce, everything else stays sequential.
fn schedule(dispatches: &[DispatchItem], force_sequential: bool) -> Vec<Unit> {
    let mut units: Vec<Unit> = Vec::new();
    for item in dispatches {
        if item.detach_cell.is_some() {
            continue; // already spawned detached
        }
        if force_sequential || item.group.is_none() {
            units.push(Unit::Seq(item.clone()));
            continue;
        }
        match units.last_mut() {
            Some(Unit::Group(members))
                if members
                    .first()
                    .map(|m| m.group == item.group)
                    .unwrap_or(false) =>
            {
                members.push(item.clone());
            }
            _ => units.push(Unit::Group(vec![item.clone()])),
        }
    }
    units
}

/// Build an invocation spec from a dispatch item's props.
fn build_spec(item: &DispatchItem) -> Result<InvocationSpec> {
    let props = &item.props;
    let mut spec = InvocationSpec::new(item.kind, item.prompt.clone());

    if let Some(model) = props.get("model").and_then(Value::as_str) {
        spec.model = Some(model.to_string());
    }
    if let Some(system) = props.get("system_prompt").and_then(Value::as_str) {
        spec.system_prompt = Some(system.to_string());
    }
    if let Some(schema) = props.get("schema") {
        spec.schema = Some(schema.clone());
        spec.schema_retries = props
            .get("schema_retries")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
    }
    if let Some(n) = props.get("token_limit").and_then(Value::as_u64) {
        spec.stop_conditions.push(StopCondition::TokenLimit(n));
    }
    if let Some(ms) = props.get("time_limit_ms").and_then(Value::as_u64) {
        spec.stop_conditions.push(StopCondition::TimeLimit(ms));
    }
    if let Some(n) = props.get("turn_limit").and_then(Value::as_u64) {
        spec.stop_conditions.push(StopCondition::TurnLimit(n as u32));
    }
    if let Some(pattern) = props.get("output_matches").and_then(Value::as_str) {
        let condition = StopCondition::output_matches(pattern)
            .map_err(|e| EngineError::PlanInvalid(format!("bad output_matches pattern: {e}")))?;
        spec.stop_conditions.push(condition);
    }
    if let Some(ms) = props.get("timeout_ms").and_then(Value::as_u64) {
        spec.timeout_ms = Some(ms);
    }
    if let Some(dir) = props.get("cwd").and_then(Value::as_str) {
        spec.working_dir = Some(PathBuf::from(dir));
    }
    if let Some(true) = props.get("use_subscription").and_then(Value::as_bool) {
        spec.use_subscription = true;
    }
    spec.options = props.clone();
    Ok(spec)
}
