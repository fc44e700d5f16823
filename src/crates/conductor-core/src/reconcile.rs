//! Reconciliation: from author tree + state snapshot to a primitive tree.
//!
//! Each pass is a pure function of `(plan, state snapshot, dispatch ledger)`.
//! Function components are invoked, transparent nodes are spliced, predicates
//! elide subtrees, and every remaining node gets a stable path derived from
//! author keys or position among same-kind siblings. The engine iterates
//! passes until the serialized tree stops changing.
//!
//! Control flow never happens *inside* a pass: plan code writes state cells
//! and returns, and the next pass observes the writes.

use crate::error::{EngineError, Result};
use crate::state::StateSnapshot;
use crate::tree::{Handlers, NodeKind, PlanNode, RenderContext};
use conductor_store::InvocationStatus;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Components nested deeper than this are assumed cyclic.
const MAX_COMPONENT_DEPTH: usize = 64;

/// What the engine remembers about a dispatched node or executed effect,
/// keyed by resolved path. Derived state: the store rows are authoritative.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub status: InvocationStatus,
    pub invocation_id: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl NodeRecord {
    pub fn running(invocation_id: Option<String>) -> Self {
        Self {
            status: InvocationStatus::Running,
            invocation_id,
            output: None,
            error: None,
        }
    }
}

/// Dispatch statuses across passes. A finished node stays in the ledger so
/// re-evaluation is idempotent: it renders with its result and never
/// re-dispatches.
#[derive(Debug, Clone, Default)]
pub struct DispatchLedger {
    records: HashMap<String, NodeRecord>,
}

impl DispatchLedger {
    pub fn get(&self, path: &str) -> Option<&NodeRecord> {
        self.records.get(path)
    }

    pub fn insert(&mut self, path: impl Into<String>, record: NodeRecord) {
        self.records.insert(path.into(), record);
    }

    pub fn status(&self, path: &str) -> Option<InvocationStatus> {
        self.records.get(path).map(|r| r.status)
    }

    /// True when any record is still pending or running.
    pub fn has_active(&self) -> bool {
        self.records.values().any(|r| {
            matches!(
                r.status,
                InvocationStatus::Pending | InvocationStatus::Running
            )
        })
    }
}

/// A reconciled node: only primitive kinds, annotated with path and status.
#[derive(Clone)]
pub struct ResolvedNode {
    pub kind: NodeKind,
    /// Stable identity: parent path plus key or kind:index segment.
    pub path: String,
    pub key: Option<String>,
    pub props: Map<String, Value>,
    /// Literal content for text nodes.
    pub text: Option<String>,
    /// Prompt for agent leaves (joined text children or `prompt` prop).
    pub prompt: Option<String>,
    /// Dispatch or effect status, for dispatchable kinds.
    pub status: Option<InvocationStatus>,
    /// Final output of a finished dispatch.
    pub output: Option<String>,
    pub children: Vec<ResolvedNode>,
    pub handlers: Handlers,
}

impl ResolvedNode {
    pub fn is_dispatchable(&self) -> bool {
        self.kind.is_agent() || self.kind == NodeKind::Subagent
    }

    /// Depth-first walk over the resolved tree.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a ResolvedNode)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }
}

impl std::fmt::Debug for ResolvedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedNode")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("status", &self.status)
            .field("children", &self.children.len())
            .finish_non_exhaustive()
    }
}

/// Render one pass. Returns a single root; plans whose root resolves to
/// multiple nodes get an implicit `orchestration` wrapper.
pub fn reconcile(
    plan: &PlanNode,
    state: &StateSnapshot,
    ledger: &DispatchLedger,
) -> Result<ResolvedNode> {
    let mut counters = SiblingCounters::default();
    let mut resolved = resolve_node(plan, state, ledger, "", &mut counters, 0)?;
    match resolved.len() {
        1 => Ok(resolved.remove(0)),
        _ => {
            let mut counters = SiblingCounters::default();
            let root = PlanNode::new(NodeKind::Orchestration);
            let mut wrapper = materialize(&root, state, ledger, "", &mut counters)?;
            wrapper.children = resolved;
            Ok(wrapper)
        }
    }
}

/// Per-parent counters assigning positional indices among same-kind siblings.
#[derive(Default)]
struct SiblingCounters {
    counts: HashMap<&'static str, usize>,
}

impl SiblingCounters {
    fn next(&mut self, tag: &'static str) -> usize {
        let counter = self.counts.entry(tag).or_insert(0);
        let index = *counter;
        *counter += 1;
        index
    }
}

/// Resolve one author node into zero or more reconciled nodes (transparent
/// kinds splice; elided predicates produce nothing).
fn resolve_node(
    node: &PlanNode,
    state: &StateSnapshot,
    ledger: &DispatchLedger,
    parent_path: &str,
    counters: &mut SiblingCounters,
    depth: usize,
) -> Result<Vec<ResolvedNode>> {
    if depth > MAX_COMPONENT_DEPTH {
        return Err(EngineError::PlanInvalid(format!(
            "component nesting exceeds {MAX_COMPONENT_DEPTH} levels; cyclic definition?"
        )));
    }

    if let Some(condition) = &node.condition {
        if !condition.evaluate(state) {
            return Ok(Vec::new());
        }
    }
    if let Some(skip_if) = &node.skip_if {
        if skip_if.evaluate(state) {
            return Ok(Vec::new());
        }
    }

    match node.kind {
        // Transparent: splice children into the parent.
        NodeKind::Fragment => {
            let mut out = Vec::new();
            for child in node.children.iter().flatten() {
                out.extend(resolve_node(child, state, ledger, parent_path, counters, depth + 1)?);
            }
            Ok(out)
        }

        // Invoke the function and splice what it returns.
        NodeKind::Component => {
            let render = node.component.as_ref().ok_or_else(|| {
                EngineError::PlanInvalid("component node without a render function".into())
            })?;
            let ctx = RenderContext { state };
            let rendered = render(&node.props, &ctx);
            let mut out = Vec::new();
            for child in rendered.iter().flatten() {
                out.extend(resolve_node(child, state, ledger, parent_path, counters, depth + 1)?);
            }
            Ok(out)
        }

        // Loop: repeat children `times` times; iterations become ordinary
        // repeated siblings, so positional identity stays stable.
        NodeKind::Loop => {
            let mut resolved = materialize(node, state, ledger, parent_path, counters)?;
            let times = node
                .props
                .get("times")
                .and_then(Value::as_u64)
                .unwrap_or(1);
            let mut child_counters = SiblingCounters::default();
            let mut children = Vec::new();
            for _ in 0..times {
                for child in node.children.iter().flatten() {
                    children.extend(resolve_node(
                        child,
                        state,
                        ledger,
                        &resolved.path,
                        &mut child_counters,
                        depth + 1,
                    )?);
                }
            }
            resolved.children = children;
            Ok(vec![resolved])
        }

        _ => {
            let mut resolved = materialize(node, state, ledger, parent_path, counters)?;
            if !node.kind.is_agent() {
                let mut child_counters = SiblingCounters::default();
                let mut children = Vec::new();
                for child in node.children.iter().flatten() {
                    children.extend(resolve_node(
                        child,
                        state,
                        ledger,
                        &resolved.path,
                        &mut child_counters,
                        depth + 1,
                    )?);
                }
                resolved.children = children;
            }
            Ok(vec![resolved])
        }
    }
}

/// Build the resolved form of a non-transparent node (children not yet
/// attached).
fn materialize(
    node: &PlanNode,
    _state: &StateSnapshot,
    ledger: &DispatchLedger,
    parent_path: &str,
    counters: &mut SiblingCounters,
) -> Result<ResolvedNode> {
    let tag = node.kind.tag();
    let segment = match &node.key {
        Some(key) => format!("{tag}@{key}"),
        None => format!("{tag}:{}", counters.next(tag)),
    };
    let path = if parent_path.is_empty() {
        segment
    } else {
        format!("{parent_path}/{segment}")
    };

    let record = ledger.get(&path);

    let prompt = if node.kind.is_agent() {
        let text = node.child_text();
        Some(match node.prop_str("prompt") {
            Some(p) => p.to_string(),
            None => text,
        })
    } else {
        None
    };

    let status = if node.kind.is_agent() || node.kind.is_effect() || node.kind == NodeKind::Subagent
    {
        Some(record.map(|r| r.status).unwrap_or(InvocationStatus::Pending))
    } else {
        None
    };

    Ok(ResolvedNode {
        kind: node.kind,
        path,
        key: node.key.clone(),
        props: node.props.clone(),
        text: node.text.clone(),
        prompt,
        status,
        output: record.and_then(|r| r.output.clone()),
        children: Vec::new(),
        handlers: node.handlers.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::AgentKind;
    use crate::tree::Predicate;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Arc;

    fn state_with(key: &str, value: Value) -> StateSnapshot {
        let mut cells = StdHashMap::new();
        cells.insert(key.to_string(), value);
        StateSnapshot::new(cells)
    }

    #[test]
    fn test_single_agent_root() {
        let plan = PlanNode::agent(AgentKind::Claude, "Say hello.");
        let resolved = reconcile(&plan, &StateSnapshot::default(), &DispatchLedger::default()).unwrap();
        assert_eq!(resolved.kind, NodeKind::Agent(AgentKind::Claude));
        assert_eq!(resolved.path, "claude:0");
        assert_eq!(resolved.prompt.as_deref(), Some("Say hello."));
        assert_eq!(resolved.status, Some(InvocationStatus::Pending));
        assert!(resolved.children.is_empty());
    }

    #[test]
    fn test_paths_stable_across_passes() {
        let plan = PlanNode::orchestration(vec![
            PlanNode::phase("a", vec![PlanNode::agent(AgentKind::Claude, "A")]),
            PlanNode::phase("b", vec![PlanNode::agent(AgentKind::Claude, "B")]),
        ]);
        let state = StateSnapshot::default();
        let ledger = DispatchLedger::default();

        let first = reconcile(&plan, &state, &ledger).unwrap();
        let second = reconcile(&plan, &state, &ledger).unwrap();

        let paths = |root: &ResolvedNode| {
            let mut out = Vec::new();
            root.walk(&mut |n| out.push(n.path.clone()));
            out
        };
        assert_eq!(paths(&first), paths(&second));
        assert_eq!(first.children[0].path, "orchestration:0/phase:0");
        assert_eq!(first.children[1].path, "orchestration:0/phase:1");
        assert_eq!(
            first.children[1].children[0].path,
            "orchestration:0/phase:1/claude:0"
        );
    }

    #[test]
    fn test_author_keys_override_position() {
        let plan = PlanNode::orchestration(vec![
            PlanNode::agent(AgentKind::Claude, "x").with_key("writer"),
        ]);
        let resolved = reconcile(&plan, &StateSnapshot::default(), &DispatchLedger::default()).unwrap();
        assert_eq!(resolved.children[0].path, "orchestration:0/claude@writer");
    }

    #[test]
    fn test_condition_elides_subtree() {
        let plan = PlanNode::orchestration(vec![
            PlanNode::phase("a", vec![PlanNode::agent(AgentKind::Claude, "A")]),
            PlanNode::phase("b", vec![PlanNode::agent(AgentKind::Claude, "B")])
                .with_condition(Predicate::state_equals("phase", json!("b"))),
        ]);

        let hidden = reconcile(&plan, &StateSnapshot::default(), &DispatchLedger::default()).unwrap();
        assert_eq!(hidden.children.len(), 1);

        let shown = reconcile(&plan, &state_with("phase", json!("b")), &DispatchLedger::default()).unwrap();
        assert_eq!(shown.children.len(), 2);
    }

    #[test]
    fn test_skip_if_elides_subtree() {
        let plan = PlanNode::orchestration(vec![
            PlanNode::agent(AgentKind::Claude, "x")
                .with_skip_if(Predicate::state_exists("done")),
        ]);
        let shown = reconcile(&plan, &StateSnapshot::default(), &DispatchLedger::default()).unwrap();
        assert_eq!(shown.children.len(), 1);

        let hidden = reconcile(&plan, &state_with("done", json!(true)), &DispatchLedger::default()).unwrap();
        assert_eq!(hidden.children.len(), 0);
    }

    #[test]
    fn test_fragment_is_transparent() {
        let plan = PlanNode::orchestration(vec![PlanNode::fragment(vec![
            PlanNode::agent(AgentKind::Claude, "a"),
            PlanNode::agent(AgentKind::Claude, "b"),
        ])]);
        let resolved = reconcile(&plan, &StateSnapshot::default(), &DispatchLedger::default()).unwrap();
        assert_eq!(resolved.children.len(), 2);
        assert_eq!(resolved.children[0].path, "orchestration:0/claude:0");
        assert_eq!(resolved.children[1].path, "orchestration:0/claude:1");
    }

    #[test]
    fn test_component_renders_and_splices() {
        let component = PlanNode::component(Arc::new(|props, ctx| {
            let phase = ctx.state.get_str("phase").unwrap_or("a");
            let label = props.get("label").and_then(Value::as_str).unwrap_or("?");
            vec![
                Some(PlanNode::agent(AgentKind::Claude, format!("{label}:{phase}"))),
                None,
            ]
        }))
        .with_prop("label", json!("task"));

        let plan = PlanNode::orchestration(vec![component]);
        let resolved = reconcile(&plan, &state_with("phase", json!("b")), &DispatchLedger::default()).unwrap();
        assert_eq!(resolved.children.len(), 1);
        assert_eq!(resolved.children[0].prompt.as_deref(), Some("task:b"));
    }

    #[test]
    fn test_component_without_function_is_invalid() {
        let plan = PlanNode::new(NodeKind::Component);
        let err = reconcile(&plan, &StateSnapshot::default(), &DispatchLedger::default()).unwrap_err();
        assert_eq!(err.tag(), "plan.invalid");
    }

    #[test]
    fn test_cyclic_component_detected() {
        // A component that renders itself forever.
        fn recursive() -> PlanNode {
            PlanNode::component(Arc::new(|_, _| vec![Some(recursive())]))
        }
        let err = reconcile(&recursive(), &StateSnapshot::default(), &DispatchLedger::default())
            .unwrap_err();
        assert_eq!(err.tag(), "plan.invalid");
    }

    #[test]
    fn test_loop_times_repeats_children_with_distinct_paths() {
        let plan = PlanNode::loop_times(3, vec![PlanNode::agent(AgentKind::Claude, "go")]);
        let resolved = reconcile(&plan, &StateSnapshot::default(), &DispatchLedger::default()).unwrap();
        assert_eq!(resolved.kind, NodeKind::Loop);
        assert_eq!(resolved.children.len(), 3);
        let paths: Vec<&str> = resolved.children.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["loop:0/claude:0", "loop:0/claude:1", "loop:0/claude:2"]);
    }

    #[test]
    fn test_ledger_status_flows_into_resolved_nodes() {
        let plan = PlanNode::agent(AgentKind::Claude, "Say hello.");
        let mut ledger = DispatchLedger::default();
        ledger.insert(
            "claude:0",
            NodeRecord {
                status: InvocationStatus::Succeeded,
                invocation_id: Some("inv-1".into()),
                output: Some("Hello!".into()),
                error: None,
            },
        );
        let resolved = reconcile(&plan, &StateSnapshot::default(), &ledger).unwrap();
        assert_eq!(resolved.status, Some(InvocationStatus::Succeeded));
        assert_eq!(resolved.output.as_deref(), Some("Hello!"));
    }

    #[test]
    fn test_multiple_roots_get_implicit_wrapper() {
        let plan = PlanNode::fragment(vec![
            PlanNode::agent(AgentKind::Claude, "a"),
            PlanNode::agent(AgentKind::Claude, "b"),
        ]);
        let resolved = reconcile(&plan, &StateSnapshot::default(), &DispatchLedger::default()).unwrap();
        assert_eq!(resolved.kind, NodeKind::Orchestration);
        assert_eq!(resolved.children.len(), 2);
    }
}
