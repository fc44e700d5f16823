//! The plan tree: what authors hand the engine.
//!
//! A plan is a rose tree of [`PlanNode`]s. Each node carries a kind tag from
//! a small closed set, a JSON props map, and children as `Vec<Option<PlanNode>>`
//! (conditional authoring produces `None`s; they are filtered before
//! reconciliation). `Fragment` nodes and function components are transparent:
//! they splice their rendered children into the parent.
//!
//! How the tree is *authored* is out of scope here; the CLI's YAML loader and
//! the builder methods on [`PlanNode`] both produce this resolved form.

use crate::runner::{AgentKind, AgentResult};
use crate::state::{StateSnapshot, StateWriter};
use crate::error::EngineError;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Kind tag for a plan node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Root wrapper for a whole plan.
    Orchestration,
    /// A named sequential stage.
    Phase,
    /// A small unit of work inside a phase.
    Step,
    /// Marks immediate children as eligible for concurrent dispatch.
    Parallel,
    /// A detached dispatch whose output lands in a named state cell.
    Subagent,
    /// Repeats its children.
    Loop,
    /// A dispatchable agent leaf.
    Agent(AgentKind),
    /// Effect: create or remove a git worktree.
    Worktree,
    /// Effect: post a review.
    Review,
    /// Effect: commit the working tree.
    Commit,
    /// Effect: record a snapshot of the working tree.
    Snapshot,
    /// Transparent grouping node.
    Fragment,
    /// Literal text content.
    Text,
    /// A function component; renders to a subtree.
    Component,
}

impl NodeKind {
    /// The element name used in serialized frames. Transparent kinds never
    /// appear in frames.
    pub fn tag(&self) -> &'static str {
        match self {
            NodeKind::Orchestration => "orchestration",
            NodeKind::Phase => "phase",
            NodeKind::Step => "step",
            NodeKind::Parallel => "parallel",
            NodeKind::Subagent => "subagent",
            NodeKind::Loop => "loop",
            NodeKind::Agent(kind) => kind.as_str(),
            NodeKind::Worktree => "worktree",
            NodeKind::Review => "review",
            NodeKind::Commit => "commit",
            NodeKind::Snapshot => "snapshot",
            NodeKind::Fragment => "fragment",
            NodeKind::Text => "text",
            NodeKind::Component => "component",
        }
    }

    pub fn is_effect(&self) -> bool {
        matches!(
            self,
            NodeKind::Worktree | NodeKind::Review | NodeKind::Commit | NodeKind::Snapshot
        )
    }

    pub fn is_agent(&self) -> bool {
        matches!(self, NodeKind::Agent(_))
    }
}

/// Predicate over the state snapshot, used by `condition` / `skip_if`.
#[derive(Clone)]
pub enum Predicate {
    /// True when the cell exists and equals the value.
    StateEquals { key: String, value: Value },
    /// True when the cell exists at all.
    StateExists { key: String },
    /// Arbitrary code predicate.
    Custom(Arc<dyn Fn(&StateSnapshot) -> bool + Send + Sync>),
}

impl Predicate {
    pub fn state_equals(key: impl Into<String>, value: Value) -> Self {
        Predicate::StateEquals {
            key: key.into(),
            value,
        }
    }

    pub fn state_exists(key: impl Into<String>) -> Self {
        Predicate::StateExists { key: key.into() }
    }

    pub fn evaluate(&self, state: &StateSnapshot) -> bool {
        match self {
            Predicate::StateEquals { key, value } => state.get(key) == Some(value),
            Predicate::StateExists { key } => state.contains(key),
            Predicate::Custom(f) => f(state),
        }
    }
}

impl std::fmt::Debug for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Predicate::StateEquals { key, value } => write!(f, "state[{key}] == {value}"),
            Predicate::StateExists { key } => write!(f, "state[{key}] exists"),
            Predicate::Custom(_) => write!(f, "<custom>"),
        }
    }
}

/// Callback when a node's dispatch finished successfully.
pub type FinishHandler = Arc<dyn Fn(&AgentResult, &mut StateWriter) + Send + Sync>;

/// Callback when a node's dispatch failed.
pub type ErrorHandler = Arc<dyn Fn(&EngineError, &mut StateWriter) + Send + Sync>;

/// Completion callbacks attached to a dispatchable node.
#[derive(Clone, Default)]
pub struct Handlers {
    pub on_finished: Option<FinishHandler>,
    pub on_error: Option<ErrorHandler>,
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("on_finished", &self.on_finished.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Context handed to function components at render time. Components read
/// state and return children; they must not block.
pub struct RenderContext<'a> {
    pub state: &'a StateSnapshot,
}

/// A function component body.
pub type ComponentFn =
    Arc<dyn Fn(&Map<String, Value>, &RenderContext<'_>) -> Vec<Option<PlanNode>> + Send + Sync>;

/// One node of the author's plan tree.
#[derive(Clone)]
pub struct PlanNode {
    pub kind: NodeKind,
    /// Author-provided stability key; falls back to position among
    /// same-kind siblings.
    pub key: Option<String>,
    pub props: Map<String, Value>,
    pub children: Vec<Option<PlanNode>>,
    /// Literal content for `Text` nodes.
    pub text: Option<String>,
    /// Render function for `Component` nodes.
    pub component: Option<ComponentFn>,
    /// Elide the subtree when this is false.
    pub condition: Option<Predicate>,
    /// Elide the subtree when this is true.
    pub skip_if: Option<Predicate>,
    pub handlers: Handlers,
}

impl PlanNode {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            key: None,
            props: Map::new(),
            children: Vec::new(),
            text: None,
            component: None,
            condition: None,
            skip_if: None,
            handlers: Handlers::default(),
        }
    }

    // --- constructors ---

    pub fn orchestration(children: Vec<PlanNode>) -> Self {
        Self::new(NodeKind::Orchestration).with_children(children)
    }

    pub fn phase(name: impl Into<String>, children: Vec<PlanNode>) -> Self {
        Self::new(NodeKind::Phase)
            .with_prop("name", Value::String(name.into()))
            .with_children(children)
    }

    pub fn step(children: Vec<PlanNode>) -> Self {
        Self::new(NodeKind::Step).with_children(children)
    }

    pub fn parallel(children: Vec<PlanNode>) -> Self {
        Self::new(NodeKind::Parallel).with_children(children)
    }

    pub fn fragment(children: Vec<PlanNode>) -> Self {
        Self::new(NodeKind::Fragment).with_children(children)
    }

    /// An agent leaf whose prompt is the given text.
    pub fn agent(kind: AgentKind, prompt: impl Into<String>) -> Self {
        Self::new(NodeKind::Agent(kind)).with_child(Self::text(prompt))
    }

    pub fn text(content: impl Into<String>) -> Self {
        let mut node = Self::new(NodeKind::Text);
        node.text = Some(content.into());
        node
    }

    /// A detached dispatch whose result lands in the `name` state cell.
    pub fn subagent(name: impl Into<String>, agent: PlanNode) -> Self {
        Self::new(NodeKind::Subagent)
            .with_prop("name", Value::String(name.into()))
            .with_child(agent)
    }

    pub fn loop_times(times: u64, children: Vec<PlanNode>) -> Self {
        Self::new(NodeKind::Loop)
            .with_prop("times", Value::from(times))
            .with_children(children)
    }

    pub fn commit(message: impl Into<String>) -> Self {
        Self::new(NodeKind::Commit).with_prop("message", Value::String(message.into()))
    }

    pub fn component(render: ComponentFn) -> Self {
        let mut node = Self::new(NodeKind::Component);
        node.component = Some(render);
        node
    }

    // --- builders ---

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: Value) -> Self {
        self.props.insert(key.into(), value);
        self
    }

    pub fn with_child(mut self, child: PlanNode) -> Self {
        self.children.push(Some(child));
        self
    }

    pub fn with_children(mut self, children: Vec<PlanNode>) -> Self {
        self.children.extend(children.into_iter().map(Some));
        self
    }

    /// Children including explicit holes (conditional authoring).
    pub fn with_optional_children(mut self, children: Vec<Option<PlanNode>>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn with_condition(mut self, predicate: Predicate) -> Self {
        self.condition = Some(predicate);
        self
    }

    pub fn with_skip_if(mut self, predicate: Predicate) -> Self {
        self.skip_if = Some(predicate);
        self
    }

    pub fn on_finished(mut self, handler: FinishHandler) -> Self {
        self.handlers.on_finished = Some(handler);
        self
    }

    pub fn on_error(mut self, handler: ErrorHandler) -> Self {
        self.handlers.on_error = Some(handler);
        self
    }

    /// String prop accessor.
    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.props.get(key).and_then(Value::as_str)
    }

    /// Concatenated text of direct `Text` children; the default prompt for
    /// agent nodes without a `prompt` prop.
    pub fn child_text(&self) -> String {
        self.children
            .iter()
            .flatten()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }
}

impl std::fmt::Debug for PlanNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanNode")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("props", &self.props)
            .field("children", &self.children.iter().flatten().count())
            .finish_non_exhaustive()
    }
}
