//! YAML plan documents.
//!
//! The core consumes a resolved [`PlanNode`] tree; this loader is the CLI's
//! way of producing one from a file. The document mirrors the tree shape:
//!
//! ```yaml
//! name: phased-work
//! root:
//!   kind: orchestration
//!   children:
//!     - kind: phase
//!       props: { name: a }
//!       children:
//!         - kind: claude
//!           prompt: "do A"
//!           props: { model: claude-sonnet-4 }
//!           on_finished_set: { phase: b }
//!     - kind: phase
//!       props: { name: b }
//!       condition: { key: phase, equals: b }
//!       children:
//!         - kind: claude
//!           prompt: "do B"
//! ```
//!
//! Declarative `on_finished_set` / `on_error_set` maps compile into the
//! state-writing callbacks that drive cross-phase control flow. Function
//! components stay API-only; an authoring language is not this loader's job.

use conductor_core::{AgentKind, EngineError, NodeKind, PlanNode, Predicate, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct PlanDoc {
    #[serde(default)]
    name: Option<String>,
    root: NodeDoc,
}

#[derive(Debug, Deserialize)]
struct NodeDoc {
    kind: String,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    props: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    children: Vec<NodeDoc>,
    #[serde(default)]
    condition: Option<PredicateDoc>,
    #[serde(default)]
    skip_if: Option<PredicateDoc>,
    #[serde(default)]
    on_finished_set: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    on_error_set: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct PredicateDoc {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    equals: Option<Value>,
    #[serde(default)]
    exists: Option<String>,
}

/// A loaded plan: logical name plus the resolved tree.
#[derive(Debug)]
pub struct LoadedPlan {
    pub name: String,
    pub root: PlanNode,
}

/// Load a plan document from disk.
pub fn load(path: &Path) -> Result<LoadedPlan> {
    let source = std::fs::read_to_string(path).map_err(|e| {
        EngineError::PlanInvalid(format!("cannot read {}: {e}", path.display()))
    })?;
    let doc: PlanDoc = serde_yaml::from_str(&source)
        .map_err(|e| EngineError::PlanInvalid(format!("malformed plan document: {e}")))?;

    let name = doc.name.unwrap_or_else(|| {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "plan".to_string())
    });
    Ok(LoadedPlan {
        name,
        root: build_node(&doc.root)?,
    })
}

fn build_node(doc: &NodeDoc) -> Result<PlanNode> {
    let kind = parse_kind(&doc.kind)?;
    let mut node = PlanNode::new(kind);
    node.key = doc.key.clone();

    if let Some(props) = &doc.props {
        for (key, value) in props {
            node.props.insert(key.clone(), value.clone());
        }
    }
    if let Some(text) = &doc.text {
        node.text = Some(text.clone());
    }
    if let Some(prompt) = &doc.prompt {
        node.children.push(Some(PlanNode::text(prompt.clone())));
    }
    for child in &doc.children {
        node.children.push(Some(build_node(child)?));
    }

    if let Some(predicate) = &doc.condition {
        node.condition = Some(build_predicate(predicate)?);
    }
    if let Some(predicate) = &doc.skip_if {
        node.skip_if = Some(build_predicate(predicate)?);
    }

    if let Some(writes) = &doc.on_finished_set {
        let writes = writes.clone();
        node.handlers.on_finished = Some(Arc::new(move |_result, writer| {
            for (key, value) in &writes {
                writer.set(key.clone(), value.clone());
            }
        }));
    }
    if let Some(writes) = &doc.on_error_set {
        let writes = writes.clone();
        node.handlers.on_error = Some(Arc::new(move |_error, writer| {
            for (key, value) in &writes {
                writer.set(key.clone(), value.clone());
            }
        }));
    }

    Ok(node)
}

fn build_predicate(doc: &PredicateDoc) -> Result<Predicate> {
    if let Some(key) = &doc.exists {
        return Ok(Predicate::state_exists(key.clone()));
    }
    match (&doc.key, &doc.equals) {
        (Some(key), Some(value)) => Ok(Predicate::state_equals(key.clone(), value.clone())),
        _ => Err(EngineError::PlanInvalid(
            "predicate needs either {key, equals} or {exists}".into(),
        )),
    }
}

fn parse_kind(kind: &str) -> Result<NodeKind> {
    if let Some(agent) = AgentKind::parse(kind) {
        return Ok(NodeKind::Agent(agent));
    }
    match kind {
        "orchestration" => Ok(NodeKind::Orchestration),
        "phase" => Ok(NodeKind::Phase),
        "step" => Ok(NodeKind::Step),
        "parallel" => Ok(NodeKind::Parallel),
        "subagent" => Ok(NodeKind::Subagent),
        "loop" => Ok(NodeKind::Loop),
        "worktree" => Ok(NodeKind::Worktree),
        "review" => Ok(NodeKind::Review),
        "commit" => Ok(NodeKind::Commit),
        "snapshot" => Ok(NodeKind::Snapshot),
        "fragment" => Ok(NodeKind::Fragment),
        "text" => Ok(NodeKind::Text),
        other => Err(EngineError::PlanInvalid(format!("unknown node kind '{other}'"))),
    }
}
