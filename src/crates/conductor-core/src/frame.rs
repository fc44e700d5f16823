//! Frame serialization: one reconciled tree per pass, as a self-describing
//! XML document.
//!
//! The serializer is deterministic — attributes are emitted in sorted key
//! order — so identical reconciled trees produce byte-identical documents.
//! Frame determinism in mock mode, and the stabilization check itself, both
//! ride on that.

use crate::reconcile::ResolvedNode;
use crate::tree::NodeKind;
use serde_json::Value;

/// Serialize a reconciled tree to an XML document.
pub fn serialize(root: &ResolvedNode) -> String {
    let mut out = String::new();
    write_node(root, 0, &mut out);
    out
}

fn write_node(node: &ResolvedNode, depth: usize, out: &mut String) {
    if node.kind == NodeKind::Text {
        if let Some(text) = &node.text {
            indent(depth, out);
            out.push_str(&escape(text));
            out.push('\n');
        }
        return;
    }

    let tag = node.kind.tag();
    indent(depth, out);
    out.push('<');
    out.push_str(tag);

    for (key, value) in sorted_attrs(node) {
        out.push(' ');
        out.push_str(&key);
        out.push_str("=\"");
        out.push_str(&escape(&value));
        out.push('"');
    }

    let content = node_content(node);
    if node.children.is_empty() && content.is_none() {
        out.push_str("/>\n");
        return;
    }

    out.push('>');
    match content {
        Some(content) if node.children.is_empty() => {
            // Single-line form for leaves with text content.
            out.push_str(&escape(&content));
            out.push_str("</");
            out.push_str(tag);
            out.push_str(">\n");
        }
        content => {
            out.push('\n');
            if let Some(content) = content {
                indent(depth + 1, out);
                out.push_str(&escape(&content));
                out.push('\n');
            }
            for child in &node.children {
                write_node(child, depth + 1, out);
            }
            indent(depth, out);
            out.push_str("</");
            out.push_str(tag);
            out.push_str(">\n");
        }
    }
}

/// Scalar props in sorted key order, then `status`.
fn sorted_attrs(node: &ResolvedNode) -> Vec<(String, String)> {
    let mut attrs: Vec<(String, String)> = node
        .props
        .iter()
        .filter(|(key, _)| key.as_str() != "prompt")
        .filter_map(|(key, value)| scalar(value).map(|v| (key.clone(), v)))
        .collect();
    attrs.sort_by(|a, b| a.0.cmp(&b.0));
    if let Some(status) = node.status {
        attrs.push(("status".to_string(), status.as_str().to_string()));
    }
    attrs
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Text content of a node: a finished dispatch shows its output, a waiting
/// agent shows its prompt.
fn node_content(node: &ResolvedNode) -> Option<String> {
    if let Some(output) = &node.output {
        return Some(output.clone());
    }
    if let Some(prompt) = &node.prompt {
        if !prompt.is_empty() {
            return Some(prompt.clone());
        }
    }
    None
}

fn indent(depth: usize, out: &mut String) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Document-order equality ignoring inter-element whitespace.
pub fn xml_equivalent(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

fn normalize(doc: &str) -> String {
    // Collapse whitespace runs between a closing '>' and the next '<'; text
    // content keeps its internal spacing.
    let mut out = String::with_capacity(doc.len());
    let mut pending_ws = String::new();
    let mut last_significant = '\0';
    for c in doc.chars() {
        if c.is_whitespace() {
            pending_ws.push(c);
            continue;
        }
        if !pending_ws.is_empty() {
            let between_tags = last_significant == '>' && c == '<';
            let leading = last_significant == '\0';
            if !between_tags && !leading {
                out.push(' ');
            }
            pending_ws.clear();
        }
        out.push(c);
        last_significant = c;
    }
    out
}
