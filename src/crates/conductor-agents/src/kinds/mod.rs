//! Per-kind CLI adapters.
//!
//! Each supported agent CLI gets an adapter that knows the command name, how
//! to turn an [`InvocationSpec`] into an argument vector, and how to parse
//! one stdout line into typed stream events. Builders are pure functions;
//! unknown options are ignored. Parsers never fail: a line that doesn't
//! parse becomes a `raw` event.

pub mod amp;
pub mod claude;
pub mod codex;
pub mod opencode;
pub mod pi;

pub use amp::AmpCli;
pub use claude::ClaudeCli;
pub use codex::CodexCli;
pub use opencode::OpencodeCli;
pub use pi::PiCli;

use conductor_core::{AgentKind, InvocationSpec, StreamEvent};
use serde_json::Value;

/// One external agent CLI's surface.
pub trait AgentCli: Send + Sync {
    /// Command name looked up on the system path.
    fn command(&self) -> &'static str;

    /// Pure mapping from spec to argument vector.
    fn build_args(&self, spec: &InvocationSpec) -> Vec<String>;

    /// Parse one stdout line into zero or more typed events.
    fn parse_line(&self, line: &str) -> Vec<StreamEvent>;

    /// Whether the prompt is piped through stdin instead of an argument.
    fn prompt_via_stdin(&self) -> bool {
        false
    }
}

/// Adapter lookup by kind.
pub fn cli_for(kind: AgentKind) -> &'static dyn AgentCli {
    match kind {
        AgentKind::Claude => &ClaudeCli,
        AgentKind::Codex => &CodexCli,
        AgentKind::Amp => &AmpCli,
        AgentKind::Opencode => &OpencodeCli,
        AgentKind::Pi => &PiCli,
    }
}

/// Shared helper: a string option from the pass-through map.
pub(crate) fn opt_str<'s>(spec: &'s InvocationSpec, key: &str) -> Option<&'s str> {
    spec.options.get(key).and_then(Value::as_str)
}

/// Shared helper: a boolean option from the pass-through map.
pub(crate) fn opt_bool(spec: &InvocationSpec, key: &str) -> bool {
    spec.options.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Shared helper: an option that is either an array of strings or one
/// comma-separated string.
pub(crate) fn opt_list(spec: &InvocationSpec, key: &str) -> Vec<String> {
    match spec.options.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s.split(',').map(|p| p.trim().to_string()).collect(),
        _ => Vec::new(),
    }
}

/// Shared helper: parse a line as JSON, or surface it as a raw event.
pub(crate) fn parse_json_line(line: &str) -> Result<Value, Vec<StreamEvent>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(Vec::new());
    }
    serde_json::from_str::<Value>(trimmed).map_err(|_| vec![StreamEvent::raw(line)])
}

/// Shared helper: a raw event that carries a vendor session id where the
/// supervisor will find it.
pub(crate) fn session_event(session: &str, line: &str) -> StreamEvent {
    let mut event = StreamEvent::raw(line);
    if let Some(payload) = event.payload.as_object_mut() {
        payload.insert("session".to_string(), Value::String(session.to_string()));
    }
    event
}
