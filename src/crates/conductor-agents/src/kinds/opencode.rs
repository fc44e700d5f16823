//! OpenCode CLI adapter.
//!
//! Recognized options:
//!
//! | Option | Argument |
//! |---|---|
//! | model (spec, "provider/model") | `--model <p/m>` |
//! | `agent` | `--agent <profile>` |
//! | `permission_mode` | `--permission-mode <m>` |
//! | resume session (spec) | `--session <id>` |
//!
//! Output discipline: JSON lines (`run --print-logs --format json`).

use super::{opt_str, parse_json_line, session_event, AgentCli};
use conductor_core::{InvocationSpec, StreamEvent};
use serde_json::Value;

pub struct OpencodeCli;

impl AgentCli for OpencodeCli {
    fn command(&self) -> &'static str {
        "opencode"
    }

    fn build_args(&self, spec: &InvocationSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--format".to_string(),
            "json".to_string(),
        ];
        if let Some(model) = &spec.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(agent) = opt_str(spec, "agent") {
            args.push("--agent".to_string());
            args.push(agent.to_string());
        }
        if let Some(mode) = opt_str(spec, "permission_mode") {
            args.push("--permission-mode".to_string());
            args.push(mode.to_string());
        }
        if let Some(session) = &spec.resume_session {
            args.push("--session".to_string());
            args.push(session.clone());
        }
        args.push(spec.prompt.clone());
        args
    }

    fn parse_line(&self, line: &str) -> Vec<StreamEvent> {
        let value = match parse_json_line(line) {
            Ok(value) => value,
            Err(events) => return events,
        };

        let mut events = Vec::new();
        match value.get("type").and_then(Value::as_str) {
            Some("session") => {
                match value.get("id").and_then(Value::as_str) {
                    Some(id) => events.push(session_event(id, line)),
                    None => events.push(StreamEvent::raw(line)),
                }
            }
            Some("text") => {
                if let Some(text) = value.get("text").and_then(Value::as_str) {
                    events.push(StreamEvent::text_delta(text));
                }
            }
            Some("tool") => {
                let name = value.get("name").and_then(Value::as_str).unwrap_or("");
                match value.get("result") {
                    Some(result) => events.push(StreamEvent::tool_result(name, result.clone())),
                    None => {
                        let input = value.get("input").cloned().unwrap_or(Value::Null);
                        events.push(StreamEvent::tool_call(name, input));
                    }
                }
            }
            Some("step-finish") => {
                if let Some(usage) = value.get("tokens") {
                    let input = usage.get("input").and_then(Value::as_u64).unwrap_or(0);
                    let output = usage.get("output").and_then(Value::as_u64).unwrap_or(0);
                    events.push(StreamEvent::token_usage(input, output));
                }
                events.push(StreamEvent::turn_boundary());
            }
            Some("error") => {
                let message = value.get("message").and_then(Value::as_str).unwrap_or("error");
                events.push(StreamEvent::error(message));
            }
            _ => events.push(StreamEvent::raw(line)),
        }
        events
    }
}
