//! Claude Code CLI adapter.
//!
//! Recognized options:
//!
//! | Option | Argument |
//! |---|---|
//! | model (spec) | `--model <m>` |
//! | system prompt (spec) | `--append-system-prompt <s>` |
//! | resume session (spec) | `--resume <id>` |
//! | `permission_mode` | `--permission-mode <m>` |
//! | `allowed_tools` | `--allowedTools <a,b>` |
//! | `disallowed_tools` | `--disallowedTools <a,b>` |
//! | `mcp_config` | `--mcp-config <path>` |
//! | `continue` | `--continue` |
//! | `max_turns` | `--max-turns <n>` |
//!
//! Output discipline: JSON lines (`--output-format stream-json`).

use super::{opt_bool, opt_list, opt_str, parse_json_line, session_event, AgentCli};
use conductor_core::{InvocationSpec, StreamEvent};
use serde_json::Value;

pub struct ClaudeCli;

impl AgentCli for ClaudeCli {
    fn command(&self) -> &'static str {
        "claude"
    }

    fn build_args(&self, spec: &InvocationSpec) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            spec.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if let Some(model) = &spec.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(system) = &spec.system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(system.clone());
        }
        if let Some(session) = &spec.resume_session {
            args.push("--resume".to_string());
            args.push(session.clone());
        }
        if let Some(mode) = opt_str(spec, "permission_mode") {
            args.push("--permission-mode".to_string());
            args.push(mode.to_string());
        }
        let allowed = opt_list(spec, "allowed_tools");
        if !allowed.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(allowed.join(","));
        }
        let disallowed = opt_list(spec, "disallowed_tools");
        if !disallowed.is_empty() {
            args.push("--disallowedTools".to_string());
            args.push(disallowed.join(","));
        }
        if let Some(config) = opt_str(spec, "mcp_config") {
            args.push("--mcp-config".to_string());
            args.push(config.to_string());
        }
        if opt_bool(spec, "continue") {
            args.push("--continue".to_string());
        }
        if let Some(turns) = spec.options.get("max_turns").and_then(Value::as_u64) {
            args.push("--max-turns".to_string());
            args.push(turns.to_string());
        }
        args
    }

    fn parse_line(&self, line: &str) -> Vec<StreamEvent> {
        let value = match parse_json_line(line) {
            Ok(value) => value,
            Err(events) => return events,
        };

        let mut events = Vec::new();
        match value.get("type").and_then(Value::as_str) {
            Some("system") => {
                if let Some(session) = value.get("session_id").and_then(Value::as_str) {
                    events.push(session_event(session, line));
                } else {
                    events.push(StreamEvent::raw(line));
                }
            }
            Some("assistant") => {
                let message = value.get("message").unwrap_or(&Value::Null);
                if let Some(blocks) = message.get("content").and_then(Value::as_array) {
                    for block in blocks {
                        match block.get("type").and_then(Value::as_str) {
                            Some("text") => {
                                if let Some(text) = block.get("text").and_then(Value::as_str) {
                                    events.push(StreamEvent::text_delta(text));
                                }
                            }
                            Some("thinking") => {
                                if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                                    events.push(StreamEvent::reasoning(text));
                                }
                            }
                            Some("tool_use") => {
                                let name = block.get("name").and_then(Value::as_str).unwrap_or("");
                                let input = block.get("input").cloned().unwrap_or(Value::Null);
                                events.push(StreamEvent::tool_call(name, input));
                            }
                            _ => {}
                        }
                    }
                }
                if let Some(usage) = message.get("usage") {
                    let input = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
                    let output = usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
                    events.push(StreamEvent::token_usage(input, output));
                }
                events.push(StreamEvent::turn_boundary());
            }
            Some("user") => {
                let message = value.get("message").unwrap_or(&Value::Null);
                if let Some(blocks) = message.get("content").and_then(Value::as_array) {
                    for block in blocks {
                        if block.get("type").and_then(Value::as_str) == Some("tool_result") {
                            let content = block.get("content").cloned().unwrap_or(Value::Null);
                            events.push(StreamEvent::tool_result("", content));
                        }
                    }
                }
                if events.is_empty() {
                    events.push(StreamEvent::raw(line));
                }
            }
            Some("result") => {
                if let Some(usage) = value.get("usage") {
                    let input = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
                    let output = usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
                    events.push(StreamEvent::token_usage(input, output));
                }
                if value.get("is_error").and_then(Value::as_bool) == Some(true) {
                    let message = value.get("result").and_then(Value::as_str).unwrap_or("error");
                    events.push(StreamEvent::error(message));
                }
            }
            _ => events.push(StreamEvent::raw(line)),
        }
        events
    }
}
