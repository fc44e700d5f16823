//! Codex CLI adapter.
//!
//! Recognized options:
//!
//! | Option | Argument |
//! |---|---|
//! | model (spec) | `--model <m>` |
//! | resume session (spec) | `resume <id>` subcommand form |
//! | `reasoning_effort` | `-c model_reasoning_effort=<v>` |
//! | `sandbox_mode` | `--sandbox <v>` |
//! | `approval_policy` | `--ask-for-approval <v>` |
//! | `cd` | `--cd <dir>` |
//! | `images` | repeated `--image <path>` |
//! | `profile` | `--profile <name>` |
//!
//! Output discipline: JSON lines (`exec --json`).

use super::{opt_list, opt_str, parse_json_line, session_event, AgentCli};
use conductor_core::{InvocationSpec, StreamEvent};
use serde_json::Value;

pub struct CodexCli;

impl AgentCli for CodexCli {
    fn command(&self) -> &'static str {
        "codex"
    }

    fn build_args(&self, spec: &InvocationSpec) -> Vec<String> {
        let mut args = vec!["exec".to_string(), "--json".to_string()];
        if let Some(session) = &spec.resume_session {
            args.push("resume".to_string());
            args.push(session.clone());
        }
        if let Some(model) = &spec.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(effort) = opt_str(spec, "reasoning_effort") {
            args.push("-c".to_string());
            args.push(format!("model_reasoning_effort={effort}"));
        }
        if let Some(sandbox) = opt_str(spec, "sandbox_mode") {
            args.push("--sandbox".to_string());
            args.push(sandbox.to_string());
        }
        if let Some(approval) = opt_str(spec, "approval_policy") {
            args.push("--ask-for-approval".to_string());
            args.push(approval.to_string());
        }
        if let Some(dir) = opt_str(spec, "cd") {
            args.push("--cd".to_string());
            args.push(dir.to_string());
        }
        for image in opt_list(spec, "images") {
            args.push("--image".to_string());
            args.push(image);
        }
        if let Some(profile) = opt_str(spec, "profile") {
            args.push("--profile".to_string());
            args.push(profile.to_string());
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
            Some("thread.started") => {
                match value.get("thread_id").and_then(Value::as_str) {
                    Some(thread) => events.push(session_event(thread, line)),
                    None => events.push(StreamEvent::raw(line)),
                }
            }
            Some("item.completed") => {
                let item = value.get("item").unwrap_or(&Value::Null);
                match item.get("type").and_then(Value::as_str) {
                    Some("agent_message") => {
                        if let Some(text) = item.get("text").and_then(Value::as_str) {
                            events.push(StreamEvent::text_delta(text));
                        }
                    }
                    Some("reasoning") => {
                        if let Some(text) = item.get("text").and_then(Value::as_str) {
                            events.push(StreamEvent::reasoning(text));
                        }
                    }
                    Some("command_execution") => {
                        let command = item.get("command").cloned().unwrap_or(Value::Null);
                        events.push(StreamEvent::tool_call("command", command));
                    }
                    _ => events.push(StreamEvent::raw(line)),
                }
            }
            Some("turn.completed") => {
                if let Some(usage) = value.get("usage") {
                    let input = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
                    let output = usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
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
