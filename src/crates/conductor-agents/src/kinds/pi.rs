//! Pi CLI adapter.
//!
//! Recognized options:
//!
//! | Option | Argument |
//! |---|---|
//! | (always) | `--mode json -p <prompt>` |
//! | `no_session` | `--no-session` |
//! | `provider` | `--provider <p>` |
//! | model (spec) | `--model <m>` |
//! | `thinking` | `--thinking <level>` |
//! | system prompt (spec) | `--system-prompt <s>` |
//! | `append_system_prompt` | `--append-system-prompt <s>` |
//! | `tools` | `--tools <a,b,c>` (comma joined) |
//!
//! Output discipline: JSON lines. The last content block of each assistant
//! `message_end` concatenates into the final output; the per-message `usage`
//! accumulates into the token counters.

use super::{opt_bool, opt_list, opt_str, parse_json_line, session_event, AgentCli};
use conductor_core::{InvocationSpec, StreamEvent};
use serde_json::Value;

pub struct PiCli;

impl AgentCli for PiCli {
    fn command(&self) -> &'static str {
        "pi"
    }

    fn build_args(&self, spec: &InvocationSpec) -> Vec<String> {
        let mut args = vec![
            "--mode".to_string(),
            "json".to_string(),
            "-p".to_string(),
            spec.prompt.clone(),
        ];
        if opt_bool(spec, "no_session") {
            args.push("--no-session".to_string());
        }
        if let Some(provider) = opt_str(spec, "provider") {
            args.push("--provider".to_string());
            args.push(provider.to_string());
        }
        if let Some(model) = &spec.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(thinking) = opt_str(spec, "thinking") {
            args.push("--thinking".to_string());
            args.push(thinking.to_string());
        }
        if let Some(system) = &spec.system_prompt {
            args.push("--system-prompt".to_string());
            args.push(system.clone());
        }
        if let Some(append) = opt_str(spec, "append_system_prompt") {
            args.push("--append-system-prompt".to_string());
            args.push(append.to_string());
        }
        let tools = opt_list(spec, "tools");
        if !tools.is_empty() {
            args.push("--tools".to_string());
            args.push(tools.join(","));
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
            Some("session") => {
                match value.get("id").and_then(Value::as_str) {
                    Some(id) => events.push(session_event(id, line)),
                    None => events.push(StreamEvent::raw(line)),
                }
            }
            Some("message_end") => {
                let message = value.get("message").unwrap_or(&Value::Null);
                let role = message.get("role").and_then(Value::as_str).unwrap_or("assistant");
                if role == "assistant" {
                    // Only the final content block of each assistant message
                    // contributes to the output.
                    if let Some(last) = message
                        .get("content")
                        .and_then(Value::as_array)
                        .and_then(|blocks| blocks.last())
                    {
                        match last.get("type").and_then(Value::as_str) {
                            Some("text") => {
                                if let Some(text) = last.get("text").and_then(Value::as_str) {
                                    events.push(StreamEvent::text_delta(text));
                                }
                            }
                            Some("thinking") => {
                                if let Some(text) = last.get("thinking").and_then(Value::as_str) {
                                    events.push(StreamEvent::reasoning(text));
                                }
                            }
                            _ => {}
                        }
                    }
                    if let Some(usage) = message.get("usage") {
                        let input = usage.get("input").and_then(Value::as_u64).unwrap_or(0);
                        let output = usage.get("output").and_then(Value::as_u64).unwrap_or(0);
                        events.push(StreamEvent::token_usage(input, output));
                    }
                    events.push(StreamEvent::turn_boundary());
                }
            }
            Some("tool_execution_start") => {
                let name = value.get("name").and_then(Value::as_str).unwrap_or("");
                let args = value.get("args").cloned().unwrap_or(Value::Null);
                events.push(StreamEvent::tool_call(name, args));
            }
            Some("tool_execution_end") => {
                let name = value.get("name").and_then(Value::as_str).unwrap_or("");
                let result = value.get("result").cloned().unwrap_or(Value::Null);
                events.push(StreamEvent::tool_result(name, result));
            }
            Some("error") => {
                let message = value.get("message").and_then(Value::as_str).unwrap_or("error");
                events.push(StreamEvent::error(message));
            }
            // Streaming deltas carry partial text the message_end repeats;
            // skip them so the output is not doubled.
            Some("message_update") | Some("message_start") => {}
            _ => events.push(StreamEvent::raw(line)),
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::{AgentKind, StreamEventKind};
    use serde_json::json;

    fn base_spec() -> InvocationSpec {
        InvocationSpec::new(AgentKind::Pi, "summarize the diff")
    }

    #[test]
    fn test_minimal_args() {
        let args = PiCli.build_args(&base_spec());
        assert_eq!(args, vec!["--mode", "json", "-p", "summarize the diff"]);
    }

    #[test]
    fn test_full_option_table() {
        let spec = base_spec()
            .with_model("gpt-5.2")
            .with_option("no_session", json!(true))
            .with_option("provider", json!("openai"))
            .with_option("thinking", json!("high"))
            .with_option("append_system_prompt", json!("stay terse"))
            .with_option("tools", json!(["read", "bash", "edit"]));
        let args = PiCli.build_args(&spec);
        assert!(args.contains(&"--no-session".to_string()));
        assert!(args.windows(2).any(|w| w == ["--provider", "openai"]));
        assert!(args.windows(2).any(|w| w == ["--model", "gpt-5.2"]));
        assert!(args.windows(2).any(|w| w == ["--thinking", "high"]));
        assert!(args.windows(2).any(|w| w == ["--append-system-prompt", "stay terse"]));
        assert!(args.windows(2).any(|w| w == ["--tools", "read,bash,edit"]));
    }

    #[test]
    fn test_system_prompt_flag() {
        let mut spec = base_spec();
        spec.system_prompt = Some("you are a reviewer".into());
        let args = PiCli.build_args(&spec);
        assert!(args.windows(2).any(|w| w == ["--system-prompt", "you are a reviewer"]));
    }

    #[test]
    fn test_message_end_takes_last_block_and_usage() {
        let line = json!({
            "type": "message_end",
            "message": {
                "role": "assistant",
                "content": [
                    {"type": "thinking", "thinking": "let me think"},
                    {"type": "text", "text": "the answer"}
                ],
                "usage": {"input": 40, "output": 8}
            }
        })
        .to_string();
        let events = PiCli.parse_line(&line);
        let kinds: Vec<StreamEventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StreamEventKind::TextDelta,
                StreamEventKind::TokenUsage,
                StreamEventKind::TurnBoundary
            ]
        );
        assert_eq!(events[0].text(), Some("the answer"));
        assert_eq!(events[1].usage(), Some((40, 8)));
    }

    #[test]
    fn test_non_assistant_message_end_ignored() {
        let line = json!({
            "type": "message_end",
            "message": {"role": "toolResult", "content": []}
        })
        .to_string();
        assert!(PiCli.parse_line(&line).is_empty());
    }

    #[test]
    fn test_message_updates_are_skipped() {
        let line = json!({"type": "message_update", "delta": "par"}).to_string();
        assert!(PiCli.parse_line(&line).is_empty());
    }

    #[test]
    fn test_tool_execution_events() {
        let start = json!({"type": "tool_execution_start", "name": "bash", "args": {"cmd": "ls"}})
            .to_string();
        assert_eq!(PiCli.parse_line(&start)[0].kind, StreamEventKind::ToolCall);

        let end = json!({"type": "tool_execution_end", "name": "bash", "result": "files"}).to_string();
        assert_eq!(PiCli.parse_line(&end)[0].kind, StreamEventKind::ToolResult);
    }

    #[test]
    fn test_malformed_line_becomes_raw() {
        assert_eq!(PiCli.parse_line("%%%")[0].kind, StreamEventKind::Raw);
    }
}
