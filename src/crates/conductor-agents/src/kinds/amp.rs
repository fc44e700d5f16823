//! Amp CLI adapter.
//!
//! Recognized options:
//!
//! | Option | Argument |
//! |---|---|
//! | `mode` (smart/rush) | `--mode <m>` |
//! | `permission_mode` | `--permission-mode <m>` |
//! | `continue_thread` | `--continue-thread <id>` |
//! | resume session (spec) | `--resume-thread <id>` |
//! | `labels` | repeated `--label <l>` |
//!
//! Output discipline: JSON lines (`-x --stream-json`).

use super::{opt_list, opt_str, parse_json_line, session_event, AgentCli};
use conductor_core::{InvocationSpec, StreamEvent};
use serde_json::Value;

pub struct AmpCli;

impl AgentCli for AmpCli {
    fn command(&self) -> &'static str {
        "amp"
    }

    fn build_args(&self, spec: &InvocationSpec) -> Vec<String> {
        let mut args = vec![
            "-x".to_string(),
            spec.prompt.clone(),
            "--stream-json".to_string(),
        ];
        if let Some(mode) = opt_str(spec, "mode") {
            args.push("--mode".to_string());
            args.push(mode.to_string());
        }
        if let Some(mode) = opt_str(spec, "permission_mode") {
            args.push("--permission-mode".to_string());
            args.push(mode.to_string());
        }
        if let Some(thread) = opt_str(spec, "continue_thread") {
            args.push("--continue-thread".to_string());
            args.push(thread.to_string());
        }
        if let Some(session) = &spec.resume_session {
            args.push("--resume-thread".to_string());
            args.push(session.clone());
        }
        for label in opt_list(spec, "labels") {
            args.push("--label".to_string());
            args.push(label);
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
            Some("thread") => {
                match value.get("id").and_then(Value::as_str) {
                    Some(id) => events.push(session_event(id, line)),
                    None => events.push(StreamEvent::raw(line)),
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
            Some("error") => {
                let message = value.get("message").and_then(Value::as_str).unwrap_or("error");
                events.push(StreamEvent::error(message));
            }
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
        InvocationSpec::new(AgentKind::Amp, "refactor this")
    }

    #[test]
    fn test_minimal_args() {
        let args = AmpCli.build_args(&base_spec());
        assert_eq!(args, vec!["-x", "refactor this", "--stream-json"]);
    }

    #[test]
    fn test_full_option_table() {
        let mut spec = base_spec()
            .with_option("mode", json!("rush"))
            .with_option("permission_mode", json!("loose"))
            .with_option("continue_thread", json!("T-1"))
            .with_option("labels", json!(["nightly", "refactor"]));
        spec.resume_session = Some("T-2".into());
        let args = AmpCli.build_args(&spec);
        assert!(args.windows(2).any(|w| w == ["--mode", "rush"]));
        assert!(args.windows(2).any(|w| w == ["--permission-mode", "loose"]));
        assert!(args.windows(2).any(|w| w == ["--continue-thread", "T-1"]));
        assert!(args.windows(2).any(|w| w == ["--resume-thread", "T-2"]));
        assert!(args.windows(2).any(|w| w == ["--label", "nightly"]));
        assert!(args.windows(2).any(|w| w == ["--label", "refactor"]));
    }

    #[test]
    fn test_parse_thread_and_assistant() {
        let thread = json!({"type": "thread", "id": "T-99"}).to_string();
        assert_eq!(AmpCli.parse_line(&thread)[0].session(), Some("T-99"));

        let message = json!({
            "type": "assistant",
            "message": {
                "content": [{"type": "text", "text": "shipped"}],
                "usage": {"input_tokens": 5, "output_tokens": 9}
            }
        })
        .to_string();
        let events = AmpCli.parse_line(&message);
        assert_eq!(events[0].text(), Some("shipped"));
        assert_eq!(events[1].usage(), Some((5, 9)));
        assert_eq!(events[2].kind, StreamEventKind::TurnBoundary);
    }

    #[test]
    fn test_malformed_line_becomes_raw() {
        assert_eq!(AmpCli.parse_line("oops")[0].kind, StreamEventKind::Raw);
    }
}
