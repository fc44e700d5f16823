//! Typed stream events.
//!
//! Every vendor CLI emits line-delimited JSON with some `type` discriminator;
//! the per-kind parsers normalize those lines into this one tagged union.
//! Lines that fail to parse become [`StreamEventKind::Raw`] events — a bad
//! line never halts the stream.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Discriminator for a parsed stream record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamEventKind {
    TextDelta,
    ToolCall,
    ToolResult,
    Reasoning,
    TokenUsage,
    TurnBoundary,
    Error,
    Raw,
}

impl StreamEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamEventKind::TextDelta => "text-delta",
            StreamEventKind::ToolCall => "tool-call",
            StreamEventKind::ToolResult => "tool-result",
            StreamEventKind::Reasoning => "reasoning",
            StreamEventKind::TokenUsage => "token-usage",
            StreamEventKind::TurnBoundary => "turn-boundary",
            StreamEventKind::Error => "error",
            StreamEventKind::Raw => "raw",
        }
    }
}

/// One parsed record from an agent's stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub kind: StreamEventKind,
    pub payload: Value,
}

impl StreamEvent {
    pub fn text_delta(text: impl Into<String>) -> Self {
        Self {
            kind: StreamEventKind::TextDelta,
            payload: json!({ "text": text.into() }),
        }
    }

    pub fn tool_call(name: impl Into<String>, args: Value) -> Self {
        Self {
            kind: StreamEventKind::ToolCall,
            payload: json!({ "name": name.into(), "args": args }),
        }
    }

    pub fn tool_result(name: impl Into<String>, result: Value) -> Self {
        Self {
            kind: StreamEventKind::ToolResult,
            payload: json!({ "name": name.into(), "result": result }),
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            kind: StreamEventKind::Reasoning,
            payload: json!({ "text": text.into() }),
        }
    }

    pub fn token_usage(input: u64, output: u64) -> Self {
        Self {
            kind: StreamEventKind::TokenUsage,
            payload: json!({ "input": input, "output": output }),
        }
    }

    pub fn turn_boundary() -> Self {
        Self {
            kind: StreamEventKind::TurnBoundary,
            payload: Value::Null,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: StreamEventKind::Error,
            payload: json!({ "message": message.into() }),
        }
    }

    /// Wrap a line that could not be parsed.
    pub fn raw(line: impl Into<String>) -> Self {
        Self {
            kind: StreamEventKind::Raw,
            payload: json!({ "line": line.into() }),
        }
    }

    /// Text carried by a text-delta or reasoning event.
    pub fn text(&self) -> Option<&str> {
        match self.kind {
            StreamEventKind::TextDelta | StreamEventKind::Reasoning => {
                self.payload.get("text").and_then(Value::as_str)
            }
            _ => None,
        }
    }

    /// (input, output) token counts carried by a token-usage event.
    pub fn usage(&self) -> Option<(u64, u64)> {
        if self.kind != StreamEventKind::TokenUsage {
            return None;
        }
        let input = self.payload.get("input").and_then(Value::as_u64).unwrap_or(0);
        let output = self.payload.get("output").and_then(Value::as_u64).unwrap_or(0);
        Some((input, output))
    }

    /// Session identifier, when a vendor event carries one.
    pub fn session(&self) -> Option<&str> {
        self.payload.get("session").and_then(Value::as_str)
    }
}
