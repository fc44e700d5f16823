//! Scripted mock runner.
//!
//! Backs `--mock` runs and the engine test suite: no process is spawned, but
//! everything else — event persistence, stop conditions, schema validation,
//! middleware — behaves exactly as with a real supervisor, so mock frames
//! are deterministic and replayable.

use crate::error::{EngineError, Result};
use crate::events::StreamEvent;
use crate::runner::{AgentResult, AgentRunner, InvocationSpec, RunContext, StopReason};
use crate::stop::{StopEvaluator, StopTrigger};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// One scripted reply.
#[derive(Debug, Clone, Default)]
pub struct MockResponse {
    /// Final output; when `None`, the accumulated text-delta events are used.
    pub output: Option<String>,
    /// Events streamed (and persisted) before completion.
    pub events: Vec<StreamEvent>,
    /// Simulated run time.
    pub delay: Duration,
    /// Vendor session id to report.
    pub session: Option<String>,
    /// Fail the dispatch with this message instead of completing.
    pub error: Option<String>,
}

impl MockResponse {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_events(mut self, events: Vec<StreamEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }
}

/// Scripted [`AgentRunner`]. Responses are looked up by exact prompt first,
/// then by agent kind, then the fixed default — so "mock everything" runs
/// need no scripting at all.
pub struct MockRunner {
    by_prompt: Mutex<HashMap<String, VecDeque<MockResponse>>>,
    by_kind: Mutex<HashMap<&'static str, VecDeque<MockResponse>>>,
    default_output: String,
}

impl MockRunner {
    pub fn new() -> Self {
        Self {
            by_prompt: Mutex::new(HashMap::new()),
            by_kind: Mutex::new(HashMap::new()),
            default_output: "ok".to_string(),
        }
    }

    /// Change the output used when nothing is scripted.
    pub fn with_default_output(mut self, output: impl Into<String>) -> Self {
        self.default_output = output.into();
        self
    }

    /// Queue a response for the next dispatch whose prompt matches exactly.
    pub fn script_prompt(self, prompt: impl Into<String>, response: MockResponse) -> Self {
        self.by_prompt
            .lock()
            .expect("mock script lock poisoned")
            .entry(prompt.into())
            .or_default()
            .push_back(response);
        self
    }

    /// Queue a response for the next dispatch of the given kind.
    pub fn script_kind(self, kind: &'static str, response: MockResponse) -> Self {
        self.by_kind
            .lock()
            .expect("mock script lock poisoned")
            .entry(kind)
            .or_default()
            .push_back(response);
        self
    }

    fn take_response(&self, spec: &InvocationSpec) -> MockResponse {
        if let Some(queue) = self
            .by_prompt
            .lock()
            .expect("mock script lock poisoned")
            .get_mut(&spec.prompt)
        {
            if let Some(response) = queue.pop_front() {
                return response;
            }
        }
        if let Some(queue) = self
            .by_kind
            .lock()
            .expect("mock script lock poisoned")
            .get_mut(spec.kind.as_str())
        {
            if let Some(response) = queue.pop_front() {
                return response;
            }
        }
        MockResponse::text(self.default_output.clone())
    }
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRunner for MockRunner {
    async fn run(&self, spec: InvocationSpec, ctx: &RunContext) -> Result<AgentResult> {
        let response = self.take_response(&spec);

        if !response.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(response.delay) => {}
                _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        }

        if let Some(message) = response.error {
            return Err(EngineError::AgentFailed { message });
        }

        let mut evaluator = StopEvaluator::new(spec.stop_conditions.clone(), spec.timeout_ms);
        let mut stopped: Option<StopTrigger> = None;
        for event in &response.events {
            if ctx.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            ctx.emit(event).await?;
            if let Some(trigger) = evaluator.observe(event) {
                stopped = Some(trigger);
                break;
            }
        }

        let output = match &response.output {
            // A triggered stop truncates to what was streamed.
            Some(output) if stopped.is_none() => output.clone(),
            _ => evaluator.accumulated_text().to_string(),
        };

        let stop_reason = match &stopped {
            None => StopReason::Completed,
            Some(StopTrigger::TimeLimit { .. }) => StopReason::StopCondition,
            Some(StopTrigger::Condition { .. }) => StopReason::StopCondition,
        };

        Ok(AgentResult {
            output,
            reasoning: None,
            structured: None,
            tokens_used: evaluator.tokens(),
            turns_used: evaluator.turns(),
            stop_reason,
            duration_ms: evaluator.elapsed_ms(),
            exit_code: Some(0),
            session: response.session,
        })
    }
}
