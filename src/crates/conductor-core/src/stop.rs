//! Stop conditions: predicates that end a running dispatch early.
//!
//! Invocation timeouts and the engine's global wall-clock limit are both
//! lowered onto `TimeLimit`, so timeout handling and stop-condition handling
//! share one code path.

use crate::events::StreamEvent;
use crate::runner::{AgentResult, StopReason, TokensUsed};
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Predicate evaluated against a partial [`AgentResult`].
pub type StopPredicate = Arc<dyn Fn(&AgentResult) -> bool + Send + Sync>;

/// A condition that terminates a dispatch before natural completion.
#[derive(Clone)]
pub enum StopCondition {
    /// Cumulative output tokens exceed N.
    TokenLimit(u64),
    /// Wall clock exceeds this many milliseconds.
    TimeLimit(u64),
    /// The Nth turn boundary.
    TurnLimit(u32),
    /// Accumulated output text matches the pattern.
    OutputMatches(Regex),
    /// Arbitrary predicate over the partial result.
    Custom { name: String, predicate: StopPredicate },
}

impl StopCondition {
    /// Convenience constructor that compiles the pattern.
    pub fn output_matches(pattern: &str) -> Result<Self, regex::Error> {
        Ok(StopCondition::OutputMatches(Regex::new(pattern)?))
    }

    pub fn custom(name: impl Into<String>, predicate: StopPredicate) -> Self {
        StopCondition::Custom {
            name: name.into(),
            predicate,
        }
    }

    /// Human-readable description, used in results and log rows.
    pub fn describe(&self) -> String {
        match self {
            StopCondition::TokenLimit(n) => format!("token-limit {n}"),
            StopCondition::TimeLimit(ms) => format!("time-limit {ms}ms"),
            StopCondition::TurnLimit(n) => format!("turn-limit {n}"),
            StopCondition::OutputMatches(re) => format!("output-matches /{}/", re.as_str()),
            StopCondition::Custom { name, .. } => format!("custom {name}"),
        }
    }
}

impl std::fmt::Debug for StopCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

/// What tripped, and how the result should be tagged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopTrigger {
    /// A `time-limit` condition; reported as a timeout.
    TimeLimit { ms: u64 },
    /// Any other condition; a normal early termination.
    Condition { description: String },
}

/// Tracks stream progress against a set of stop conditions.
///
/// Both the process supervisor and the mock runner feed every event through
/// [`StopEvaluator::observe`]; whichever sees a trigger stops the dispatch.
pub struct StopEvaluator {
    conditions: Vec<StopCondition>,
    started: Instant,
    accumulated: String,
    tokens: TokensUsed,
    turns: u32,
}

impl StopEvaluator {
    /// Build an evaluator; a per-invocation timeout is folded in as one more
    /// `TimeLimit` condition.
    pub fn new(conditions: Vec<StopCondition>, timeout_ms: Option<u64>) -> Self {
        let mut conditions = conditions;
        if let Some(ms) = timeout_ms {
            conditions.push(StopCondition::TimeLimit(ms));
        }
        Self {
            conditions,
            started: Instant::now(),
            accumulated: String::new(),
            tokens: TokensUsed::default(),
            turns: 0,
        }
    }

    pub fn accumulated_text(&self) -> &str {
        &self.accumulated
    }

    pub fn tokens(&self) -> TokensUsed {
        self.tokens
    }

    pub fn turns(&self) -> u32 {
        self.turns
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Earliest time-limit deadline still ahead, as a sleep duration.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.conditions
            .iter()
            .filter_map(|c| match c {
                StopCondition::TimeLimit(ms) => Some(*ms),
                _ => None,
            })
            .min()
            .map(|ms| Duration::from_millis(ms).saturating_sub(self.started.elapsed()))
    }

    /// Check whether any time limit has already elapsed.
    pub fn check_deadline(&self) -> Option<StopTrigger> {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.conditions.iter().find_map(|c| match c {
            StopCondition::TimeLimit(ms) if elapsed >= *ms => {
                Some(StopTrigger::TimeLimit { ms: *ms })
            }
            _ => None,
        })
    }

    /// Fold one event into the trackers and evaluate every condition.
    /// Returns the first trigger, if any.
    pub fn observe(&mut self, event: &StreamEvent) -> Option<StopTrigger> {
        if let Some(text) = event.text() {
            self.accumulated.push_str(text);
        }
        if let Some((input, output)) = event.usage() {
            // Token counters are monotonic; vendors report cumulative or
            // per-message usage, so take the max of both readings.
            self.tokens.input = self.tokens.input.max(input);
            self.tokens.output = self.tokens.output.max(output);
        }
        if event.kind == crate::events::StreamEventKind::TurnBoundary {
            self.turns += 1;
        }

        for condition in &self.conditions {
            let triggered = match condition {
                StopCondition::TokenLimit(n) => self.tokens.output > *n,
                StopCondition::TimeLimit(_) => continue,
                StopCondition::TurnLimit(n) => self.turns >= *n,
                StopCondition::OutputMatches(re) => re.is_match(&self.accumulated),
                StopCondition::Custom { predicate, .. } => predicate(&self.partial_result()),
            };
            if triggered {
                return Some(StopTrigger::Condition {
                    description: condition.describe(),
                });
            }
        }
        None
    }

    /// The partial result as of now, for custom predicates and final
    /// assembly.
    pub fn partial_result(&self) -> AgentResult {
        AgentResult {
            output: self.accumulated.clone(),
            reasoning: None,
            structured: None,
            tokens_used: self.tokens,
            turns_used: self.turns,
            stop_reason: StopReason::Completed,
            duration_ms: self.elapsed_ms(),
            exit_code: None,
            session: None,
        }
    }
}
