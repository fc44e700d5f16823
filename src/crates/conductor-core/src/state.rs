//! State cells as the reconciler sees them.
//!
//! Plan code never touches the store directly. Each reconciliation pass reads
//! a [`StateSnapshot`] taken at pass start, and callbacks queue writes into a
//! [`StateWriter`]; the engine commits queued writes to the store after the
//! pass, so the *next* pass observes them. That one-pass delay is what keeps
//! rendering a pure function of (plan, snapshot).

use serde_json::Value;
use std::collections::HashMap;

/// Immutable view of an execution's state cells at pass start.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    cells: HashMap<String, Value>,
}

impl StateSnapshot {
    pub fn new(cells: HashMap<String, Value>) -> Self {
        Self { cells }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.cells.get(key)
    }

    /// String form of a cell, when it holds a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.cells.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// One queued state-cell write.
#[derive(Debug, Clone, PartialEq)]
pub struct StateWrite {
    pub key: String,
    pub value: Value,
    /// Free-form tag naming the writer, recorded on the row.
    pub trigger: String,
}

/// Write buffer handed to plan callbacks. Drained and committed by the
/// engine in queue order.
#[derive(Debug, Default)]
pub struct StateWriter {
    writes: Vec<StateWrite>,
    trigger: String,
}

impl StateWriter {
    /// A writer whose queued writes are tagged with `trigger`.
    pub fn new(trigger: impl Into<String>) -> Self {
        Self {
            writes: Vec::new(),
            trigger: trigger.into(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.writes.push(StateWrite {
            key: key.into(),
            value,
            trigger: self.trigger.clone(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn into_writes(self) -> Vec<StateWrite> {
        self.writes
    }
}
