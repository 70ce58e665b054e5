//! Append-only progress event log.
//!
//! Deletion phases emit one progress entry per item plus a completion entry
//! per stage. An external observer snapshots the log; the core never reads it
//! back.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

/// One entry in the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Progress on one item of a stage. `index` is 1-based.
    Progress {
        stage: String,
        total: usize,
        task: String,
        index: usize,
    },
    /// All items of a stage are done.
    StageComplete { stage: String, total: usize },
}

/// Shared append-only log of [`Event`]s.
#[derive(Debug, Default)]
pub struct EventLog {
    entries: Mutex<Vec<Event>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress(&self, stage: &str, total: usize, task: &str, index: usize) {
        self.push(Event::Progress {
            stage: stage.to_string(),
            total,
            task: task.to_string(),
            index,
        });
    }

    pub fn stage_complete(&self, stage: &str, total: usize) {
        self.push(Event::StageComplete {
            stage: stage.to_string(),
            total,
        });
    }

    fn push(&self, event: Event) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    /// Copy of every entry recorded so far, in emission order.
    pub fn snapshot(&self) -> Vec<Event> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
