//! Profile snapshots
//!
//! Copies of engine counters plus the session's own query bookkeeping.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::inference::EngineProfile;
use crate::session::CompletionReason;

/// Per-outcome query counters kept by a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCounters {
    pub completed: u64,
    pub terminated_by_callback: u64,
    pub stopped_externally: u64,
    pub failed: u64,
    /// How the most recent query ended
    pub last_completion: Option<CompletionReason>,
}

impl QueryCounters {
    pub fn record(&mut self, reason: CompletionReason) {
        match reason {
            CompletionReason::Completed => self.completed += 1,
            CompletionReason::TerminatedByCallback => self.terminated_by_callback += 1,
            CompletionReason::StoppedExternally => self.stopped_externally += 1,
            CompletionReason::Failed => self.failed += 1,
        }
        self.last_completion = Some(reason);
    }

    /// Total queries that reached the engine
    pub fn total(&self) -> u64 {
        self.completed + self.terminated_by_callback + self.stopped_externally + self.failed
    }
}

/// Read-only view returned by `Session::profile`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub session_id: Uuid,
    pub engine: EngineProfile,
    pub queries: QueryCounters,
}

impl ProfileSnapshot {
    /// Renders the snapshot as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
