//! Process lifecycle state machine.
//!
//! ```text
//! Initialized ──▶ Running ──▶ Completed
//!                  │  ▲  └──▶ Failed
//!                  ▼  │         ▲
//!                 Paused ───────┘
//! ```
//!
//! `Completed` and `Failed` are terminal. `Paused -> Failed` covers a step that
//! was already in flight when the pause arrived and then failed.

use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Initialized,
    Running,
    Completed,
    Failed,
    Paused,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Completed | ProcessState::Failed)
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;

        matches!(
            (self, next),
            (Initialized, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Initialized => "initialized",
            ProcessState::Running => "running",
            ProcessState::Completed => "completed",
            ProcessState::Failed => "failed",
            ProcessState::Paused => "paused",
        }
    }
}

impl core::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
