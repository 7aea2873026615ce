//! Terminal state classification for tasks and workflows.

use serde::{Deserialize, Serialize};

/// The terminal state of a task or a workflow, reached exactly once.
///
/// `Timeout` is a cancellation distinguished by its cause: a task cancelled
/// by its own timer ends as `Timeout`, a workflow cancelled by its
/// workflow-level timer does too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FutureState {
    Finished,
    Exception,
    Cancelled,
    Timeout,
}

impl FutureState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FutureState::Finished => "finished",
            FutureState::Exception => "exception",
            FutureState::Cancelled => "cancelled",
            FutureState::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for FutureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
