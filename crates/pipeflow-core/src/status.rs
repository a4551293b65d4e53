//! Status enums for runs, task units and worker slots.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Lifecycle status shared by runs and task units.
///
/// ```text
/// Pending ──► Running ──► Complete | Failed | Cancelled
///    │  ◄──────┘ (unit reassigned after worker loss)
///    └──► Failed | Cancelled
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Not yet started (run) or not yet assigned (unit).
    #[default]
    Pending,
    /// Run expanded and scheduling, or unit held by a worker.
    Running,
    /// Finished successfully.
    Complete,
    /// Finished with a failure diagnostic.
    Failed,
    /// Stopped by a cancellation signal.
    Cancelled,
}

impl Status {
    /// Returns true if the status can never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the status is not terminal.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// The transition table. Terminal states have no outgoing edges.
    pub fn can_transition_to(&self, next: Status) -> bool {
        use Status::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Pending)
                | (Running, Complete)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    /// Checked transition.
    pub fn transition(self, next: Status) -> Result<Status, CoreError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status of a worker slot as seen by the Manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotStatus {
    /// Slot exists but its worker has not said hello yet.
    #[default]
    Connecting,
    /// Worker is alive and holds no unit.
    Idle,
    /// Worker is executing a unit.
    Busy,
    /// Worker is presumed dead; unusable until it rejoins.
    Dead,
}

impl SlotStatus {
    /// Returns true if the slot's worker is believed to be running.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Idle | Self::Busy)
    }
}
