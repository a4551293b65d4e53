//! Newtype wrappers for identifiers to ensure type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier from a string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the inner string reference.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner string.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// Unique identifier for a pipeline run.
    RunId
);

string_id!(
    /// Identifier of a pipeline definition.
    PipelineId
);

string_id!(
    /// Identifier of a step, unique within its pipeline definition.
    StepId
);

string_id!(
    /// Identifier of a task unit, unique across runs.
    UnitId
);

string_id!(
    /// Identity of a dataset. The scheduling core never looks inside it.
    DatasetRef
);

impl RunId {
    /// Generate a new random RunId.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl UnitId {
    /// Unit id for a step of a run: `<run_id>/<step_id>`.
    pub fn for_step(run_id: &RunId, step_id: &StepId) -> Self {
        Self(format!("{}/{}", run_id, step_id))
    }
}

/// Position of a process in the cluster. Rank 0 is the Manager.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Rank(u32);

impl Rank {
    /// The Manager's rank.
    pub const MANAGER: Rank = Rank(0);

    pub const fn new(rank: u32) -> Self {
        Self(rank)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub fn is_manager(self) -> bool {
        self == Self::MANAGER
    }

    /// Every worker rank of a cluster of `size` processes.
    pub fn workers(size: usize) -> impl Iterator<Item = Rank> {
        (1..size as u32).map(Rank)
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Rank {
    fn from(rank: u32) -> Self {
        Self(rank)
    }
}
