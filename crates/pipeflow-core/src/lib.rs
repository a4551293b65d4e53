//! pipeflow Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/transport
//! - Storage
//! - Runtime specifics
//!
//! The run graph in [`graph`] is the single place where run and unit status
//! transitions happen.

pub mod cancel;
pub mod error;
pub mod graph;
pub mod ids;
pub mod pipeline;
pub mod run;
pub mod status;
pub mod unit;

// Re-export commonly used types
pub use cancel::{CancelReason, CancellationSignal};
pub use error::{CoreError, MalformedPipelineError};
pub use graph::{Advance, RunGraph};
pub use ids::{DatasetRef, PipelineId, Rank, RunId, StepId, UnitId};
pub use pipeline::{PipelineDefinition, StepSpec};
pub use run::Run;
pub use status::{SlotStatus, Status};
pub use unit::{DatasetHandle, FailureDiagnostic, TaskUnit, UnitOutcome};
