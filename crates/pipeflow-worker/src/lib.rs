//! pipeflow Worker Library
//!
//! A worker waits for a unit assignment, executes the bound step through a
//! [`StepEngine`], reports the outcome to the manager, and repeats until the
//! manager tells it to shut down.

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod process;
pub mod worker;

pub use config::WorkerConfig;
pub use engine::{Interrupt, StepEngine, StepInvocation, StepResult, StopExecution};
pub use error::{EngineError, WorkerError};
pub use process::ProcessEngine;
pub use worker::Worker;
