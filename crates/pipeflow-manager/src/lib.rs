//! pipeflow Manager Library
//!
//! The Manager discovers submitted runs in the run registry, expands them
//! into task units, hands ready units to idle workers over the transport,
//! and records outcomes back into the registry.

pub mod cancellation;
pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod runs;
pub mod scheduler;
pub mod slots;

pub use config::ManagerConfig;
pub use error::{ManagerError, RegistryError};
pub use manager::Manager;
pub use registry::{DefinitionStore, DirRegistry, MemoryRegistry, RunRegistry};
