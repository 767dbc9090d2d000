//! # sim-state
//!
//! Live state management for clustersim.
//!
//! This crate provides:
//! - [`ClusterStore`], the single owner of the live cluster state and the simulated clock
//! - Fault injection from `{ nodeId, gpuId?, type, severity, parameters? }` descriptors
//! - A deferred-event queue for delayed mutations such as job start
//! - Snapshot capture, restore and optional JSON persistence
//! - Scenario and fault-file loading

use thiserror::Error;

pub mod events;
pub mod faults;
pub mod scenario;
pub mod snapshot;
pub mod store;

// Re-export commonly used types
pub use events::{EventQueue, StateEvent, JOB_START_DELAY_MS};
pub use faults::{apply_faults, clear_all_faults, FaultInjectionConfig, FaultKind};
pub use scenario::{load_faults, parse_faults, Scenario};
pub use snapshot::{SnapshotManager, SnapshotMetadata, StateSnapshot};
pub use store::ClusterStore;

/// Result type for state operations
pub type Result<T> = std::result::Result<T, StateError>;

/// Errors that can occur during state operations
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Invalid fault descriptor: {0}")]
    InvalidFault(String),

    #[error("Scenario error: {0}")]
    Scenario(String),

    #[error("Snapshot persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Core error: {0}")]
    Core(#[from] sim_core::Error),
}

impl StateError {
    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            StateError::InvalidFault(_) => "invalid_fault",
            StateError::Scenario(_) => "scenario",
            StateError::Persistence(_) => "persistence",
            StateError::Serialization(_) => "serialization",
            StateError::Io(_) => "io",
            StateError::Core(e) => e.category(),
        }
    }
}
