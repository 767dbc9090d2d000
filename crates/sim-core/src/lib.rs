//! # sim-core
//!
//! Core types for clustersim, an offline simulator of GPU cluster
//! administration tools.
//!
//! This crate provides the foundational pieces shared by every other crate:
//!
//! - The cluster-state model: nodes, GPUs, HCAs, BMCs and scheduler jobs
//! - Configuration schema and layered loading
//! - Error handling types
//! - A deterministic demo cluster used at session start and in tests

pub mod config;
pub mod error;
pub mod fixtures;
pub mod state;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::{ClusterConfig, MatcherConfig, OutputConfig, SimConfig, SnapshotConfig};
pub use error::{Error, ErrorContext, Result};
pub use state::{
    Bmc, ClusterState, Clocks, EccCounts, EccErrors, Gpu, Hca, HcaPort, Job, MigInstance, Node,
    NvLink, PortErrors, SelEntry, XidError, XID_FALLEN_OFF_BUS,
};
pub use types::{
    HealthStatus, JobState, NodeId, PhysicalState, PortState, PowerState, SchedulerState,
    Severity, SystemType,
};
