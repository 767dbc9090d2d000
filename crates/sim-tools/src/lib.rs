//! # sim-tools
//!
//! Simulated cluster administration tools for clustersim.
//!
//! This crate provides:
//! - The [`Simulator`] contract and the table-driven [`ToolRegistry`]
//! - nvidia-smi, dcgmi, the Slurm commands, ipmitool, lspci, dmesg and ibstat
//! - The session [`Engine`] that parses lines, dispatches them and applies pipes

pub mod engine;
pub mod simulator;
pub mod tools;

// Re-export commonly used types
pub use engine::{Engine, ScenarioOutcome};
pub use simulator::{
    CommandMetadata, CommandResult, FlagMetadata, SimContext, Simulator, SimulatorMetadata,
    ToolRegistry,
};
