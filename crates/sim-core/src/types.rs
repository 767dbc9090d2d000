//! Core type definitions for clustersim

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a node in the simulated cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a new NodeId from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string representation of the NodeId
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Hardware platform being simulated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemType {
    #[serde(rename = "DGX-A100")]
    DgxA100,
    #[serde(rename = "DGX-H100")]
    DgxH100,
}

impl SystemType {
    /// Marketing name of the GPU fitted to this platform
    pub fn gpu_name(&self) -> &'static str {
        match self {
            SystemType::DgxA100 => "NVIDIA A100-SXM4-80GB",
            SystemType::DgxH100 => "NVIDIA H100 80GB HBM3",
        }
    }

    /// PCI device description of the GPU as printed by lspci
    pub fn gpu_pci_description(&self) -> &'static str {
        match self {
            SystemType::DgxA100 => "NVIDIA Corporation GA100 [A100 SXM4 80GB]",
            SystemType::DgxH100 => "NVIDIA Corporation GH100 [H100 SXM5 80GB]",
        }
    }

    /// PCI device id of the GPU
    pub fn gpu_device_id(&self) -> &'static str {
        match self {
            SystemType::DgxA100 => "20b2",
            SystemType::DgxH100 => "2330",
        }
    }

    /// Default board power limit in watts
    pub fn power_limit(&self) -> f64 {
        match self {
            SystemType::DgxA100 => 400.0,
            SystemType::DgxH100 => 700.0,
        }
    }

    /// Link rate of the compute fabric HCAs in Gb/s
    pub fn hca_rate(&self) -> u32 {
        match self {
            SystemType::DgxA100 => 200,
            SystemType::DgxH100 => 400,
        }
    }

    /// HCA model string
    pub fn hca_model(&self) -> &'static str {
        match self {
            SystemType::DgxA100 => "MT4123",
            SystemType::DgxH100 => "MT4129",
        }
    }
}

impl std::str::FromStr for SystemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace('_', "-").as_str() {
            "DGX-A100" | "A100" => Ok(SystemType::DgxA100),
            "DGX-H100" | "H100" => Ok(SystemType::DgxH100),
            _ => Err(format!("Unknown system type: {}", s)),
        }
    }
}

impl fmt::Display for SystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemType::DgxA100 => write!(f, "DGX-A100"),
            SystemType::DgxH100 => write!(f, "DGX-H100"),
        }
    }
}

/// Overall health of a GPU or node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthStatus {
    #[default]
    #[serde(rename = "OK")]
    Ok,
    Warning,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Ok => write!(f, "OK"),
            HealthStatus::Warning => write!(f, "Warning"),
            HealthStatus::Critical => write!(f, "Critical"),
        }
    }
}

/// Severity attached to XID events and injected faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Health status a fault of this severity pushes a GPU to
    pub fn health(&self) -> HealthStatus {
        match self {
            Severity::Info => HealthStatus::Ok,
            Severity::Warning => HealthStatus::Warning,
            Severity::Critical => HealthStatus::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Slurm node state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    #[default]
    Idle,
    Mixed,
    Allocated,
    /// Drain requested while jobs are still running
    Draining,
    Drained,
    Down,
}

impl SchedulerState {
    /// Full state name as shown by `sinfo -N -l` and `scontrol`
    pub fn long_name(&self) -> &'static str {
        match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Mixed => "mixed",
            SchedulerState::Allocated => "allocated",
            SchedulerState::Draining => "draining",
            SchedulerState::Drained => "drained",
            SchedulerState::Down => "down",
        }
    }

    /// Abbreviated state name as shown by default `sinfo`
    pub fn short_name(&self) -> &'static str {
        match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Mixed => "mix",
            SchedulerState::Allocated => "alloc",
            SchedulerState::Draining => "drng",
            SchedulerState::Drained => "drain",
            SchedulerState::Down => "down",
        }
    }

    /// State as reported by `scontrol show node`
    pub fn scontrol_name(&self) -> &'static str {
        match self {
            SchedulerState::Idle => "IDLE",
            SchedulerState::Mixed => "MIXED",
            SchedulerState::Allocated => "ALLOCATED",
            SchedulerState::Draining => "MIXED+DRAIN",
            SchedulerState::Drained => "IDLE+DRAIN",
            SchedulerState::Down => "DOWN",
        }
    }

    /// Whether new jobs may be placed on a node in this state
    pub fn accepts_jobs(&self) -> bool {
        matches!(self, SchedulerState::Idle | SchedulerState::Mixed)
    }

    /// Whether a drain was requested on the node
    pub fn is_drain(&self) -> bool {
        matches!(self, SchedulerState::Draining | SchedulerState::Drained)
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.long_name())
    }
}

/// Chassis power state reported by the BMC
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    #[default]
    On,
    Off,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::On => write!(f, "on"),
            PowerState::Off => write!(f, "off"),
        }
    }
}

/// Logical state of an InfiniBand port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortState {
    #[default]
    Active,
    Down,
    Initializing,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortState::Active => write!(f, "Active"),
            PortState::Down => write!(f, "Down"),
            PortState::Initializing => write!(f, "Initializing"),
        }
    }
}

/// Physical state of an InfiniBand port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhysicalState {
    #[default]
    LinkUp,
    Disabled,
    Polling,
}

impl fmt::Display for PhysicalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysicalState::LinkUp => write!(f, "LinkUp"),
            PhysicalState::Disabled => write!(f, "Disabled"),
            PhysicalState::Polling => write!(f, "Polling"),
        }
    }
}

/// Lifecycle of a scheduler job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Cancelled,
}

impl JobState {
    /// Two-letter code used by `squeue`
    pub fn code(&self) -> &'static str {
        match self {
            JobState::Pending => "PD",
            JobState::Running => "R",
            JobState::Completed => "CD",
            JobState::Cancelled => "CA",
        }
    }

    /// Whether the job still counts against the queue
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "PENDING"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Completed => write!(f, "COMPLETED"),
            JobState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}
