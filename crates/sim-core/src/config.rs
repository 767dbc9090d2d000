//! Configuration management for clustersim
//!
//! Supports YAML files, environment variables and command-line overrides,
//! layered with the `config` crate.

use crate::types::SystemType;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Shape of the demo cluster created at session start
    pub cluster: ClusterConfig,

    /// Snapshot retention and storage
    pub snapshots: SnapshotConfig,

    /// Terminal output settings
    pub output: OutputConfig,

    /// "Did you mean" suggestion tuning
    pub matcher: MatcherConfig,
}

/// Demo cluster shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub name: String,
    pub nodes: u32,
    pub gpus_per_node: u32,
    pub system_type: SystemType,
    /// Seed for UUIDs and serial numbers
    pub seed: u64,
    pub simulation_speed: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "dgx-cluster".to_string(),
            nodes: 4,
            gpus_per_node: 8,
            system_type: SystemType::DgxA100,
            seed: 42,
            simulation_speed: 1.0,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.nodes == 0 {
            return Err(Error::config("cluster.nodes must be at least 1"));
        }
        if self.gpus_per_node == 0 || self.gpus_per_node > 16 {
            return Err(Error::config("cluster.gpus_per_node must be between 1 and 16"));
        }
        if self.simulation_speed <= 0.0 {
            return Err(Error::config("cluster.simulation_speed must be positive"));
        }
        Ok(())
    }
}

/// Snapshot retention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// JSON file the snapshot list is persisted to; in-memory only when unset
    pub storage_path: Option<PathBuf>,
    /// Oldest non-baseline snapshots are evicted past this count
    pub max_snapshots: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            storage_path: None,
            max_snapshots: 20,
        }
    }
}

/// Terminal output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub color: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { color: true }
    }
}

/// Fuzzy matcher settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    pub max_distance: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self { max_distance: 3 }
    }
}

impl SimConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest)
    /// 2. Configuration file (explicit path, `CLUSTERSIM_CONFIG`, or `./clustersim.yaml`)
    /// 3. Defaults (lowest)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path.to_path_buf()));
            }
            None => {
                if let Ok(config_path) = std::env::var("CLUSTERSIM_CONFIG") {
                    builder =
                        builder.add_source(config::File::with_name(&config_path).required(false));
                } else {
                    builder = builder
                        .add_source(config::File::with_name("./clustersim.yaml").required(false));
                }
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CLUSTERSIM")
                .separator("__")
                .try_parsing(true),
        );

        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;
        debug!(
            "Configuration loaded: {} nodes x {} GPUs ({})",
            parsed.cluster.nodes, parsed.cluster.gpus_per_node, parsed.cluster.system_type
        );
        Ok(parsed)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.cluster.validate()?;
        if self.snapshots.max_snapshots == 0 {
            return Err(Error::config("snapshots.max_snapshots must be at least 1"));
        }
        Ok(())
    }

    /// Render the effective configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
