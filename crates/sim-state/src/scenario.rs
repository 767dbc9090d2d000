//! Scenario and fault-file descriptors

use serde::{Deserialize, Serialize};
use sim_core::ClusterState;
use std::fs;
use std::path::Path;

use crate::faults::FaultInjectionConfig;
use crate::{Result, StateError};

/// A training scenario: faults to inject, optionally on a custom cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub faults: Vec<FaultInjectionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_cluster_state: Option<ClusterState>,
}

impl Scenario {
    pub fn from_json(text: &str) -> Result<Self> {
        let scenario: Scenario = serde_json::from_str(text)?;
        if scenario.id.trim().is_empty() {
            return Err(StateError::Scenario("scenario id must not be empty".into()));
        }
        Ok(scenario)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FaultFile {
    Many(Vec<FaultInjectionConfig>),
    One(FaultInjectionConfig),
    Scenario { faults: Vec<FaultInjectionConfig> },
}

/// Parse fault descriptors from a single object, a list, or any object
/// with a `faults` list
pub fn parse_faults(text: &str) -> Result<Vec<FaultInjectionConfig>> {
    let file: FaultFile = serde_json::from_str(text)
        .map_err(|e| StateError::InvalidFault(format!("unrecognised fault file: {}", e)))?;
    Ok(match file {
        FaultFile::Many(faults) | FaultFile::Scenario { faults } => faults,
        FaultFile::One(fault) => vec![fault],
    })
}

pub fn load_faults(path: &Path) -> Result<Vec<FaultInjectionConfig>> {
    let text = fs::read_to_string(path)?;
    parse_faults(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faults::FaultKind;

    #[test]
    fn test_scenario_from_json() {
        let scenario = Scenario::from_json(
            r#"{
                "id": "xid-79-drill",
                "title": "GPU fell off the bus",
                "faults": [
                    { "nodeId": "dgx-00", "gpuId": 0, "type": "xid-error",
                      "severity": "critical", "parameters": { "xid": 79 } }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(scenario.id, "xid-79-drill");
        assert_eq!(scenario.faults.len(), 1);
        assert_eq!(scenario.faults[0].fault, FaultKind::XidError { xid: 79 });
        assert!(scenario.initial_cluster_state.is_none());
    }

    #[test]
    fn test_empty_id_is_rejected() {
        assert!(matches!(
            Scenario::from_json(r#"{ "id": " " }"#),
            Err(StateError::Scenario(_))
        ));
    }

    #[test]
    fn test_fault_file_shapes() {
        let one = r#"{ "nodeId": "dgx-00", "type": "gpu-hang", "severity": "critical" }"#;
        assert_eq!(parse_faults(one).unwrap().len(), 1);

        let many = format!("[{one}, {one}]");
        assert_eq!(parse_faults(&many).unwrap().len(), 2);

        let wrapped = format!(r#"{{ "id": "x", "faults": [{one}] }}"#);
        assert_eq!(parse_faults(&wrapped).unwrap().len(), 1);

        assert!(parse_faults("42").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario.json");
        fs::write(&path, r#"{ "id": "thermal", "faults": [] }"#).unwrap();
        assert_eq!(Scenario::load(&path).unwrap().id, "thermal");
        assert!(Scenario::load(&dir.path().join("missing.json")).is_err());
    }
}
