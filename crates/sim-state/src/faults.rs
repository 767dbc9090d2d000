//! Fault injection
//!
//! A fault descriptor on the wire is `{ nodeId, gpuId?, type, severity,
//! parameters? }`. It is parsed into a [`FaultKind`] carrying only the
//! parameters its type understands. Types the simulator does not know are
//! kept as [`FaultKind::Unrecognized`] and skipped with a warning.
//!
//! Every fault sets values or raises counters to a floor rather than adding
//! to them, so applying the same descriptor twice leaves the state exactly as
//! applying it once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sim_core::state::THERMAL_SLOWDOWN_C;
use sim_core::{
    ClusterState, Gpu, HealthStatus, Node, NodeId, PhysicalState, PortErrors, PortState,
    PowerState, Severity, XidError, XID_FALLEN_OFF_BUS,
};
use tracing::{debug, info, warn};

use crate::StateError;

const XID_PAGE_FAULT: u32 = 31;
const XID_GPU_STOPPED: u32 = 43;
const XID_NVLINK: u32 = 74;

/// Type-specific fault parameters
#[derive(Debug, Clone, PartialEq)]
pub enum FaultKind {
    /// `xid-error`: record an XID event (`xid`, default 79)
    XidError { xid: u32 },
    /// `thermal`: force the GPU temperature (`temperature`, default 92)
    Thermal { temperature: u32 },
    /// `ecc-error`: raise ECC counters (`singleBit`, `doubleBit`)
    EccError { single_bit: u64, double_bit: u64 },
    /// `nvlink-failure`: take one NVLink down (`link`, default 0)
    NvlinkFailure { link: u32 },
    /// `gpu-hang`: GPU stops processing (XID 43)
    GpuHang,
    /// `power`: force the power draw (`powerDraw`, default limit + 50 W)
    Power { power_draw: Option<f64> },
    /// `memory-full`: all framebuffer memory in use
    MemoryFull,
    /// `ib-link-down`: an InfiniBand port loses link (`hca`, `port`)
    IbLinkDown { hca: u32, port: u32 },
    /// Any other type tag
    Unrecognized(String),
}

impl FaultKind {
    /// The type tag as written in fault descriptors
    pub fn type_name(&self) -> &str {
        match self {
            FaultKind::XidError { .. } => "xid-error",
            FaultKind::Thermal { .. } => "thermal",
            FaultKind::EccError { .. } => "ecc-error",
            FaultKind::NvlinkFailure { .. } => "nvlink-failure",
            FaultKind::GpuHang => "gpu-hang",
            FaultKind::Power { .. } => "power",
            FaultKind::MemoryFull => "memory-full",
            FaultKind::IbLinkDown { .. } => "ib-link-down",
            FaultKind::Unrecognized(name) => name,
        }
    }

    fn from_parts(fault_type: &str, params: &Map<String, Value>) -> Result<Self, StateError> {
        let kind = match fault_type {
            "xid-error" | "xid" => FaultKind::XidError {
                xid: param_u64(params, &["xid", "xidCode", "code"])?
                    .map_or(Ok(XID_FALLEN_OFF_BUS), u32::try_from)
                    .map_err(|_| StateError::InvalidFault("xid out of range".into()))?,
            },
            "thermal" => FaultKind::Thermal {
                temperature: param_u64(params, &["temperature", "temp"])?.unwrap_or(92) as u32,
            },
            "ecc-error" | "ecc" => FaultKind::EccError {
                single_bit: param_u64(params, &["singleBit", "single_bit", "sbe"])?.unwrap_or(0),
                double_bit: param_u64(params, &["doubleBit", "double_bit", "dbe"])?.unwrap_or(0),
            },
            "nvlink-failure" | "nvlink" => FaultKind::NvlinkFailure {
                link: param_u64(params, &["link", "linkId"])?.unwrap_or(0) as u32,
            },
            "gpu-hang" | "hang" => FaultKind::GpuHang,
            "power" => FaultKind::Power {
                power_draw: param_f64(params, &["powerDraw", "power_draw", "watts"])?,
            },
            "memory-full" => FaultKind::MemoryFull,
            "ib-link-down" => FaultKind::IbLinkDown {
                hca: param_u64(params, &["hca"])?.unwrap_or(0) as u32,
                port: param_u64(params, &["port"])?.unwrap_or(1) as u32,
            },
            other => FaultKind::Unrecognized(other.to_string()),
        };
        Ok(kind)
    }

    fn to_params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        match self {
            FaultKind::XidError { xid } => {
                params.insert("xid".into(), (*xid).into());
            }
            FaultKind::Thermal { temperature } => {
                params.insert("temperature".into(), (*temperature).into());
            }
            FaultKind::EccError {
                single_bit,
                double_bit,
            } => {
                params.insert("singleBit".into(), (*single_bit).into());
                params.insert("doubleBit".into(), (*double_bit).into());
            }
            FaultKind::NvlinkFailure { link } => {
                params.insert("link".into(), (*link).into());
            }
            FaultKind::Power {
                power_draw: Some(watts),
            } => {
                params.insert("powerDraw".into(), (*watts).into());
            }
            FaultKind::IbLinkDown { hca, port } => {
                params.insert("hca".into(), (*hca).into());
                params.insert("port".into(), (*port).into());
            }
            _ => {}
        }
        params
    }
}

fn param<'a>(params: &'a Map<String, Value>, names: &[&str]) -> Option<(&'a str, &'a Value)> {
    names
        .iter()
        .find_map(|n| params.get_key_value(*n))
        .map(|(k, v)| (k.as_str(), v))
}

fn param_u64(params: &Map<String, Value>, names: &[&str]) -> Result<Option<u64>, StateError> {
    match param(params, names) {
        None => Ok(None),
        Some((_, Value::String(s))) if s.parse::<u64>().is_ok() => Ok(s.parse().ok()),
        Some((key, value)) => value.as_u64().map(Some).ok_or_else(|| {
            StateError::InvalidFault(format!("parameter '{}' must be a non-negative integer", key))
        }),
    }
}

fn param_f64(params: &Map<String, Value>, names: &[&str]) -> Result<Option<f64>, StateError> {
    match param(params, names) {
        None => Ok(None),
        Some((key, value)) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| StateError::InvalidFault(format!("parameter '{}' must be a number", key))),
    }
}

/// A request to force part of the cluster into an abnormal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFaultConfig", into = "RawFaultConfig")]
pub struct FaultInjectionConfig {
    pub node_id: NodeId,
    /// Target GPU; `None` applies GPU faults to every GPU of the node
    pub gpu_id: Option<u32>,
    pub fault: FaultKind,
    pub severity: Severity,
}

impl FaultInjectionConfig {
    pub fn new(node_id: impl Into<NodeId>, gpu_id: Option<u32>, fault: FaultKind) -> Self {
        Self {
            node_id: node_id.into(),
            gpu_id,
            fault,
            severity: Severity::Critical,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// Wire form of [`FaultInjectionConfig`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFaultConfig {
    node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gpu_id: Option<u32>,
    #[serde(rename = "type")]
    fault_type: String,
    #[serde(default = "default_severity")]
    severity: Severity,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    parameters: Map<String, Value>,
}

fn default_severity() -> Severity {
    Severity::Warning
}

impl TryFrom<RawFaultConfig> for FaultInjectionConfig {
    type Error = StateError;

    fn try_from(raw: RawFaultConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            fault: FaultKind::from_parts(&raw.fault_type, &raw.parameters)?,
            node_id: NodeId::new(raw.node_id),
            gpu_id: raw.gpu_id,
            severity: raw.severity,
        })
    }
}

impl From<FaultInjectionConfig> for RawFaultConfig {
    fn from(config: FaultInjectionConfig) -> Self {
        Self {
            node_id: config.node_id.to_string(),
            gpu_id: config.gpu_id,
            fault_type: config.fault.type_name().to_string(),
            severity: config.severity,
            parameters: config.fault.to_params(),
        }
    }
}

/// Apply faults to the cluster and return how many took effect.
///
/// Descriptors that name a missing node or GPU, or an unknown fault type,
/// are logged and skipped.
pub fn apply_faults(
    state: &mut ClusterState,
    faults: &[FaultInjectionConfig],
    now: DateTime<Utc>,
) -> usize {
    let mut applied = 0;
    for fault in faults {
        if let FaultKind::Unrecognized(name) = &fault.fault {
            warn!("Ignoring fault with unrecognized type '{}'", name);
            continue;
        }
        let Some(node) = state.node_mut(fault.node_id.as_str()) else {
            warn!("Ignoring {} fault for unknown node {}", fault.fault.type_name(), fault.node_id);
            continue;
        };
        if apply_to_node(node, fault, now) {
            info!(
                "Applied {} fault to {}{}",
                fault.fault.type_name(),
                fault.node_id,
                fault.gpu_id.map(|g| format!(" GPU {}", g)).unwrap_or_default()
            );
            applied += 1;
        }
        node.recompute_health();
    }
    applied
}

fn apply_to_node(node: &mut Node, fault: &FaultInjectionConfig, now: DateTime<Utc>) -> bool {
    if let FaultKind::IbLinkDown { hca, port } = fault.fault {
        return ib_link_down(node, hca, port);
    }

    let targets: Vec<u32> = match fault.gpu_id {
        Some(id) if node.gpu(id).is_some() => vec![id],
        Some(id) => {
            warn!("Ignoring {} fault for unknown GPU {} on {}", fault.fault.type_name(), id, node.id);
            return false;
        }
        None => node.gpus.iter().map(|g| g.id).collect(),
    };

    for id in targets {
        let Some(gpu) = node.gpu_mut(id) else {
            continue;
        };
        apply_to_gpu(gpu, &fault.fault, fault.severity, now);
        let critical = gpu.derived_health() == HealthStatus::Critical;
        if critical {
            node.bmc
                .log_event(now, &format!("GPU{} Status", id), "Critical fault asserted");
        }
        if let FaultKind::Thermal { temperature } = fault.fault {
            if temperature > THERMAL_SLOWDOWN_C {
                node.bmc.log_event(
                    now,
                    &format!("GPU{} Temp", id),
                    "Upper Non-critical going high",
                );
            }
        }
    }
    true
}

fn record_xid(gpu: &mut Gpu, code: u32, severity: Severity, now: DateTime<Utc>) {
    if gpu.xid_errors.iter().any(|x| x.code == code) {
        debug!("GPU {} already reports XID {}", gpu.id, code);
        return;
    }
    gpu.xid_errors.push(XidError::new(code, now, severity));
}

fn apply_to_gpu(gpu: &mut Gpu, fault: &FaultKind, severity: Severity, now: DateTime<Utc>) {
    match *fault {
        FaultKind::XidError { xid } => {
            record_xid(gpu, xid, severity, now);
            match xid {
                XID_FALLEN_OFF_BUS => {
                    gpu.utilization = 0;
                    gpu.power_draw = 0.0;
                }
                48 => gpu.ecc.raise_to(0, 1),
                XID_NVLINK => set_link_down(gpu, 0),
                _ => {}
            }
        }
        FaultKind::Thermal { temperature } => {
            gpu.temperature = temperature;
            gpu.clocks.sm = if temperature > THERMAL_SLOWDOWN_C {
                gpu.clocks.sm_max * 7 / 10
            } else {
                gpu.clocks.sm_max
            };
        }
        FaultKind::EccError {
            single_bit,
            double_bit,
        } => gpu.ecc.raise_to(single_bit, double_bit),
        FaultKind::NvlinkFailure { link } => {
            set_link_down(gpu, link);
            record_xid(gpu, XID_NVLINK, severity, now);
        }
        FaultKind::GpuHang => {
            record_xid(gpu, XID_GPU_STOPPED, Severity::Critical, now);
            gpu.hung = true;
            gpu.utilization = 100;
        }
        FaultKind::Power { power_draw } => {
            gpu.power_draw = power_draw.unwrap_or(gpu.power_limit + 50.0);
        }
        FaultKind::MemoryFull => {
            gpu.memory_used = gpu.memory_total;
            if severity == Severity::Critical {
                record_xid(gpu, XID_PAGE_FAULT, severity, now);
            }
        }
        FaultKind::IbLinkDown { .. } | FaultKind::Unrecognized(_) => {}
    }
}

fn set_link_down(gpu: &mut Gpu, link: u32) {
    if let Some(nvlink) = gpu.nvlinks.iter_mut().find(|l| l.link == link) {
        nvlink.active = false;
        nvlink.replay_errors = nvlink.replay_errors.max(128);
        nvlink.crc_errors = nvlink.crc_errors.max(32);
    }
}

fn ib_link_down(node: &mut Node, hca: u32, port: u32) -> bool {
    let node_id = node.id.clone();
    let Some(port) = node
        .hcas
        .iter_mut()
        .find(|h| h.id == hca)
        .and_then(|h| h.ports.iter_mut().find(|p| p.port == port))
    else {
        warn!("Ignoring ib-link-down fault for unknown port mlx5_{}/{} on {}", hca, port, node_id);
        return false;
    };
    if port.state != PortState::Down {
        port.errors.link_downed += 1;
    }
    port.state = PortState::Down;
    port.physical_state = PhysicalState::Disabled;
    true
}

/// Return every GPU and node to the canonical healthy baseline.
///
/// Jobs keep running: GPUs they hold go on reporting job load, and a node
/// that was down only because it was powered off returns to service.
pub fn clear_all_faults(state: &mut ClusterState) {
    for node in &mut state.nodes {
        for gpu in &mut node.gpus {
            gpu.reset_to_baseline();
            if gpu.allocated_job.is_some() {
                gpu.show_job_load();
            }
        }
        for port in node.hcas.iter_mut().flat_map(|h| h.ports.iter_mut()) {
            port.state = PortState::Active;
            port.physical_state = PhysicalState::LinkUp;
            port.errors = PortErrors::default();
        }
        node.bmc.sel.clear();
        node.bmc.power_state = PowerState::On;
        node.health = HealthStatus::Ok;
        node.release_power_off_hold();
    }
    info!("Cleared all faults on {} nodes", state.nodes.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_core::fixtures::demo_cluster;
    use sim_core::state::{JOB_UTILIZATION, POWERED_OFF_REASON};
    use sim_core::{ClusterConfig, Job, JobState, SchedulerState};

    fn cluster() -> ClusterState {
        demo_cluster(&ClusterConfig {
            nodes: 2,
            gpus_per_node: 4,
            ..ClusterConfig::default()
        })
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_parse_wire_format() {
        let json = r#"{
            "nodeId": "dgx-00",
            "gpuId": 3,
            "type": "thermal",
            "severity": "critical",
            "parameters": { "temperature": 95 }
        }"#;
        let fault: FaultInjectionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(fault.node_id.as_str(), "dgx-00");
        assert_eq!(fault.gpu_id, Some(3));
        assert_eq!(fault.fault, FaultKind::Thermal { temperature: 95 });
        assert_eq!(fault.severity, Severity::Critical);
    }

    #[test]
    fn test_unknown_type_parses_and_is_ignored() {
        let json = r#"{ "nodeId": "dgx-00", "type": "cosmic-ray", "severity": "info" }"#;
        let fault: FaultInjectionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(fault.fault, FaultKind::Unrecognized("cosmic-ray".into()));

        let mut state = cluster();
        let before = state.clone();
        assert_eq!(apply_faults(&mut state, &[fault], now()), 0);
        assert_eq!(state, before);
    }

    #[test]
    fn test_bad_parameter_type_is_rejected() {
        let json = r#"{ "nodeId": "dgx-00", "type": "xid-error", "parameters": { "xid": "abc" } }"#;
        assert!(serde_json::from_str::<FaultInjectionConfig>(json).is_err());
    }

    #[test]
    fn test_xid_79_hides_gpu() {
        let mut state = cluster();
        let fault = FaultInjectionConfig::new("dgx-00", Some(1), FaultKind::XidError { xid: 79 });
        assert_eq!(apply_faults(&mut state, &[fault], now()), 1);

        let node = state.node("dgx-00").unwrap();
        assert!(node.gpus[1].is_fallen_off_bus());
        assert_eq!(node.gpus[1].health, HealthStatus::Critical);
        assert_eq!(node.health, HealthStatus::Critical);
        assert_eq!(node.visible_gpus().count(), 3);
        assert!(!node.bmc.sel.is_empty());
    }

    #[test]
    fn test_fault_application_is_idempotent() {
        let faults = vec![
            FaultInjectionConfig::new("dgx-00", Some(0), FaultKind::XidError { xid: 48 }),
            FaultInjectionConfig::new(
                "dgx-00",
                Some(1),
                FaultKind::EccError {
                    single_bit: 10,
                    double_bit: 2,
                },
            ),
            FaultInjectionConfig::new("dgx-01", None, FaultKind::Thermal { temperature: 88 }),
            FaultInjectionConfig::new("dgx-01", None, FaultKind::IbLinkDown { hca: 2, port: 1 }),
        ];
        let at = now();
        let mut once = cluster();
        apply_faults(&mut once, &faults, at);
        let mut twice = once.clone();
        apply_faults(&mut twice, &faults, at);
        assert_eq!(once, twice);

        let port = &twice.node("dgx-01").unwrap().hcas[2].ports[0];
        assert_eq!(port.state, PortState::Down);
        assert_eq!(port.errors.link_downed, 1);
    }

    #[test]
    fn test_thermal_throttles_clocks() {
        let mut state = cluster();
        let fault = FaultInjectionConfig::new("dgx-00", Some(2), FaultKind::Thermal { temperature: 86 })
            .with_severity(Severity::Warning);
        apply_faults(&mut state, &[fault], now());

        let gpu = &state.node("dgx-00").unwrap().gpus[2];
        assert_eq!(gpu.temperature, 86);
        assert!(gpu.is_throttled());
        assert!(gpu.clocks.sm < gpu.clocks.sm_max);
        assert_eq!(gpu.health, HealthStatus::Warning);
    }

    #[test]
    fn test_gpu_hang() {
        let mut state = cluster();
        let fault = FaultInjectionConfig::new("dgx-01", Some(0), FaultKind::GpuHang)
            .with_severity(Severity::Info);
        apply_faults(&mut state, &[fault], now());

        let gpu = &state.node("dgx-01").unwrap().gpus[0];
        assert!(gpu.hung);
        assert_eq!(gpu.utilization, 100);
        assert_eq!(gpu.latest_xid().map(|x| x.code), Some(43));
        assert_eq!(gpu.health, HealthStatus::Critical);
    }

    #[test]
    fn test_missing_targets_are_skipped() {
        let mut state = cluster();
        let faults = vec![
            FaultInjectionConfig::new("dgx-99", Some(0), FaultKind::MemoryFull),
            FaultInjectionConfig::new("dgx-00", Some(42), FaultKind::MemoryFull),
        ];
        assert_eq!(apply_faults(&mut state, &faults, now()), 0);
    }

    #[test]
    fn test_clear_all_faults_is_idempotent() {
        let mut state = cluster();
        let faults = vec![
            FaultInjectionConfig::new("dgx-00", None, FaultKind::XidError { xid: 79 }),
            FaultInjectionConfig::new("dgx-01", Some(1), FaultKind::NvlinkFailure { link: 3 }),
            FaultInjectionConfig::new("dgx-01", None, FaultKind::IbLinkDown { hca: 0, port: 1 }),
        ];
        apply_faults(&mut state, &faults, now());

        clear_all_faults(&mut state);
        let once = state.clone();
        clear_all_faults(&mut state);
        assert_eq!(state, once);

        let gpu = &state.node("dgx-00").unwrap().gpus[0];
        assert!(gpu.xid_errors.is_empty());
        assert_eq!(gpu.temperature, 45);
        assert_eq!(gpu.power_draw, 300.0);
        assert_eq!(state.node("dgx-01").unwrap().health, HealthStatus::Ok);
    }

    #[test]
    fn test_clear_keeps_running_jobs_loaded() {
        let mut state = cluster();
        let id = state.submit_job(Job {
            id: 0,
            name: "train".into(),
            user: "root".into(),
            partition: "batch".into(),
            requested_node: None,
            node: None,
            gpus_requested: 2,
            gpu_ids: Vec::new(),
            state: JobState::Pending,
            reason: None,
            submit_time: now(),
            start_time: None,
            end_time: None,
            time_limit_minutes: None,
        });
        assert!(state.start_job(id, now()).unwrap());
        apply_faults(
            &mut state,
            &[FaultInjectionConfig::new("dgx-00", Some(0), FaultKind::Thermal { temperature: 95 })],
            now(),
        );

        clear_all_faults(&mut state);
        let node = state.node("dgx-00").unwrap();
        assert_eq!(node.gpus[0].temperature, 45);
        assert_eq!(node.gpus[0].utilization, JOB_UTILIZATION);
        assert_eq!(node.gpus[1].memory_used, node.gpus[1].memory_total * 3 / 4);
        assert_eq!(node.gpus[2].utilization, 0);
        assert_eq!(node.scheduler_state, SchedulerState::Mixed);
        assert_eq!(state.job(id).unwrap().state, JobState::Running);
    }

    #[test]
    fn test_clear_brings_powered_off_node_back() {
        let mut state = cluster();
        let node = state.node_mut("dgx-01").unwrap();
        node.bmc.power_state = PowerState::Off;
        node.scheduler_state = SchedulerState::Down;
        node.scheduler_reason = Some(POWERED_OFF_REASON.to_string());
        node.reason_set_at = Some(now());
        let drained = state.node_mut("dgx-00").unwrap();
        drained.scheduler_state = SchedulerState::Drained;
        drained.scheduler_reason = Some("bad cable".to_string());

        clear_all_faults(&mut state);
        let node = state.node("dgx-01").unwrap();
        assert_eq!(node.bmc.power_state, PowerState::On);
        assert_eq!(node.scheduler_state, SchedulerState::Idle);
        assert_eq!(node.scheduler_reason, None);
        // An admin drain is not a fault
        let drained = state.node("dgx-00").unwrap();
        assert_eq!(drained.scheduler_state, SchedulerState::Drained);
        assert_eq!(drained.scheduler_reason.as_deref(), Some("bad cable"));
    }

    #[test]
    fn test_clear_on_empty_cluster() {
        let mut state = cluster();
        state.nodes.clear();
        clear_all_faults(&mut state);
        assert!(state.nodes.is_empty());
    }

    #[test]
    fn test_serialize_round_trip_keeps_wire_shape() {
        let fault = FaultInjectionConfig::new("dgx-00", None, FaultKind::IbLinkDown { hca: 1, port: 1 });
        let value = serde_json::to_value(&fault).unwrap();
        assert_eq!(value["type"], "ib-link-down");
        assert_eq!(value["nodeId"], "dgx-00");
        assert!(value.get("gpuId").is_none());
        assert_eq!(value["parameters"]["hca"], 1);
    }
}
