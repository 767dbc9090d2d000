//! Cluster state model
//!
//! `ClusterState` is the single source of truth every simulated tool reads
//! and writes. Tools never cache derived views: anything a tool prints is
//! recomputed from these structures on each call.

use crate::types::{
    HealthStatus, JobState, NodeId, PhysicalState, PortState, PowerState, SchedulerState,
    Severity, SystemType,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// XID code for a GPU that has fallen off the PCIe bus
pub const XID_FALLEN_OFF_BUS: u32 = 79;

/// Temperature above which a GPU is considered thermally throttled
pub const THERMAL_SLOWDOWN_C: u32 = 80;

/// Baseline metrics a healthy, idle GPU reports
pub const BASELINE_TEMPERATURE_C: u32 = 45;
pub const BASELINE_POWER_W: f64 = 300.0;

/// Utilization reported by a GPU that runs a scheduler job
pub const JOB_UTILIZATION: u32 = 97;

/// Scheduler reason of a node that is down because its chassis is off
pub const POWERED_OFF_REASON: &str = "Node powered off";

/// Human readable description of an XID code
pub fn xid_description(code: u32) -> &'static str {
    match code {
        13 => "Graphics Engine Exception",
        31 => "GPU memory page fault",
        43 => "GPU stopped processing",
        45 => "Preemptive cleanup, due to previous errors",
        48 => "Double Bit ECC Error",
        61 => "Internal micro-controller breakpoint/warning",
        62 => "Internal micro-controller halt",
        63 => "ECC page retirement or row remapping recording event",
        64 => "ECC page retirement or row remapper recording failure",
        74 => "NVLink Error",
        79 => "GPU has fallen off the bus",
        92 => "High single-bit ECC error rate",
        94 => "Contained ECC error",
        95 => "Uncontained ECC error",
        119 => "GSP RPC Timeout",
        120 => "GSP Error",
        _ => "Unknown XID error",
    }
}

/// Root aggregate of the simulated cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Cluster name as reported by the scheduler
    pub name: String,
    pub system_type: SystemType,
    /// Multiplier applied to elapsed time before deferred events fire
    pub simulation_speed: f64,
    /// Boot time shared by every node; kernel log offsets are relative to it
    pub boot_time: DateTime<Utc>,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default = "default_next_job_id")]
    pub next_job_id: u32,
}

fn default_next_job_id() -> u32 {
    1000
}

/// A compute node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub hostname: String,
    pub partition: String,
    pub gpus: Vec<Gpu>,
    pub hcas: Vec<Hca>,
    pub bmc: Bmc,
    pub scheduler_state: SchedulerState,
    pub scheduler_reason: Option<String>,
    pub reason_set_at: Option<DateTime<Utc>>,
    pub health: HealthStatus,
    pub cpu_count: u32,
    pub ram_total_gb: u32,
    pub ram_used_gb: u32,
    pub driver_version: String,
    pub cuda_version: String,
    pub kernel_version: String,
}

/// Clock frequencies in MHz
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clocks {
    pub sm: u32,
    pub memory: u32,
    pub sm_max: u32,
    pub memory_max: u32,
}

/// Single- and double-bit ECC error counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EccCounts {
    pub single_bit: u64,
    pub double_bit: u64,
}

/// ECC counters: volatile (since last reset) and aggregate (lifetime)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EccErrors {
    pub volatile: EccCounts,
    pub aggregate: EccCounts,
}

impl EccErrors {
    /// Raise counters to at least the given values.
    ///
    /// Never lowers a counter, so re-applying the same observation is a no-op.
    pub fn raise_to(&mut self, single_bit: u64, double_bit: u64) {
        self.volatile.single_bit = self.volatile.single_bit.max(single_bit);
        self.volatile.double_bit = self.volatile.double_bit.max(double_bit);
        self.aggregate.single_bit = self.aggregate.single_bit.max(single_bit);
        self.aggregate.double_bit = self.aggregate.double_bit.max(double_bit);
    }

    /// Clear the volatile counters; aggregate counters survive a GPU reset
    pub fn reset_volatile(&mut self) {
        self.volatile = EccCounts::default();
    }
}

/// An XID event recorded by the driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XidError {
    pub code: u32,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub severity: Severity,
}

impl XidError {
    pub fn new(code: u32, timestamp: DateTime<Utc>, severity: Severity) -> Self {
        Self {
            code,
            timestamp,
            description: xid_description(code).to_string(),
            severity,
        }
    }
}

/// A MIG GPU instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigInstance {
    pub gpu_instance_id: u32,
    pub profile_id: u32,
    pub profile: String,
    pub placement_start: u32,
    pub placement_size: u32,
    pub memory_mib: u64,
}

/// An NVLink connection of a GPU
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NvLink {
    pub link: u32,
    pub active: bool,
    /// Per-link bandwidth in GB/s
    pub speed_gbps: f64,
    pub replay_errors: u64,
    pub crc_errors: u64,
}

/// A simulated GPU
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gpu {
    pub id: u32,
    pub name: String,
    pub uuid: String,
    pub serial: String,
    /// Bus id in nvidia-smi format, e.g. `00000000:07:00.0`
    pub pci_address: String,
    pub vbios_version: String,
    pub temperature: u32,
    pub power_draw: f64,
    pub power_limit: f64,
    pub max_power_limit: f64,
    /// Memory in MiB
    pub memory_used: u64,
    pub memory_total: u64,
    pub utilization: u32,
    pub clocks: Clocks,
    pub ecc: EccErrors,
    pub xid_errors: Vec<XidError>,
    pub mig_mode: bool,
    pub mig_instances: Vec<MigInstance>,
    pub nvlinks: Vec<NvLink>,
    pub health: HealthStatus,
    pub persistence_mode: bool,
    /// Set while the GPU is stuck and not accepting work
    #[serde(default)]
    pub hung: bool,
    pub allocated_job: Option<u32>,
}

impl Gpu {
    /// Whether an XID 79 was recorded; such a GPU is invisible to enumeration
    pub fn is_fallen_off_bus(&self) -> bool {
        self.xid_errors.iter().any(|x| x.code == XID_FALLEN_OFF_BUS)
    }

    /// Most recent XID event
    pub fn latest_xid(&self) -> Option<&XidError> {
        self.xid_errors.iter().max_by_key(|x| x.timestamp)
    }

    /// Whether the GPU is hot enough to be clocked down
    pub fn is_throttled(&self) -> bool {
        self.temperature > THERMAL_SLOWDOWN_C
    }

    /// Whether uncorrectable ECC errors were ever recorded
    pub fn has_double_bit_errors(&self) -> bool {
        self.ecc.aggregate.double_bit > 0
    }

    /// Short bus id (`07:00.0`) as printed by lspci
    pub fn short_pci_address(&self) -> &str {
        short_bdf(&self.pci_address)
    }

    /// NVLinks that are down
    pub fn inactive_links(&self) -> impl Iterator<Item = &NvLink> {
        self.nvlinks.iter().filter(|l| !l.active)
    }

    /// Return the GPU to the clean, idle baseline
    pub fn reset_to_baseline(&mut self) {
        self.temperature = BASELINE_TEMPERATURE_C;
        self.power_draw = BASELINE_POWER_W;
        self.utilization = 0;
        self.memory_used = 0;
        self.health = HealthStatus::Ok;
        self.ecc = EccErrors::default();
        self.xid_errors.clear();
        self.hung = false;
        self.clocks.sm = self.clocks.sm_max;
        self.clocks.memory = self.clocks.memory_max;
        for link in &mut self.nvlinks {
            link.active = true;
            link.replay_errors = 0;
            link.crc_errors = 0;
        }
    }

    /// Report the load of a running job
    pub fn show_job_load(&mut self) {
        self.utilization = JOB_UTILIZATION;
        self.memory_used = self.memory_total * 3 / 4;
    }

    /// Re-derive the health enum from the recorded fault evidence
    pub fn derived_health(&self) -> HealthStatus {
        let mut health = HealthStatus::Ok;
        for xid in &self.xid_errors {
            health = health.max(xid.severity.health());
        }
        if self.has_double_bit_errors() || self.hung || self.temperature >= 90 {
            health = health.max(HealthStatus::Critical);
        }
        if self.is_throttled()
            || self.ecc.aggregate.single_bit > 0
            || self.inactive_links().next().is_some()
            || self.power_draw > self.power_limit
            || self.memory_used >= self.memory_total
        {
            health = health.max(HealthStatus::Warning);
        }
        health
    }
}

/// Error counters of an HCA port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortErrors {
    pub symbol_errors: u64,
    pub link_downed: u64,
    pub rcv_errors: u64,
    pub xmit_discards: u64,
}

/// An InfiniBand port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HcaPort {
    pub port: u32,
    pub state: PortState,
    pub physical_state: PhysicalState,
    /// Rate in Gb/s
    pub rate: u32,
    pub lid: u32,
    pub sm_lid: u32,
    pub port_guid: String,
    pub link_layer: String,
    pub errors: PortErrors,
}

/// A host channel adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hca {
    pub id: u32,
    pub ca_name: String,
    pub ca_type: String,
    pub device_path: String,
    pub pci_address: String,
    pub firmware_version: String,
    pub node_guid: String,
    pub ports: Vec<HcaPort>,
}

/// An entry of the BMC system event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelEntry {
    pub id: u32,
    pub timestamp: DateTime<Utc>,
    pub sensor: String,
    pub event: String,
    pub asserted: bool,
}

/// Baseboard management controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bmc {
    pub ip_address: String,
    pub mac_address: String,
    pub firmware_version: String,
    pub manufacturer: String,
    pub power_state: PowerState,
    pub sel: Vec<SelEntry>,
}

impl Bmc {
    /// Append a SEL record unless an identical assertion is already logged
    pub fn log_event(&mut self, timestamp: DateTime<Utc>, sensor: &str, event: &str) {
        let exists = self
            .sel
            .iter()
            .any(|e| e.asserted && e.sensor == sensor && e.event == event);
        if exists {
            return;
        }
        let id = self.sel.iter().map(|e| e.id).max().unwrap_or(0) + 1;
        self.sel.push(SelEntry {
            id,
            timestamp,
            sensor: sensor.to_string(),
            event: event.to_string(),
            asserted: true,
        });
    }
}

/// A scheduler job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: u32,
    pub name: String,
    pub user: String,
    pub partition: String,
    /// Node requested with `-w`, if any
    pub requested_node: Option<NodeId>,
    /// Node the job runs on once started
    pub node: Option<NodeId>,
    pub gpus_requested: u32,
    pub gpu_ids: Vec<u32>,
    pub state: JobState,
    /// Pending reason as shown by squeue
    pub reason: Option<String>,
    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub time_limit_minutes: Option<u32>,
}

impl Node {
    /// GPUs visible to enumeration (excludes GPUs that fell off the bus)
    pub fn visible_gpus(&self) -> impl Iterator<Item = &Gpu> {
        self.gpus.iter().filter(|g| !g.is_fallen_off_bus())
    }

    /// GPUs that fell off the bus
    pub fn fallen_gpus(&self) -> impl Iterator<Item = &Gpu> {
        self.gpus.iter().filter(|g| g.is_fallen_off_bus())
    }

    pub fn gpu(&self, id: u32) -> Option<&Gpu> {
        self.gpus.iter().find(|g| g.id == id)
    }

    pub fn gpu_mut(&mut self, id: u32) -> Option<&mut Gpu> {
        self.gpus.iter_mut().find(|g| g.id == id)
    }

    /// GPUs that a job could be placed on
    pub fn free_gpus(&self) -> Vec<u32> {
        self.gpus
            .iter()
            .filter(|g| g.allocated_job.is_none() && !g.is_fallen_off_bus() && !g.hung)
            .map(|g| g.id)
            .collect()
    }

    /// Recompute each GPU's health and the node health from them
    pub fn recompute_health(&mut self) {
        let mut node_health = HealthStatus::Ok;
        for gpu in &mut self.gpus {
            gpu.health = gpu.derived_health();
            node_health = node_health.max(gpu.health);
        }
        let link_down = self
            .hcas
            .iter()
            .flat_map(|h| h.ports.iter())
            .any(|p| p.state != PortState::Active);
        if link_down {
            node_health = node_health.max(HealthStatus::Warning);
        }
        self.health = node_health;
    }

    /// Return a node that was down only because it was powered off to service
    pub fn release_power_off_hold(&mut self) {
        if self.scheduler_reason.as_deref() == Some(POWERED_OFF_REASON) {
            self.scheduler_state = SchedulerState::Idle;
            self.scheduler_reason = None;
            self.reason_set_at = None;
        }
        self.refresh_scheduler_state();
    }

    /// Derive the scheduler state from GPU allocations, keeping drain/down
    pub fn refresh_scheduler_state(&mut self) {
        let allocated = self.gpus.iter().filter(|g| g.allocated_job.is_some()).count();
        let usable = self.gpus.iter().filter(|g| !g.is_fallen_off_bus()).count();
        self.scheduler_state = match self.scheduler_state {
            SchedulerState::Down => SchedulerState::Down,
            SchedulerState::Draining | SchedulerState::Drained => {
                if allocated > 0 {
                    SchedulerState::Draining
                } else {
                    SchedulerState::Drained
                }
            }
            _ if allocated == 0 => SchedulerState::Idle,
            _ if allocated >= usable => SchedulerState::Allocated,
            _ => SchedulerState::Mixed,
        };
    }
}

impl ClusterState {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| n.id.as_str() == id || n.hostname == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes
            .iter_mut()
            .find(|n| n.id.as_str() == id || n.hostname == id)
    }

    /// Total number of GPUs, including ones that fell off the bus
    pub fn gpu_count(&self) -> usize {
        self.nodes.iter().map(|n| n.gpus.len()).sum()
    }

    pub fn job(&self, id: u32) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    /// Record a new pending job and return its id
    pub fn submit_job(&mut self, mut job: Job) -> u32 {
        let id = self.next_job_id;
        self.next_job_id += 1;
        job.id = id;
        job.state = JobState::Pending;
        job.reason = Some("None".to_string());
        debug!("Job {} '{}' queued for {} GPUs", id, job.name, job.gpus_requested);
        self.jobs.push(job);
        id
    }

    /// Move a pending job to running and allocate GPUs for it.
    ///
    /// Returns `Ok(false)` if no node has enough free GPUs; the job stays
    /// pending with reason `Resources`.
    pub fn start_job(&mut self, job_id: u32, now: DateTime<Utc>) -> Result<bool> {
        let job_idx = self
            .jobs
            .iter()
            .position(|j| j.id == job_id)
            .ok_or_else(|| Error::not_found(format!("job {}", job_id)))?;
        if self.jobs[job_idx].state != JobState::Pending {
            return Ok(false);
        }

        let wanted = self.jobs[job_idx].gpus_requested as usize;
        let requested = self.jobs[job_idx].requested_node.clone();
        let partition = self.jobs[job_idx].partition.clone();
        let target = self.nodes.iter().position(|n| {
            let name_ok = requested.as_ref().map_or(true, |r| &n.id == r);
            name_ok
                && n.partition == partition
                && n.scheduler_state.accepts_jobs()
                && n.free_gpus().len() >= wanted
        });

        let Some(node_idx) = target else {
            debug!("Job {} waiting for resources", job_id);
            self.jobs[job_idx].reason = Some("Resources".to_string());
            return Ok(false);
        };

        let node = &mut self.nodes[node_idx];
        let gpu_ids: Vec<u32> = node.free_gpus().into_iter().take(wanted).collect();
        for gpu in node.gpus.iter_mut().filter(|g| gpu_ids.contains(&g.id)) {
            gpu.allocated_job = Some(job_id);
            gpu.show_job_load();
        }
        node.refresh_scheduler_state();
        let node_id = node.id.clone();

        let job = &mut self.jobs[job_idx];
        job.state = JobState::Running;
        job.reason = None;
        job.node = Some(node_id);
        job.gpu_ids = gpu_ids;
        job.start_time = Some(now);
        info!("Job {} started on {} with GPUs {:?}", job_id, self.nodes[node_idx].id, job.gpu_ids);
        Ok(true)
    }

    /// End a job and release its GPUs
    pub fn finish_job(&mut self, job_id: u32, state: JobState, now: DateTime<Utc>) -> Result<()> {
        let job = self
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| Error::not_found(format!("job {}", job_id)))?;
        if !job.state.is_active() {
            return Err(Error::state(format!(
                "job {} already {}",
                job_id,
                job.state.to_string().to_lowercase()
            )));
        }
        info!("Job {} finished as {}", job_id, state);
        job.state = state;
        job.end_time = Some(now);
        job.reason = None;
        let node_id = job.node.clone();

        if let Some(node) = node_id.and_then(|id| {
            self.nodes.iter_mut().find(|n| n.id == id)
        }) {
            for gpu in node.gpus.iter_mut().filter(|g| g.allocated_job == Some(job_id)) {
                gpu.allocated_job = None;
                gpu.utilization = 0;
                gpu.memory_used = 0;
            }
            node.refresh_scheduler_state();
        }
        Ok(())
    }
}

/// Strip the PCI domain from a bus id: `00000000:07:00.0` becomes `07:00.0`
pub fn short_bdf(address: &str) -> &str {
    match address.match_indices(':').count() {
        2 => address.split_once(':').map(|(_, rest)| rest).unwrap_or(address),
        _ => address,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::fixtures::demo_cluster;

    fn cluster() -> ClusterState {
        demo_cluster(&ClusterConfig {
            nodes: 2,
            gpus_per_node: 4,
            ..ClusterConfig::default()
        })
    }

    #[test]
    fn test_fallen_gpu_is_hidden() {
        let mut state = cluster();
        let now = state.boot_time;
        let node = state.node_mut("dgx-00").unwrap();
        node.gpus[1]
            .xid_errors
            .push(XidError::new(XID_FALLEN_OFF_BUS, now, Severity::Critical));

        let visible: Vec<u32> = node.visible_gpus().map(|g| g.id).collect();
        assert_eq!(visible, vec![0, 2, 3]);
        assert_eq!(node.fallen_gpus().count(), 1);
        assert!(!node.free_gpus().contains(&1));
    }

    #[test]
    fn test_ecc_counters_never_decrease() {
        let mut ecc = EccErrors::default();
        ecc.raise_to(5, 1);
        ecc.raise_to(2, 0);
        assert_eq!(ecc.aggregate.single_bit, 5);
        assert_eq!(ecc.aggregate.double_bit, 1);

        ecc.reset_volatile();
        assert_eq!(ecc.volatile, EccCounts::default());
        assert_eq!(ecc.aggregate.double_bit, 1);
    }

    #[test]
    fn test_job_lifecycle_updates_gpus_and_node_state() {
        let mut state = cluster();
        let now = state.boot_time;
        let id = state.submit_job(Job {
            id: 0,
            name: "train".into(),
            user: "root".into(),
            partition: "batch".into(),
            requested_node: Some(NodeId::new("dgx-01")),
            node: None,
            gpus_requested: 2,
            gpu_ids: vec![],
            state: JobState::Pending,
            reason: None,
            submit_time: now,
            start_time: None,
            end_time: None,
            time_limit_minutes: None,
        });

        assert!(state.start_job(id, now).unwrap());
        let node = state.node("dgx-01").unwrap();
        assert_eq!(node.scheduler_state, SchedulerState::Mixed);
        assert_eq!(node.gpus[0].utilization, JOB_UTILIZATION);
        assert_eq!(node.gpus[0].allocated_job, Some(id));

        state.finish_job(id, JobState::Completed, now).unwrap();
        let node = state.node("dgx-01").unwrap();
        assert_eq!(node.scheduler_state, SchedulerState::Idle);
        assert_eq!(node.gpus[0].utilization, 0);
        assert!(state.finish_job(id, JobState::Cancelled, now).is_err());
    }

    #[test]
    fn test_drain_survives_allocation_refresh() {
        let mut state = cluster();
        let node = state.node_mut("dgx-00").unwrap();
        node.scheduler_state = SchedulerState::Drained;
        node.refresh_scheduler_state();
        assert_eq!(node.scheduler_state, SchedulerState::Drained);
    }

    #[test]
    fn test_short_bdf() {
        assert_eq!(short_bdf("00000000:07:00.0"), "07:00.0");
        assert_eq!(short_bdf("07:00.0"), "07:00.0");
    }
}
