//! Deterministic demo cluster
//!
//! Builds a DGX-style cluster from a [`ClusterConfig`]. The same seed always
//! yields the same UUIDs, serial numbers and GUIDs.

use crate::config::ClusterConfig;
use crate::state::{
    Bmc, ClusterState, Clocks, EccErrors, Gpu, Hca, HcaPort, Node, NvLink, PortErrors,
    BASELINE_POWER_W, BASELINE_TEMPERATURE_C,
};
use crate::types::{HealthStatus, NodeId, PhysicalState, PortState, PowerState, SchedulerState, SystemType};
use chrono::{TimeZone, Utc};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

const A100_GPU_BUSES: [u32; 8] = [0x07, 0x0f, 0x47, 0x4e, 0x87, 0x90, 0xb7, 0xbd];
const H100_GPU_BUSES: [u32; 8] = [0x18, 0x2a, 0x3a, 0x5d, 0x9a, 0xab, 0xba, 0xdb];
const A100_HCA_BUSES: [u32; 4] = [0x0c, 0x12, 0x8d, 0x94];
const H100_HCA_BUSES: [u32; 4] = [0x1a, 0x3c, 0x9c, 0xbc];

const NVLINKS_PER_GPU: u32 = 12;
const GPU_MEMORY_MIB: u64 = 81920;

/// Build the demo cluster described by `config`
pub fn demo_cluster(config: &ClusterConfig) -> ClusterState {
    let mut rng = SmallRng::seed_from_u64(config.seed);
    let boot_time = Utc
        .with_ymd_and_hms(2024, 1, 15, 8, 0, 0)
        .single()
        .unwrap_or_else(Utc::now);

    let nodes = (0..config.nodes)
        .map(|i| create_node(i, config, &mut rng))
        .collect();

    ClusterState {
        name: config.name.clone(),
        system_type: config.system_type,
        simulation_speed: config.simulation_speed,
        boot_time,
        nodes,
        jobs: Vec::new(),
        next_job_id: 1000,
    }
}

fn create_node(index: u32, config: &ClusterConfig, rng: &mut SmallRng) -> Node {
    let hostname = format!("dgx-{:02}", index);
    let system = config.system_type;

    let gpus = (0..config.gpus_per_node)
        .map(|g| create_gpu(g, system, rng))
        .collect();
    let hcas = (0..4).map(|h| create_hca(h, system, rng)).collect();

    Node {
        id: NodeId::new(hostname.clone()),
        hostname,
        partition: "batch".to_string(),
        gpus,
        hcas,
        bmc: Bmc {
            ip_address: format!("10.0.1.{}", 10 + index),
            mac_address: format!("5c:ff:35:{:02x}:{:02x}:{:02x}", index, rng.gen::<u8>(), rng.gen::<u8>()),
            firmware_version: "01.00.20".to_string(),
            manufacturer: "NVIDIA".to_string(),
            power_state: PowerState::On,
            sel: Vec::new(),
        },
        scheduler_state: SchedulerState::Idle,
        scheduler_reason: None,
        reason_set_at: None,
        health: HealthStatus::Ok,
        cpu_count: 128,
        ram_total_gb: 2048,
        ram_used_gb: 64,
        driver_version: "535.129.03".to_string(),
        cuda_version: "12.2".to_string(),
        kernel_version: "5.15.0-1042-nvidia".to_string(),
    }
}

fn gpu_bus(index: u32, system: SystemType) -> u32 {
    let table = match system {
        SystemType::DgxA100 => &A100_GPU_BUSES,
        SystemType::DgxH100 => &H100_GPU_BUSES,
    };
    table
        .get(index as usize)
        .copied()
        .unwrap_or(0xc0 + index)
}

fn create_gpu(index: u32, system: SystemType, rng: &mut SmallRng) -> Gpu {
    let (sm_max, memory_max, link_speed) = match system {
        SystemType::DgxA100 => (1410, 1593, 25.0),
        SystemType::DgxH100 => (1980, 2619, 26.562),
    };

    let mut gpu = Gpu {
        id: index,
        name: system.gpu_name().to_string(),
        uuid: format!("GPU-{}", Uuid::from_u128(rng.gen::<u128>())),
        serial: format!("1654922{:06}", rng.gen_range(0..1_000_000)),
        pci_address: format!("00000000:{:02X}:00.0", gpu_bus(index, system)),
        vbios_version: "92.00.45.00.03".to_string(),
        temperature: BASELINE_TEMPERATURE_C,
        power_draw: BASELINE_POWER_W,
        power_limit: system.power_limit(),
        max_power_limit: system.power_limit(),
        memory_used: 0,
        memory_total: GPU_MEMORY_MIB,
        utilization: 0,
        clocks: Clocks {
            sm: sm_max,
            memory: memory_max,
            sm_max,
            memory_max,
        },
        ecc: EccErrors::default(),
        xid_errors: Vec::new(),
        mig_mode: false,
        mig_instances: Vec::new(),
        nvlinks: (0..NVLINKS_PER_GPU)
            .map(|link| NvLink {
                link,
                active: true,
                speed_gbps: link_speed,
                replay_errors: 0,
                crc_errors: 0,
            })
            .collect(),
        health: HealthStatus::Ok,
        persistence_mode: true,
        hung: false,
        allocated_job: None,
    };
    gpu.reset_to_baseline();
    gpu
}

fn create_hca(index: u32, system: SystemType, rng: &mut SmallRng) -> Hca {
    let bus = match system {
        SystemType::DgxA100 => A100_HCA_BUSES[index as usize % 4],
        SystemType::DgxH100 => H100_HCA_BUSES[index as usize % 4],
    };
    let guid: u64 = 0xb8ce_f603_0000_0000 | (rng.gen::<u32>() as u64);

    Hca {
        id: index,
        ca_name: format!("mlx5_{}", index),
        ca_type: system.hca_model().to_string(),
        device_path: format!("/dev/infiniband/uverbs{}", index),
        pci_address: format!("0000:{:02x}:00.0", bus),
        firmware_version: "20.39.1002".to_string(),
        node_guid: format!("0x{:016x}", guid),
        ports: vec![HcaPort {
            port: 1,
            state: PortState::Active,
            physical_state: PhysicalState::LinkUp,
            rate: system.hca_rate(),
            lid: 100 + index,
            sm_lid: 1,
            port_guid: format!("0x{:016x}", guid),
            link_layer: "InfiniBand".to_string(),
            errors: PortErrors::default(),
        }],
    }
}
