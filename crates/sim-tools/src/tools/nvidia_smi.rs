//! nvidia-smi
//!
//! GPUs that fell off the bus are never enumerated: listings skip them and
//! print a warning banner instead, and any request that targets one fails
//! with the driver's "GPU is lost" diagnostic.

use super::{fallen_banner, suggestion, HandlerResult};
use crate::simulator::{CommandMetadata, CommandResult, FlagMetadata, SimContext, ToolRegistry};
use chrono::{DateTime, Utc};
use sim_core::{Gpu, MigInstance, Node, SystemType};
use sim_shell::ParsedCommand;

const NAME: &str = "nvidia-smi";
const WIDTH: usize = 87;

pub fn simulator() -> ToolRegistry {
    let id_flag = || FlagMetadata::both("i", "id", "Target GPUs by index, UUID or PCI bus id").takes("ID");
    ToolRegistry::new(NAME, "535.129.03", "NVIDIA System Management Interface")
        .usage("nvidia-smi [OPTION1 [ARG1]] [OPTION2 [ARG2]] ...")
        .version_flags(&["version"])
        .version_text(
            "NVIDIA-SMI version  : 535.129.03\n\
             NVML version        : 535.129\n\
             DRIVER version      : 535.129.03\n\
             CUDA Version        : 12.2",
        )
        .root(root)
        .flag(FlagMetadata::both("L", "list-gpus", "Display a list of GPUs connected to the system"))
        .flag(FlagMetadata::both("q", "query", "Display GPU or Unit info"))
        .flag(id_flag())
        .flag(
            FlagMetadata::both(
                "d",
                "display",
                "Display only selected information: MEMORY, UTILIZATION, ECC, TEMPERATURE, POWER, CLOCK, PERFORMANCE",
            )
            .takes("TYPE"),
        )
        .flag(FlagMetadata::long("query-gpu", "Information about GPU, comma separated fields").takes("FIELDS"))
        .flag(FlagMetadata::long("format", "Output format: csv[,noheader][,nounits]").takes("FORMAT"))
        .flag(FlagMetadata::both("r", "gpu-reset", "Trigger reset of the GPU"))
        .flag(FlagMetadata::both("pl", "power-limit", "Specify maximum power management limit in watts").takes("WATTS"))
        .flag(FlagMetadata::both("pm", "persistence-mode", "Set persistence mode: 0/DISABLED, 1/ENABLED").takes("MODE"))
        .flag(FlagMetadata::both("mig", "multi-instance-gpu", "Enable or disable MIG mode: 0/DISABLED, 1/ENABLED").takes("MODE"))
        .command(
            CommandMetadata::new("topo", "Display topological information about the system")
                .usage("nvidia-smi topo -m")
                .flag(FlagMetadata::both("m", "matrix", "Display the GPUDirect communication matrix"))
                .example("nvidia-smi topo -m"),
            topo,
        )
        .command(
            CommandMetadata::new("nvlink", "Display NvLink information")
                .usage("nvidia-smi nvlink [-s | -e] [-i ID]")
                .flag(FlagMetadata::both("s", "status", "Display link state"))
                .flag(FlagMetadata::both("e", "error-counters", "Display error counters"))
                .flag(id_flag())
                .example("nvidia-smi nvlink -s -i 0"),
            nvlink,
        )
        .command(
            CommandMetadata::new("mig", "Multi Instance GPU management")
                .usage("nvidia-smi mig [-lgip | -lgi | -cgi PROFILES [-C] | -dgi] [-i ID]")
                .flag(FlagMetadata::both("lgip", "list-gpu-instance-profiles", "List supported GPU instance profiles"))
                .flag(FlagMetadata::both("lgi", "list-gpu-instances", "List GPU instances"))
                .flag(
                    FlagMetadata::both("cgi", "create-gpu-instance", "Create GPU instances from profile names or ids")
                        .takes("PROFILES"),
                )
                .flag(FlagMetadata::both("C", "default-compute-instance", "Also create the default compute instance"))
                .flag(FlagMetadata::both("dgi", "destroy-gpu-instance", "Destroy all GPU instances"))
                .flag(id_flag())
                .example("nvidia-smi mig -lgip")
                .example("nvidia-smi mig -cgi 3g.40gb,3g.40gb -C -i 0"),
            mig,
        )
}

fn root(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    if parsed.has_flag(&["r", "gpu-reset"]) {
        return reset(parsed, ctx);
    }
    if parsed.has_flag(&["pl", "power-limit"]) {
        return set_power_limit(parsed, ctx);
    }
    if parsed.has_flag(&["pm", "persistence-mode"]) {
        return set_persistence(parsed, ctx);
    }
    if parsed.has_flag(&["mig", "multi-instance-gpu"]) {
        return set_mig_mode(parsed, ctx);
    }

    let now = ctx.now();
    let node = ctx.node()?;
    if parsed.has_flag(&["query-gpu"]) {
        return Ok(query_gpu(parsed, node, ctx, now));
    }
    let gpus = match targets(node, parsed) {
        Ok(gpus) => gpus,
        Err(result) => return Ok(result),
    };
    if parsed.has_flag(&["L", "list-gpus"]) {
        return Ok(CommandResult::ok(list_gpus(node, &gpus)));
    }
    if parsed.has_flag(&["q", "query"]) {
        return Ok(query(parsed, node, &gpus, ctx, now));
    }
    Ok(CommandResult::ok(summary(node, &gpus, ctx, now)))
}

fn find_gpu<'n>(node: &'n Node, spec: &str) -> Option<&'n Gpu> {
    let spec = spec.trim();
    let index = spec.parse::<u32>().ok();
    node.gpus.iter().find(|g| {
        index == Some(g.id)
            || g.uuid.eq_ignore_ascii_case(spec)
            || g.pci_address.eq_ignore_ascii_case(spec)
            || g.short_pci_address().eq_ignore_ascii_case(spec)
    })
}

fn gpu_lost(gpu: &Gpu) -> CommandResult {
    CommandResult::error(format!(
        "Unable to determine the device handle for GPU{}: GPU is lost.  Reboot the system to recover this GPU",
        gpu.pci_address
    ))
}

fn no_such_gpu(node: &Node, spec: &str) -> CommandResult {
    let valid: Vec<String> = node.visible_gpus().map(|g| g.id.to_string()).collect();
    CommandResult::error(format!(
        "No devices were found matching '{}'.\nValid GPU indices on {}: {}",
        spec,
        node.hostname,
        if valid.is_empty() { "none".to_string() } else { valid.join(", ") }
    ))
}

/// GPUs selected by `-i`, or every visible GPU
fn targets<'n>(node: &'n Node, parsed: &ParsedCommand) -> Result<Vec<&'n Gpu>, CommandResult> {
    match parsed.flag_value(&["i", "id"]) {
        None if parsed.has_flag(&["i", "id"]) => Err(CommandResult::error(
            "Option -i requires a GPU index, UUID or PCI bus id.\nRun 'nvidia-smi -h' for usage.",
        )),
        None => Ok(node.visible_gpus().collect()),
        Some(spec) => spec
            .split(',')
            .map(|s| match find_gpu(node, s) {
                Some(gpu) if gpu.is_fallen_off_bus() => Err(gpu_lost(gpu)),
                Some(gpu) => Ok(gpu),
                None => Err(no_such_gpu(node, s.trim())),
            })
            .collect(),
    }
}

fn target_ids(node: &Node, parsed: &ParsedCommand) -> Result<Vec<u32>, CommandResult> {
    targets(node, parsed).map(|gpus| gpus.iter().map(|g| g.id).collect())
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "Enabled"
    } else {
        "Disabled"
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(width.saturating_sub(3)).collect();
        cut.push_str("...");
        cut
    }
}

fn pid(job_id: u32, gpu_id: u32) -> u32 {
    10_000 + (job_id % 10_000) * 8 + gpu_id
}

fn process_name(ctx: &SimContext<'_>, job_id: u32) -> String {
    ctx.state()
        .job(job_id)
        .map(|j| j.name.clone())
        .unwrap_or_else(|| "python".to_string())
}

fn memory_utilization(gpu: &Gpu) -> u64 {
    if gpu.memory_total == 0 {
        0
    } else {
        gpu.memory_used * 100 / gpu.memory_total
    }
}

// Default summary table

fn full_row(content: &str) -> String {
    format!("|{:<width$}|", truncate(content, WIDTH), width = WIDTH)
}

fn split_rule(fill: &str, edge: char) -> String {
    format!("{edge}{}+{}+{}{edge}", fill.repeat(41), fill.repeat(22), fill.repeat(22))
}

fn summary(node: &Node, gpus: &[&Gpu], ctx: &SimContext<'_>, now: DateTime<Utc>) -> String {
    let border = format!("+{}+", "-".repeat(WIDTH));
    let mut lines = Vec::new();
    if let Some(banner) = fallen_banner(node) {
        lines.push(banner);
        lines.push(String::new());
    }
    lines.push(now.format("%a %b %e %H:%M:%S %Y").to_string());
    lines.push(border.clone());
    lines.push(full_row(&format!(
        " NVIDIA-SMI 535.129.03             Driver Version: {:<14} CUDA Version: {:<9}",
        node.driver_version, node.cuda_version
    )));
    lines.push(split_rule("-", '|'));
    lines.push("| GPU  Name                 Persistence-M | Bus-Id        Disp.A | Volatile Uncorr. ECC |".to_string());
    lines.push("| Fan  Temp   Perf          Pwr:Usage/Cap |         Memory-Usage | GPU-Util  Compute M. |".to_string());
    lines.push("|                                         |                      |               MIG M. |".to_string());
    lines.push(split_rule("=", '|'));

    for gpu in gpus {
        lines.push(format!(
            "| {:>3}  {:<28}{:>5}  | {:<16} {:>3} | {:>20} |",
            gpu.id,
            truncate(&gpu.name, 28),
            if gpu.persistence_mode { "On" } else { "Off" },
            gpu.pci_address,
            "Off",
            gpu.ecc.volatile.double_bit
        ));
        lines.push(format!(
            "| {:>3}  {:>4}   {:<4}  {:>21} | {:>20} | {:>8} {:>11} |",
            "N/A",
            format!("{}C", gpu.temperature),
            "P0",
            format!("{:.0}W / {:.0}W", gpu.power_draw, gpu.power_limit),
            format!("{}MiB / {}MiB", gpu.memory_used, gpu.memory_total),
            format!("{}%", gpu.utilization),
            "Default"
        ));
        lines.push(format!(
            "|{:41}|{:22}| {:>20} |",
            "",
            "",
            enabled(gpu.mig_mode)
        ));
        lines.push(split_rule("-", '+'));
    }

    lines.push(String::new());
    lines.push(border.clone());
    lines.push(full_row(" Processes:"));
    lines.push(full_row(
        "  GPU   GI   CI        PID   Type   Process name                            GPU Memory",
    ));
    lines.push(full_row(
        "        ID   ID                                                             Usage",
    ));
    lines.push(format!("|{}|", "=".repeat(WIDTH)));
    let mut any = false;
    for gpu in gpus {
        if let Some(job_id) = gpu.allocated_job {
            any = true;
            lines.push(full_row(&format!(
                "  {:>3}   N/A  N/A  {:>9}      C   {:<36} {:>9}MiB",
                gpu.id,
                pid(job_id, gpu.id),
                truncate(&process_name(ctx, job_id), 36),
                gpu.memory_used
            )));
        }
    }
    if !any {
        lines.push(full_row("  No running processes found"));
    }
    lines.push(border);
    lines.join("\n")
}

// -L

fn list_gpus(node: &Node, gpus: &[&Gpu]) -> String {
    let mut lines = Vec::new();
    if let Some(banner) = fallen_banner(node) {
        lines.push(banner);
    }
    for gpu in gpus {
        lines.push(format!("GPU {}: {} (UUID: {})", gpu.id, gpu.name, gpu.uuid));
        for (device, instance) in gpu.mig_instances.iter().enumerate() {
            lines.push(format!(
                "  MIG {:<11} Device {:>2}: (UUID: MIG-{}/{}/0)",
                instance.profile,
                device,
                gpu.uuid.trim_start_matches("GPU-"),
                instance.gpu_instance_id
            ));
        }
    }
    if gpus.is_empty() && lines.is_empty() {
        lines.push("No devices were found".to_string());
    }
    lines.join("\n")
}

// -q

const DISPLAY_SECTIONS: [&str; 7] = ["MEMORY", "UTILIZATION", "ECC", "TEMPERATURE", "POWER", "CLOCK", "PERFORMANCE"];

struct Report {
    lines: Vec<String>,
}

impl Report {
    fn header(&mut self, indent: usize, title: &str) {
        self.lines.push(format!("{}{}", " ".repeat(indent), title));
    }

    fn kv(&mut self, indent: usize, key: &str, value: impl std::fmt::Display) {
        self.lines.push(format!(
            "{}{:<width$}: {}",
            " ".repeat(indent),
            key,
            value,
            width = 42 - indent
        ));
    }
}

fn architecture(system: SystemType) -> (&'static str, &'static str) {
    match system {
        SystemType::DgxA100 => ("Ampere", "692-2G506-0212-002"),
        SystemType::DgxH100 => ("Hopper", "692-2G520-0200-000"),
    }
}

fn min_power_limit(system: SystemType) -> f64 {
    match system {
        SystemType::DgxA100 => 100.0,
        SystemType::DgxH100 => 200.0,
    }
}

fn active(flag: bool) -> &'static str {
    if flag {
        "Active"
    } else {
        "Not Active"
    }
}

fn query(parsed: &ParsedCommand, node: &Node, gpus: &[&Gpu], ctx: &SimContext<'_>, now: DateTime<Utc>) -> CommandResult {
    let sections: Vec<String> = match parsed.flag_value(&["d", "display"]) {
        Some(list) => {
            let requested: Vec<String> = list.split(',').map(|s| s.trim().to_uppercase()).collect();
            if let Some(bad) = requested.iter().find(|s| !DISPLAY_SECTIONS.contains(&s.as_str())) {
                return CommandResult::error(format!(
                    "Invalid display type '{}'.{}\nValid types: {}",
                    bad,
                    suggestion(ctx.matcher, bad, &DISPLAY_SECTIONS),
                    DISPLAY_SECTIONS.join(", ")
                ));
            }
            requested
        }
        None => Vec::new(),
    };
    let show = |section: &str| sections.is_empty() || sections.iter().any(|s| s == section);
    let system = ctx.state().system_type;

    let mut report = Report { lines: Vec::new() };
    if let Some(banner) = fallen_banner(node) {
        report.lines.push(banner);
        report.lines.push(String::new());
    }
    report.lines.push("==============NVSMI LOG==============".to_string());
    report.lines.push(String::new());
    report.kv(0, "Timestamp", now.format("%a %b %e %H:%M:%S %Y"));
    report.kv(0, "Driver Version", &node.driver_version);
    report.kv(0, "CUDA Version", &node.cuda_version);
    report.lines.push(String::new());
    report.kv(0, "Attached GPUs", node.visible_gpus().count());

    for gpu in gpus {
        report.header(0, &format!("GPU {}", gpu.pci_address));
        if sections.is_empty() {
            identity(&mut report, gpu, system);
        }
        if show("PERFORMANCE") {
            report.kv(4, "Performance State", "P0");
            report.header(4, "Clocks Event Reasons");
            report.kv(8, "Idle", active(gpu.utilization == 0));
            report.kv(8, "Applications Clocks Setting", "Not Active");
            report.kv(8, "SW Power Cap", active(gpu.power_draw > gpu.power_limit));
            report.kv(8, "HW Slowdown", active(gpu.is_throttled()));
            report.kv(8, "HW Thermal Slowdown", active(gpu.is_throttled()));
            report.kv(8, "SW Thermal Slowdown", "Not Active");
        }
        if show("MEMORY") {
            report.header(4, "FB Memory Usage");
            report.kv(8, "Total", format!("{} MiB", gpu.memory_total));
            report.kv(8, "Used", format!("{} MiB", gpu.memory_used));
            report.kv(8, "Free", format!("{} MiB", gpu.memory_total.saturating_sub(gpu.memory_used)));
        }
        if show("UTILIZATION") {
            report.header(4, "Utilization");
            report.kv(8, "Gpu", format!("{} %", gpu.utilization));
            report.kv(8, "Memory", format!("{} %", memory_utilization(gpu)));
            report.kv(8, "Encoder", "0 %");
            report.kv(8, "Decoder", "0 %");
        }
        if show("ECC") {
            ecc(&mut report, gpu);
        }
        if show("TEMPERATURE") {
            report.header(4, "Temperature");
            report.kv(8, "GPU Current Temp", format!("{} C", gpu.temperature));
            report.kv(8, "GPU Shutdown Temp", "92 C");
            report.kv(8, "GPU Slowdown Temp", format!("{} C", sim_core::state::THERMAL_SLOWDOWN_C));
            report.kv(8, "GPU Max Operating Temp", "85 C");
        }
        if show("POWER") {
            report.header(4, "GPU Power Readings");
            report.kv(8, "Power Draw", format!("{:.2} W", gpu.power_draw));
            report.kv(8, "Current Power Limit", format!("{:.2} W", gpu.power_limit));
            report.kv(8, "Requested Power Limit", format!("{:.2} W", gpu.power_limit));
            report.kv(8, "Default Power Limit", format!("{:.2} W", system.power_limit()));
            report.kv(8, "Min Power Limit", format!("{:.2} W", min_power_limit(system)));
            report.kv(8, "Max Power Limit", format!("{:.2} W", gpu.max_power_limit));
        }
        if show("CLOCK") {
            report.header(4, "Clocks");
            report.kv(8, "Graphics", format!("{} MHz", gpu.clocks.sm));
            report.kv(8, "SM", format!("{} MHz", gpu.clocks.sm));
            report.kv(8, "Memory", format!("{} MHz", gpu.clocks.memory));
            report.header(4, "Max Clocks");
            report.kv(8, "Graphics", format!("{} MHz", gpu.clocks.sm_max));
            report.kv(8, "SM", format!("{} MHz", gpu.clocks.sm_max));
            report.kv(8, "Memory", format!("{} MHz", gpu.clocks.memory_max));
        }
        if sections.is_empty() {
            processes(&mut report, gpu, ctx);
        }
        report.lines.push(String::new());
    }
    CommandResult::ok(report.lines.join("\n").trim_end().to_string())
}

fn identity(report: &mut Report, gpu: &Gpu, system: SystemType) {
    let (arch, part) = architecture(system);
    let bus = gpu.short_pci_address().split(':').next().unwrap_or("00");
    report.kv(4, "Product Name", &gpu.name);
    report.kv(4, "Product Brand", "NVIDIA");
    report.kv(4, "Product Architecture", arch);
    report.kv(4, "Display Mode", "Disabled");
    report.kv(4, "Display Active", "Disabled");
    report.kv(4, "Persistence Mode", enabled(gpu.persistence_mode));
    report.header(4, "MIG Mode");
    report.kv(8, "Current", enabled(gpu.mig_mode));
    report.kv(8, "Pending", enabled(gpu.mig_mode));
    report.kv(4, "Accounting Mode", "Disabled");
    report.kv(4, "Serial Number", &gpu.serial);
    report.kv(4, "GPU UUID", &gpu.uuid);
    report.kv(4, "Minor Number", gpu.id);
    report.kv(4, "VBIOS Version", &gpu.vbios_version);
    report.kv(4, "GPU Part Number", part);
    report.header(4, "PCI");
    report.kv(8, "Bus", format!("0x{}", bus));
    report.kv(8, "Device", "0x00");
    report.kv(8, "Domain", "0x0000");
    report.kv(8, "Device Id", format!("0x{}10DE", system.gpu_device_id().to_uppercase()));
    report.kv(8, "Bus Id", &gpu.pci_address);
    report.kv(4, "Fan Speed", "N/A");
    report.kv(4, "Compute Mode", "Default");
}

fn ecc(report: &mut Report, gpu: &Gpu) {
    report.header(4, "ECC Mode");
    report.kv(8, "Current", "Enabled");
    report.kv(8, "Pending", "Enabled");
    report.header(4, "ECC Errors");
    report.header(8, "Volatile");
    report.kv(12, "Single Bit ECC", gpu.ecc.volatile.single_bit);
    report.kv(12, "Double Bit ECC", gpu.ecc.volatile.double_bit);
    report.header(8, "Aggregate");
    report.kv(12, "Single Bit ECC", gpu.ecc.aggregate.single_bit);
    report.kv(12, "Double Bit ECC", gpu.ecc.aggregate.double_bit);
    report.header(4, "Remapped Rows");
    report.kv(8, "Correctable Error", gpu.ecc.aggregate.single_bit);
    report.kv(8, "Uncorrectable Error", gpu.ecc.aggregate.double_bit);
    report.kv(8, "Pending", if gpu.has_double_bit_errors() { "Yes" } else { "No" });
    report.kv(8, "Remapping Failure Occurred", "No");
}

fn processes(report: &mut Report, gpu: &Gpu, ctx: &SimContext<'_>) {
    let Some(job_id) = gpu.allocated_job else {
        report.kv(4, "Processes", "None");
        return;
    };
    report.header(4, "Processes");
    report.kv(8, "GPU instance ID", "N/A");
    report.kv(8, "Compute instance ID", "N/A");
    report.kv(8, "Process ID", pid(job_id, gpu.id));
    report.kv(8, "Type", "C");
    report.kv(8, "Name", process_name(ctx, job_id));
    report.kv(8, "Used GPU Memory", format!("{} MiB", gpu.memory_used));
}

// --query-gpu

const QUERY_FIELDS: [&str; 31] = [
    "timestamp",
    "driver_version",
    "count",
    "name",
    "serial",
    "uuid",
    "pci.bus_id",
    "index",
    "vbios_version",
    "persistence_mode",
    "pstate",
    "temperature.gpu",
    "utilization.gpu",
    "utilization.memory",
    "memory.total",
    "memory.used",
    "memory.free",
    "power.draw",
    "power.limit",
    "power.max_limit",
    "clocks.sm",
    "clocks.mem",
    "clocks.max.sm",
    "clocks.max.mem",
    "mig.mode.current",
    "ecc.errors.corrected.volatile.total",
    "ecc.errors.uncorrected.volatile.total",
    "ecc.errors.corrected.aggregate.total",
    "ecc.errors.uncorrected.aggregate.total",
    "clocks_throttle_reasons.hw_thermal_slowdown",
    "health",
];

fn canonical_field(field: &str) -> Option<&'static str> {
    let field = field.trim().to_lowercase();
    let alias = match field.as_str() {
        "gpu_name" => "name",
        "gpu_uuid" => "uuid",
        "gpu_serial" => "serial",
        "gpu_bus_id" => "pci.bus_id",
        "clocks.current.sm" | "clocks.gr" => "clocks.sm",
        "clocks.current.memory" | "clocks.memory" => "clocks.mem",
        "clocks.max.memory" => "clocks.max.mem",
        other => other,
    };
    QUERY_FIELDS.iter().copied().find(|f| *f == alias)
}

fn field_unit(field: &str) -> Option<&'static str> {
    match field {
        "utilization.gpu" | "utilization.memory" => Some("%"),
        "memory.total" | "memory.used" | "memory.free" => Some("MiB"),
        "power.draw" | "power.limit" | "power.max_limit" => Some("W"),
        "clocks.sm" | "clocks.mem" | "clocks.max.sm" | "clocks.max.mem" => Some("MHz"),
        _ => None,
    }
}

fn field_value(field: &str, gpu: &Gpu, node: &Node, now: DateTime<Utc>) -> String {
    match field {
        "timestamp" => now.format("%Y/%m/%d %H:%M:%S%.3f").to_string(),
        "driver_version" => node.driver_version.clone(),
        "count" => node.visible_gpus().count().to_string(),
        "name" => gpu.name.clone(),
        "serial" => gpu.serial.clone(),
        "uuid" => gpu.uuid.clone(),
        "pci.bus_id" => gpu.pci_address.clone(),
        "index" => gpu.id.to_string(),
        "vbios_version" => gpu.vbios_version.clone(),
        "persistence_mode" => enabled(gpu.persistence_mode).to_string(),
        "pstate" => "P0".to_string(),
        "temperature.gpu" => gpu.temperature.to_string(),
        "utilization.gpu" => gpu.utilization.to_string(),
        "utilization.memory" => memory_utilization(gpu).to_string(),
        "memory.total" => gpu.memory_total.to_string(),
        "memory.used" => gpu.memory_used.to_string(),
        "memory.free" => gpu.memory_total.saturating_sub(gpu.memory_used).to_string(),
        "power.draw" => format!("{:.2}", gpu.power_draw),
        "power.limit" => format!("{:.2}", gpu.power_limit),
        "power.max_limit" => format!("{:.2}", gpu.max_power_limit),
        "clocks.sm" => gpu.clocks.sm.to_string(),
        "clocks.mem" => gpu.clocks.memory.to_string(),
        "clocks.max.sm" => gpu.clocks.sm_max.to_string(),
        "clocks.max.mem" => gpu.clocks.memory_max.to_string(),
        "mig.mode.current" => enabled(gpu.mig_mode).to_string(),
        "ecc.errors.corrected.volatile.total" => gpu.ecc.volatile.single_bit.to_string(),
        "ecc.errors.uncorrected.volatile.total" => gpu.ecc.volatile.double_bit.to_string(),
        "ecc.errors.corrected.aggregate.total" => gpu.ecc.aggregate.single_bit.to_string(),
        "ecc.errors.uncorrected.aggregate.total" => gpu.ecc.aggregate.double_bit.to_string(),
        "clocks_throttle_reasons.hw_thermal_slowdown" => active(gpu.is_throttled()).to_string(),
        "health" => gpu.health.to_string(),
        _ => "[N/A]".to_string(),
    }
}

fn query_gpu(parsed: &ParsedCommand, node: &Node, ctx: &SimContext<'_>, now: DateTime<Utc>) -> CommandResult {
    let Some(field_list) = parsed.flag_value(&["query-gpu"]) else {
        return CommandResult::error("Option --query-gpu requires a comma separated list of fields.");
    };
    let Some(format) = parsed.flag_value(&["format"]) else {
        return CommandResult::error(
            "Missing --format. Use --format=csv[,noheader][,nounits] together with --query-gpu.",
        );
    };

    let (mut csv, mut header, mut units) = (false, true, true);
    for option in format.split(',').map(str::trim) {
        match option {
            "csv" => csv = true,
            "noheader" => header = false,
            "nounits" => units = false,
            other => {
                return CommandResult::error(format!(
                    "Unknown format option '{}'.{}\nValid options: csv, noheader, nounits",
                    other,
                    suggestion(ctx.matcher, other, &["csv", "noheader", "nounits"])
                ))
            }
        }
    }
    if !csv {
        return CommandResult::error("Only --format=csv is supported with --query-gpu.");
    }

    let mut fields = Vec::new();
    for raw in field_list.split(',').filter(|f| !f.trim().is_empty()) {
        match canonical_field(raw) {
            Some(field) => fields.push(field),
            None => {
                return CommandResult::error(format!(
                    "Field \"{}\" is not a valid field to query.{}",
                    raw.trim(),
                    suggestion(ctx.matcher, raw.trim(), &QUERY_FIELDS)
                ))
            }
        }
    }

    let gpus = match targets(node, parsed) {
        Ok(gpus) => gpus,
        Err(result) => return result,
    };

    let mut lines = Vec::new();
    if header {
        let names: Vec<String> = fields
            .iter()
            .map(|f| match (field_unit(f), units) {
                (Some(unit), true) => format!("{} [{}]", f, unit),
                _ => f.to_string(),
            })
            .collect();
        lines.push(names.join(", "));
    }
    for gpu in gpus {
        let values: Vec<String> = fields
            .iter()
            .map(|f| {
                let value = field_value(f, gpu, node, now);
                match (field_unit(f), units) {
                    (Some(unit), true) => format!("{} {}", value, unit),
                    _ => value,
                }
            })
            .collect();
        lines.push(values.join(", "));
    }
    CommandResult::ok(lines.join("\n"))
}

// Mutating operations

fn reset(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    let Some(spec) = parsed
        .flag_value(&["i", "id"])
        .or_else(|| parsed.flag_value(&["r", "gpu-reset"]))
        .map(str::to_string)
    else {
        return Ok(CommandResult::error(
            "GPU reset requires a target GPU.\nUse 'nvidia-smi -r -i <index>' to reset one GPU at a time.",
        ));
    };

    let node = ctx.node()?;
    let mut lines = Vec::new();
    let mut in_use = false;
    let mut to_reset = Vec::new();
    for s in spec.split(',') {
        match find_gpu(node, s) {
            None => return Ok(no_such_gpu(node, s.trim())),
            Some(gpu) if gpu.is_fallen_off_bus() => lines.push(format!(
                "Unable to reset GPU {}: GPU has fallen off the bus.\n\
                 The device is not reachable over PCIe. Reboot the node to recover it \
                 (e.g. 'ipmitool chassis power cycle').",
                gpu.id
            )),
            Some(gpu) if gpu.allocated_job.is_some() => {
                in_use = true;
                lines.push(format!(
                    "Unable to reset GPU {}: In use by another client (job {}).\n\
                     Cancel the job with 'scancel' or drain the node first.",
                    gpu.pci_address,
                    gpu.allocated_job.unwrap_or_default()
                ));
            }
            Some(gpu) => to_reset.push(gpu.id),
        }
    }

    let node = ctx.node_mut()?;
    for id in to_reset {
        if let Some(gpu) = node.gpu_mut(id) {
            let aggregate = gpu.ecc.aggregate;
            gpu.reset_to_baseline();
            gpu.ecc.aggregate = aggregate;
            lines.push(format!("GPU {} was reset successfully.", gpu.pci_address));
        }
    }
    node.recompute_health();

    let output = lines.join("\n");
    Ok(if in_use {
        CommandResult::error(output)
    } else {
        CommandResult::ok(output)
    })
}

fn set_power_limit(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    let Some(raw) = parsed.flag_value(&["pl", "power-limit"]) else {
        return Ok(CommandResult::error("Option -pl requires a power limit in watts."));
    };
    let Ok(watts) = raw.parse::<f64>() else {
        return Ok(CommandResult::error(format!(
            "Invalid power limit '{}'. Provide the limit in watts, e.g. 'nvidia-smi -pl 350 -i 0'.",
            raw
        )));
    };
    let system = ctx.state().system_type;
    let ids = match target_ids(ctx.node()?, parsed) {
        Ok(ids) => ids,
        Err(result) => return Ok(result),
    };

    let node = ctx.node_mut()?;
    let mut lines = Vec::new();
    let mut failed = false;
    for id in ids {
        let Some(gpu) = node.gpu_mut(id) else { continue };
        let min = min_power_limit(system);
        if !watts.is_finite() || watts < min || watts > gpu.max_power_limit {
            failed = true;
            lines.push(format!(
                "Provided power limit {:.2} W is not a valid power limit which should be between {:.2} W and {:.2} W for GPU {}",
                watts, min, gpu.max_power_limit, gpu.pci_address
            ));
            continue;
        }
        let previous = gpu.power_limit;
        gpu.power_limit = watts;
        lines.push(format!(
            "Power limit for GPU {} was set to {:.2} W from {:.2} W.",
            gpu.pci_address, watts, previous
        ));
    }
    node.recompute_health();

    if failed {
        lines.push("Terminating early due to previous errors.".to_string());
        return Ok(CommandResult::error(lines.join("\n")));
    }
    lines.push("All done.".to_string());
    Ok(CommandResult::ok(lines.join("\n")))
}

fn parse_toggle(raw: Option<&str>) -> Option<bool> {
    match raw?.to_uppercase().as_str() {
        "1" | "ENABLED" => Some(true),
        "0" | "DISABLED" => Some(false),
        _ => None,
    }
}

fn set_persistence(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    let Some(on) = parse_toggle(parsed.flag_value(&["pm", "persistence-mode"])) else {
        return Ok(CommandResult::error(
            "Invalid persistence mode. Use 'nvidia-smi -pm 1' to enable or 'nvidia-smi -pm 0' to disable.",
        ));
    };
    let ids = match target_ids(ctx.node()?, parsed) {
        Ok(ids) => ids,
        Err(result) => return Ok(result),
    };
    let node = ctx.node_mut()?;
    let mut lines = Vec::new();
    for gpu in node.gpus.iter_mut().filter(|g| ids.contains(&g.id)) {
        gpu.persistence_mode = on;
        lines.push(format!(
            "{} persistence mode for GPU {}.",
            if on { "Enabled" } else { "Disabled" },
            gpu.pci_address
        ));
    }
    lines.push("All done.".to_string());
    Ok(CommandResult::ok(lines.join("\n")))
}

fn set_mig_mode(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    let Some(on) = parse_toggle(parsed.flag_value(&["mig", "multi-instance-gpu"])) else {
        return Ok(CommandResult::error(
            "Invalid MIG mode. Use 'nvidia-smi -mig 1 -i <index>' to enable or '-mig 0' to disable.",
        ));
    };
    let ids = match target_ids(ctx.node()?, parsed) {
        Ok(ids) => ids,
        Err(result) => return Ok(result),
    };
    let node = ctx.node_mut()?;
    let mut lines = Vec::new();
    let mut failed = false;
    for gpu in node.gpus.iter_mut().filter(|g| ids.contains(&g.id)) {
        let verb = if on { "enable" } else { "disable" };
        if let Some(job) = gpu.allocated_job {
            failed = true;
            lines.push(format!(
                "Unable to {} MIG Mode for GPU {}: In use by another client (job {}).",
                verb, gpu.pci_address, job
            ));
            continue;
        }
        if !on && !gpu.mig_instances.is_empty() {
            failed = true;
            lines.push(format!(
                "Unable to disable MIG Mode for GPU {}: GPU instances still exist. \
                 Destroy them first with 'nvidia-smi mig -dgi -i {}'.",
                gpu.pci_address, gpu.id
            ));
            continue;
        }
        gpu.mig_mode = on;
        lines.push(format!(
            "{} MIG Mode for GPU {}",
            if on { "Enabled" } else { "Disabled" },
            gpu.pci_address
        ));
    }
    if failed {
        return Ok(CommandResult::error(lines.join("\n")));
    }
    lines.push("All done.".to_string());
    Ok(CommandResult::ok(lines.join("\n")))
}

// topo

/// NUMA node of the `index`-th of `count` devices on a two-socket board
fn numa_half(index: usize, count: usize) -> usize {
    index * 2 / count.max(1)
}

fn topo(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    if !parsed.has_flag(&["m", "matrix"]) {
        return Ok(CommandResult::error(
            "nvidia-smi topo: no display option given.\nUsage: nvidia-smi topo -m",
        ));
    }
    let node = ctx.node()?;
    let gpus: Vec<&Gpu> = node.visible_gpus().collect();
    let total = node.gpus.len();
    let nics = node.hcas.len();

    let mut lines = Vec::new();
    if let Some(banner) = fallen_banner(node) {
        lines.push(banner);
        lines.push(String::new());
    }
    let mut header: Vec<String> = gpus.iter().map(|g| format!("GPU{}", g.id)).collect();
    header.extend(node.hcas.iter().map(|h| format!("NIC{}", h.id)));
    lines.push(format!(
        "\t{}\tCPU Affinity\tNUMA Affinity\tGPU NUMA ID",
        header.join("\t")
    ));

    for gpu in &gpus {
        let mut cells: Vec<String> = gpus
            .iter()
            .map(|other| {
                if other.id == gpu.id {
                    " X ".to_string()
                } else {
                    let links = gpu.nvlinks.iter().filter(|l| l.active).count().min(
                        other.nvlinks.iter().filter(|l| l.active).count(),
                    );
                    if links == 0 {
                        "SYS".to_string()
                    } else {
                        format!("NV{}", links)
                    }
                }
            })
            .collect();
        cells.extend(node.hcas.iter().map(|h| {
            if h.id as usize == gpu.id as usize * nics / total.max(1) {
                "PXB".to_string()
            } else if numa_half(h.id as usize, nics) == numa_half(gpu.id as usize, total) {
                "NODE".to_string()
            } else {
                "SYS".to_string()
            }
        }));
        let numa = numa_half(gpu.id as usize, total);
        let cpus = node.cpu_count as usize / 2;
        let start = numa * cpus;
        lines.push(format!(
            "GPU{}\t{}\t{}-{}\t{}\t\tN/A",
            gpu.id,
            cells.join("\t"),
            start,
            start + cpus - 1,
            numa
        ));
    }
    for hca in &node.hcas {
        let numa = numa_half(hca.id as usize, nics);
        let mut cells: Vec<String> = gpus
            .iter()
            .map(|g| {
                if numa == numa_half(g.id as usize, total) {
                    "NODE".to_string()
                } else {
                    "SYS".to_string()
                }
            })
            .collect();
        cells.extend(node.hcas.iter().map(|other| {
            if other.id == hca.id {
                " X ".to_string()
            } else if numa_half(other.id as usize, nics) == numa {
                "NODE".to_string()
            } else {
                "SYS".to_string()
            }
        }));
        lines.push(format!("NIC{}\t{}", hca.id, cells.join("\t")));
    }

    lines.push(String::new());
    lines.push("Legend:".to_string());
    lines.push(String::new());
    lines.push("  X    = Self".to_string());
    lines.push("  SYS  = Connection traversing PCIe as well as the SMP interconnect between NUMA nodes (e.g., QPI/UPI)".to_string());
    lines.push("  NODE = Connection traversing PCIe as well as the interconnect between PCIe Host Bridges within a NUMA node".to_string());
    lines.push("  PHB  = Connection traversing PCIe as well as a PCIe Host Bridge (typically the CPU)".to_string());
    lines.push("  PXB  = Connection traversing multiple PCIe bridges (without traversing the PCIe Host Bridge)".to_string());
    lines.push("  PIX  = Connection traversing at most a single PCIe bridge".to_string());
    lines.push("  NV#  = Connection traversing a bonded set of # NVLinks".to_string());
    lines.push(String::new());
    lines.push("NIC Legend:".to_string());
    lines.push(String::new());
    for hca in &node.hcas {
        lines.push(format!("  NIC{}: {}", hca.id, hca.ca_name));
    }
    Ok(CommandResult::ok(lines.join("\n")))
}

// nvlink

fn nvlink(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    let node = ctx.node()?;
    let gpus = match targets(node, parsed) {
        Ok(gpus) => gpus,
        Err(result) => return Ok(result),
    };
    let errors = parsed.has_flag(&["e", "error-counters"]);
    let mut lines = Vec::new();
    if let Some(banner) = fallen_banner(node) {
        lines.push(banner);
    }
    for gpu in gpus {
        lines.push(format!("GPU {}: {} (UUID: {})", gpu.id, gpu.name, gpu.uuid));
        for link in &gpu.nvlinks {
            if errors {
                lines.push(format!("\t Link {}: Replay Errors: {}", link.link, link.replay_errors));
                lines.push(format!("\t Link {}: Recovery Errors: 0", link.link));
                lines.push(format!("\t Link {}: CRC Errors: {}", link.link, link.crc_errors));
            } else if link.active {
                lines.push(format!("\t Link {}: {} GB/s", link.link, link.speed_gbps));
            } else {
                lines.push(format!("\t Link {}: <inactive>", link.link));
            }
        }
    }
    Ok(CommandResult::ok(lines.join("\n")))
}

// mig

struct MigProfile {
    id: u32,
    name: &'static str,
    compute_profile: u32,
    slices: u32,
    max_instances: u32,
    memory_gib: f64,
    sms_a100: u32,
    sms_h100: u32,
}

static MIG_PROFILES: [MigProfile; 6] = [
    MigProfile { id: 19, name: "1g.10gb", compute_profile: 0, slices: 1, max_instances: 7, memory_gib: 9.75, sms_a100: 14, sms_h100: 16 },
    MigProfile { id: 15, name: "1g.20gb", compute_profile: 0, slices: 2, max_instances: 4, memory_gib: 19.62, sms_a100: 14, sms_h100: 26 },
    MigProfile { id: 14, name: "2g.20gb", compute_profile: 1, slices: 2, max_instances: 3, memory_gib: 19.62, sms_a100: 28, sms_h100: 32 },
    MigProfile { id: 9, name: "3g.40gb", compute_profile: 2, slices: 4, max_instances: 2, memory_gib: 39.50, sms_a100: 42, sms_h100: 60 },
    MigProfile { id: 5, name: "4g.40gb", compute_profile: 3, slices: 4, max_instances: 1, memory_gib: 39.50, sms_a100: 56, sms_h100: 64 },
    MigProfile { id: 0, name: "7g.80gb", compute_profile: 4, slices: 8, max_instances: 1, memory_gib: 79.25, sms_a100: 98, sms_h100: 132 },
];

const MIG_SLOTS: u32 = 8;

fn find_profile(spec: &str) -> Option<&'static MigProfile> {
    let spec = spec.trim();
    let name = spec.strip_prefix("MIG ").unwrap_or(spec).to_lowercase();
    MIG_PROFILES
        .iter()
        .find(|p| p.name == name || spec.parse::<u32>().map_or(false, |id| id == p.id))
}

/// Placement starts still free for `profile` on `gpu`
fn free_placements(gpu: &Gpu, profile: &MigProfile) -> Vec<u32> {
    let existing = gpu.mig_instances.iter().filter(|i| i.profile_id == profile.id).count() as u32;
    if existing >= profile.max_instances {
        return Vec::new();
    }
    let overlaps = |start: u32| {
        gpu.mig_instances.iter().any(|i| {
            start < i.placement_start + i.placement_size && i.placement_start < start + profile.slices
        })
    };
    (0..MIG_SLOTS)
        .step_by(profile.slices as usize)
        .filter(|start| start + profile.slices <= MIG_SLOTS && !(profile.slices == 1 && *start == MIG_SLOTS - 1))
        .filter(|start| !overlaps(*start))
        .take((profile.max_instances - existing) as usize)
        .collect()
}

fn mig_rule(fill: char) -> String {
    format!("+{}+", fill.to_string().repeat(49))
}

fn mig(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    let system = ctx.state().system_type;
    let node = ctx.node()?;
    let gpus = match targets(node, parsed) {
        Ok(gpus) => gpus,
        Err(result) => return Ok(result),
    };
    let explicit = parsed.has_flag(&["i", "id"]);
    let mig_gpus: Vec<&Gpu> = gpus.iter().copied().filter(|g| g.mig_mode).collect();

    if parsed.has_flag(&["lgip", "list-gpu-instance-profiles"]) {
        if mig_gpus.is_empty() {
            return Ok(CommandResult::error(
                "No MIG-enabled devices found.\nEnable MIG mode first with 'nvidia-smi -mig 1 -i <index>'.",
            ));
        }
        let mut lines = vec![
            mig_rule('-'),
            "| GPU instance profiles:                          |".to_string(),
            "| GPU   Name             ID    Instances   Memory |".to_string(),
            "|                              Free/Total   GiB   |".to_string(),
            mig_rule('='),
        ];
        for gpu in &mig_gpus {
            for profile in &MIG_PROFILES {
                let sms = match system {
                    SystemType::DgxA100 => profile.sms_a100,
                    SystemType::DgxH100 => profile.sms_h100,
                };
                lines.push(format!(
                    "|{:>4}  MIG {:<11} {:>3}   {:>3}/{:<3}   {:>6.2} |",
                    gpu.id,
                    profile.name,
                    profile.id,
                    free_placements(gpu, profile).len(),
                    profile.max_instances,
                    profile.memory_gib
                ));
                lines.push(format!("|{:>34}{:>3} SMs{:>8}|", "", sms, ""));
                lines.push(mig_rule('-'));
            }
        }
        return Ok(CommandResult::ok(lines.join("\n")));
    }

    if parsed.has_flag(&["lgi", "list-gpu-instances"]) {
        let instances: Vec<(&Gpu, &MigInstance)> = mig_gpus
            .iter()
            .flat_map(|g| g.mig_instances.iter().map(move |i| (*g, i)))
            .collect();
        if instances.is_empty() {
            return Ok(CommandResult::error(
                "No GPU instances found: Not Found\nCreate one with 'nvidia-smi mig -cgi <profile> -C'.",
            ));
        }
        let mut lines = vec![
            mig_rule('-'),
            "| GPU instances:                                  |".to_string(),
            "| GPU   Name             Profile  Instance   Placement  |".to_string(),
            "|                          ID       ID       Start:Size |".to_string(),
            mig_rule('='),
        ];
        for (gpu, instance) in instances {
            lines.push(format!(
                "|{:>4}  MIG {:<11} {:>6}  {:>7}  {:>8}:{:<3}|",
                gpu.id,
                instance.profile,
                instance.profile_id,
                instance.gpu_instance_id,
                instance.placement_start,
                instance.placement_size
            ));
            lines.push(mig_rule('-'));
        }
        return Ok(CommandResult::ok(lines.join("\n")));
    }

    let creating = parsed.has_flag(&["cgi", "create-gpu-instance"]);
    let destroying = parsed.has_flag(&["dgi", "destroy-gpu-instance"]);
    if !creating && !destroying {
        return Ok(CommandResult::error(
            "nvidia-smi mig: no operation given.\n\
             Usage: nvidia-smi mig [-lgip | -lgi | -cgi PROFILES [-C] | -dgi] [-i ID]",
        ));
    }

    if let Some(gpu) = gpus.iter().find(|g| explicit && !g.mig_mode) {
        return Ok(CommandResult::error(format!(
            "Unable to {} GPU instances on GPU {}: MIG mode is not enabled.\n\
             Enable it with 'nvidia-smi -mig 1 -i {}'.",
            if creating { "create" } else { "destroy" },
            gpu.id,
            gpu.id
        )));
    }
    if mig_gpus.is_empty() {
        return Ok(CommandResult::error(
            "No MIG-enabled devices found.\nEnable MIG mode first with 'nvidia-smi -mig 1 -i <index>'.",
        ));
    }
    let ids: Vec<u32> = mig_gpus.iter().map(|g| g.id).collect();

    if destroying {
        let node = ctx.node_mut()?;
        let mut lines = Vec::new();
        for gpu in node.gpus.iter_mut().filter(|g| ids.contains(&g.id)) {
            for instance in gpu.mig_instances.drain(..) {
                lines.push(format!(
                    "Successfully destroyed GPU instance ID {:>2} from GPU {:>2} using profile MIG {} (ID {:>2})",
                    instance.gpu_instance_id, gpu.id, instance.profile, instance.profile_id
                ));
            }
        }
        if lines.is_empty() {
            return Ok(CommandResult::error("No GPU instances found: Not Found"));
        }
        return Ok(CommandResult::ok(lines.join("\n")));
    }

    let spec = parsed.flag_value(&["cgi", "create-gpu-instance"]).unwrap_or_default();
    let mut profiles = Vec::new();
    for item in spec.split(',').filter(|s| !s.trim().is_empty()) {
        match find_profile(item) {
            Some(profile) => profiles.push(profile),
            None => {
                let names: Vec<&str> = MIG_PROFILES.iter().map(|p| p.name).collect();
                return Ok(CommandResult::error(format!(
                    "Unable to create a GPU instance using profile '{}': Not Found{}\nRun 'nvidia-smi mig -lgip' to list profiles.",
                    item.trim(),
                    suggestion(ctx.matcher, item.trim(), &names)
                )));
            }
        }
    }
    if profiles.is_empty() {
        return Ok(CommandResult::error(
            "Option -cgi requires a comma separated list of profile names or ids.",
        ));
    }

    let compute = parsed.has_flag(&["C", "default-compute-instance"]);
    let node = ctx.node_mut()?;
    let mut lines = Vec::new();
    let mut failed = false;
    for gpu in node.gpus.iter_mut().filter(|g| ids.contains(&g.id)) {
        for profile in &profiles {
            let Some(start) = free_placements(gpu, profile).first().copied() else {
                failed = true;
                lines.push(format!(
                    "Unable to create a GPU instance on GPU {:>2} using profile {}: Insufficient Resources",
                    gpu.id, profile.id
                ));
                continue;
            };
            let instance_id = gpu.mig_instances.iter().map(|i| i.gpu_instance_id).max().unwrap_or(0) + 1;
            gpu.mig_instances.push(MigInstance {
                gpu_instance_id: instance_id,
                profile_id: profile.id,
                profile: profile.name.to_string(),
                placement_start: start,
                placement_size: profile.slices,
                memory_mib: (profile.memory_gib * 1024.0) as u64,
            });
            lines.push(format!(
                "Successfully created GPU instance ID {:>2} on GPU {:>2} using profile MIG {} (ID {:>2})",
                instance_id, gpu.id, profile.name, profile.id
            ));
            if compute {
                lines.push(format!(
                    "Successfully created compute instance ID  0 on GPU {:>2} GPU instance ID {:>2} using profile MIG {} (ID {:>2})",
                    gpu.id, instance_id, profile.name, profile.compute_profile
                ));
            }
        }
    }
    let output = lines.join("\n");
    Ok(if failed {
        CommandResult::error(output)
    } else {
        CommandResult::ok(output)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{run, store};
    use sim_core::{Severity, XidError};
    use sim_state::ClusterStore;

    fn fall_off_bus(store: &mut ClusterStore, gpu: u32) {
        let now = store.now();
        let node = store.state_mut().node_mut("dgx-00").unwrap();
        node.gpu_mut(gpu)
            .unwrap()
            .xid_errors
            .push(XidError::new(79, now, Severity::Critical));
        node.recompute_health();
    }

    #[test]
    fn test_summary_lists_every_gpu() {
        let mut store = store(1, 2);
        let result = run(&simulator(), &mut store, "nvidia-smi");
        assert_eq!(result.exit_code, 0);
        assert!(result.output.contains("00000000:07:00.0"));
        assert!(result.output.contains("00000000:0F:00.0"));
        assert!(result.output.contains("No running processes found"));
        assert!(!result.output.contains("WARNING"));
    }

    #[test]
    fn test_fallen_gpu_is_hidden_everywhere() {
        let mut store = store(1, 2);
        let uuid = store.state().nodes[0].gpus[0].uuid.clone();
        fall_off_bus(&mut store, 0);

        for line in ["nvidia-smi", "nvidia-smi -L", "nvidia-smi -q", "nvidia-smi --query-gpu=index,uuid --format=csv"] {
            let result = run(&simulator(), &mut store, line);
            assert!(!result.output.contains(&uuid), "{} leaked the fallen GPU", line);
            assert!(!result.output.contains("00000000:07:00.0"), "{} leaked the bus id", line);
        }
        let listing = run(&simulator(), &mut store, "nvidia-smi");
        assert!(listing.output.contains("WARNING"));
        assert!(listing.output.contains("XID 79"));

        let targeted = run(&simulator(), &mut store, "nvidia-smi -q -i 0");
        assert_eq!(targeted.exit_code, 1);
        assert!(targeted.output.contains("GPU is lost"));
    }

    #[test]
    fn test_reset_healthy_and_fallen_gpu() {
        let mut store = store(1, 1);
        let ok = run(&simulator(), &mut store, "nvidia-smi -r -i 0");
        assert_eq!(ok.exit_code, 0);
        assert!(ok.output.contains("reset successfully"));

        fall_off_bus(&mut store, 0);
        let failed = run(&simulator(), &mut store, "nvidia-smi --gpu-reset -i 0");
        assert_eq!(failed.exit_code, 0);
        assert!(failed.output.contains("Unable to reset"));
        assert!(failed.output.contains("fallen off the bus"));
    }

    #[test]
    fn test_reset_keeps_aggregate_ecc() {
        let mut store = store(1, 1);
        {
            let gpu = &mut store.state_mut().nodes[0].gpus[0];
            gpu.ecc.raise_to(4, 1);
            gpu.temperature = 88;
        }
        run(&simulator(), &mut store, "nvidia-smi -r -i 0");
        let gpu = &store.state().nodes[0].gpus[0];
        assert_eq!(gpu.temperature, 45);
        assert_eq!(gpu.ecc.volatile.double_bit, 0);
        assert_eq!(gpu.ecc.aggregate.double_bit, 1);
    }

    #[test]
    fn test_query_gpu_csv() {
        let mut store = store(1, 2);
        let result = run(
            &simulator(),
            &mut store,
            "nvidia-smi --query-gpu=index,temperature.gpu,power.draw --format=csv",
        );
        let lines: Vec<&str> = result.output.lines().collect();
        assert_eq!(lines[0], "index, temperature.gpu, power.draw [W]");
        assert_eq!(lines[1], "0, 45, 300.00 W");
        assert_eq!(lines.len(), 3);

        let bare = run(
            &simulator(),
            &mut store,
            "nvidia-smi --query-gpu=index,power.draw --format=csv,noheader,nounits -i 1",
        );
        assert_eq!(bare.output, "1, 300.00");
    }

    #[test]
    fn test_query_gpu_rejects_unknown_field() {
        let mut store = store(1, 1);
        let result = run(
            &simulator(),
            &mut store,
            "nvidia-smi --query-gpu=temperature.gpuu --format=csv",
        );
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("not a valid field"));
        assert!(result.output.contains("temperature.gpu"));
    }

    #[test]
    fn test_query_display_section() {
        let mut store = store(1, 1);
        store.state_mut().nodes[0].gpus[0].temperature = 85;
        let result = run(&simulator(), &mut store, "nvidia-smi -q -d TEMPERATURE");
        assert!(result.output.contains("GPU Current Temp"));
        assert!(result.output.contains("85 C"));
        assert!(!result.output.contains("Power Draw"));

        let bad = run(&simulator(), &mut store, "nvidia-smi -q -d TEMP");
        assert_eq!(bad.exit_code, 1);
    }

    #[test]
    fn test_power_limit_bounds() {
        let mut store = store(1, 1);
        let ok = run(&simulator(), &mut store, "nvidia-smi -pl 300 -i 0");
        assert_eq!(ok.exit_code, 0);
        assert_eq!(store.state().nodes[0].gpus[0].power_limit, 300.0);

        let too_high = run(&simulator(), &mut store, "nvidia-smi -pl 900 -i 0");
        assert_eq!(too_high.exit_code, 1);
        assert_eq!(store.state().nodes[0].gpus[0].power_limit, 300.0);
    }

    #[test]
    fn test_power_limit_must_be_finite() {
        let mut store = store(1, 1);
        for value in ["NaN", "inf", "-infinity"] {
            let result = run(&simulator(), &mut store, &format!("nvidia-smi -pl {} -i 0", value));
            assert_eq!(result.exit_code, 1, "{}", value);
            assert!(result.output.contains("not a valid power limit"));
            assert!(store.state().nodes[0].gpus[0].power_limit.is_finite());
        }
    }

    #[test]
    fn test_mig_lifecycle() {
        let mut store = store(1, 1);
        let none = run(&simulator(), &mut store, "nvidia-smi mig -lgip");
        assert_eq!(none.exit_code, 1);

        assert_eq!(run(&simulator(), &mut store, "nvidia-smi -mig 1 -i 0").exit_code, 0);
        let profiles = run(&simulator(), &mut store, "nvidia-smi mig -lgip");
        assert!(profiles.output.contains("MIG 3g.40gb"));

        let created = run(&simulator(), &mut store, "nvidia-smi mig -cgi 3g.40gb,3g.40gb -C");
        assert_eq!(created.exit_code, 0, "{}", created.output);
        assert_eq!(store.state().nodes[0].gpus[0].mig_instances.len(), 2);

        let full = run(&simulator(), &mut store, "nvidia-smi mig -cgi 1g.10gb");
        assert_eq!(full.exit_code, 1);
        assert!(full.output.contains("Insufficient Resources"));

        let listed = run(&simulator(), &mut store, "nvidia-smi mig -lgi");
        assert_eq!(listed.output.matches("3g.40gb").count(), 2);

        run(&simulator(), &mut store, "nvidia-smi mig -dgi");
        assert!(store.state().nodes[0].gpus[0].mig_instances.is_empty());
    }

    #[test]
    fn test_nvlink_status_shows_inactive_link() {
        let mut store = store(1, 1);
        store.state_mut().nodes[0].gpus[0].nvlinks[2].active = false;
        let result = run(&simulator(), &mut store, "nvidia-smi nvlink -s");
        assert!(result.output.contains("Link 2: <inactive>"));
        assert!(result.output.contains("Link 0: 25 GB/s"));
    }

    #[test]
    fn test_topo_matrix() {
        let mut store = store(1, 8);
        let result = run(&simulator(), &mut store, "nvidia-smi topo -m");
        assert!(result.output.contains("GPU7"));
        assert!(result.output.contains("NV12"));
        assert!(result.output.contains("NIC0: mlx5_0"));
        assert_eq!(run(&simulator(), &mut store, "nvidia-smi topo").exit_code, 1);
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        let mut store = store(1, 1);
        let result = run(&simulator(), &mut store, "nvidia-smi --gpu-reet -i 0");
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("--gpu-reset"));
    }
}
