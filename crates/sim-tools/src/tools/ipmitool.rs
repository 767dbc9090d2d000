//! ipmitool
//!
//! The BMC view of the current node. Sensor readings follow the GPU state:
//! a hot GPU shows a non-critical temperature, a GPU that fell off the bus
//! has no reading, and a powered-off chassis reports nothing but the SEL.

use super::{active_jobs_on, suggestion, HandlerResult};
use crate::simulator::{CommandMetadata, CommandResult, FlagMetadata, SimContext, ToolRegistry};
use sim_core::state::{BASELINE_TEMPERATURE_C, POWERED_OFF_REASON, THERMAL_SLOWDOWN_C};
use sim_core::{
    JobState, Node, PhysicalState, PortState, PowerState, SchedulerState, SelEntry, SystemType,
};
use sim_shell::ParsedCommand;
use tracing::info;

const IPMITOOL_VERSION: &str = "1.8.19";

pub fn simulator() -> ToolRegistry {
    ToolRegistry::new("ipmitool", IPMITOOL_VERSION, "Utility for controlling IPMI-enabled devices")
        .usage("ipmitool [-I interface] [-H host] [-U user] [-P password] <command> [args]")
        .version_flags(&["V"])
        .version_text(format!("ipmitool version {}", IPMITOOL_VERSION))
        .flag(FlagMetadata::short("I", "Interface to use").takes("INTERFACE"))
        .flag(FlagMetadata::short("H", "Remote BMC address").takes("ADDRESS"))
        .flag(FlagMetadata::short("U", "Remote session user name").takes("USER"))
        .flag(FlagMetadata::short("P", "Remote session password").takes("PASSWORD"))
        .command(
            CommandMetadata::new("sdr", "Print sensor data repository entries and readings")
                .usage("ipmitool sdr [list|elist]")
                .example("ipmitool sdr list"),
            sdr,
        )
        .command(
            CommandMetadata::new("sensor", "Print detailed sensor information")
                .usage("ipmitool sensor [list]")
                .example("ipmitool sensor list"),
            sensor,
        )
        .command(
            CommandMetadata::new("chassis", "Get chassis status and set power state")
                .usage("ipmitool chassis status | power <status|on|off|cycle>")
                .example("ipmitool chassis status")
                .example("ipmitool chassis power cycle"),
            chassis,
        )
        .command(
            CommandMetadata::new("sel", "Print the system event log")
                .usage("ipmitool sel [info|list|elist|clear]")
                .example("ipmitool sel elist"),
            sel,
        )
        .command(
            CommandMetadata::new("mc", "Management controller status")
                .usage("ipmitool mc info")
                .example("ipmitool mc info"),
            mc,
        )
        .command(
            CommandMetadata::new("lan", "Configure LAN channels")
                .usage("ipmitool lan print [channel]")
                .example("ipmitool lan print 1"),
            lan,
        )
}

/// The action word after the command, e.g. `list` in `sdr list`
fn action<'p>(parsed: &'p ParsedCommand, index: usize) -> Option<&'p str> {
    parsed.operands().nth(index)
}

fn invalid(ctx: &SimContext<'_>, command: &str, given: &str, valid: &[&str]) -> CommandResult {
    CommandResult::error(format!(
        "Invalid {} command: {}{}\nValid commands: {}",
        command,
        given,
        suggestion(ctx.matcher, given, valid),
        valid.join(", ")
    ))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Unit {
    Celsius,
    Watts,
    Rpm,
    Discrete,
}

impl Unit {
    fn sdr_label(&self) -> &'static str {
        match self {
            Unit::Celsius => "degrees C",
            Unit::Watts => "Watts",
            Unit::Rpm => "RPM",
            Unit::Discrete => "",
        }
    }

    fn sensor_label(&self) -> &'static str {
        match self {
            Unit::Celsius => "degrees C",
            Unit::Watts => "Watts",
            Unit::Rpm => "RPM",
            Unit::Discrete => "discrete",
        }
    }
}

struct Sensor {
    name: String,
    reading: Option<f64>,
    unit: Unit,
    /// Upper non-critical, critical and non-recoverable thresholds
    upper: Option<[f64; 3]>,
}

impl Sensor {
    fn new(name: impl Into<String>, reading: Option<f64>, unit: Unit) -> Self {
        Self {
            name: name.into(),
            reading,
            unit,
            upper: None,
        }
    }

    fn thresholds(mut self, unc: f64, ucr: f64, unr: f64) -> Self {
        self.upper = Some([unc, ucr, unr]);
        self
    }

    fn status(&self) -> &'static str {
        match (self.reading, self.upper) {
            (None, _) => "ns",
            (Some(value), Some([_, _, unr])) if value >= unr => "nr",
            (Some(value), Some([_, ucr, _])) if value >= ucr => "cr",
            (Some(value), Some([unc, _, _])) if value > unc => "nc",
            _ => "ok",
        }
    }

    fn sdr_reading(&self) -> String {
        match (self.reading, self.unit) {
            (None, _) => "no reading".to_string(),
            (Some(value), Unit::Discrete) => format!("0x{:02x}", value as u32),
            (Some(value), unit) => format!("{} {}", value.round() as i64, unit.sdr_label()),
        }
    }
}

fn sensors(node: &Node, system: SystemType) -> Vec<Sensor> {
    let powered = node.bmc.power_state == PowerState::On;
    let live = |value: f64| if powered { Some(value) } else { None };

    let visible_temps: Vec<u32> = node.visible_gpus().map(|g| g.temperature).collect();
    let hottest = visible_temps.iter().copied().max().unwrap_or(BASELINE_TEMPERATURE_C);
    let gpu_power: f64 = node.visible_gpus().map(|g| g.power_draw).sum();
    let platform_power = match system {
        SystemType::DgxA100 => 1100.0,
        SystemType::DgxH100 => 1800.0,
    };
    let fan_rpm = 8000.0 + f64::from(hottest.saturating_sub(BASELINE_TEMPERATURE_C)) * 120.0;

    let mut list = vec![
        Sensor::new("Inlet Temp", live(24.0), Unit::Celsius).thresholds(40.0, 45.0, 50.0),
        Sensor::new("Exhaust Temp", live(30.0 + f64::from(hottest) / 3.0), Unit::Celsius)
            .thresholds(70.0, 75.0, 80.0),
        Sensor::new("CPU0 Temp", live(45.0), Unit::Celsius).thresholds(90.0, 95.0, 100.0),
        Sensor::new("CPU1 Temp", live(47.0), Unit::Celsius).thresholds(90.0, 95.0, 100.0),
    ];
    for gpu in &node.gpus {
        let reading = if gpu.is_fallen_off_bus() {
            None
        } else {
            live(f64::from(gpu.temperature))
        };
        list.push(
            Sensor::new(format!("GPU{} Temp", gpu.id), reading, Unit::Celsius).thresholds(
                f64::from(THERMAL_SLOWDOWN_C),
                90.0,
                95.0,
            ),
        );
    }
    for psu in 0..6 {
        list.push(Sensor::new(
            format!("PSU{} Input", psu),
            live((platform_power + gpu_power) / 6.0),
            Unit::Watts,
        ));
    }
    list.push(
        Sensor::new("Total Power", live(platform_power + gpu_power), Unit::Watts)
            .thresholds(6000.0, 6500.0, 7000.0),
    );
    for fan in 0..6 {
        list.push(
            Sensor::new(format!("FAN{}", fan), live(fan_rpm), Unit::Rpm)
                .thresholds(15000.0, 16000.0, 17000.0),
        );
    }
    list.push(Sensor::new("PSU Status", live(0.0), Unit::Discrete));
    list
}

fn sdr(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    match action(parsed, 1) {
        None | Some("list") | Some("elist") => {}
        Some(other) => return Ok(invalid(ctx, "sdr", other, &["list", "elist"])),
    }
    let system = ctx.state().system_type;
    let node = ctx.node()?;
    let lines: Vec<String> = sensors(node, system)
        .iter()
        .map(|s| format!("{:<16} | {:<17} | {}", s.name, s.sdr_reading(), s.status()))
        .collect();
    Ok(CommandResult::ok(lines.join("\n")))
}

fn sensor(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    match action(parsed, 1) {
        None | Some("list") => {}
        Some(other) => return Ok(invalid(ctx, "sensor", other, &["list"])),
    }
    let system = ctx.state().system_type;
    let node = ctx.node()?;
    let threshold = |value: Option<f64>| value.map_or("na".to_string(), |v| format!("{:.3}", v));
    let lines: Vec<String> = sensors(node, system)
        .iter()
        .map(|s| {
            let value = match (s.reading, s.unit) {
                (None, _) => "na".to_string(),
                (Some(v), Unit::Discrete) => format!("0x{:x}", v as u32),
                (Some(v), _) => format!("{:.3}", v),
            };
            let [unc, ucr, unr] = match s.upper {
                Some([a, b, c]) => [Some(a), Some(b), Some(c)],
                None => [None, None, None],
            };
            format!(
                "{:<16} | {:<10} | {:<10} | {:<5} | {:<10} | {:<10} | {:<10} | {:<10} | {:<10} | {:<10}",
                s.name,
                value,
                s.unit.sensor_label(),
                s.status(),
                "na",
                "na",
                "na",
                threshold(unc),
                threshold(ucr),
                threshold(unr)
            )
        })
        .collect();
    Ok(CommandResult::ok(lines.join("\n")))
}

fn chassis(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    match action(parsed, 1) {
        Some("status") => {
            let node = ctx.node()?;
            let hot_fans = node.visible_gpus().any(|g| g.temperature >= 90);
            let rows = [
                ("System Power", node.bmc.power_state.to_string()),
                ("Power Overload", "false".to_string()),
                ("Power Interlock", "inactive".to_string()),
                ("Main Power Fault", "false".to_string()),
                ("Power Control Fault", "false".to_string()),
                ("Power Restore Policy", "always-on".to_string()),
                ("Last Power Event", String::new()),
                ("Chassis Intrusion", "inactive".to_string()),
                ("Front-Panel Lockout", "inactive".to_string()),
                ("Drive Fault", "false".to_string()),
                ("Cooling/Fan Fault", hot_fans.to_string()),
            ];
            let lines: Vec<String> = rows
                .iter()
                .map(|(key, value)| format!("{:<20} : {}", key, value))
                .collect();
            Ok(CommandResult::ok(lines.join("\n")))
        }
        Some("power") => power(parsed, ctx),
        Some(other) => Ok(invalid(ctx, "chassis", other, &["status", "power"])),
        None => Ok(CommandResult::error(
            "Chassis Commands:  status, power\nUsage: ipmitool chassis status | power <status|on|off|cycle>",
        )),
    }
}

fn power(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    let Some(verb) = action(parsed, 2) else {
        return Ok(CommandResult::error(
            "chassis power Commands: status, on, off, cycle",
        ));
    };
    let now = ctx.now();
    match verb {
        "status" => {
            let node = ctx.node()?;
            Ok(CommandResult::ok(format!("Chassis Power is {}", node.bmc.power_state)))
        }
        "on" => {
            let node = ctx.node_mut()?;
            if node.bmc.power_state == PowerState::Off {
                node.bmc.power_state = PowerState::On;
                node.bmc.log_event(now, "System ACPI Power State", "S0/G0: working");
                node.release_power_off_hold();
                info!("{} powered on", node.hostname);
            }
            Ok(CommandResult::ok("Chassis Power Control: Up/On"))
        }
        "off" => {
            cancel_node_jobs(ctx)?;
            let node = ctx.node_mut()?;
            if node.bmc.power_state == PowerState::On {
                node.bmc.power_state = PowerState::Off;
                node.bmc.log_event(now, "System ACPI Power State", "S5/G2: soft-off");
                node.scheduler_state = SchedulerState::Down;
                node.scheduler_reason = Some(POWERED_OFF_REASON.to_string());
                node.reason_set_at = Some(now);
                info!("{} powered off", node.hostname);
            }
            Ok(CommandResult::ok("Chassis Power Control: Down/Off"))
        }
        "cycle" | "reset" => {
            cancel_node_jobs(ctx)?;
            let node = ctx.node_mut()?;
            reboot(node);
            node.bmc.log_event(now, "System Restart", "System restarted");
            info!("{} power cycled", node.hostname);
            Ok(CommandResult::ok(if verb == "cycle" {
                "Chassis Power Control: Cycle"
            } else {
                "Chassis Power Control: Reset"
            }))
        }
        other => Ok(invalid(ctx, "chassis power", other, &["status", "on", "off", "cycle"])),
    }
}

fn cancel_node_jobs(ctx: &mut SimContext<'_>) -> sim_core::Result<()> {
    let now = ctx.now();
    let jobs = active_jobs_on(ctx.state(), &ctx.node()?.id);
    for job_id in jobs {
        ctx.state_mut().finish_job(job_id, JobState::Cancelled, now)?;
    }
    Ok(())
}

/// A reboot clears every transient fault; lifetime ECC counts survive
fn reboot(node: &mut Node) {
    node.bmc.power_state = PowerState::On;
    for gpu in &mut node.gpus {
        let aggregate = gpu.ecc.aggregate;
        gpu.reset_to_baseline();
        gpu.ecc.aggregate = aggregate;
        gpu.mig_instances.clear();
    }
    for port in node.hcas.iter_mut().flat_map(|h| h.ports.iter_mut()) {
        port.state = PortState::Active;
        port.physical_state = PhysicalState::LinkUp;
    }
    node.recompute_health();
    node.release_power_off_hold();
}

fn sensor_type(entry: &SelEntry) -> &'static str {
    if entry.sensor.contains("Temp") {
        "Temperature"
    } else if entry.sensor.contains("Power") || entry.sensor.contains("Restart") {
        "System ACPI Power State"
    } else if entry.sensor.starts_with("GPU") {
        "Module/Board"
    } else {
        "Event Logging Disabled"
    }
}

fn sel(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    let now = ctx.now();
    match action(parsed, 1) {
        None | Some("info") => {
            let node = ctx.node()?;
            let last = node
                .bmc
                .sel
                .iter()
                .map(|e| e.timestamp)
                .max()
                .map_or("Not Available".to_string(), |t| t.format("%m/%d/%Y %H:%M:%S").to_string());
            Ok(CommandResult::ok(format!(
                "SEL Information\nVersion          : 1.5 (v1.5, v2 compliant)\nEntries          : {}\nFree Space       : {} bytes\nPercent Used     : {}%\nLast Add Time    : {}",
                node.bmc.sel.len(),
                65_535usize.saturating_sub(node.bmc.sel.len() * 16),
                node.bmc.sel.len() * 16 * 100 / 65_535,
                last
            )))
        }
        Some(verb @ ("list" | "elist")) => {
            let node = ctx.node()?;
            if node.bmc.sel.is_empty() {
                return Ok(CommandResult::ok("SEL has no entries"));
            }
            let lines: Vec<String> = node
                .bmc
                .sel
                .iter()
                .enumerate()
                .map(|(index, entry)| {
                    let sensor = if verb == "elist" {
                        format!("{} {}", sensor_type(entry), entry.sensor)
                    } else {
                        format!("{} #0x{:02x}", sensor_type(entry), 0x30 + index)
                    };
                    format!(
                        "{:>4x} | {} | {} | {} | {} | {}",
                        entry.id,
                        entry.timestamp.format("%m/%d/%Y"),
                        entry.timestamp.format("%H:%M:%S"),
                        sensor,
                        entry.event,
                        if entry.asserted { "Asserted" } else { "Deasserted" }
                    )
                })
                .collect();
            Ok(CommandResult::ok(lines.join("\n")))
        }
        Some("clear") => {
            let node = ctx.node_mut()?;
            node.bmc.sel.clear();
            node.bmc.log_event(now, "SEL", "Log area reset/cleared");
            Ok(CommandResult::ok("Clearing SEL.  Please allow a few seconds to erase."))
        }
        Some(other) => Ok(invalid(ctx, "sel", other, &["info", "list", "elist", "clear"])),
    }
}

fn mc(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    match action(parsed, 1) {
        Some("info") => {}
        Some(other) => return Ok(invalid(ctx, "mc", other, &["info"])),
        None => return Ok(CommandResult::error("MC Commands:  info\nUsage: ipmitool mc info")),
    }
    let product = match ctx.state().system_type {
        SystemType::DgxA100 => "DGX A100",
        SystemType::DgxH100 => "DGX H100",
    };
    let bmc = &ctx.node()?.bmc;
    let lines = [
        format!("{:<26}: 32", "Device ID"),
        format!("{:<26}: 1", "Device Revision"),
        format!("{:<26}: {}", "Firmware Revision", bmc.firmware_version),
        format!("{:<26}: 2.0", "IPMI Version"),
        format!("{:<26}: 5703", "Manufacturer ID"),
        format!("{:<26}: {}", "Manufacturer Name", bmc.manufacturer),
        format!("{:<26}: 5 (0x0005)", "Product ID"),
        format!("{:<26}: {}", "Product Name", product),
        format!("{:<26}: yes", "Device Available"),
        format!("{:<26}: yes", "Provides Device SDRs"),
        format!("{:<26}:", "Additional Device Support"),
        "    Sensor Device".to_string(),
        "    SDR Repository Device".to_string(),
        "    SEL Device".to_string(),
        "    FRU Inventory Device".to_string(),
        "    Chassis Device".to_string(),
    ];
    Ok(CommandResult::ok(lines.join("\n")))
}

fn lan(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    match action(parsed, 1) {
        Some("print") => {}
        Some(other) => return Ok(invalid(ctx, "lan", other, &["print"])),
        None => return Ok(CommandResult::error("LAN Commands:  print\nUsage: ipmitool lan print [channel]")),
    }
    if let Some(channel) = action(parsed, 2) {
        if channel != "1" {
            return Ok(CommandResult::error(format!("Invalid channel {}", channel)));
        }
    }
    let bmc = &ctx.node()?.bmc;
    let gateway = match bmc.ip_address.rsplit_once('.') {
        Some((network, _)) => format!("{}.1", network),
        None => "0.0.0.0".to_string(),
    };
    let rows = [
        ("Set in Progress", "Set Complete".to_string()),
        ("IP Address Source", "Static Address".to_string()),
        ("IP Address", bmc.ip_address.clone()),
        ("Subnet Mask", "255.255.255.0".to_string()),
        ("MAC Address", bmc.mac_address.clone()),
        ("Default Gateway IP", gateway),
        ("802.1q VLAN ID", "Disabled".to_string()),
        ("RMCP+ Cipher Suites", "3,17".to_string()),
    ];
    let lines: Vec<String> = rows
        .iter()
        .map(|(key, value)| format!("{:<24}: {}", key, value))
        .collect();
    Ok(CommandResult::ok(lines.join("\n")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{run, store};
    use sim_core::{Severity, XidError, XID_FALLEN_OFF_BUS};

    #[test]
    fn test_sdr_follows_gpu_temperature() {
        let mut store = store(1, 8);
        store.state_mut().nodes[0].gpus[3].temperature = 85;
        let result = run(&simulator(), &mut store, "ipmitool sdr list");
        let line = result
            .output
            .lines()
            .find(|l| l.starts_with("GPU3 Temp"))
            .unwrap();
        assert!(line.contains("85 degrees C"));
        assert!(line.ends_with("nc"));
        assert!(result.output.contains("GPU0 Temp        | 45 degrees C      | ok"));
    }

    #[test]
    fn test_fallen_gpu_has_no_reading() {
        let mut store = store(1, 8);
        let now = store.now();
        store.state_mut().nodes[0].gpus[1]
            .xid_errors
            .push(XidError::new(XID_FALLEN_OFF_BUS, now, Severity::Critical));
        let result = run(&simulator(), &mut store, "ipmitool sdr");
        assert!(result.output.contains("GPU1 Temp        | no reading        | ns"));
    }

    #[test]
    fn test_power_cycle_recovers_fallen_gpu() {
        let mut store = store(1, 8);
        let now = store.now();
        {
            let gpu = &mut store.state_mut().nodes[0].gpus[1];
            gpu.xid_errors.push(XidError::new(XID_FALLEN_OFF_BUS, now, Severity::Critical));
            gpu.ecc.raise_to(0, 2);
        }
        let result = run(&simulator(), &mut store, "ipmitool chassis power cycle");
        assert_eq!(result.output, "Chassis Power Control: Cycle");
        let gpu = &store.state().nodes[0].gpus[1];
        assert!(!gpu.is_fallen_off_bus());
        assert_eq!(gpu.ecc.aggregate.double_bit, 2);
        assert_eq!(gpu.ecc.volatile.double_bit, 0);
    }

    #[test]
    fn test_power_off_and_on() {
        let mut store = store(1, 8);
        run(&simulator(), &mut store, "ipmitool chassis power off");
        assert_eq!(
            run(&simulator(), &mut store, "ipmitool chassis power status").output,
            "Chassis Power is off"
        );
        assert_eq!(store.state().nodes[0].scheduler_state, SchedulerState::Down);
        assert!(run(&simulator(), &mut store, "ipmitool sdr").output.contains("Inlet Temp       | no reading"));

        run(&simulator(), &mut store, "ipmitool chassis power on");
        assert_eq!(store.state().nodes[0].scheduler_state, SchedulerState::Idle);
        assert!(run(&simulator(), &mut store, "ipmitool chassis status")
            .output
            .contains("System Power         : on"));
    }

    #[test]
    fn test_sel_list_and_clear() {
        let mut store = store(1, 8);
        assert_eq!(run(&simulator(), &mut store, "ipmitool sel list").output, "SEL has no entries");

        let now = store.now();
        store.state_mut().nodes[0]
            .bmc
            .log_event(now, "GPU2 Temp", "Upper Non-critical going high");
        let elist = run(&simulator(), &mut store, "ipmitool sel elist");
        assert!(elist.output.contains("Temperature GPU2 Temp"));
        assert!(elist.output.contains("Asserted"));

        run(&simulator(), &mut store, "ipmitool sel clear");
        let after = run(&simulator(), &mut store, "ipmitool sel elist");
        assert_eq!(after.output.lines().count(), 1);
        assert!(after.output.contains("Log area reset/cleared"));
    }

    #[test]
    fn test_remote_options_are_accepted() {
        let mut store = store(1, 8);
        let result = run(&simulator(), &mut store, "ipmitool -I lanplus -H 10.0.1.10 -U admin -P secret mc info");
        assert_eq!(result.exit_code, 0);
        assert!(result.output.contains("Firmware Revision         : 01.00.20"));
    }

    #[test]
    fn test_lan_print_and_invalid_action() {
        let mut store = store(1, 8);
        let lan = run(&simulator(), &mut store, "ipmitool lan print 1");
        assert!(lan.output.contains("IP Address              : 10.0.1.10"));
        assert!(lan.output.contains("Default Gateway IP      : 10.0.1.1"));

        let bad = run(&simulator(), &mut store, "ipmitool chassis stauts");
        assert_eq!(bad.exit_code, 1);
        assert!(bad.output.contains("status"));
    }
}
