//! dmesg
//!
//! The kernel ring buffer is rebuilt from the node state on every call: a
//! fixed boot sequence followed by one or more lines per piece of fault
//! evidence, ordered by time since boot.

use super::{kernel_pci, HandlerResult};
use crate::simulator::{CommandResult, FlagMetadata, SimContext, ToolRegistry};
use chrono::{DateTime, Duration, Utc};
use sim_core::state::THERMAL_SLOWDOWN_C;
use sim_core::{Gpu, Node, PortState, XID_FALLEN_OFF_BUS};
use sim_shell::ParsedCommand;
use sim_state::store::SESSION_UPTIME_SECS;
use std::str::FromStr;

pub fn simulator() -> ToolRegistry {
    ToolRegistry::new("dmesg", "2.37.2", "Print or control the kernel ring buffer")
        .usage("dmesg [-T] [-l|--level LIST]")
        .version_flags(&["version", "V"])
        .version_text("dmesg from util-linux 2.37.2")
        .root(show)
        .flag(FlagMetadata::both("T", "ctime", "Show human-readable timestamps"))
        .flag(FlagMetadata::both("l", "level", "Restrict output to the given levels").takes("LIST"))
        .flag(FlagMetadata::both("x", "decode", "Decode facility and level to readable strings"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Level {
    Emerg,
    Alert,
    Crit,
    Error,
    Warning,
    Notice,
    Info,
    Debug,
}

impl Level {
    fn name(&self) -> &'static str {
        match self {
            Level::Emerg => "emerg",
            Level::Alert => "alert",
            Level::Crit => "crit",
            Level::Error => "err",
            Level::Warning => "warn",
            Level::Notice => "notice",
            Level::Info => "info",
            Level::Debug => "debug",
        }
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "emerg" => Ok(Level::Emerg),
            "alert" => Ok(Level::Alert),
            "crit" => Ok(Level::Crit),
            "err" => Ok(Level::Error),
            "warn" => Ok(Level::Warning),
            "notice" => Ok(Level::Notice),
            "info" => Ok(Level::Info),
            "debug" => Ok(Level::Debug),
            other => Err(format!("unknown level '{}'", other)),
        }
    }
}

struct Entry {
    offset: f64,
    level: Level,
    text: String,
}

struct RingBuffer {
    boot: DateTime<Utc>,
    /// Time used for evidence that carries no timestamp of its own
    fallback: DateTime<Utc>,
    entries: Vec<Entry>,
}

impl RingBuffer {
    fn new(boot: DateTime<Utc>, fallback: DateTime<Utc>) -> Self {
        Self {
            boot,
            fallback,
            entries: Vec::new(),
        }
    }

    fn at(&mut self, offset: f64, level: Level, text: impl Into<String>) {
        // Later lines logged at the same instant keep their order.
        let offset = offset + self.entries.len() as f64 * 0.000_013;
        self.entries.push(Entry {
            offset,
            level,
            text: text.into(),
        });
    }

    fn when(&mut self, time: Option<DateTime<Utc>>, level: Level, text: impl Into<String>) {
        let time = time.unwrap_or(self.fallback);
        let offset = (time - self.boot).num_milliseconds() as f64 / 1000.0;
        self.at(offset.max(0.0), level, text);
    }

    fn into_sorted(mut self) -> Vec<Entry> {
        self.entries.sort_by(|a, b| a.offset.total_cmp(&b.offset));
        self.entries
    }
}

fn sel_time(node: &Node, sensor: &str) -> Option<DateTime<Utc>> {
    node.bmc
        .sel
        .iter()
        .filter(|e| e.sensor == sensor)
        .map(|e| e.timestamp)
        .min()
}

/// `0000:07:00`, the bus tag NVRM prints in XID lines
fn xid_tag(gpu: &Gpu) -> String {
    kernel_pci(&gpu.pci_address)
        .to_lowercase()
        .trim_end_matches(".0")
        .to_string()
}

fn ring_buffer(node: &Node, boot: DateTime<Utc>, fallback: DateTime<Utc>) -> Vec<Entry> {
    let mut log = RingBuffer::new(boot, fallback);

    log.at(
        0.0,
        Level::Notice,
        format!(
            "Linux version {} (buildd@lcy02-amd64-045) (gcc (Ubuntu 11.4.0-1ubuntu1~22.04) 11.4.0) #43-Ubuntu SMP",
            node.kernel_version
        ),
    );
    log.at(
        0.0,
        Level::Info,
        format!("Command line: BOOT_IMAGE=/boot/vmlinuz-{} ro quiet", node.kernel_version),
    );
    log.at(0.0, Level::Info, format!("DMI: NVIDIA DGX/{}, BIOS 1.25 11/30/2023", node.hostname));
    for gpu in &node.gpus {
        log.at(
            1.204_311,
            Level::Info,
            format!(
                "pci {}: [10de:{}] type 00 class 0x030200",
                kernel_pci(&gpu.pci_address).to_lowercase(),
                if gpu.name.contains("H100") { "2330" } else { "20b2" }
            ),
        );
    }
    for hca in &node.hcas {
        log.at(
            4.518_902,
            Level::Info,
            format!("mlx5_core {}: firmware version: {}", hca.pci_address, hca.firmware_version),
        );
    }
    log.at(12.304_117, Level::Warning, "nvidia: loading out-of-tree module taints kernel.");
    log.at(
        12.551_060,
        Level::Info,
        "nvidia-nvlink: Nvlink Core is being initialized, major device number 511",
    );
    log.at(
        13.098_245,
        Level::Info,
        format!(
            "NVRM: loading NVIDIA UNIX x86_64 Kernel Module  {}  Thu Oct 26 21:47:07 UTC 2023",
            node.driver_version
        ),
    );
    for hca in &node.hcas {
        log.at(
            25.774_812,
            Level::Info,
            format!("mlx5_core {} {}: Link up", hca.pci_address, interface_name(&hca.pci_address)),
        );
    }

    for gpu in &node.gpus {
        let pci = kernel_pci(&gpu.pci_address).to_lowercase();
        let tag = xid_tag(gpu);
        for xid in &gpu.xid_errors {
            log.when(
                Some(xid.timestamp),
                Level::Error,
                format!(
                    "NVRM: Xid (PCI:{}): {}, pid='<unknown>', name=<unknown>, {}.",
                    tag, xid.code, xid.description
                ),
            );
            if xid.code == XID_FALLEN_OFF_BUS {
                log.when(
                    Some(xid.timestamp),
                    Level::Error,
                    format!("NVRM: GPU {}: GPU has fallen off the bus.", pci),
                );
                log.when(
                    Some(xid.timestamp),
                    Level::Error,
                    format!("NVRM: GPU {}: A GPU crash dump has been created.", pci),
                );
            }
        }
        if gpu.is_throttled() {
            log.when(
                sel_time(node, &format!("GPU{} Temp", gpu.id)),
                Level::Warning,
                format!(
                    "NVRM: GPU {}: Thermal slowdown engaged: temperature {} C exceeds slowdown threshold {} C",
                    pci, gpu.temperature, THERMAL_SLOWDOWN_C
                ),
            );
        }
        if gpu.has_double_bit_errors() && !gpu.xid_errors.iter().any(|x| x.code == 48) {
            log.when(
                sel_time(node, &format!("GPU{} Status", gpu.id)),
                Level::Error,
                format!(
                    "NVRM: GPU {}: Uncorrectable ECC error detected, {} double bit error(s)",
                    pci, gpu.ecc.aggregate.double_bit
                ),
            );
        }
        let link_time = gpu.xid_errors.iter().find(|x| x.code == 74).map(|x| x.timestamp);
        for link in gpu.inactive_links() {
            log.when(
                link_time,
                Level::Warning,
                format!("nvidia-nvlink: GPU {}: NVLink {} is down", pci, link.link),
            );
        }
    }

    for hca in &node.hcas {
        for port in hca.ports.iter().filter(|p| p.state == PortState::Down) {
            log.when(
                None,
                Level::Warning,
                format!(
                    "mlx5_core {} {}: Link down (port {})",
                    hca.pci_address,
                    interface_name(&hca.pci_address),
                    port.port
                ),
            );
        }
    }

    log.into_sorted()
}

/// Predictable interface name, `ibp12s0` for bus `0c`
fn interface_name(pci_address: &str) -> String {
    let bus = pci_address
        .split(':')
        .nth(1)
        .and_then(|b| u32::from_str_radix(b, 16).ok())
        .unwrap_or(0);
    format!("ibp{}s0", bus)
}

fn show(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    let levels: Option<Vec<Level>> = match parsed.flag_value(&["l", "level"]) {
        Some(list) => match list.split(',').map(Level::from_str).collect::<Result<Vec<_>, _>>() {
            Ok(levels) => Some(levels),
            Err(message) => return Ok(CommandResult::error(format!("dmesg: {}", message))),
        },
        None if parsed.has_flag(&["l", "level"]) => {
            return Ok(CommandResult::error("dmesg: option requires an argument -- 'l'"))
        }
        None => None,
    };
    let human = parsed.has_flag(&["T", "ctime"]);
    let decode = parsed.has_flag(&["x", "decode"]);

    let boot = ctx.state().boot_time;
    let fallback = boot + Duration::seconds(SESSION_UPTIME_SECS);
    let node = ctx.node()?;

    let lines: Vec<String> = ring_buffer(node, boot, fallback)
        .into_iter()
        .filter(|e| levels.as_ref().map_or(true, |l| l.contains(&e.level)))
        .map(|e| {
            let stamp = if human {
                let at = boot + Duration::milliseconds((e.offset * 1000.0) as i64);
                format!("[{}]", at.format("%a %b %e %H:%M:%S %Y"))
            } else {
                format!("[{:>12.6}]", e.offset)
            };
            if decode {
                format!("kern  :{:<6}: {} {}", e.level.name(), stamp, e.text)
            } else {
                format!("{} {}", stamp, e.text)
            }
        })
        .collect();
    Ok(CommandResult::ok(lines.join("\n")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{run, store};
    use sim_core::{PhysicalState, Severity, XidError};

    #[test]
    fn test_boot_sequence() {
        let mut store = store(1, 8);
        let result = run(&simulator(), &mut store, "dmesg");
        let first = result.output.lines().next().unwrap();
        assert!(first.starts_with("[    0.000000] Linux version 5.15.0-1042-nvidia"));
        assert!(result.output.contains("NVRM: loading NVIDIA UNIX x86_64 Kernel Module  535.129.03"));
        assert!(!result.output.contains("Xid"));
    }

    #[test]
    fn test_fallen_gpu_xid_line() {
        let mut store = store(1, 8);
        let now = store.now();
        store.state_mut().nodes[0].gpus[1]
            .xid_errors
            .push(XidError::new(XID_FALLEN_OFF_BUS, now, Severity::Critical));

        let result = run(&simulator(), &mut store, "dmesg --level err");
        assert!(result
            .output
            .contains("NVRM: Xid (PCI:0000:0f:00): 79, pid='<unknown>', name=<unknown>, GPU has fallen off the bus."));
        assert!(result.output.contains("NVRM: GPU 0000:0f:00.0: GPU has fallen off the bus."));
        assert!(!result.output.contains("Linux version"));
        let last = result.output.lines().last().unwrap();
        assert!(last.contains("crash dump"));
    }

    #[test]
    fn test_thermal_and_link_lines() {
        let mut store = store(1, 8);
        {
            let node = &mut store.state_mut().nodes[0];
            node.gpus[2].temperature = 87;
            node.hcas[0].ports[0].state = PortState::Down;
            node.hcas[0].ports[0].physical_state = PhysicalState::Disabled;
        }
        let result = run(&simulator(), &mut store, "dmesg -l err,warn");
        assert!(result.output.contains("Thermal slowdown engaged: temperature 87 C"));
        assert!(result.output.contains("mlx5_core 0000:0c:00.0 ibp12s0: Link down (port 1)"));
    }

    #[test]
    fn test_human_timestamps() {
        let mut store = store(1, 8);
        let result = run(&simulator(), &mut store, "dmesg -T");
        assert!(result
            .output
            .lines()
            .next()
            .unwrap()
            .starts_with("[Mon Jan 15 08:00:00 2024] Linux version"));
    }

    #[test]
    fn test_unknown_level() {
        let mut store = store(1, 8);
        let result = run(&simulator(), &mut store, "dmesg --level loud");
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("unknown level 'loud'"));
    }
}
