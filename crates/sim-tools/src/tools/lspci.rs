//! lspci
//!
//! PCI enumeration still sees a GPU that fell off the bus: the slot answers
//! with all-ones config space, so the entry stays in the listing with
//! revision `ff` and is annotated with the XID that took it down.

use super::HandlerResult;
use crate::simulator::{CommandResult, FlagMetadata, SimContext, ToolRegistry};
use sim_core::state::short_bdf;
use sim_core::{Gpu, Node, SystemType};
use sim_shell::ParsedCommand;

pub fn simulator() -> ToolRegistry {
    ToolRegistry::new("lspci", "3.7.0", "List all PCI devices")
        .usage("lspci [-v|-vv|-vvv] [-n|-nn] [-k] [-s [[domain:]bus:][slot][.func]] [-d [vendor]:[device]]")
        .help_flags(&["help"])
        .version_flags(&["version", "V"])
        .version_text("lspci version 3.7.0")
        .root(list)
        .flag(FlagMetadata::short("v", "Be verbose"))
        .flag(FlagMetadata::short("vv", "Be very verbose"))
        .flag(FlagMetadata::short("vvv", "Be even more verbose"))
        .flag(FlagMetadata::short("n", "Show numeric ID's"))
        .flag(FlagMetadata::short("nn", "Show both textual and numeric ID's (names & numbers)"))
        .flag(FlagMetadata::short("k", "Show kernel drivers handling each device"))
        .flag(FlagMetadata::short("s", "Show only devices in selected slots").takes("SLOT"))
        .flag(FlagMetadata::short("d", "Show only devices with specified ID's").takes("VENDOR:DEVICE"))
}

struct Device {
    bus: u32,
    bdf: String,
    class: &'static str,
    class_id: &'static str,
    vendor: &'static str,
    vendor_id: &'static str,
    name: String,
    device_id: String,
    rev: &'static str,
    subsystem: String,
    driver: &'static str,
    modules: &'static str,
    /// Negotiated PCIe link speed and width
    link: (&'static str, u32),
    numa_node: u32,
    notes: Vec<String>,
    unreachable: bool,
}

impl Device {
    fn platform(
        bus: u32,
        class: (&'static str, &'static str),
        vendor: (&'static str, &'static str),
        name: &str,
        device_id: &str,
        driver: &'static str,
    ) -> Self {
        Self {
            bus,
            bdf: format!("{:02x}:00.0", bus),
            class: class.0,
            class_id: class.1,
            vendor: vendor.0,
            vendor_id: vendor.1,
            name: name.to_string(),
            device_id: device_id.to_string(),
            rev: "01",
            subsystem: format!("{} Device 0000", vendor.0),
            driver,
            modules: driver,
            link: ("16GT/s", 16),
            numa_node: u32::from(bus >= 0x80),
            notes: Vec::new(),
            unreachable: false,
        }
    }

    fn from_gpu(gpu: &Gpu, system: SystemType) -> Self {
        let bdf = gpu.short_pci_address().to_lowercase();
        let bus = u32::from_str_radix(bdf.split(':').next().unwrap_or("0"), 16).unwrap_or(0);
        let unreachable = gpu.is_fallen_off_bus();

        let mut notes = Vec::new();
        if let Some(xid) = gpu.latest_xid() {
            notes.push(format!("[XID {}: {}]", xid.code, xid.description));
        }
        if gpu.is_throttled() && !unreachable {
            notes.push(format!("[thermal slowdown: {} C]", gpu.temperature));
        }

        let (vendor_name, class_name) = ("NVIDIA Corporation", "3D controller");
        Self {
            bus,
            bdf,
            class: class_name,
            class_id: "0302",
            vendor: vendor_name,
            vendor_id: "10de",
            name: system
                .gpu_pci_description()
                .trim_start_matches("NVIDIA Corporation ")
                .to_string(),
            device_id: system.gpu_device_id().to_string(),
            rev: if unreachable { "ff" } else { "a1" },
            subsystem: "NVIDIA Corporation Device 1463".to_string(),
            driver: "nvidia",
            modules: "nvidiafb, nouveau, nvidia_drm, nvidia",
            link: if unreachable { ("unknown", 0) } else { ("16GT/s", 16) },
            numa_node: u32::from(bus >= 0x80),
            notes,
            unreachable,
        }
    }

    fn header(&self, numeric: bool, both: bool) -> String {
        let mut line = if numeric {
            format!(
                "{} {}: {}:{} (rev {})",
                self.bdf, self.class_id, self.vendor_id, self.device_id, self.rev
            )
        } else if both {
            format!(
                "{} {} [{}]: {} {} [{}:{}] (rev {})",
                self.bdf,
                self.class,
                self.class_id,
                self.vendor,
                self.name,
                self.vendor_id,
                self.device_id,
                self.rev
            )
        } else {
            format!(
                "{} {}: {} {} (rev {})",
                self.bdf, self.class, self.vendor, self.name, self.rev
            )
        };
        for note in &self.notes {
            line.push_str("  ");
            line.push_str(note);
        }
        line
    }

    fn details(&self, verbosity: u8, kernel: bool) -> Vec<String> {
        let mut lines = Vec::new();
        if verbosity == 0 {
            if kernel {
                lines.push(format!("\tSubsystem: {}", self.subsystem));
                if !self.unreachable {
                    lines.push(format!("\tKernel driver in use: {}", self.driver));
                }
                lines.push(format!("\tKernel modules: {}", self.modules));
            }
            return lines;
        }

        if self.unreachable {
            lines.push("\t!!! Unknown header type 7f".to_string());
            lines.push(format!("\tKernel modules: {}", self.modules));
            return lines;
        }

        lines.push(format!("\tSubsystem: {}", self.subsystem));
        lines.push(format!(
            "\tFlags: bus master, fast devsel, latency 0, IRQ {}, NUMA node {}",
            40 + self.bus % 200,
            self.numa_node
        ));
        lines.push(format!(
            "\tMemory at {:x}000000 (32-bit, non-prefetchable) [size=16M]",
            0xa0 + self.bus % 0x50
        ));
        lines.push("\tCapabilities: [60] Power Management version 3".to_string());
        lines.push("\tCapabilities: [78] Express Endpoint, MSI 00".to_string());
        if verbosity >= 2 {
            lines.push("\t\tDevCtl:\tCorrErr- NonFatalErr+ FatalErr+ UnsupReq-".to_string());
            lines.push(format!(
                "\t\tLnkCap:\tPort #0, Speed {}, Width x{}",
                self.link.0, self.link.1
            ));
            lines.push(format!(
                "\t\tLnkSta:\tSpeed {} (ok), Width x{} (ok)",
                self.link.0, self.link.1
            ));
        }
        if verbosity >= 3 {
            lines.push("\tCapabilities: [100 v1] Virtual Channel".to_string());
            lines.push("\tCapabilities: [258 v1] L1 PM Substates".to_string());
            lines.push("\tCapabilities: [600 v1] Vendor Specific Information: ID=0001 Rev=1 Len=024".to_string());
        }
        lines.push(format!("\tKernel driver in use: {}", self.driver));
        lines.push(format!("\tKernel modules: {}", self.modules));
        lines
    }
}

fn devices(node: &Node, system: SystemType) -> Vec<Device> {
    const HOST_BRIDGE: (&str, &str) = ("Host bridge", "0600");
    const NVME: (&str, &str) = ("Non-Volatile memory controller", "0108");
    const BRIDGE: (&str, &str) = ("Bridge", "0680");
    const INFINIBAND: (&str, &str) = ("Infiniband controller", "0207");
    const ETHERNET: (&str, &str) = ("Ethernet controller", "0200");
    const AMD: (&str, &str) = ("Advanced Micro Devices, Inc. [AMD]", "1022");
    const SAMSUNG: (&str, &str) = ("Samsung Electronics Co Ltd", "144d");
    const NVIDIA: (&str, &str) = ("NVIDIA Corporation", "10de");
    const MELLANOX: (&str, &str) = ("Mellanox Technologies", "15b3");

    let (switch_id, switch_count, hca_name, hca_id) = match system {
        SystemType::DgxA100 => ("1af1", 6, "MT28908 Family [ConnectX-6]", "101b"),
        SystemType::DgxH100 => ("22a3", 4, "MT2910 Family [ConnectX-7]", "1021"),
    };

    let mut list = vec![
        Device::platform(0x00, HOST_BRIDGE, AMD, "Starship/Matisse Root Complex", "1480", "pcieport"),
        Device::platform(0x01, NVME, SAMSUNG, "NVMe SSD Controller PM173X", "a824", "nvme"),
        Device::platform(0x80, HOST_BRIDGE, AMD, "Starship/Matisse Root Complex", "1480", "pcieport"),
        Device::platform(0xe1, ETHERNET, MELLANOX, "MT2892 Family [ConnectX-6 Dx]", "101d", "mlx5_core"),
    ];
    for switch in 0..switch_count {
        let mut device = Device::platform(0xc4 + switch, BRIDGE, NVIDIA, "Device", switch_id, "nvidia-nvswitch");
        device.name = format!("Device {}", switch_id);
        device.rev = "a1";
        list.push(device);
    }
    for hca in &node.hcas {
        let bus = u32::from_str_radix(short_bdf(&hca.pci_address).split(':').next().unwrap_or("0"), 16)
            .unwrap_or(0);
        list.push(Device::platform(bus, INFINIBAND, MELLANOX, hca_name, hca_id, "mlx5_core"));
    }
    list.extend(node.gpus.iter().map(|gpu| Device::from_gpu(gpu, system)));
    list.sort_by_key(|d| d.bus);
    list
}

/// `-s` selector: `[[domain:]bus:][slot][.func]`, matched as a prefix
fn slot_matches(device: &Device, selector: &str) -> bool {
    let selector = selector.to_lowercase();
    let selector = match selector.matches(':').count() {
        2 => selector.split_once(':').map_or(selector.clone(), |(_, rest)| rest.to_string()),
        _ => selector,
    };
    device.bdf.starts_with(&selector)
}

/// `-d` selector: `[vendor]:[device]`
fn id_matches(device: &Device, selector: &str) -> Option<bool> {
    let (vendor, id) = selector.split_once(':')?;
    let hex = |s: &str| s.is_empty() || s.chars().all(|c| c.is_ascii_hexdigit());
    if !hex(vendor) || !hex(id) {
        return None;
    }
    Some(
        (vendor.is_empty() || vendor.eq_ignore_ascii_case(device.vendor_id))
            && (id.is_empty() || id.eq_ignore_ascii_case(&device.device_id)),
    )
}

fn list(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    let system = ctx.state().system_type;
    let node = ctx.node()?;
    let verbosity = if parsed.has_flag(&["vvv"]) {
        3
    } else if parsed.has_flag(&["vv"]) {
        2
    } else {
        u8::from(parsed.has_flag(&["v"]))
    };
    let numeric = parsed.has_flag(&["n"]);
    let both = parsed.has_flag(&["nn"]);
    let kernel = parsed.has_flag(&["k"]);
    let slot = parsed.flag_value(&["s"]);
    let ids = parsed.flag_value(&["d"]);

    let mut blocks = Vec::new();
    for device in devices(node, system) {
        if slot.map_or(false, |s| !slot_matches(&device, s)) {
            continue;
        }
        if let Some(selector) = ids {
            match id_matches(&device, selector) {
                Some(true) => {}
                Some(false) => continue,
                None => {
                    return Ok(CommandResult::error(format!(
                        "lspci: -d: Invalid vendor:device ID specification '{}'",
                        selector
                    )))
                }
            }
        }
        let mut lines = vec![device.header(numeric, both)];
        lines.extend(device.details(verbosity, kernel));
        blocks.push(lines.join("\n"));
    }

    let separator = if verbosity > 0 { "\n\n" } else { "\n" };
    Ok(CommandResult::ok(blocks.join(separator)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{run, store};
    use sim_core::{Severity, XidError, XID_FALLEN_OFF_BUS};

    #[test]
    fn test_lists_gpus_and_hcas() {
        let mut store = store(1, 8);
        let result = run(&simulator(), &mut store, "lspci");
        assert_eq!(result.output.lines().filter(|l| l.contains("3D controller")).count(), 8);
        assert_eq!(result.output.lines().filter(|l| l.contains("Infiniband controller")).count(), 4);
        assert!(result
            .output
            .contains("07:00.0 3D controller: NVIDIA Corporation GA100 [A100 SXM4 80GB] (rev a1)"));
    }

    #[test]
    fn test_fallen_gpu_is_annotated() {
        let mut store = store(1, 8);
        let now = store.now();
        store.state_mut().nodes[0].gpus[0]
            .xid_errors
            .push(XidError::new(XID_FALLEN_OFF_BUS, now, Severity::Critical));

        let result = run(&simulator(), &mut store, "lspci -s 07:00.0");
        assert_eq!(result.output.lines().count(), 1);
        assert!(result.output.contains("(rev ff)"));
        assert!(result.output.contains("[XID 79: GPU has fallen off the bus]"));

        let verbose = run(&simulator(), &mut store, "lspci -v -s 0000:07:00.0");
        assert!(verbose.output.contains("Unknown header type 7f"));
        assert!(!verbose.output.contains("Kernel driver in use"));
    }

    #[test]
    fn test_thermal_annotation() {
        let mut store = store(1, 8);
        store.state_mut().nodes[0].gpus[1].temperature = 88;
        let result = run(&simulator(), &mut store, "lspci -d 10de:");
        let line = result.output.lines().find(|l| l.starts_with("0f:00.0")).unwrap();
        assert!(line.contains("[thermal slowdown: 88 C]"));
        assert!(!result.output.contains("Mellanox"));
    }

    #[test]
    fn test_numeric_and_kernel_views() {
        let mut store = store(1, 8);
        let both = run(&simulator(), &mut store, "lspci -nn -s 07:00.0");
        assert!(both.output.contains("3D controller [0302]"));
        assert!(both.output.contains("[10de:20b2]"));

        let kernel = run(&simulator(), &mut store, "lspci -k -d 15b3:101b");
        assert!(kernel.output.contains("Kernel driver in use: mlx5_core"));
        assert_eq!(kernel.output.lines().filter(|l| !l.starts_with('\t')).count(), 4);
    }

    #[test]
    fn test_invalid_id_selector() {
        let mut store = store(1, 8);
        let result = run(&simulator(), &mut store, "lspci -d nvidia");
        assert_eq!(result.exit_code, 1);
    }

    #[test]
    fn test_very_verbose_shows_link_status() {
        let mut store = store(1, 2);
        let result = run(&simulator(), &mut store, "lspci -vv -s 07:00.0");
        assert!(result.output.contains("LnkSta:\tSpeed 16GT/s (ok), Width x16 (ok)"));
        assert!(!result.output.contains("Virtual Channel"));
    }
}
