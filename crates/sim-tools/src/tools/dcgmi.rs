//! dcgmi
//!
//! Diagnostics and health checks derive every verdict from the GPU fault
//! evidence in the cluster state. GPUs that fell off the bus cannot be
//! reached by DCGM: they are left out of discovery and health reports, and
//! a diagnostic that targets one fails with an "inaccessible" error.

use super::{fallen_banner, parse_index_list, HandlerResult};
use crate::simulator::{CommandMetadata, CommandResult, FlagMetadata, SimContext, ToolRegistry};
use sim_core::state::{xid_description, THERMAL_SLOWDOWN_C};
use sim_core::{Gpu, HealthStatus, Node, SystemType, XID_FALLEN_OFF_BUS};
use sim_shell::ParsedCommand;

const DCGM_VERSION: &str = "3.3.5";

pub fn simulator() -> ToolRegistry {
    ToolRegistry::new("dcgmi", DCGM_VERSION, "NVIDIA Data Center GPU Manager command-line interface")
        .usage("dcgmi <command> [options]")
        .version_text(format!("dcgmi  version: {}", DCGM_VERSION))
        .command(
            CommandMetadata::new("discovery", "Discover GPUs and NvSwitches on the system")
                .usage("dcgmi discovery -l")
                .flag(FlagMetadata::both("l", "list", "List all GPUs and NvSwitches discovered by DCGM"))
                .example("dcgmi discovery -l"),
            discovery,
        )
        .command(
            CommandMetadata::new("diag", "Run system validation and diagnostic tests")
                .usage("dcgmi diag -r <1|2|3> [-i <gpuList>]")
                .flag(FlagMetadata::both("r", "run", "Run level: 1 (short), 2 (medium) or 3 (long)").takes("LEVEL"))
                .flag(FlagMetadata::both("i", "gpuList", "Comma separated list of GPU indices").takes("GPUS"))
                .flag(FlagMetadata::both("g", "group", "Group to run on (default: all GPUs)").takes("GROUP"))
                .example("dcgmi diag -r 1")
                .example("dcgmi diag -r 3 -i 0"),
            diag,
        )
        .command(
            CommandMetadata::new("health", "Check the health of the GPUs")
                .usage("dcgmi health -c [-g <groupId>]")
                .flag(FlagMetadata::both("c", "check", "Check the current health of the group"))
                .flag(FlagMetadata::both("g", "group", "Group to check (default: all GPUs)").takes("GROUP"))
                .example("dcgmi health -c"),
            health,
        )
        .command(
            CommandMetadata::new("group", "Manage GPU groups")
                .usage("dcgmi group -l")
                .flag(FlagMetadata::both("l", "list", "List the groups that currently exist"))
                .example("dcgmi group -l"),
            group,
        )
}

fn nvswitch_count(system: SystemType) -> u32 {
    match system {
        SystemType::DgxA100 => 6,
        SystemType::DgxH100 => 4,
    }
}

const INNER: usize = 76;

fn boxed(content: &str) -> String {
    format!("| {:<width$} |", content, width = INNER)
}

fn two_column(left: &str, right: &str) -> String {
    format!("| {:<25} | {:<48} |", left, right)
}

fn rule(fill: char) -> String {
    format!("+{}+{}+", fill.to_string().repeat(27), fill.to_string().repeat(50))
}

/// Greedy word wrap
fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if !current.is_empty() && current.len() + 1 + word.len() > width {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

fn discovery(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    if !parsed.has_flag(&["l", "list"]) {
        return Ok(CommandResult::error(
            "dcgmi discovery: no option given.\nUsage: dcgmi discovery -l",
        ));
    }
    let system = ctx.state().system_type;
    let node = ctx.node()?;
    let gpus: Vec<&Gpu> = node.visible_gpus().collect();
    let divider = format!("+--------+{}+", "-".repeat(70));

    let mut lines = Vec::new();
    if let Some(banner) = fallen_banner(node) {
        lines.push(banner);
    }
    lines.push(format!("{} GPU{} found.", gpus.len(), if gpus.len() == 1 { "" } else { "s" }));
    lines.push(divider.clone());
    lines.push(format!("| GPU ID | {:<68} |", "Device Information"));
    lines.push(divider.clone());
    for gpu in &gpus {
        lines.push(format!("| {:<6} | {:<68} |", gpu.id, format!("Name: {}", gpu.name)));
        lines.push(format!("| {:<6} | {:<68} |", "", format!("PCI Bus ID: {}", gpu.pci_address)));
        lines.push(format!("| {:<6} | {:<68} |", "", format!("Device UUID: {}", gpu.uuid)));
        lines.push(divider.clone());
    }

    let switches = nvswitch_count(system);
    lines.push(format!("{} NvSwitches found.", switches));
    lines.push("+-----------+".to_string());
    lines.push("| Switch ID |".to_string());
    lines.push("+-----------+".to_string());
    for id in 0..switches {
        lines.push(format!("| {:<9} |", id));
    }
    lines.push("+-----------+".to_string());
    Ok(CommandResult::ok(lines.join("\n")))
}

/// Outcome of one diagnostic test across the tested GPUs
struct TestOutcome {
    name: &'static str,
    failures: Vec<(u32, String)>,
    warnings: Vec<(u32, String)>,
}

impl TestOutcome {
    fn run(name: &'static str, gpus: &[&Gpu], check: impl Fn(&Gpu) -> Option<(HealthStatus, String)>) -> Self {
        let mut outcome = TestOutcome {
            name,
            failures: Vec::new(),
            warnings: Vec::new(),
        };
        for &gpu in gpus {
            match check(gpu) {
                Some((HealthStatus::Critical, message)) => outcome.failures.push((gpu.id, message)),
                Some((_, message)) => outcome.warnings.push((gpu.id, message)),
                None => {}
            }
        }
        outcome
    }

    fn verdict(&self) -> String {
        let ids = |entries: &[(u32, String)]| {
            entries
                .iter()
                .map(|(id, _)| id.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        if !self.failures.is_empty() {
            format!("Fail - GPU: {}", ids(&self.failures))
        } else if !self.warnings.is_empty() {
            format!("Warn - GPU: {}", ids(&self.warnings))
        } else {
            "Pass - All".to_string()
        }
    }

    fn render(&self, lines: &mut Vec<String>) {
        lines.push(two_column(self.name, &self.verdict()));
        let notes = self
            .failures
            .iter()
            .map(|(id, m)| format!("Error: GPU {}: {}", id, m))
            .chain(self.warnings.iter().map(|(id, m)| format!("Warning: GPU {}: {}", id, m)));
        for note in notes {
            for line in wrap(&note, 48) {
                lines.push(two_column("", &line));
            }
        }
    }
}

fn check_row_remap(gpu: &Gpu) -> Option<(HealthStatus, String)> {
    gpu.has_double_bit_errors().then(|| {
        (
            HealthStatus::Critical,
            format!(
                "{} uncorrectable ECC error(s) pending row remapping. Drain the node and reset the GPU.",
                gpu.ecc.aggregate.double_bit
            ),
        )
    })
}

fn check_pcie(gpu: &Gpu) -> Option<(HealthStatus, String)> {
    let down: Vec<String> = gpu.inactive_links().map(|l| l.link.to_string()).collect();
    if !down.is_empty() {
        return Some((
            HealthStatus::Critical,
            format!("NVLink link(s) {} inactive. Check 'nvidia-smi nvlink -s'.", down.join(", ")),
        ));
    }
    let crc: u64 = gpu.nvlinks.iter().map(|l| l.crc_errors).sum();
    (crc > 0).then(|| (HealthStatus::Warning, format!("{} NVLink CRC errors detected.", crc)))
}

fn check_memory(gpu: &Gpu) -> Option<(HealthStatus, String)> {
    if gpu.has_double_bit_errors() {
        return Some((
            HealthStatus::Critical,
            "A double-bit ECC error was detected in GPU memory.".to_string(),
        ));
    }
    (gpu.memory_used >= gpu.memory_total).then(|| {
        (
            HealthStatus::Warning,
            "GPU memory is fully allocated; the test could not allocate its buffers.".to_string(),
        )
    })
}

fn check_stress(gpu: &Gpu) -> Option<(HealthStatus, String)> {
    if gpu.hung {
        return Some((
            HealthStatus::Critical,
            "GPU stopped processing (XID 43). The GPU must be reset.".to_string(),
        ));
    }
    gpu.xid_errors
        .iter()
        .find(|x| x.severity.health() == HealthStatus::Critical && x.code != XID_FALLEN_OFF_BUS)
        .map(|x| {
            (
                HealthStatus::Critical,
                format!("XID {} ({}) reported during the test.", x.code, x.description),
            )
        })
}

fn check_power(gpu: &Gpu) -> Option<(HealthStatus, String)> {
    if gpu.is_throttled() {
        return Some((
            HealthStatus::Critical,
            format!(
                "Clocks throttled: temperature {} C exceeds the slowdown threshold of {} C.",
                gpu.temperature, THERMAL_SLOWDOWN_C
            ),
        ));
    }
    (gpu.power_draw > gpu.power_limit).then(|| {
        (
            HealthStatus::Warning,
            format!(
                "Power draw {:.0} W exceeds the power limit of {:.0} W.",
                gpu.power_draw, gpu.power_limit
            ),
        )
    })
}

fn diag_level(raw: &str) -> Option<u32> {
    match raw.to_lowercase().as_str() {
        "1" | "short" => Some(1),
        "2" | "medium" => Some(2),
        "3" | "long" => Some(3),
        _ => None,
    }
}

fn diag(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    let Some(raw_level) = parsed.flag_value(&["r", "run"]) else {
        return Ok(CommandResult::error(
            "Error: a run level is required.\nUsage: dcgmi diag -r <1|2|3> [-i <gpuList>]\n\
             Use 1 for a quick check, 2 for a medium check or 3 for a full hardware validation.",
        ));
    };
    let Some(level) = diag_level(raw_level) else {
        return Ok(CommandResult::error(format!(
            "Error: invalid run level '{}'. Valid levels are 1 (short), 2 (medium) and 3 (long).",
            raw_level
        )));
    };

    let node = ctx.node()?;
    let gpus: Vec<&Gpu> = match parsed.flag_value(&["i", "gpuList"]) {
        None => node.visible_gpus().collect(),
        Some(list) => {
            let Some(ids) = parse_index_list(list) else {
                return Ok(CommandResult::error(format!(
                    "Error: invalid GPU list '{}'. Use indices such as '0', '0,1' or '0-3'.",
                    list
                )));
            };
            let mut selected = Vec::new();
            for id in ids {
                match node.gpu(id) {
                    Some(gpu) if gpu.is_fallen_off_bus() => {
                        return Ok(CommandResult::error(format!(
                            "Error: GPU {} is inaccessible (XID {}: {}).\n\
                             DCGM cannot communicate with the device, so no diagnostic can run on it.\n\
                             Check 'dmesg' and reboot the node to recover the GPU.",
                            id,
                            XID_FALLEN_OFF_BUS,
                            xid_description(XID_FALLEN_OFF_BUS)
                        )));
                    }
                    Some(gpu) => selected.push(gpu),
                    None => {
                        return Ok(CommandResult::error(format!(
                            "Error: GPU {} was not found on {}. Run 'dcgmi discovery -l' to list GPUs.",
                            id, node.hostname
                        )));
                    }
                }
            }
            selected
        }
    };
    if gpus.is_empty() {
        return Ok(CommandResult::error(
            "Error: no accessible GPUs to run diagnostics on. Check 'dmesg' for bus errors.",
        ));
    }

    let device_ids: Vec<&str> = gpus.iter().map(|_| ctx.state().system_type.gpu_device_id()).collect();
    let mut lines = Vec::new();
    if let Some(banner) = fallen_banner(node) {
        lines.push(banner);
    }
    lines.push("Successfully ran diagnostic for group.".to_string());
    lines.push(rule('-'));
    lines.push(two_column("Diagnostic", "Result"));
    lines.push(rule('='));
    lines.push(format!("|{:-<27}+{:-<50}|", "-----  Metadata  ", ""));
    lines.push(two_column("DCGM Version", DCGM_VERSION));
    lines.push(two_column("Driver Version Detected", &node.driver_version));
    lines.push(two_column("GPU Device IDs Detected", &device_ids.join(",")));
    lines.push(format!("|{:-<27}+{:-<50}|", "-----  Deployment  ", ""));

    let mut outcomes = Vec::new();
    for name in ["Denylist", "NVML Library", "CUDA Main Library", "Permissions and OS Blocks"] {
        lines.push(two_column(name, "Pass"));
    }
    let persistence = TestOutcome::run("Persistence Mode", &gpus, |g| {
        (!g.persistence_mode).then(|| {
            (
                HealthStatus::Warning,
                "Persistence mode is disabled. Enable it with 'nvidia-smi -pm 1'.".to_string(),
            )
        })
    });
    outcomes.push(persistence);
    outcomes.push(TestOutcome::run("Page Retirement/Row Remap", &gpus, check_row_remap));
    for outcome in &outcomes {
        outcome.render(&mut lines);
    }
    lines.push(two_column("Graphics Processes", "Pass"));
    lines.push(two_column("Inforom", "Pass"));

    let mut sections: Vec<(&str, Vec<TestOutcome>)> = Vec::new();
    if level >= 2 {
        sections.push(("Integration", vec![TestOutcome::run("PCIe", &gpus, check_pcie)]));
        sections.push(("Hardware", vec![TestOutcome::run("GPU Memory", &gpus, check_memory)]));
    }
    if level >= 3 {
        sections.push((
            "Stress",
            vec![
                TestOutcome::run("Targeted Stress", &gpus, check_stress),
                TestOutcome::run("Targeted Power", &gpus, check_power),
                TestOutcome::run("Memory Bandwidth", &gpus, check_memory),
                TestOutcome::run("Diagnostic", &gpus, check_stress),
            ],
        ));
    }
    for (title, tests) in &sections {
        lines.push(format!("+{:-<27}+{:-<50}+", format!("-----  {}  ", title), ""));
        for test in tests {
            test.render(&mut lines);
        }
    }
    lines.push(rule('-'));

    let failed = outcomes
        .iter()
        .chain(sections.iter().flat_map(|(_, tests)| tests.iter()))
        .any(|t| !t.failures.is_empty());
    let output = lines.join("\n");
    Ok(if failed {
        CommandResult::error(output)
    } else {
        CommandResult::ok(output)
    })
}

/// One health incident: severity and message
fn gpu_incidents(gpu: &Gpu) -> Vec<(HealthStatus, String)> {
    let mut incidents = Vec::new();
    if gpu.has_double_bit_errors() {
        incidents.push((
            HealthStatus::Critical,
            format!(
                "Memory: {} double-bit ECC error(s) detected. Drain the node and reset the GPU.",
                gpu.ecc.aggregate.double_bit
            ),
        ));
    } else if gpu.ecc.aggregate.single_bit > 0 {
        incidents.push((
            HealthStatus::Warning,
            format!(
                "Memory: {} single-bit ECC error(s) corrected. Monitor for growth.",
                gpu.ecc.aggregate.single_bit
            ),
        ));
    }
    if gpu.is_throttled() {
        let severity = if gpu.temperature >= 90 {
            HealthStatus::Critical
        } else {
            HealthStatus::Warning
        };
        incidents.push((
            severity,
            format!(
                "Thermal: temperature {} C is above the slowdown threshold of {} C. Check cooling and airflow.",
                gpu.temperature, THERMAL_SLOWDOWN_C
            ),
        ));
    }
    if gpu.power_draw > gpu.power_limit {
        incidents.push((
            HealthStatus::Warning,
            format!(
                "Power: draw {:.0} W exceeds the limit of {:.0} W.",
                gpu.power_draw, gpu.power_limit
            ),
        ));
    }
    let down: Vec<String> = gpu.inactive_links().map(|l| l.link.to_string()).collect();
    if !down.is_empty() {
        incidents.push((
            HealthStatus::Warning,
            format!("NVLink: link(s) {} down.", down.join(", ")),
        ));
    }
    if gpu.memory_used >= gpu.memory_total {
        incidents.push((HealthStatus::Warning, "Memory: framebuffer is full.".to_string()));
    }
    for xid in &gpu.xid_errors {
        incidents.push((
            xid.severity.health(),
            format!("Driver: XID {} ({}) reported.", xid.code, xid.description),
        ));
    }
    incidents
}

fn health_word(status: HealthStatus) -> &'static str {
    match status {
        HealthStatus::Ok => "Healthy",
        HealthStatus::Warning => "Warning",
        HealthStatus::Critical => "Failure",
    }
}

fn health(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    if !parsed.has_flag(&["c", "check"]) {
        return Ok(CommandResult::error(
            "dcgmi health: no action given.\nUse 'dcgmi health -c' to check the current health of all GPUs.",
        ));
    }
    let node = ctx.node()?;
    let fallen = node.fallen_gpus().count();
    let reports: Vec<(u32, HealthStatus, Vec<(HealthStatus, String)>)> = node
        .visible_gpus()
        .map(|g| {
            let incidents = gpu_incidents(g);
            let status = incidents.iter().map(|(s, _)| *s).max().unwrap_or(HealthStatus::Ok);
            (g.id, status, incidents)
        })
        .filter(|(_, status, _)| *status != HealthStatus::Ok)
        .collect();

    let mut overall = reports.iter().map(|(_, s, _)| *s).max().unwrap_or(HealthStatus::Ok);
    if fallen > 0 {
        overall = HealthStatus::Critical;
    }

    let border = format!("+{}+", "-".repeat(INNER + 2));
    let mut lines = vec![
        border.clone(),
        boxed("Health Monitor Report"),
        format!("+{}+", "=".repeat(INNER + 2)),
        boxed(&format!("Overall Health: {}", health_word(overall))),
    ];
    if fallen > 0 {
        lines.push(border.clone());
        let text = format!(
            "System: {} GPU(s) inaccessible (XID {}: {}). Reboot the node to recover.",
            fallen,
            XID_FALLEN_OFF_BUS,
            xid_description(XID_FALLEN_OFF_BUS)
        );
        for line in wrap(&text, INNER) {
            lines.push(boxed(&line));
        }
    }
    for (id, status, incidents) in &reports {
        lines.push(format!("+{}+{}+", "-".repeat(27), "-".repeat(50)));
        lines.push(two_column(&format!("GPU ID: {}", id), health_word(*status)));
        for (_, message) in incidents {
            for line in wrap(message, 48) {
                lines.push(two_column("", &line));
            }
        }
    }
    lines.push(border);
    Ok(CommandResult::ok(lines.join("\n")))
}

fn group(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    if !parsed.has_flag(&["l", "list"]) {
        return Ok(CommandResult::error(
            "dcgmi group: no action given.\nUse 'dcgmi group -l' to list groups.",
        ));
    }
    let system = ctx.state().system_type;
    let node: &Node = ctx.node()?;
    let gpus: Vec<String> = node.visible_gpus().map(|g| format!("GPU {}", g.id)).collect();
    let switches: Vec<String> = (0..nvswitch_count(system)).map(|i| format!("SWITCH {}", i)).collect();

    let mut lines = vec![
        rule('-'),
        boxed("GROUPS"),
        boxed("2 groups found."),
        rule('='),
        two_column("Groups", ""),
    ];
    for (id, name, entities) in [
        (0, "DCGM_ALL_SUPPORTED_GPUS", gpus),
        (1, "DCGM_ALL_SUPPORTED_NVSWITCHES", switches),
    ] {
        lines.push(two_column(&format!("-> {}", id), ""));
        lines.push(two_column("   -> Group ID", &id.to_string()));
        lines.push(two_column("   -> Group Name", name));
        let text = if entities.is_empty() {
            "None".to_string()
        } else {
            entities.join(", ")
        };
        for (i, line) in wrap(&text, 48).iter().enumerate() {
            lines.push(two_column(if i == 0 { "   -> Entities" } else { "" }, line));
        }
    }
    lines.push(rule('-'));
    Ok(CommandResult::ok(lines.join("\n")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{run, store};
    use sim_core::{Severity, XidError};

    #[test]
    fn test_discovery_lists_gpus() {
        let mut store = store(1, 2);
        let result = run(&simulator(), &mut store, "dcgmi discovery -l");
        assert_eq!(result.exit_code, 0);
        assert!(result.output.starts_with("2 GPUs found."));
        assert!(result.output.contains("6 NvSwitches found."));
    }

    #[test]
    fn test_diag_passes_on_healthy_node() {
        let mut store = store(1, 2);
        let result = run(&simulator(), &mut store, "dcgmi diag -r 3");
        assert_eq!(result.exit_code, 0, "{}", result.output);
        assert!(result.output.contains("Successfully ran diagnostic"));
        assert!(result.output.contains("Targeted Power"));
        assert!(!result.output.contains("Fail"));
    }

    #[test]
    fn test_diag_levels() {
        let mut store = store(1, 1);
        let short = run(&simulator(), &mut store, "dcgmi diag -r 1");
        assert!(!short.output.contains("PCIe"));
        let medium = run(&simulator(), &mut store, "dcgmi diag -r medium");
        assert!(medium.output.contains("PCIe"));
        assert!(!medium.output.contains("Targeted Stress"));
    }

    #[test]
    fn test_diag_reports_fallen_gpu_as_inaccessible() {
        let mut store = store(1, 2);
        let now = store.now();
        store.state_mut().nodes[0].gpus[0]
            .xid_errors
            .push(XidError::new(79, now, Severity::Critical));
        let result = run(&simulator(), &mut store, "dcgmi diag -r 1 -i 0");
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("inaccessible"));
    }

    #[test]
    fn test_diag_fails_on_double_bit_ecc() {
        let mut store = store(1, 2);
        store.state_mut().nodes[0].gpus[1].ecc.raise_to(0, 2);
        let result = run(&simulator(), &mut store, "dcgmi diag -r 2");
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("Fail - GPU: 1"));
    }

    #[test]
    fn test_diag_requires_level() {
        let mut store = store(1, 1);
        assert_eq!(run(&simulator(), &mut store, "dcgmi diag").exit_code, 1);
        assert_eq!(run(&simulator(), &mut store, "dcgmi diag -r 9").exit_code, 1);
    }

    #[test]
    fn test_health_check() {
        let mut store = store(1, 2);
        let healthy = run(&simulator(), &mut store, "dcgmi health -c");
        assert!(healthy.output.contains("Overall Health: Healthy"));

        store.state_mut().nodes[0].gpus[1].temperature = 85;
        let warm = run(&simulator(), &mut store, "dcgmi health -c");
        assert!(warm.output.contains("Overall Health: Warning"));
        assert!(warm.output.contains("GPU ID: 1"));
        assert!(warm.output.contains("Thermal"));
    }

    #[test]
    fn test_health_hides_fallen_gpu() {
        let mut store = store(1, 1);
        let now = store.now();
        store.state_mut().nodes[0].gpus[0]
            .xid_errors
            .push(XidError::new(79, now, Severity::Critical));
        let result = run(&simulator(), &mut store, "dcgmi health -c");
        assert!(result.output.contains("Overall Health: Failure"));
        assert!(result.output.contains("inaccessible"));
        assert!(!result.output.contains("GPU ID: 0"));
    }

    #[test]
    fn test_group_list() {
        let mut store = store(1, 2);
        let result = run(&simulator(), &mut store, "dcgmi group -l");
        assert!(result.output.contains("DCGM_ALL_SUPPORTED_GPUS"));
        assert!(result.output.contains("GPU 0, GPU 1"));
    }

    #[test]
    fn test_wrap() {
        assert_eq!(wrap("aa bb cc", 5), vec!["aa bb", "cc"]);
        assert!(wrap("", 5).is_empty());
    }
}
