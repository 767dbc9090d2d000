//! ibstat

use super::{suggestion, HandlerResult};
use crate::simulator::{CommandResult, FlagMetadata, SimContext, ToolRegistry};
use sim_core::{Hca, HcaPort};
use sim_shell::ParsedCommand;

pub fn simulator() -> ToolRegistry {
    ToolRegistry::new("ibstat", "1.5", "Query basic status of InfiniBand devices")
        .usage("ibstat [-l] [-p] [ca_name] [portnum]")
        .version_flags(&["version", "V"])
        .version_text("ibstat BUILD VERSION: 39.0 Build date: Nov 15 2023")
        .root(show)
        .accept_operands()
        .flag(FlagMetadata::both("l", "list_of_cas", "List all IB devices"))
        .flag(FlagMetadata::both("p", "port_list", "Show port GUIDs"))
}

fn port_block(port: &HcaPort, indent: &str) -> Vec<String> {
    let mut lines = vec![format!("{}Port {}:", indent, port.port)];
    let rows = [
        ("State", port.state.to_string()),
        ("Physical state", port.physical_state.to_string()),
        ("Rate", port.rate.to_string()),
        ("Base lid", port.lid.to_string()),
        ("LMC", "0".to_string()),
        ("SM lid", port.sm_lid.to_string()),
        ("Capability mask", "0xa651e848".to_string()),
        ("Port GUID", port.port_guid.clone()),
        ("Link layer", port.link_layer.clone()),
    ];
    lines.extend(
        rows.iter()
            .map(|(key, value)| format!("{}\t{}: {}", indent, key, value)),
    );
    lines
}

fn ca_block(hca: &Hca) -> Vec<String> {
    let mut lines = vec![
        format!("CA '{}'", hca.ca_name),
        format!("\tCA type: {}", hca.ca_type),
        format!("\tNumber of ports: {}", hca.ports.len()),
        format!("\tFirmware version: {}", hca.firmware_version),
        "\tHardware version: 0".to_string(),
        format!("\tNode GUID: {}", hca.node_guid),
        format!("\tSystem image GUID: {}", hca.node_guid),
    ];
    for port in &hca.ports {
        lines.extend(port_block(port, "\t"));
    }
    lines
}

fn show(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    // `-l mlx5_0` binds the name as the flag's value
    let mut operands: Vec<&str> = parsed
        .flag_value(&["l", "list_of_cas"])
        .into_iter()
        .chain(parsed.flag_value(&["p", "port_list"]))
        .chain(parsed.operands())
        .collect();
    let port_arg = if operands.len() > 1 { Some(operands.remove(1)) } else { None };
    let ca_arg = operands.first().copied();

    let node = ctx.node()?;
    let names: Vec<&str> = node.hcas.iter().map(|h| h.ca_name.as_str()).collect();
    let selected: Vec<&Hca> = match ca_arg {
        Some(name) => match node.hcas.iter().find(|h| h.ca_name == name) {
            Some(hca) => vec![hca],
            None => {
                return Ok(CommandResult::error(format!(
                    "ibpanic: [1342] main: stat of IB device '{}' failed: No such file or directory{}",
                    name,
                    suggestion(ctx.matcher, name, &names)
                )))
            }
        },
        None => node.hcas.iter().collect(),
    };

    if parsed.has_flag(&["l", "list_of_cas"]) {
        let names: Vec<&str> = selected.iter().map(|h| h.ca_name.as_str()).collect();
        return Ok(CommandResult::ok(names.join("\n")));
    }
    if parsed.has_flag(&["p", "port_list"]) {
        let guids: Vec<&str> = selected
            .iter()
            .flat_map(|h| h.ports.iter().map(|p| p.port_guid.as_str()))
            .collect();
        return Ok(CommandResult::ok(guids.join("\n")));
    }

    if let (Some(raw), [hca]) = (port_arg, selected.as_slice()) {
        let port = raw
            .parse::<u32>()
            .ok()
            .and_then(|n| hca.ports.iter().find(|p| p.port == n));
        return Ok(match port {
            Some(port) => CommandResult::ok(port_block(port, "").join("\n")),
            None => CommandResult::error(format!(
                "ibpanic: [1342] main: '{}' port {} doesn't exist",
                hca.ca_name,
                raw
            )),
        });
    }

    let blocks: Vec<String> = selected.iter().map(|h| ca_block(h).join("\n")).collect();
    Ok(CommandResult::ok(blocks.join("\n")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{run, store};
    use sim_core::{PhysicalState, PortState};

    #[test]
    fn test_lists_every_ca() {
        let mut store = store(1, 8);
        let result = run(&simulator(), &mut store, "ibstat");
        assert_eq!(result.output.matches("CA '").count(), 4);
        assert!(result.output.contains("\t\tState: Active"));
        assert!(result.output.contains("\t\tRate: 200"));
    }

    #[test]
    fn test_ca_names_and_guids() {
        let mut store = store(1, 8);
        let names = run(&simulator(), &mut store, "ibstat -l");
        assert_eq!(names.output, "mlx5_0\nmlx5_1\nmlx5_2\nmlx5_3");

        let guids = run(&simulator(), &mut store, "ibstat -p mlx5_1");
        assert_eq!(guids.output.lines().count(), 1);
        assert!(guids.output.starts_with("0x"));
    }

    #[test]
    fn test_single_port_reflects_link_down() {
        let mut store = store(1, 8);
        {
            let port = &mut store.state_mut().nodes[0].hcas[2].ports[0];
            port.state = PortState::Down;
            port.physical_state = PhysicalState::Disabled;
        }
        let result = run(&simulator(), &mut store, "ibstat mlx5_2 1");
        assert!(result.output.starts_with("Port 1:"));
        assert!(result.output.contains("\tState: Down"));
        assert!(result.output.contains("\tPhysical state: Disabled"));
    }

    #[test]
    fn test_unknown_ca_and_port() {
        let mut store = store(1, 8);
        let ca = run(&simulator(), &mut store, "ibstat mlx5_9");
        assert_eq!(ca.exit_code, 1);
        assert!(ca.output.contains("'mlx5_9'"));

        let port = run(&simulator(), &mut store, "ibstat mlx5_0 2");
        assert_eq!(port.exit_code, 1);
    }
}
