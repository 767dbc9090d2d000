//! Simulated command-line tools
//!
//! Every tool re-derives its output from the live cluster state on each
//! call, so a fault applied anywhere is visible to every tool's next call.

pub mod dcgmi;
pub mod dmesg;
pub mod ibstat;
pub mod ipmitool;
pub mod lspci;
pub mod nvidia_smi;
pub mod slurm;

use crate::simulator::{CommandResult, Simulator};
use colored::Colorize;
use sim_core::state::{short_bdf, xid_description};
use sim_core::{ClusterState, Node, NodeId, XID_FALLEN_OFF_BUS};
use sim_shell::FuzzyMatcher;

pub(crate) type HandlerResult = sim_core::Result<CommandResult>;

/// Every simulated tool, in help order
pub fn all() -> Vec<Box<dyn Simulator>> {
    vec![
        Box::new(nvidia_smi::simulator()),
        Box::new(dcgmi::simulator()),
        Box::new(slurm::sinfo()),
        Box::new(slurm::squeue()),
        Box::new(slurm::scontrol()),
        Box::new(slurm::sbatch()),
        Box::new(slurm::scancel()),
        Box::new(ipmitool::simulator()),
        Box::new(lspci::simulator()),
        Box::new(dmesg::simulator()),
        Box::new(ibstat::simulator()),
    ]
}

/// Warning printed above GPU listings when GPUs fell off the bus.
///
/// Deliberately names no index, UUID or bus id: the GPU is not enumerable.
pub(crate) fn fallen_banner(node: &Node) -> Option<String> {
    let count = node.fallen_gpus().count();
    if count == 0 {
        return None;
    }
    let subject = if count == 1 {
        "1 GPU is".to_string()
    } else {
        format!("{} GPUs are", count)
    };
    Some(format!(
        "{}\nCheck 'dmesg' for details. The node must be rebooted to recover.",
        format!(
            "WARNING: {} inaccessible and excluded from this listing (XID {}: {}).",
            subject,
            XID_FALLEN_OFF_BUS,
            xid_description(XID_FALLEN_OFF_BUS)
        )
        .yellow()
        .bold()
    ))
}

/// `"\nDid you mean ...?"`, or an empty string when nothing is close
pub(crate) fn suggestion(matcher: &FuzzyMatcher, input: &str, candidates: &[&str]) -> String {
    matcher
        .closest(input, candidates.iter().copied())
        .message()
        .map(|m| format!("\n{}", m))
        .unwrap_or_default()
}

/// Kernel-style PCI address: `00000000:07:00.0` becomes `0000:07:00.0`
pub(crate) fn kernel_pci(address: &str) -> String {
    format!("0000:{}", short_bdf(address))
}

/// Parse `0`, `0,2` or `0-3` into GPU indices
pub(crate) fn parse_index_list(spec: &str) -> Option<Vec<u32>> {
    let mut ids = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((a, b)) => {
                let (a, b): (u32, u32) = (a.parse().ok()?, b.parse().ok()?);
                if a > b {
                    return None;
                }
                ids.extend(a..=b);
            }
            None => ids.push(part.parse().ok()?),
        }
    }
    if ids.is_empty() {
        None
    } else {
        Some(ids)
    }
}

/// Ids of pending or running jobs placed on `node`
pub(crate) fn active_jobs_on(state: &ClusterState, node: &NodeId) -> Vec<u32> {
    state
        .jobs
        .iter()
        .filter(|j| j.state.is_active() && j.node.as_ref() == Some(node))
        .map(|j| j.id)
        .collect()
}
