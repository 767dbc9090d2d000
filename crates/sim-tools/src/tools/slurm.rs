//! Slurm client commands: sinfo, squeue, scontrol, sbatch and scancel
//!
//! Job placement goes through [`ClusterState::start_job`], so allocating a
//! job updates the same GPU utilization fields nvidia-smi and dcgmi read.

use super::{active_jobs_on, suggestion, HandlerResult};
use crate::simulator::{CommandMetadata, CommandResult, FlagMetadata, SimContext, ToolRegistry};
use chrono::{DateTime, Utc};
use sim_core::{ClusterState, Job, JobState, Node, NodeId, SchedulerState};
use sim_shell::ParsedCommand;
use sim_state::{StateEvent, JOB_START_DELAY_MS};
use std::collections::HashSet;
use tracing::info;

const SLURM_VERSION: &str = "23.02.7";
const DEFAULT_USER: &str = "root";
const CPUS_PER_GPU: u32 = 16;

fn slurm_tool(name: &'static str, description: &'static str) -> ToolRegistry {
    ToolRegistry::new(name, SLURM_VERSION, description)
        .version_flags(&["version", "V"])
        .version_text(format!("slurm {}", SLURM_VERSION))
}

fn stray_operand(tool: &str, parsed: &ParsedCommand) -> Option<CommandResult> {
    parsed.operands().next().map(|op| {
        CommandResult::error(format!(
            "{}: error: unrecognized argument '{}'\nTry \"{} --help\" for more information",
            tool, op, tool
        ))
    })
}

// Hostlists

/// Compress host names into Slurm hostlist syntax: `dgx-[00-02,05]`
pub(crate) fn compress_hostlist<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    let mut groups: Vec<(String, usize, Vec<u32>)> = Vec::new();
    for name in names {
        let digits = name.chars().rev().take_while(|c| c.is_ascii_digit()).count();
        let (prefix, number) = name.split_at(name.len() - digits);
        let Ok(n) = number.parse::<u32>() else {
            groups.push((name.to_string(), 0, Vec::new()));
            continue;
        };
        match groups
            .iter_mut()
            .find(|(p, w, nums)| p == prefix && *w == digits && !nums.is_empty())
        {
            Some((_, _, nums)) => nums.push(n),
            None => groups.push((prefix.to_string(), digits, vec![n])),
        }
    }

    groups
        .into_iter()
        .map(|(prefix, width, mut nums)| {
            if nums.is_empty() {
                return prefix;
            }
            nums.sort_unstable();
            nums.dedup();
            if nums.len() == 1 {
                return format!("{}{:0w$}", prefix, nums[0], w = width);
            }
            let mut ranges = Vec::new();
            let (mut start, mut prev) = (nums[0], nums[0]);
            for &n in &nums[1..] {
                if n != prev + 1 {
                    ranges.push((start, prev));
                    start = n;
                }
                prev = n;
            }
            ranges.push((start, prev));
            let body: Vec<String> = ranges
                .iter()
                .map(|&(a, b)| {
                    if a == b {
                        format!("{:0w$}", a, w = width)
                    } else {
                        format!("{:0w$}-{:0w$}", a, b, w = width)
                    }
                })
                .collect();
            format!("{}[{}]", prefix, body.join(","))
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Most host names a single hostlist expression may expand to
const MAX_HOSTLIST_NAMES: usize = 4096;

/// Expand Slurm hostlist syntax into individual host names.
///
/// Returns `None` if the expression names more than [`MAX_HOSTLIST_NAMES`] hosts.
pub(crate) fn expand_hostlist(list: &str) -> Option<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for c in list.chars() {
        match c {
            '[' => {
                depth += 1;
                current.push(c);
            }
            ']' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    let mut names = Vec::new();
    for part in parts.into_iter().filter(|p| !p.is_empty()) {
        let (Some(open), Some(close)) = (part.find('['), part.rfind(']')) else {
            names.push(part);
            continue;
        };
        if close < open {
            names.push(part);
            continue;
        }
        let (prefix, suffix) = (&part[..open], &part[close + 1..]);
        for item in part[open + 1..close].split(',') {
            let range = item
                .split_once('-')
                .and_then(|(a, b)| Some((a.len(), a.parse::<u32>().ok()?, b.parse::<u32>().ok()?)));
            match range {
                Some((width, a, b)) => {
                    let count = if b >= a { (b - a) as usize + 1 } else { 0 };
                    if names.len() + count > MAX_HOSTLIST_NAMES {
                        return None;
                    }
                    for n in a..=b {
                        names.push(format!("{}{:0w$}{}", prefix, n, suffix, w = width));
                    }
                }
                None => names.push(format!("{}{}{}", prefix, item, suffix)),
            }
        }
    }
    (names.len() <= MAX_HOSTLIST_NAMES).then_some(names)
}

fn hostlist_too_large(list: &str) -> CommandResult {
    CommandResult::error(format!(
        "scontrol: error: Hostlist {} names more than {} nodes",
        list, MAX_HOSTLIST_NAMES
    ))
}

// Time formatting

fn format_elapsed(secs: i64) -> String {
    let secs = secs.max(0);
    let (days, hours, minutes, seconds) = (secs / 86_400, secs % 86_400 / 3600, secs % 3600 / 60, secs % 60);
    if days > 0 {
        format!("{}-{:02}:{:02}:{:02}", days, hours, minutes, seconds)
    } else if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

fn format_limit(minutes: Option<u32>) -> String {
    let Some(minutes) = minutes else {
        return "UNLIMITED".to_string();
    };
    let (days, hours, mins) = (minutes / 1440, minutes % 1440 / 60, minutes % 60);
    if days > 0 {
        format!("{}-{:02}:{:02}:00", days, hours, mins)
    } else {
        format!("{:02}:{:02}:00", hours, mins)
    }
}

/// Parse a `--time` value into minutes.
///
/// Accepts `M`, `M:S`, `H:M:S`, `D-H`, `D-H:M` and `D-H:M:S`; seconds round up.
/// Values that do not fit in `u32` minutes are rejected.
pub(crate) fn parse_time_limit(raw: &str) -> Option<u32> {
    let (days, rest) = match raw.split_once('-') {
        Some((d, rest)) => (Some(d.parse::<u64>().ok()?), rest),
        None => (None, raw),
    };
    let parts: Vec<u64> = rest
        .split(':')
        .map(|p| p.parse::<u32>().ok().map(u64::from))
        .collect::<Option<Vec<u64>>>()?;
    let round = |s: u64| u64::from(s > 0);
    let minutes = match (days, parts.as_slice()) {
        (Some(_), [h]) => h * 60,
        (Some(_), [h, m]) => h * 60 + m,
        (Some(_), [h, m, s]) => h * 60 + m + round(*s),
        (None, [m]) => *m,
        (None, [m, s]) => m + round(*s),
        (None, [h, m, s]) => h * 60 + m + round(*s),
        _ => return None,
    };
    let total = days.unwrap_or(0).checked_mul(1440)?.checked_add(minutes)?;
    u32::try_from(total).ok()
}

fn iso(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S").to_string()
}

fn default_partition(state: &ClusterState) -> &str {
    state.nodes.first().map_or("batch", |n| n.partition.as_str())
}

// sinfo

pub fn sinfo() -> ToolRegistry {
    slurm_tool("sinfo", "View information about Slurm nodes and partitions")
        .usage("sinfo [-N] [-l] [-R] [-p PARTITION] [-h]")
        .help_flags(&["help"])
        .root(sinfo_root)
        .accept_operands()
        .flag(FlagMetadata::both("N", "Node", "Print information in a node-oriented format"))
        .flag(FlagMetadata::both("l", "long", "Print more detailed information"))
        .flag(FlagMetadata::both("R", "list-reasons", "List reasons nodes are down or drained"))
        .flag(FlagMetadata::both("p", "partition", "Only report on this partition").takes("PARTITION"))
        .flag(FlagMetadata::both("h", "noheader", "Do not print a header"))
}

fn sinfo_root(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    if let Some(result) = stray_operand("sinfo", parsed) {
        return Ok(result);
    }
    let now = ctx.now();
    let state = ctx.state();
    let default = default_partition(state);
    let filter = parsed.flag_value(&["p", "partition"]);
    let nodes: Vec<&Node> = state
        .nodes
        .iter()
        .filter(|n| filter.map_or(true, |p| n.partition == p))
        .collect();
    let header = !parsed.has_flag(&["h", "noheader"]);
    let long = parsed.has_flag(&["l", "long"]);

    let mut lines = Vec::new();
    if long {
        lines.push(now.format("%a %b %e %H:%M:%S %Y").to_string());
    }

    if parsed.has_flag(&["R", "list-reasons"]) {
        if header {
            lines.push(format!("{:<20} {:<9} {:<19} {}", "REASON", "USER", "TIMESTAMP", "NODELIST"));
        }
        let mut groups: Vec<(&str, String, Vec<&str>)> = Vec::new();
        for node in nodes.iter().filter(|n| n.scheduler_reason.is_some()) {
            let reason = node.scheduler_reason.as_deref().unwrap_or_default();
            let stamp = node.reason_set_at.map(iso).unwrap_or_else(|| "Unknown".to_string());
            match groups.iter_mut().find(|(r, s, _)| *r == reason && *s == stamp) {
                Some((_, _, hosts)) => hosts.push(&node.hostname),
                None => groups.push((reason, stamp, vec![node.hostname.as_str()])),
            }
        }
        for (reason, stamp, hosts) in groups {
            lines.push(format!(
                "{:<20} {:<9} {:<19} {}",
                truncate(reason, 20),
                DEFAULT_USER,
                stamp,
                compress_hostlist(hosts)
            ));
        }
        return Ok(CommandResult::ok(lines.join("\n")));
    }

    let partition_label = |node: &Node| {
        if node.partition == default {
            format!("{}*", node.partition)
        } else {
            node.partition.clone()
        }
    };
    let state_label = |node: &Node| {
        if long {
            node.scheduler_state.long_name()
        } else {
            node.scheduler_state.short_name()
        }
    };

    if parsed.has_flag(&["N", "Node"]) {
        if long {
            if header {
                lines.push(format!(
                    "{:<10} {:>5} {:>9} {:>11} {:>4} {:>8} {:>7} {:>8} {:>6} {:>8} {}",
                    "NODELIST", "NODES", "PARTITION", "STATE", "CPUS", "S:C:T", "MEMORY", "TMP_DISK", "WEIGHT", "AVAIL_FE", "REASON"
                ));
            }
            for node in &nodes {
                lines.push(format!(
                    "{:<10} {:>5} {:>9} {:>11} {:>4} {:>8} {:>7} {:>8} {:>6} {:>8} {}",
                    node.hostname,
                    1,
                    partition_label(node),
                    state_label(node),
                    node.cpu_count,
                    format!("2:{}:2", node.cpu_count / 4),
                    node.ram_total_gb * 1000,
                    0,
                    1,
                    "(null)",
                    node.scheduler_reason.as_deref().unwrap_or("none")
                ));
            }
        } else {
            if header {
                lines.push(format!("{:<10} {:>5} {:>9} {}", "NODELIST", "NODES", "PARTITION", "STATE"));
            }
            for node in &nodes {
                lines.push(format!(
                    "{:<10} {:>5} {:>9} {}",
                    node.hostname,
                    1,
                    partition_label(node),
                    state_label(node)
                ));
            }
        }
        return Ok(CommandResult::ok(lines.join("\n")));
    }

    if header {
        lines.push(format!(
            "{:<9} {:>5} {:>10} {:>6} {:>6} {}",
            "PARTITION", "AVAIL", "TIMELIMIT", "NODES", "STATE", "NODELIST"
        ));
    }
    let mut groups: Vec<(String, &str, Vec<&str>)> = Vec::new();
    for node in &nodes {
        let (partition, state) = (partition_label(node), state_label(node));
        match groups.iter_mut().find(|(p, s, _)| *p == partition && *s == state) {
            Some((_, _, hosts)) => hosts.push(&node.hostname),
            None => groups.push((partition, state, vec![node.hostname.as_str()])),
        }
    }
    for (partition, state, hosts) in groups {
        lines.push(format!(
            "{:<9} {:>5} {:>10} {:>6} {:>6} {}",
            partition,
            "up",
            "infinite",
            hosts.len(),
            state,
            compress_hostlist(hosts)
        ));
    }
    Ok(CommandResult::ok(lines.join("\n")))
}

fn truncate(text: &str, width: usize) -> String {
    text.chars().take(width).collect()
}

// squeue

pub fn squeue() -> ToolRegistry {
    slurm_tool("squeue", "View information about jobs in the Slurm queue")
        .usage("squeue [-u USER] [-j JOBID] [-h]")
        .help_flags(&["help"])
        .root(squeue_root)
        .accept_operands()
        .flag(FlagMetadata::both("u", "user", "Only show jobs of this user").takes("USER"))
        .flag(FlagMetadata::both("j", "jobs", "Only show these job ids").takes("JOBIDS"))
        .flag(FlagMetadata::both("h", "noheader", "Do not print a header"))
}

fn squeue_root(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    if let Some(result) = stray_operand("squeue", parsed) {
        return Ok(result);
    }
    let ids: Option<Vec<u32>> = match parsed.flag_value(&["j", "jobs"]) {
        Some(list) => match list.split(',').map(|id| id.trim().parse().ok()).collect() {
            Some(ids) => Some(ids),
            None => {
                return Ok(CommandResult::error(format!(
                    "squeue: error: Invalid job id: {}",
                    list
                )))
            }
        },
        None => None,
    };
    let user = parsed.flag_value(&["u", "user"]);
    let now = ctx.now();
    let state = ctx.state();

    let mut lines = Vec::new();
    if !parsed.has_flag(&["h", "noheader"]) {
        lines.push(format!(
            "{:>18} {:>9} {:>8} {:>8} {:>2} {:>10} {:>6} {}",
            "JOBID", "PARTITION", "NAME", "USER", "ST", "TIME", "NODES", "NODELIST(REASON)"
        ));
    }
    let jobs = state
        .jobs
        .iter()
        .filter(|j| j.state.is_active())
        .filter(|j| user.map_or(true, |u| j.user == u))
        .filter(|j| ids.as_ref().map_or(true, |ids| ids.contains(&j.id)));
    for job in jobs {
        let elapsed = job.start_time.map_or(0, |t| (now - t).num_seconds());
        let location = match (&job.node, &job.reason) {
            (Some(node), _) if job.state == JobState::Running => node.to_string(),
            (_, Some(reason)) => format!("({})", reason),
            _ => "(None)".to_string(),
        };
        lines.push(format!(
            "{:>18} {:>9} {:>8} {:>8} {:>2} {:>10} {:>6} {}",
            job.id,
            job.partition,
            truncate(&job.name, 8),
            truncate(&job.user, 8),
            job.state.code(),
            format_elapsed(elapsed),
            1,
            location
        ));
    }
    Ok(CommandResult::ok(lines.join("\n")))
}

// scontrol

pub fn scontrol() -> ToolRegistry {
    slurm_tool("scontrol", "View or modify Slurm configuration and state")
        .usage("scontrol <command> [entity] [options]")
        .command(
            CommandMetadata::new("show", "Display the state of a node, job or partition")
                .usage("scontrol show node [NAME] | job [JOBID] | partition [NAME]")
                .example("scontrol show node dgx-00")
                .example("scontrol show job 1000"),
            scontrol_show,
        )
        .command(
            CommandMetadata::new("update", "Change the state of a node")
                .usage("scontrol update NodeName=<nodes> State=<DRAIN|DOWN|RESUME|IDLE|UNDRAIN> [Reason=<text>]")
                .example("scontrol update NodeName=dgx-00 State=DRAIN Reason=\"GPU fault\"")
                .example("scontrol update NodeName=dgx-00 State=RESUME"),
            scontrol_update,
        )
}

fn scontrol_show(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    let operands: Vec<&str> = parsed.operands().skip(1).collect();
    let Some(entity) = operands.first() else {
        return Ok(CommandResult::error(
            "scontrol: error: Invalid entity for \"show\" command.\nUse 'scontrol show node', 'scontrol show job' or 'scontrol show partition'.",
        ));
    };
    let target = operands.get(1).copied();
    let now = ctx.now();
    let state = ctx.state();

    match entity.to_lowercase().as_str() {
        "node" | "nodes" => {
            let names: Vec<String> = match target {
                Some(list) => match expand_hostlist(list) {
                    Some(names) => names,
                    None => return Ok(hostlist_too_large(list)),
                },
                None => state.nodes.iter().map(|n| n.hostname.clone()).collect(),
            };
            let mut blocks = Vec::new();
            for name in &names {
                match state.node(name) {
                    Some(node) => blocks.push(describe_node(node, state)),
                    None => return Ok(CommandResult::error(format!("Node {} not found", name))),
                }
            }
            Ok(CommandResult::ok(blocks.join("\n\n")))
        }
        "job" | "jobs" => {
            let jobs: Vec<&Job> = match target {
                Some(raw) => match raw.parse::<u32>().ok().and_then(|id| state.job(id)) {
                    Some(job) => vec![job],
                    None => {
                        return Ok(CommandResult::error(
                            "slurm_load_jobs error: Invalid job id specified",
                        ))
                    }
                },
                None => state.jobs.iter().collect(),
            };
            if jobs.is_empty() {
                return Ok(CommandResult::ok("No jobs in the system"));
            }
            let blocks: Vec<String> = jobs.iter().map(|j| describe_job(j, now)).collect();
            Ok(CommandResult::ok(blocks.join("\n\n")))
        }
        "partition" | "partitions" => {
            let mut partitions: Vec<&str> = state.nodes.iter().map(|n| n.partition.as_str()).collect();
            partitions.dedup();
            if let Some(name) = target {
                partitions.retain(|p| *p == name);
                if partitions.is_empty() {
                    return Ok(CommandResult::error(format!("Partition {} not found", name)));
                }
            }
            let default = default_partition(state);
            let blocks: Vec<String> = partitions
                .iter()
                .map(|p| describe_partition(state, p, *p == default))
                .collect();
            Ok(CommandResult::ok(blocks.join("\n\n")))
        }
        other => Ok(CommandResult::error(format!(
            "scontrol: error: Invalid entity {} for \"show\" command{}",
            other,
            suggestion(ctx.matcher, other, &["node", "job", "partition"])
        ))),
    }
}

fn describe_node(node: &Node, state: &ClusterState) -> String {
    let allocated = node.gpus.iter().filter(|g| g.allocated_job.is_some()).count() as u32;
    let mut lines = vec![
        format!("NodeName={} Arch=x86_64 CoresPerSocket={}", node.hostname, node.cpu_count / 4),
        format!(
            "   CPUAlloc={} CPUEfctv={} CPUTot={} CPULoad={:.2}",
            (allocated * CPUS_PER_GPU).min(node.cpu_count),
            node.cpu_count,
            node.cpu_count,
            f64::from(allocated) * 1.5
        ),
        "   AvailableFeatures=(null)".to_string(),
        "   ActiveFeatures=(null)".to_string(),
        format!("   Gres=gpu:{}", node.gpus.len()),
        format!("   NodeAddr={} NodeHostName={} Version={}", node.hostname, node.hostname, SLURM_VERSION),
        format!("   OS=Linux {} #43-Ubuntu SMP", node.kernel_version),
        format!(
            "   RealMemory={} AllocMem=0 FreeMem={} Sockets=2 Boards=1",
            node.ram_total_gb * 1000,
            (node.ram_total_gb - node.ram_used_gb) * 1000
        ),
        format!(
            "   State={} ThreadsPerCore=2 TmpDisk=0 Weight=1 Owner=N/A MCS_label=N/A",
            node.scheduler_state.scontrol_name()
        ),
        format!("   Partitions={}", node.partition),
        format!("   BootTime={} SlurmdStartTime={}", iso(state.boot_time), iso(state.boot_time)),
        format!(
            "   CfgTRES=cpu={},mem={}G,billing={},gres/gpu={}",
            node.cpu_count,
            node.ram_total_gb,
            node.cpu_count,
            node.gpus.len()
        ),
        if allocated > 0 {
            format!("   AllocTRES=cpu={},gres/gpu={}", allocated * CPUS_PER_GPU, allocated)
        } else {
            "   AllocTRES=".to_string()
        },
    ];
    if let Some(reason) = &node.scheduler_reason {
        let stamp = node.reason_set_at.map(iso).unwrap_or_else(|| "Unknown".to_string());
        lines.push(format!("   Reason={} [{}@{}]", reason, DEFAULT_USER, stamp));
    }
    lines.join("\n")
}

fn describe_job(job: &Job, now: DateTime<Utc>) -> String {
    let run_time = match (job.start_time, job.end_time) {
        (Some(start), Some(end)) => (end - start).num_seconds(),
        (Some(start), None) => (now - start).num_seconds(),
        _ => 0,
    };
    let run_time = {
        let s = run_time.max(0);
        format!("{:02}:{:02}:{:02}", s / 3600, s % 3600 / 60, s % 60)
    };
    let optional = |t: Option<DateTime<Utc>>| t.map(iso).unwrap_or_else(|| "Unknown".to_string());
    let node = job.node.as_ref().map(NodeId::to_string);
    [
        format!("JobId={} JobName={}", job.id, job.name),
        format!("   UserId={}(0) GroupId={}(0) MCS_label=N/A", job.user, job.user),
        format!("   Priority=4294901759 Nice=0 Account={} QOS=normal", job.user),
        format!(
            "   JobState={} Reason={} Dependency=(null)",
            job.state,
            job.reason.as_deref().unwrap_or("None")
        ),
        format!("   RunTime={} TimeLimit={} TimeMin=N/A", run_time, format_limit(job.time_limit_minutes)),
        format!("   SubmitTime={} EligibleTime={}", iso(job.submit_time), iso(job.submit_time)),
        format!("   StartTime={} EndTime={}", optional(job.start_time), optional(job.end_time)),
        format!("   Partition={} AllocNode:Sid={}:4242", job.partition, node.as_deref().unwrap_or("(null)")),
        format!(
            "   ReqNodeList={} ExcNodeList=(null)",
            job.requested_node.as_ref().map_or("(null)".to_string(), NodeId::to_string)
        ),
        format!("   NodeList={}", node.as_deref().unwrap_or("(null)")),
        format!(
            "   NumNodes=1 NumCPUs={} NumTasks=1 CPUs/Task=1",
            (job.gpus_requested * CPUS_PER_GPU).max(1)
        ),
        format!(
            "   TRES=cpu={},node=1,billing={},gres/gpu={}",
            (job.gpus_requested * CPUS_PER_GPU).max(1),
            (job.gpus_requested * CPUS_PER_GPU).max(1),
            job.gpus_requested
        ),
        format!("   Command=/root/{}", job.name),
        "   WorkDir=/root".to_string(),
    ]
    .join("\n")
}

fn describe_partition(state: &ClusterState, partition: &str, default: bool) -> String {
    let hosts: Vec<&str> = state
        .nodes
        .iter()
        .filter(|n| n.partition == partition)
        .map(|n| n.hostname.as_str())
        .collect();
    let cpus: u32 = state
        .nodes
        .iter()
        .filter(|n| n.partition == partition)
        .map(|n| n.cpu_count)
        .sum();
    [
        format!("PartitionName={}", partition),
        format!(
            "   AllowGroups=ALL AllowAccounts=ALL AllowQos=ALL Default={}",
            if default { "YES" } else { "NO" }
        ),
        "   MaxNodes=UNLIMITED MaxTime=UNLIMITED MinNodes=0".to_string(),
        format!("   Nodes={}", compress_hostlist(hosts.iter().copied())),
        "   State=UP".to_string(),
        format!("   TotalCPUs={} TotalNodes={}", cpus, hosts.len()),
    ]
    .join("\n")
}

/// `Key=Value` operands keyed by lower-case key; bare words extend the previous value
fn key_values<'p>(operands: impl Iterator<Item = &'p str>) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    for op in operands {
        match op.split_once('=') {
            Some((key, value)) => pairs.push((key.to_lowercase(), value.to_string())),
            None => {
                if let Some((_, value)) = pairs.last_mut() {
                    value.push(' ');
                    value.push_str(op);
                }
            }
        }
    }
    pairs
}

const NODE_STATES: [&str; 5] = ["DRAIN", "DOWN", "RESUME", "IDLE", "UNDRAIN"];

fn scontrol_update(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    let pairs = key_values(parsed.operands().skip(1));
    let get = |key: &str| pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());

    if get("jobid").is_some() {
        return Ok(CommandResult::error(
            "scontrol: error: Update of job records is not supported.\nUse 'scancel <jobid>' to stop a job.",
        ));
    }
    let Some(names) = get("nodename") else {
        return Ok(CommandResult::error(
            "scontrol: error: No NodeName specified.\nUsage: scontrol update NodeName=<nodes> State=<state> [Reason=<text>]",
        ));
    };
    let Some(requested) = get("state").map(str::to_uppercase) else {
        return Ok(CommandResult::error(
            "scontrol: error: No State specified.\nValid states: DRAIN, DOWN, RESUME, IDLE, UNDRAIN",
        ));
    };
    if !NODE_STATES.contains(&requested.as_str()) {
        return Ok(CommandResult::error(format!(
            "scontrol: error: Invalid node state specified: {}{}\nValid states: {}",
            requested,
            suggestion(ctx.matcher, &requested, &NODE_STATES),
            NODE_STATES.join(", ")
        )));
    }
    let reason = get("reason").map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
    if matches!(requested.as_str(), "DRAIN" | "DOWN") && reason.is_none() {
        return Ok(CommandResult::error(
            "You must specify a reason when DOWNING or DRAINING a node. Request denied\n\
             Example: scontrol update NodeName=dgx-00 State=DRAIN Reason=\"GPU fault\"",
        ));
    }

    let Some(hosts) = expand_hostlist(names) else {
        return Ok(hostlist_too_large(names));
    };
    let known: Vec<&str> = ctx.state().nodes.iter().map(|n| n.hostname.as_str()).collect();
    if let Some(bad) = hosts.iter().find(|h| ctx.state().node(h).is_none()) {
        return Ok(CommandResult::error(format!(
            "scontrol: error: Invalid node name specified: {}{}",
            bad,
            suggestion(ctx.matcher, bad, &known)
        )));
    }

    let now = ctx.now();
    for host in &hosts {
        if requested == "DOWN" {
            let running = match ctx.state().node(host) {
                Some(node) => active_jobs_on(ctx.state(), &node.id),
                None => Vec::new(),
            };
            for job_id in running {
                ctx.state_mut().finish_job(job_id, JobState::Cancelled, now)?;
            }
        }
        let Some(node) = ctx.state_mut().node_mut(host) else { continue };
        match requested.as_str() {
            "DRAIN" => {
                node.scheduler_state = SchedulerState::Drained;
                node.scheduler_reason = reason.clone();
                node.reason_set_at = Some(now);
            }
            "DOWN" => {
                node.scheduler_state = SchedulerState::Down;
                node.scheduler_reason = reason.clone();
                node.reason_set_at = Some(now);
            }
            _ => {
                if !node.scheduler_state.accepts_jobs() {
                    node.scheduler_state = SchedulerState::Idle;
                }
                node.scheduler_reason = None;
                node.reason_set_at = None;
            }
        }
        node.refresh_scheduler_state();
        info!(
            "node {} set to {} ({})",
            host,
            node.scheduler_state,
            node.scheduler_reason.as_deref().unwrap_or("no reason")
        );
    }
    Ok(CommandResult::ok(""))
}

// sbatch

pub fn sbatch() -> ToolRegistry {
    slurm_tool("sbatch", "Submit a batch script to Slurm")
        .usage("sbatch [-J NAME] [-w NODE] [--gres=gpu:N] [-t TIME] [-p PARTITION] script")
        .root(sbatch_root)
        .accept_operands()
        .flag(FlagMetadata::both("J", "job-name", "Name of the job").takes("NAME"))
        .flag(FlagMetadata::both("w", "nodelist", "Run on this node").takes("NODE"))
        .flag(FlagMetadata::long("gres", "Generic resources, e.g. gpu:4").takes("LIST"))
        .flag(FlagMetadata::both("G", "gpus", "Number of GPUs").takes("N"))
        .flag(FlagMetadata::both("t", "time", "Time limit, e.g. 30, 2:00:00 or 1-00:00:00").takes("TIME"))
        .flag(FlagMetadata::both("p", "partition", "Partition to submit to").takes("PARTITION"))
        .flag(FlagMetadata::both("N", "nodes", "Number of nodes").takes("N"))
        .flag(FlagMetadata::both("n", "ntasks", "Number of tasks").takes("N"))
        .flag(FlagMetadata::both("o", "output", "File for the job's standard output").takes("FILE"))
        .flag(FlagMetadata::long("wrap", "Wrap a command string in a shell script").takes("COMMAND"))
}

fn parse_gres(raw: &str) -> Option<u32> {
    let mut parts = raw.split(':');
    if parts.next()? != "gpu" {
        return None;
    }
    match (parts.next(), parts.next(), parts.next()) {
        (None, _, _) => Some(1),
        (Some(count), None, _) => count.parse().ok(),
        (Some(_kind), Some(count), None) => count.parse().ok(),
        _ => None,
    }
}

fn sbatch_error(message: impl std::fmt::Display) -> CommandResult {
    CommandResult::error(format!(
        "sbatch: error: {}\nsbatch: error: Batch job submission failed",
        message
    ))
}

fn sbatch_root(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    let script = parsed.operands().next();
    let wrap = parsed.flag_value(&["wrap"]);
    if script.is_none() && wrap.is_none() {
        return Ok(CommandResult::error(
            "sbatch: error: No batch script given.\nUsage: sbatch [options] script.sh  or  sbatch --wrap=\"command\"",
        ));
    }
    let name = parsed
        .flag_value(&["J", "job-name"])
        .or_else(|| script.map(|s| s.rsplit('/').next().unwrap_or(s)))
        .unwrap_or("wrap")
        .to_string();

    let gpus = match (parsed.flag_value(&["gres"]), parsed.flag_value(&["G", "gpus"])) {
        (Some(gres), _) => match parse_gres(gres) {
            Some(n) => n,
            None => return Ok(sbatch_error(format!("Invalid generic resource (gres) specification: {}", gres))),
        },
        (None, Some(count)) => match count.parse() {
            Ok(n) => n,
            Err(_) => return Ok(sbatch_error(format!("Invalid --gpus specification: {}", count))),
        },
        (None, None) => 0,
    };
    let time_limit = match parsed.flag_value(&["t", "time"]) {
        Some(raw) if raw.eq_ignore_ascii_case("infinite") || raw.eq_ignore_ascii_case("unlimited") => None,
        Some(raw) => match parse_time_limit(raw) {
            Some(minutes) => Some(minutes),
            None => return Ok(sbatch_error("Invalid time limit specification")),
        },
        None => None,
    };

    let state = ctx.state();
    let partition = parsed
        .flag_value(&["p", "partition"])
        .unwrap_or_else(|| default_partition(state))
        .to_string();
    let candidates: Vec<&Node> = state.nodes.iter().filter(|n| n.partition == partition).collect();
    if candidates.is_empty() {
        return Ok(sbatch_error(format!("invalid partition specified: {}", partition)));
    }
    let requested_node = match parsed.flag_value(&["w", "nodelist"]) {
        Some(host) => match candidates.iter().find(|n| n.hostname == host || n.id.as_str() == host) {
            Some(node) => Some(node.id.clone()),
            None => {
                let known: Vec<&str> = state.nodes.iter().map(|n| n.hostname.as_str()).collect();
                return Ok(sbatch_error(format!(
                    "Invalid node name specified: {}{}",
                    host,
                    suggestion(ctx.matcher, host, &known)
                )));
            }
        },
        None => None,
    };
    let largest = candidates
        .iter()
        .filter(|n| requested_node.as_ref().map_or(true, |r| &n.id == r))
        .map(|n| n.gpus.len() as u32)
        .max()
        .unwrap_or(0);
    if gpus > largest {
        return Ok(sbatch_error(format!(
            "Requested node configuration is not available ({} GPUs requested, at most {} per node)",
            gpus, largest
        )));
    }

    let now = ctx.now();
    let job_id = ctx.state_mut().submit_job(Job {
        id: 0,
        name,
        user: DEFAULT_USER.to_string(),
        partition,
        requested_node,
        node: None,
        gpus_requested: gpus,
        gpu_ids: Vec::new(),
        state: JobState::Pending,
        reason: None,
        submit_time: now,
        start_time: None,
        end_time: None,
        time_limit_minutes: time_limit,
    });
    ctx.store
        .schedule_after(JOB_START_DELAY_MS, StateEvent::JobStart { job_id });
    info!("submitted job {} requesting {} GPU(s)", job_id, gpus);
    Ok(CommandResult::ok(format!("Submitted batch job {}", job_id)))
}

// scancel

pub fn scancel() -> ToolRegistry {
    slurm_tool("scancel", "Signal or cancel Slurm jobs")
        .usage("scancel [-u USER] [jobid...]")
        .root(scancel_root)
        .accept_operands()
        .flag(FlagMetadata::both("u", "user", "Cancel all jobs of this user").takes("USER"))
}

fn scancel_root(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> HandlerResult {
    let mut ids = Vec::new();
    for raw in parsed.operands() {
        match raw.parse::<u32>() {
            Ok(id) => ids.push(id),
            Err(_) => return Ok(CommandResult::error(format!("scancel: error: Invalid job id {}", raw))),
        }
    }
    if let Some(user) = parsed.flag_value(&["u", "user"]) {
        ids.extend(
            ctx.state()
                .jobs
                .iter()
                .filter(|j| j.user == user && j.state.is_active())
                .map(|j| j.id),
        );
    } else if ids.is_empty() {
        return Ok(CommandResult::error(
            "scancel: error: No job identification provided\nUsage: scancel <jobid> or scancel -u <user>",
        ));
    }
    let mut seen = HashSet::new();
    ids.retain(|id| seen.insert(*id));

    let now = ctx.now();
    let mut errors = Vec::new();
    for id in ids {
        match ctx.state().job(id).map(|j| j.state.is_active()) {
            None => errors.push(format!(
                "scancel: error: Kill job error on job id {}: Invalid job id specified",
                id
            )),
            Some(false) => errors.push(format!(
                "scancel: error: Kill job error on job id {}: Job/step already completing or completed",
                id
            )),
            Some(true) => {
                ctx.state_mut().finish_job(id, JobState::Cancelled, now)?;
                info!("cancelled job {}", id);
            }
        }
    }
    Ok(if errors.is_empty() {
        CommandResult::ok("")
    } else {
        CommandResult::error(errors.join("\n"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{run, store};

    #[test]
    fn test_hostlist_compression() {
        assert_eq!(compress_hostlist(["dgx-00", "dgx-01", "dgx-02"]), "dgx-[00-02]");
        assert_eq!(compress_hostlist(["dgx-00", "dgx-02", "dgx-03"]), "dgx-[00,02-03]");
        assert_eq!(compress_hostlist(["dgx-03"]), "dgx-03");
        assert_eq!(compress_hostlist(["login", "dgx-01"]), "login,dgx-01");
    }

    #[test]
    fn test_hostlist_expansion() {
        let expand = |list: &str| expand_hostlist(list).unwrap();
        assert_eq!(expand("dgx-[00-02]"), vec!["dgx-00", "dgx-01", "dgx-02"]);
        assert_eq!(expand("dgx-[00,03],login"), vec!["dgx-00", "dgx-03", "login"]);
        assert_eq!(expand("dgx-07"), vec!["dgx-07"]);
        assert_eq!(expand("dgx-[0-4095]").len(), MAX_HOSTLIST_NAMES);
        assert_eq!(expand_hostlist("dgx-[0-4096]"), None);
        assert_eq!(expand_hostlist("dgx-[0-4000000000]"), None);
    }

    #[test]
    fn test_oversized_hostlist_is_rejected() {
        let mut store = store(2, 8);
        let update = run(
            &scontrol(),
            &mut store,
            "scontrol update NodeName=dgx-[0-4000000000] State=DRAIN Reason=x",
        );
        assert_eq!(update.exit_code, 1);
        assert!(update.output.contains("more than 4096 nodes"));
        assert!(store.state().nodes.iter().all(|n| n.scheduler_reason.is_none()));

        let show = run(&scontrol(), &mut store, "scontrol show node dgx-[0-4000000000]");
        assert_eq!(show.exit_code, 1);
    }

    #[test]
    fn test_time_limits() {
        assert_eq!(parse_time_limit("30"), Some(30));
        assert_eq!(parse_time_limit("30:15"), Some(31));
        assert_eq!(parse_time_limit("2:00:00"), Some(120));
        assert_eq!(parse_time_limit("1-00:00:00"), Some(1440));
        assert_eq!(parse_time_limit("1-2"), Some(1560));
        assert_eq!(parse_time_limit("abc"), None);
        assert_eq!(parse_time_limit("99999999:00:00"), None);
        assert_eq!(parse_time_limit("4000000-00"), None);
        assert_eq!(parse_time_limit("4294967295"), Some(u32::MAX));
        assert_eq!(format_limit(Some(90)), "01:30:00");
        assert_eq!(format_elapsed(75), "1:15");
        assert_eq!(format_elapsed(3_725), "1:02:05");
    }

    #[test]
    fn test_sinfo_partition_summary() {
        let mut store = store(4, 8);
        let result = run(&sinfo(), &mut store, "sinfo");
        let lines: Vec<&str> = result.output.lines().collect();
        assert!(lines[0].starts_with("PARTITION"));
        assert!(lines[1].contains("batch*"));
        assert!(lines[1].contains("idle"));
        assert!(lines[1].ends_with("dgx-[00-03]"));
    }

    #[test]
    fn test_drain_shows_up_in_sinfo() {
        let mut store = store(2, 8);
        let update = run(
            &scontrol(),
            &mut store,
            "scontrol update NodeName=dgx-00 State=DRAIN Reason=\"Maintenance window\"",
        );
        assert_eq!(update.exit_code, 0, "{}", update.output);

        let reasons = run(&sinfo(), &mut store, "sinfo -R");
        assert!(reasons.output.contains("Maintenance window"));
        assert!(reasons.output.contains("dgx-00"));
        assert!(!reasons.output.contains("dgx-01"));

        let summary = run(&sinfo(), &mut store, "sinfo");
        assert!(summary.output.contains("drain"));

        let node = run(&scontrol(), &mut store, "scontrol show node dgx-00");
        assert!(node.output.contains("State=IDLE+DRAIN"));
        assert!(node.output.contains("Reason=Maintenance window"));
    }

    #[test]
    fn test_drain_requires_reason() {
        let mut store = store(1, 8);
        let result = run(&scontrol(), &mut store, "scontrol update NodeName=dgx-00 State=DRAIN");
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("must specify a reason"));
        assert_eq!(store.state().nodes[0].scheduler_state, SchedulerState::Idle);
    }

    #[test]
    fn test_resume_clears_drain() {
        let mut store = store(1, 8);
        run(&scontrol(), &mut store, "scontrol update NodeName=dgx-00 State=DRAIN Reason=test");
        run(&scontrol(), &mut store, "scontrol update nodename=dgx-00 state=resume");
        let node = &store.state().nodes[0];
        assert_eq!(node.scheduler_state, SchedulerState::Idle);
        assert!(node.scheduler_reason.is_none());
    }

    #[test]
    fn test_update_rejects_unknown_node_and_state() {
        let mut store = store(2, 8);
        let node = run(&scontrol(), &mut store, "scontrol update NodeName=dgx-09 State=DRAIN Reason=x");
        assert_eq!(node.exit_code, 1);
        assert!(node.output.contains("Invalid node name"));

        let state = run(&scontrol(), &mut store, "scontrol update NodeName=dgx-00 State=DRIAN Reason=x");
        assert_eq!(state.exit_code, 1);
        assert!(state.output.contains("DRAIN"));
    }

    #[test]
    fn test_job_lifecycle() {
        let mut store = store(1, 8);
        let submitted = run(&sbatch(), &mut store, "sbatch -J train --gres=gpu:2 -t 60 train.sh");
        assert_eq!(submitted.output, "Submitted batch job 1000");

        let pending = run(&squeue(), &mut store, "squeue");
        assert!(pending.output.contains(" PD "));

        store.advance(JOB_START_DELAY_MS);
        let running = run(&squeue(), &mut store, "squeue -u root");
        assert!(running.output.contains("  R "));
        assert!(running.output.contains("dgx-00"));
        assert_eq!(store.state().nodes[0].scheduler_state, SchedulerState::Mixed);

        let job = run(&scontrol(), &mut store, "scontrol show job 1000");
        assert!(job.output.contains("JobState=RUNNING"));
        assert!(job.output.contains("TimeLimit=01:00:00"));

        assert_eq!(run(&scancel(), &mut store, "scancel 1000").exit_code, 0);
        assert_eq!(store.state().nodes[0].scheduler_state, SchedulerState::Idle);
        assert!(store.state().nodes[0].gpus.iter().all(|g| g.allocated_job.is_none()));

        let again = run(&scancel(), &mut store, "scancel 1000");
        assert_eq!(again.exit_code, 1);
        assert!(again.output.contains("already completing or completed"));
    }

    #[test]
    fn test_sbatch_validation() {
        let mut store = store(1, 8);
        assert_eq!(run(&sbatch(), &mut store, "sbatch").exit_code, 1);
        assert_eq!(run(&sbatch(), &mut store, "sbatch --gres=gpu:9 job.sh").exit_code, 1);
        assert_eq!(run(&sbatch(), &mut store, "sbatch --gres=disk:1 job.sh").exit_code, 1);
        assert_eq!(run(&sbatch(), &mut store, "sbatch -w dgx-07 job.sh").exit_code, 1);
        assert_eq!(run(&sbatch(), &mut store, "sbatch -t soon job.sh").exit_code, 1);
        assert!(store.state().jobs.is_empty());
    }

    #[test]
    fn test_sbatch_rejects_time_limit_overflow() {
        let mut store = store(1, 8);
        let result = run(&sbatch(), &mut store, "sbatch -t 99999999:00:00 train.sh");
        assert_eq!(result.exit_code, 1);
        assert!(result.output.starts_with("sbatch: error: Invalid time limit specification"));
        assert!(store.state().jobs.is_empty());
    }

    #[test]
    fn test_scancel_ignores_repeated_ids() {
        let mut store = store(1, 8);
        run(&sbatch(), &mut store, "sbatch train.sh");
        let result = run(&scancel(), &mut store, "scancel 1000 1000");
        assert_eq!(result.exit_code, 0, "{}", result.output);
        assert_eq!(store.state().job(1000).unwrap().state, JobState::Cancelled);
    }

    #[test]
    fn test_squeue_noheader_and_user_filter() {
        let mut store = store(1, 8);
        run(&sbatch(), &mut store, "sbatch job.sh");
        assert_eq!(run(&squeue(), &mut store, "squeue -h -u alice").output, "");
        let result = run(&squeue(), &mut store, "squeue -h");
        assert_eq!(result.output.lines().count(), 1);
        assert!(result.output.contains("job.sh"));
    }
}
