//! The command session engine
//!
//! An [`Engine`] owns everything one training session needs: the live
//! cluster store, the snapshot manager, the fuzzy matcher and one registered
//! simulator per tool. A command line is split on pipes, its first segment
//! parsed and dispatched, and the result threaded through the remaining pipe
//! filters. Session builtins (`help`, `hostname`, `ssh`, `clear`) are handled
//! here rather than by a simulator.

use crate::simulator::{CommandResult, SimContext, Simulator};
use crate::tools;
use sim_core::fixtures::demo_cluster;
use sim_core::{ClusterState, SimConfig};
use sim_shell::{apply_pipe_filters, parse, split_pipeline, strip_ansi, FuzzyMatcher, ParsedCommand};
use sim_state::{ClusterStore, FaultInjectionConfig, Scenario, SnapshotManager, StateSnapshot};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, info, warn};

const BUILTINS: [&str; 4] = ["help", "hostname", "ssh", "clear"];

/// What loading a scenario did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioOutcome {
    /// Snapshot taken just before the scenario was applied
    pub snapshot_id: String,
    pub faults_applied: usize,
    pub replaced_cluster: bool,
}

pub struct Engine {
    store: ClusterStore,
    snapshots: SnapshotManager,
    matcher: FuzzyMatcher,
    simulators: BTreeMap<&'static str, Box<dyn Simulator>>,
    current_node: String,
    color: bool,
}

impl Engine {
    /// Build a session around `state` and capture it as the baseline
    pub fn new(state: ClusterState, snapshots: SnapshotManager, mut matcher: FuzzyMatcher) -> Self {
        let mut simulators = BTreeMap::new();
        for sim in tools::all() {
            sim.register_vocabulary(&mut matcher);
            simulators.insert(sim.metadata().name, sim);
        }

        let current_node = state
            .nodes
            .first()
            .map(|n| n.hostname.clone())
            .unwrap_or_default();
        let mut engine = Self {
            store: ClusterStore::new(state),
            snapshots,
            matcher,
            simulators,
            current_node,
            color: true,
        };
        engine.snapshots.create_baseline_snapshot(engine.store.state());
        info!(
            "Session started on {} with {} tools",
            engine.current_node,
            engine.simulators.len()
        );
        engine
    }

    /// Build the demo cluster and snapshot store described by `config`
    pub fn from_config(config: &SimConfig) -> sim_state::Result<Self> {
        config.validate()?;
        let snapshots = match &config.snapshots.storage_path {
            Some(path) => SnapshotManager::with_storage(path, config.snapshots.max_snapshots)?,
            None => SnapshotManager::new(config.snapshots.max_snapshots),
        };
        let mut engine = Self::new(
            demo_cluster(&config.cluster),
            snapshots,
            FuzzyMatcher::new(config.matcher.max_distance),
        );
        engine.color = config.output.color;
        Ok(engine)
    }

    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    pub fn store(&self) -> &ClusterStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ClusterStore {
        &mut self.store
    }

    pub fn state(&self) -> &ClusterState {
        self.store.state()
    }

    pub fn current_node(&self) -> &str {
        &self.current_node
    }

    /// Shell prompt for the current node
    pub fn prompt(&self) -> String {
        format!("root@{}:~# ", self.current_node)
    }

    /// Names of every registered tool
    pub fn tool_names(&self) -> Vec<&'static str> {
        self.simulators.keys().copied().collect()
    }

    /// Run one command line
    pub fn execute(&mut self, line: &str) -> CommandResult {
        let line = line.trim();
        let segments = split_pipeline(line);
        let first = segments.first().map(String::as_str).unwrap_or_default();
        let parsed = parse(first);
        if parsed.base_command.is_empty() {
            return CommandResult::ok("");
        }
        debug!("Executing '{}'", line);

        let mut result = match parsed.base_command.as_str() {
            "help" => self.help(&parsed),
            "hostname" => CommandResult::ok(self.current_node.clone()),
            "ssh" => self.ssh(&parsed),
            "clear" => CommandResult::ok("\u{1b}[2J\u{1b}[H"),
            name => self.dispatch(name, &parsed),
        };

        if !self.color {
            result.output = strip_ansi(&result.output);
        }
        if segments.len() > 1 && result.is_success() {
            result.output = apply_pipe_filters(&strip_ansi(&result.output), line);
        }
        result
    }

    fn dispatch(&mut self, name: &str, parsed: &ParsedCommand) -> CommandResult {
        let Some(sim) = self.simulators.get(name) else {
            let candidates: Vec<&str> = self
                .simulators
                .keys()
                .copied()
                .chain(BUILTINS)
                .collect();
            let mut output = format!("{}: command not found", name);
            if let Some(hint) = self.matcher.closest(name, candidates).message() {
                output.push('\n');
                output.push_str(&hint);
            }
            output.push_str("\nType 'help' to list the available commands.");
            return CommandResult::error(output);
        };

        let mut ctx = SimContext::new(&mut self.store, &self.matcher, &self.current_node);
        match catch_unwind(AssertUnwindSafe(|| sim.execute(parsed, &mut ctx))) {
            Ok(result) => result,
            Err(_) => {
                warn!("{} panicked while running '{}'", name, parsed.raw);
                CommandResult::error(format!(
                    "{}: internal error while running this command. The session is still usable.",
                    name
                ))
            }
        }
    }

    fn help(&self, parsed: &ParsedCommand) -> CommandResult {
        if let Some(tool) = parsed.operands().next() {
            return match self.simulators.get(tool) {
                Some(sim) => {
                    let mut store = self.store.clone();
                    let mut ctx = SimContext::new(&mut store, &self.matcher, &self.current_node);
                    sim.execute(&parse(&format!("{} --help", tool)), &mut ctx)
                }
                None => CommandResult::error(format!(
                    "help: no help topics match '{}'{}",
                    tool,
                    self.matcher
                        .closest(tool, self.simulators.keys().copied())
                        .message()
                        .map(|m| format!("\n{}", m))
                        .unwrap_or_default()
                )),
            };
        }

        let width = self.simulators.keys().map(|k| k.len()).max().unwrap_or(0);
        let mut lines = vec!["Available tools:".to_string()];
        for (name, sim) in &self.simulators {
            lines.push(format!(
                "  {:<width$}  {}",
                name,
                sim.metadata().description,
                width = width
            ));
        }
        lines.push(String::new());
        lines.push("Session commands:".to_string());
        for (name, text) in [
            ("help [tool]", "Show this list, or a tool's help"),
            ("hostname", "Print the node this shell is on"),
            ("ssh <node>", "Move the shell to another node"),
            ("clear", "Clear the screen"),
        ] {
            lines.push(format!("  {:<width$}  {}", name, text, width = width));
        }
        lines.push(String::new());
        lines.push(
            "Output can be piped through grep, head, tail, wc, sort, uniq, cut, awk and cat."
                .to_string(),
        );
        CommandResult::ok(lines.join("\n"))
    }

    fn ssh(&mut self, parsed: &ParsedCommand) -> CommandResult {
        let Some(target) = parsed.operands().next() else {
            return CommandResult::error("usage: ssh <node>");
        };
        let host = target.rsplit('@').next().unwrap_or(target);
        match self.store.state().node(host) {
            Some(node) => {
                self.current_node = node.hostname.clone();
                info!("Shell moved to {}", self.current_node);
                CommandResult::ok("")
            }
            None => {
                let hosts: Vec<&str> = self
                    .store
                    .state()
                    .nodes
                    .iter()
                    .map(|n| n.hostname.as_str())
                    .collect();
                let mut output = format!(
                    "ssh: Could not resolve hostname {}: Name or service not known",
                    host
                );
                if let Some(hint) = self.matcher.closest(host, hosts.iter().copied()).message() {
                    output.push('\n');
                    output.push_str(&hint);
                }
                CommandResult::error(output)
            }
        }
    }

    /// Advance simulated time; returns the number of deferred events applied
    pub fn tick(&mut self, elapsed_ms: u64) -> usize {
        self.store.advance(elapsed_ms)
    }

    pub fn apply_faults(&mut self, faults: &[FaultInjectionConfig]) -> usize {
        self.store.apply_faults(faults)
    }

    pub fn clear_faults(&mut self) {
        self.store.clear_all_faults();
    }

    /// Snapshot the current state, then apply the scenario
    pub fn load_scenario(&mut self, scenario: &Scenario) -> ScenarioOutcome {
        let snapshot_id = self
            .snapshots
            .snapshot_before_scenario(self.store.state(), &scenario.id);
        let replaced_cluster = match &scenario.initial_cluster_state {
            Some(state) => {
                self.store.replace_state(state.clone());
                self.ensure_current_node();
                true
            }
            None => false,
        };
        let faults_applied = self.store.apply_faults(&scenario.faults);
        info!(
            "Loaded scenario {} ({} of {} faults applied)",
            scenario.id,
            faults_applied,
            scenario.faults.len()
        );
        ScenarioOutcome {
            snapshot_id,
            faults_applied,
            replaced_cluster,
        }
    }

    /// Restore the baseline, or clear every fault when there is none.
    ///
    /// Returns whether the baseline was restored.
    pub fn reset(&mut self) -> bool {
        let restored = self.snapshots.restore_baseline(&mut self.store);
        if !restored {
            self.store.clear_all_faults();
        }
        self.ensure_current_node();
        restored
    }

    pub fn snapshots(&self) -> &[StateSnapshot] {
        self.snapshots.snapshots()
    }

    pub fn create_snapshot(&mut self, name: &str, description: Option<&str>) -> String {
        self.snapshots
            .create_snapshot(self.store.state(), name, description)
    }

    /// Replace the baseline with the current state
    pub fn create_baseline_snapshot(&mut self) -> String {
        self.snapshots.create_baseline_snapshot(self.store.state())
    }

    pub fn restore_snapshot(&mut self, id: &str) -> bool {
        let restored = self.snapshots.restore_snapshot(id, &mut self.store);
        if restored {
            self.ensure_current_node();
        }
        restored
    }

    pub fn restore_baseline(&mut self) -> bool {
        let restored = self.snapshots.restore_baseline(&mut self.store);
        if restored {
            self.ensure_current_node();
        }
        restored
    }

    pub fn delete_snapshot(&mut self, id: &str) -> bool {
        self.snapshots.delete_snapshot(id)
    }

    /// Fall back to the first node when the shell's node no longer exists
    fn ensure_current_node(&mut self) {
        if self.store.state().node(&self.current_node).is_none() {
            self.current_node = self
                .store
                .state()
                .nodes
                .first()
                .map(|n| n.hostname.clone())
                .unwrap_or_default();
        }
    }
}
