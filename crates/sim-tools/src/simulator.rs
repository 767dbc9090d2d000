//! Simulator contract and registry-based dispatch
//!
//! A simulated tool is a [`ToolRegistry`]: fixed metadata plus a table of
//! name → handler entries built once at construction. The registry owns the
//! behavior every tool shares: help and version interception, unknown
//! subcommand and unknown flag rejection with suggestions, and conversion of
//! handler errors into exit-code-1 results.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sim_core::{ClusterState, Error, Node};
use sim_shell::{FuzzyMatcher, ParsedCommand};
use sim_state::ClusterStore;
use std::collections::BTreeMap;
use tracing::debug;

/// Outcome of running one command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub output: String,
    /// 0 for success or informational output, 1 for any error
    pub exit_code: i32,
}

impl CommandResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code: 0,
        }
    }

    pub fn error(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code: 1,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A flag accepted by a tool or one of its commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlagMetadata {
    /// Single-dash form without the dash, e.g. `i` or `lgip`
    pub short: Option<&'static str>,
    /// Double-dash form without the dashes, e.g. `gpu-reset`
    pub long: Option<&'static str>,
    /// Placeholder for the value, if the flag takes one
    pub value: Option<&'static str>,
    pub description: &'static str,
}

impl FlagMetadata {
    pub fn short(name: &'static str, description: &'static str) -> Self {
        Self {
            short: Some(name),
            long: None,
            value: None,
            description,
        }
    }

    pub fn long(name: &'static str, description: &'static str) -> Self {
        Self {
            short: None,
            long: Some(name),
            value: None,
            description,
        }
    }

    pub fn both(short: &'static str, long: &'static str, description: &'static str) -> Self {
        Self {
            short: Some(short),
            long: Some(long),
            value: None,
            description,
        }
    }

    /// Mark the flag as taking a value
    pub fn takes(mut self, placeholder: &'static str) -> Self {
        self.value = Some(placeholder);
        self
    }

    /// Names as stored in [`ParsedCommand::flags`]
    pub fn names(&self) -> impl Iterator<Item = &'static str> {
        self.short.into_iter().chain(self.long)
    }

    /// Forms a user types: `-i`, `--id`
    pub fn tokens(&self) -> Vec<String> {
        self.short
            .map(|s| format!("-{}", s))
            .into_iter()
            .chain(self.long.map(|l| format!("--{}", l)))
            .collect()
    }

    fn display(&self) -> String {
        let mut text = self.tokens().join(", ");
        if let Some(value) = self.value {
            text.push_str(&format!(" <{}>", value));
        }
        text
    }
}

/// Help metadata of one registered command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandMetadata {
    pub name: &'static str,
    pub description: &'static str,
    pub usage: &'static str,
    pub flags: Vec<FlagMetadata>,
    pub examples: Vec<&'static str>,
}

impl CommandMetadata {
    pub fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            usage: "",
            flags: Vec::new(),
            examples: Vec::new(),
        }
    }

    pub fn usage(mut self, usage: &'static str) -> Self {
        self.usage = usage;
        self
    }

    pub fn flag(mut self, flag: FlagMetadata) -> Self {
        self.flags.push(flag);
        self
    }

    pub fn example(mut self, example: &'static str) -> Self {
        self.examples.push(example);
        self
    }

    fn help(&self) -> String {
        let mut out = format!("Usage: {}\n\n{}\n", self.usage, self.description);
        if !self.flags.is_empty() {
            out.push_str("\nOptions:\n");
            out.push_str(&flag_lines(&self.flags));
        }
        if !self.examples.is_empty() {
            out.push_str("\nExamples:\n");
            for example in &self.examples {
                out.push_str(&format!("  {}\n", example));
            }
        }
        out.trim_end().to_string()
    }
}

/// Descriptive metadata of a tool, used for help generation only
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimulatorMetadata {
    pub name: &'static str,
    pub version: &'static str,
    pub description: &'static str,
    pub usage: &'static str,
    /// Flags accepted without a command
    pub flags: Vec<FlagMetadata>,
    pub commands: Vec<CommandMetadata>,
}

fn flag_lines(flags: &[FlagMetadata]) -> String {
    let rendered: Vec<(String, &str)> = flags.iter().map(|f| (f.display(), f.description)).collect();
    let width = rendered.iter().map(|(d, _)| d.len()).max().unwrap_or(0);
    rendered
        .iter()
        .map(|(d, desc)| format!("  {:<width$}  {}\n", d, desc, width = width))
        .collect()
}

/// Everything a handler may touch while running one command
pub struct SimContext<'a> {
    pub store: &'a mut ClusterStore,
    pub matcher: &'a FuzzyMatcher,
    /// Hostname of the node the session is logged in to
    pub current_node: &'a str,
}

impl<'a> SimContext<'a> {
    pub fn new(store: &'a mut ClusterStore, matcher: &'a FuzzyMatcher, current_node: &'a str) -> Self {
        Self {
            store,
            matcher,
            current_node,
        }
    }

    pub fn state(&self) -> &ClusterState {
        self.store.state()
    }

    pub fn state_mut(&mut self) -> &mut ClusterState {
        self.store.state_mut()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.store.now()
    }

    /// The node the session is logged in to
    pub fn node(&self) -> sim_core::Result<&Node> {
        let id = self.current_node;
        self.store
            .state()
            .node(id)
            .ok_or_else(|| Error::not_found(format!("node {}", id)))
    }

    pub fn node_mut(&mut self) -> sim_core::Result<&mut Node> {
        let id = self.current_node;
        self.store
            .state_mut()
            .node_mut(id)
            .ok_or_else(|| Error::not_found(format!("node {}", id)))
    }
}

/// Command handler; domain failures are `Ok` results with exit code 1
pub type Handler = fn(&ParsedCommand, &mut SimContext<'_>) -> sim_core::Result<CommandResult>;

/// One simulated command-line tool
pub trait Simulator {
    fn metadata(&self) -> &SimulatorMetadata;

    /// Run a parsed command line whose base command names this tool.
    /// Never panics on bad input and never returns an error: every failure
    /// is an exit-code-1 result.
    fn execute(&self, parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> CommandResult;

    /// Register flags and subcommands for "did you mean" suggestions
    fn register_vocabulary(&self, matcher: &mut FuzzyMatcher) {
        let meta = self.metadata();
        let flags = meta
            .flags
            .iter()
            .chain(meta.commands.iter().flat_map(|c| c.flags.iter()))
            .flat_map(FlagMetadata::tokens);
        matcher.register_flags(meta.name, flags);
        matcher.register_subcommands(meta.name, meta.commands.iter().map(|c| c.name));
    }
}

/// Table-driven [`Simulator`]
pub struct ToolRegistry {
    metadata: SimulatorMetadata,
    handlers: BTreeMap<&'static str, Handler>,
    root: Option<Handler>,
    root_accepts_operands: bool,
    help_flags: &'static [&'static str],
    version_flags: &'static [&'static str],
    version_text: Option<String>,
}

impl ToolRegistry {
    pub fn new(name: &'static str, version: &'static str, description: &'static str) -> Self {
        Self {
            metadata: SimulatorMetadata {
                name,
                version,
                description,
                usage: "",
                flags: Vec::new(),
                commands: Vec::new(),
            },
            handlers: BTreeMap::new(),
            root: None,
            root_accepts_operands: false,
            help_flags: &["help", "h"],
            version_flags: &["version", "v"],
            version_text: None,
        }
    }

    pub fn usage(mut self, usage: &'static str) -> Self {
        self.metadata.usage = usage;
        self
    }

    /// Handler for invocations without a registered command
    pub fn root(mut self, handler: Handler) -> Self {
        self.root = Some(handler);
        self
    }

    /// Let the root handler receive operands that are not command names
    pub fn accept_operands(mut self) -> Self {
        self.root_accepts_operands = true;
        self
    }

    pub fn flag(mut self, flag: FlagMetadata) -> Self {
        self.metadata.flags.push(flag);
        self
    }

    pub fn command(mut self, metadata: CommandMetadata, handler: Handler) -> Self {
        self.handlers.insert(metadata.name, handler);
        self.metadata.commands.push(metadata);
        self
    }

    pub fn help_flags(mut self, flags: &'static [&'static str]) -> Self {
        self.help_flags = flags;
        self
    }

    pub fn version_flags(mut self, flags: &'static [&'static str]) -> Self {
        self.version_flags = flags;
        self
    }

    /// Text printed for the version flag instead of `<name> version <version>`
    pub fn version_text(mut self, text: impl Into<String>) -> Self {
        self.version_text = Some(text.into());
        self
    }

    fn help_token(&self) -> String {
        match self.help_flags.first() {
            Some(f) if f.len() == 1 => format!("-{}", f),
            Some(f) => format!("--{}", f),
            None => "--help".to_string(),
        }
    }

    fn command_meta(&self, name: &str) -> Option<&CommandMetadata> {
        self.metadata.commands.iter().find(|c| c.name == name)
    }

    /// Top-level help text
    pub fn help(&self) -> String {
        let meta = &self.metadata;
        let mut out = format!("{} {} - {}\n", meta.name, meta.version, meta.description);
        if !meta.usage.is_empty() {
            out.push_str(&format!("\nUsage: {}\n", meta.usage));
        }
        if !meta.commands.is_empty() {
            out.push_str("\nCommands:\n");
            let width = meta.commands.iter().map(|c| c.name.len()).max().unwrap_or(0);
            for command in &meta.commands {
                out.push_str(&format!(
                    "  {:<width$}  {}\n",
                    command.name,
                    command.description,
                    width = width
                ));
            }
        }

        let mut flags = meta.flags.clone();
        if let Some(help) = self.help_flags.first() {
            flags.push(token_flag(*help, "Show this help and exit"));
        }
        if let Some(version) = self.version_flags.first() {
            flags.push(token_flag(*version, "Print version information and exit"));
        }
        out.push_str("\nOptions:\n");
        out.push_str(&flag_lines(&flags));

        if !meta.commands.is_empty() {
            out.push_str(&format!(
                "\nRun '{} <command> {}' for more information on a command.\n",
                meta.name,
                self.help_token()
            ));
        }
        out.trim_end().to_string()
    }

    fn version(&self) -> String {
        self.version_text
            .clone()
            .unwrap_or_else(|| format!("{} version {}", self.metadata.name, self.metadata.version))
    }

    fn known_flag(&self, name: &str, command: Option<&CommandMetadata>) -> bool {
        self.help_flags.contains(&name)
            || self.version_flags.contains(&name)
            || self.metadata.flags.iter().any(|f| f.names().any(|n| n == name))
            || command.map_or(false, |c| c.flags.iter().any(|f| f.names().any(|n| n == name)))
    }

    fn unknown_flag(&self, parsed: &ParsedCommand, name: &str, matcher: &FuzzyMatcher) -> CommandResult {
        let token = parsed.flag_token(name);
        let mut out = format!("{}: unrecognized option '{}'", self.metadata.name, token);
        if let Some(hint) = matcher.validate_flag(self.metadata.name, &token).message() {
            out.push('\n');
            out.push_str(&hint);
        }
        out.push_str(&format!(
            "\nRun '{} {}' for usage.",
            self.metadata.name,
            self.help_token()
        ));
        CommandResult::error(out)
    }

    fn unknown_command(&self, name: &str, matcher: &FuzzyMatcher) -> CommandResult {
        let mut out = format!("{}: '{}' is not a valid command.", self.metadata.name, name);
        if let Some(hint) = matcher.validate_subcommand(self.metadata.name, name).message() {
            out.push('\n');
            out.push_str(&hint);
        }
        let names: Vec<&str> = self.metadata.commands.iter().map(|c| c.name).collect();
        out.push_str(&format!("\nValid commands: {}", names.join(", ")));
        CommandResult::error(out)
    }

    /// Registered command named by the first operand, if any
    fn dispatch_key<'p>(&self, parsed: &'p ParsedCommand) -> Option<&'p str> {
        parsed.subcommand(0).or_else(|| {
            parsed
                .positional_args
                .first()
                .map(String::as_str)
                .filter(|p| self.handlers.contains_key(p))
        })
    }
}

fn token_flag(name: &'static str, description: &'static str) -> FlagMetadata {
    if name.len() == 1 {
        FlagMetadata::short(name, description)
    } else {
        FlagMetadata::long(name, description)
    }
}

impl Simulator for ToolRegistry {
    fn metadata(&self) -> &SimulatorMetadata {
        &self.metadata
    }

    fn execute(&self, parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> CommandResult {
        let key = self.dispatch_key(parsed);
        let command = key.and_then(|k| self.command_meta(k));

        if parsed.has_flag(self.help_flags) {
            return CommandResult::ok(command.map_or_else(|| self.help(), CommandMetadata::help));
        }
        if parsed.has_flag(self.version_flags) {
            return CommandResult::ok(self.version());
        }

        let handler = match (key, command) {
            (Some(name), Some(_)) => self.handlers.get(name).copied(),
            (Some(name), None) => {
                if self.root_accepts_operands && self.root.is_some() {
                    self.root
                } else {
                    return self.unknown_command(name, ctx.matcher);
                }
            }
            (None, _) => self.root,
        };

        for name in parsed.flags.keys() {
            if !self.known_flag(name, command) {
                return self.unknown_flag(parsed, name, ctx.matcher);
            }
        }

        let Some(handler) = handler else {
            return CommandResult::error(self.help());
        };

        match handler(parsed, ctx) {
            Ok(result) => result,
            Err(e) => {
                debug!("{} failed ({}): {}", self.metadata.name, e.category(), e);
                CommandResult::error(format!("{}: {}", self.metadata.name, e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_core::fixtures::demo_cluster;
    use sim_core::ClusterConfig;
    use sim_shell::parse;

    fn greet(parsed: &ParsedCommand, ctx: &mut SimContext<'_>) -> sim_core::Result<CommandResult> {
        let name = parsed.flag_value(&["n", "name"]).unwrap_or("world");
        Ok(CommandResult::ok(format!("hello {} from {}", name, ctx.node()?.hostname)))
    }

    fn fail(_: &ParsedCommand, _: &mut SimContext<'_>) -> sim_core::Result<CommandResult> {
        Err(Error::internal("boom"))
    }

    fn tool() -> ToolRegistry {
        ToolRegistry::new("demo", "1.2.3", "Demo tool")
            .usage("demo <command> [options]")
            .command(
                CommandMetadata::new("greet", "Say hello")
                    .usage("demo greet [-n NAME]")
                    .flag(FlagMetadata::both("n", "name", "Who to greet").takes("NAME"))
                    .example("demo greet -n dgx"),
                greet,
            )
            .command(CommandMetadata::new("fail", "Always fails"), fail)
    }

    fn run(tool: &ToolRegistry, line: &str) -> CommandResult {
        let mut store = ClusterStore::new(demo_cluster(&ClusterConfig::default()));
        let mut matcher = FuzzyMatcher::default();
        tool.register_vocabulary(&mut matcher);
        let mut ctx = SimContext::new(&mut store, &matcher, "dgx-00");
        tool.execute(&parse(line), &mut ctx)
    }

    #[test]
    fn test_dispatch_to_command() {
        let result = run(&tool(), "demo greet --name admin");
        assert_eq!(result, CommandResult::ok("hello admin from dgx-00"));
    }

    #[test]
    fn test_help_and_version_are_intercepted() {
        let help = run(&tool(), "demo --help");
        assert_eq!(help.exit_code, 0);
        assert!(help.output.contains("greet"));
        assert!(help.output.contains("fail"));

        let command_help = run(&tool(), "demo greet -h");
        assert!(command_help.output.starts_with("Usage: demo greet"));
        assert!(command_help.output.contains("-n, --name <NAME>"));

        assert_eq!(run(&tool(), "demo -v").output, "demo version 1.2.3");
        assert_eq!(run(&tool(), "demo greet --version").exit_code, 0);
    }

    #[test]
    fn test_unknown_command_lists_commands() {
        let result = run(&tool(), "demo gret");
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("Did you mean 'greet'?"));
        assert!(result.output.contains("Valid commands: greet, fail"));
    }

    #[test]
    fn test_unknown_flag_suggests() {
        let result = run(&tool(), "demo greet --nme x");
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("unrecognized option '--nme'"));
        assert!(result.output.contains("Did you mean '--name'?"));
    }

    #[test]
    fn test_handler_error_becomes_exit_code_one() {
        let result = run(&tool(), "demo fail");
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("boom"));
    }

    #[test]
    fn test_no_command_without_root_prints_help() {
        let result = run(&tool(), "demo");
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("Commands:"));
    }

    #[test]
    fn test_root_with_operands() {
        let tool = ToolRegistry::new("echo", "1", "Echo").root(greet).accept_operands();
        assert_eq!(run(&tool, "echo anything").exit_code, 0);
        assert_eq!(run(&tool, "echo").exit_code, 0);
    }

    #[test]
    fn test_result_serializes_with_exit_code() {
        let json = serde_json::to_value(CommandResult::error("nope")).unwrap();
        assert_eq!(json, serde_json::json!({ "output": "nope", "exitCode": 1 }));

        let meta = serde_json::to_value(tool().metadata()).unwrap();
        assert_eq!(meta["name"], "demo");
        assert_eq!(meta["commands"].as_array().map(Vec::len), Some(2));
    }
}
