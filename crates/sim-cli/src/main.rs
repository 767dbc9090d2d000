//! clustersim - offline GPU cluster administration simulator

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sim_core::SimConfig;
use sim_state::Scenario;
use sim_tools::Engine;
use std::any::Any;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

mod output;
mod repl;

/// Practice GPU cluster administration against a simulated cluster
#[derive(Debug, Parser)]
#[command(name = "clustersim")]
#[command(about = "Practice GPU cluster administration against a simulated cluster")]
#[command(version)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true, env = "CLUSTERSIM_CONFIG")]
    config: Option<PathBuf>,

    /// Number of nodes in the demo cluster
    #[arg(long, global = true)]
    nodes: Option<u32>,

    /// GPUs per node
    #[arg(long, global = true)]
    gpus: Option<u32>,

    /// Log filter used when RUST_LOG is unset (e.g. info, sim_state=debug)
    #[arg(long, value_name = "FILTER", global = true)]
    log_level: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Keep snapshots in memory only
    #[arg(long, global = true)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the interactive shell (default)
    Shell,

    /// Run a single command line and exit with its status
    Exec {
        /// Command line, e.g. nvidia-smi -q -i 0
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        line: Vec<String>,
    },

    /// Load a scenario file, then start the shell
    Scenario {
        /// Scenario JSON file
        file: PathBuf,
    },
}

fn init_tracing(cli: &Cli) {
    let fallback = match (&cli.log_level, cli.verbose) {
        (Some(level), _) => level.clone(),
        (None, true) => "debug".to_string(),
        (None, false) => "warn".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Report panics through the log instead of the default stderr banner.
/// The engine turns a panicking command into an ordinary error result.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());
        error!("Panic at {}: {}", location, panic_message(info.payload()));
    }));
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn default_snapshot_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("clustersim").join("snapshots.json"))
}

/// Load configuration and apply command-line overrides
fn load_config(cli: &Cli) -> Result<SimConfig> {
    let mut config = SimConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(nodes) = cli.nodes {
        config.cluster.nodes = nodes;
    }
    if let Some(gpus) = cli.gpus {
        config.cluster.gpus_per_node = gpus;
    }
    if cli.no_color {
        config.output.color = false;
    }
    if cli.ephemeral {
        config.snapshots.storage_path = None;
    } else if config.snapshots.storage_path.is_none() {
        config.snapshots.storage_path = default_snapshot_path();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn load_scenario(engine: &mut Engine, path: &Path) -> Result<()> {
    let scenario = Scenario::load(path)
        .with_context(|| format!("Failed to load scenario from {}", path.display()))?;
    let outcome = engine.load_scenario(&scenario);

    output::print_success(&format!(
        "Loaded scenario '{}': {} of {} faults applied",
        scenario.title.as_deref().unwrap_or(&scenario.id),
        outcome.faults_applied,
        scenario.faults.len()
    ));
    if let Some(description) = &scenario.description {
        println!("{}", description);
    }
    output::print_info(&format!(
        "State before the scenario saved as snapshot {}",
        output::short_id(&outcome.snapshot_id)
    ));
    Ok(())
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&cli);
    install_panic_hook();
    debug!("Starting clustersim with {:?}", cli);

    let config = load_config(&cli)?;
    if !config.output.color {
        colored::control::set_override(false);
    }
    let mut engine = Engine::from_config(&config).context("Failed to start session")?;
    info!(
        "Cluster '{}' ready: {} nodes, {} GPUs per node",
        config.cluster.name, config.cluster.nodes, config.cluster.gpus_per_node
    );

    match cli.command.unwrap_or(Commands::Shell) {
        Commands::Shell => repl::run(&mut engine)?,
        Commands::Exec { line } => {
            let result = engine.execute(&line.join(" "));
            if !result.output.is_empty() {
                println!("{}", result.output);
            }
            return Ok(ExitCode::from(result.exit_code.clamp(0, 255) as u8));
        }
        Commands::Scenario { file } => {
            load_scenario(&mut engine, &file)?;
            repl::run(&mut engine)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert()
    }

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["clustersim"]).unwrap();
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["clustersim", "exec", "nvidia-smi", "-q", "-i", "0"]).unwrap();
        match cli.command {
            Some(Commands::Exec { line }) => assert_eq!(line.join(" "), "nvidia-smi -q -i 0"),
            other => panic!("unexpected command {:?}", other),
        }

        let cli = Cli::try_parse_from(["clustersim", "--nodes", "2", "--no-color", "shell"]).unwrap();
        assert_eq!(cli.nodes, Some(2));
        assert!(cli.no_color);
    }

    #[test]
    fn test_panic_message_from_payload() {
        let literal = std::panic::catch_unwind(|| {
            panic!("boom");
        }).unwrap_err();
        assert_eq!(panic_message(literal.as_ref()), "boom");

        let formatted = std::panic::catch_unwind(|| {
            panic!("bad gpu {}", 3);
        }).unwrap_err();
        assert_eq!(panic_message(formatted.as_ref()), "bad gpu 3");

        let other = std::panic::catch_unwind(|| {
            std::panic::panic_any(7u32);
        }).unwrap_err();
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_overrides_apply_to_config() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "cluster:\n  nodes: 6\nsnapshots:\n  max_snapshots: 4").unwrap();
        let path = file.path().to_str().unwrap();

        let cli = Cli::try_parse_from(["clustersim", "--config", path, "--gpus", "4", "--ephemeral"])
            .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.cluster.nodes, 6);
        assert_eq!(config.cluster.gpus_per_node, 4);
        assert_eq!(config.snapshots.max_snapshots, 4);
        assert!(config.snapshots.storage_path.is_none());

        let cli = Cli::try_parse_from(["clustersim", "--config", path, "--gpus", "0", "--ephemeral"])
            .unwrap();
        assert!(load_config(&cli).is_err());
    }

    #[test]
    fn test_scenario_file_loads_into_engine() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "id": "xid-79-drill", "title": "GPU fell off the bus",
                 "faults": [{{ "nodeId": "dgx-00", "gpuId": 0, "type": "xid-error",
                               "severity": "critical", "parameters": {{ "xid": 79 }} }}] }}"#
        )
        .unwrap();

        let mut config = SimConfig::default();
        config.output.color = false;
        let mut engine = Engine::from_config(&config).unwrap();
        load_scenario(&mut engine, file.path()).unwrap();
        assert!(engine.state().nodes[0].gpus[0].is_fallen_off_bus());
        assert!(load_scenario(&mut engine, Path::new("/nonexistent/scenario.json")).is_err());
    }
}
