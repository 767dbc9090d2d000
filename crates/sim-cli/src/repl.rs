//! Interactive shell loop and `:` meta-commands

use crate::output::{print_error, print_info, print_success, short_id, snapshot_table};
use anyhow::{Context, Result};
use chrono::Utc;
use sim_state::load_faults;
use sim_tools::Engine;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Instant;
use tracing::debug;

/// Session-level commands that act on the simulator rather than a node
#[derive(Debug, Clone, PartialEq)]
pub enum MetaCommand {
    ListSnapshots,
    SaveSnapshot { name: String, description: Option<String> },
    RestoreSnapshot(String),
    DeleteSnapshot(String),
    SaveBaseline,
    Reset,
    Fault(PathBuf),
    Advance(f64),
    Help,
    Quit,
}

const META_HELP: &str = "\
Meta-commands:
  :snapshot list                    List saved snapshots
  :snapshot save <name> [desc]      Save the current cluster state
  :snapshot restore <id>            Restore a snapshot (id prefix accepted)
  :snapshot delete <id>             Delete a snapshot
  :snapshot baseline                Make the current state the baseline
  :reset                            Restore the baseline
  :fault <file.json>                Inject faults from a file
  :advance <seconds>                Advance simulated time
  :help                             Show this help
  :quit                             Leave the shell";

impl MetaCommand {
    /// Parse a line starting with `:`. Returns `None` for ordinary commands.
    pub fn parse(line: &str) -> Option<std::result::Result<Self, String>> {
        let rest = line.trim().strip_prefix(':')?;
        let mut words = rest.split_whitespace();
        let command = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();

        let parsed = match (command, args.as_slice()) {
            ("snapshot" | "snap", ["list"] | []) => Ok(Self::ListSnapshots),
            ("snapshot" | "snap", ["save", name, desc @ ..]) => Ok(Self::SaveSnapshot {
                name: name.to_string(),
                description: (!desc.is_empty()).then(|| desc.join(" ")),
            }),
            ("snapshot" | "snap", ["restore", id]) => Ok(Self::RestoreSnapshot(id.to_string())),
            ("snapshot" | "snap", ["delete", id]) => Ok(Self::DeleteSnapshot(id.to_string())),
            ("snapshot" | "snap", ["baseline"]) => Ok(Self::SaveBaseline),
            ("snapshot" | "snap", _) => {
                Err("usage: :snapshot list|save <name> [desc]|restore <id>|delete <id>|baseline".to_string())
            }
            ("reset", []) => Ok(Self::Reset),
            ("fault", [path]) => Ok(Self::Fault(PathBuf::from(path))),
            ("fault", _) => Err("usage: :fault <file.json>".to_string()),
            ("advance", [secs]) => match secs.parse::<f64>() {
                Ok(secs) if secs >= 0.0 && secs.is_finite() => Ok(Self::Advance(secs)),
                _ => Err(format!("invalid number of seconds '{}'", secs)),
            },
            ("advance", _) => Err("usage: :advance <seconds>".to_string()),
            ("help", _) => Ok(Self::Help),
            ("quit" | "q" | "exit", _) => Ok(Self::Quit),
            (other, _) => Err(format!("unknown meta-command ':{}' (try :help)", other)),
        };
        Some(parsed)
    }
}

/// Whether the shell keeps reading after a meta-command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Run one meta-command against the engine
pub fn run_meta(engine: &mut Engine, command: MetaCommand) -> Flow {
    match command {
        MetaCommand::ListSnapshots => {
            if engine.snapshots().is_empty() {
                print_info("No snapshots saved");
            } else {
                println!("{}", snapshot_table(engine.snapshots(), Utc::now()));
            }
        }
        MetaCommand::SaveSnapshot { name, description } => {
            let id = engine.create_snapshot(&name, description.as_deref());
            print_success(&format!("Saved snapshot '{}' ({})", name, short_id(&id)));
        }
        MetaCommand::RestoreSnapshot(id) => {
            if engine.restore_snapshot(&id) {
                print_success(&format!("Restored snapshot {}", id));
            } else {
                print_error(&format!("No snapshot matches '{}'", id));
            }
        }
        MetaCommand::DeleteSnapshot(id) => {
            if engine.delete_snapshot(&id) {
                print_success(&format!("Deleted snapshot {}", id));
            } else {
                print_error(&format!("No snapshot matches '{}'", id));
            }
        }
        MetaCommand::SaveBaseline => {
            let id = engine.create_baseline_snapshot();
            print_success(&format!("Baseline replaced ({})", short_id(&id)));
        }
        MetaCommand::Reset => {
            if engine.reset() {
                print_success("Cluster restored to baseline");
            } else {
                print_success("All faults cleared");
            }
        }
        MetaCommand::Fault(path) => match load_faults(&path) {
            Ok(faults) => {
                let applied = engine.apply_faults(&faults);
                print_success(&format!(
                    "Applied {} of {} faults from {}",
                    applied,
                    faults.len(),
                    path.display()
                ));
            }
            Err(e) => print_error(&format!("{}: {}", path.display(), e)),
        },
        MetaCommand::Advance(secs) => {
            let applied = engine.tick((secs * 1000.0).round() as u64);
            print_info(&format!("Advanced {}s, {} events applied", secs, applied));
        }
        MetaCommand::Help => println!("{}", META_HELP),
        MetaCommand::Quit => return Flow::Quit,
    }
    Flow::Continue
}

/// Read commands from stdin until EOF or `:quit`
pub fn run(engine: &mut Engine) -> Result<()> {
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut stdout = io::stdout();
    let mut last = Instant::now();
    let mut line = String::new();

    print_info("Type 'help' for tools, ':help' for session commands");
    loop {
        write!(stdout, "{}", engine.prompt()).context("Failed to write prompt")?;
        stdout.flush().context("Failed to flush stdout")?;

        line.clear();
        if input.read_line(&mut line).context("Failed to read from stdin")? == 0 {
            println!();
            break;
        }

        let elapsed = last.elapsed();
        last = Instant::now();
        let applied = engine.tick(elapsed.as_millis() as u64);
        if applied > 0 {
            debug!("{} deferred events applied", applied);
        }

        let command = line.trim();
        match command {
            "" => continue,
            "exit" | "logout" => break,
            _ => {}
        }
        match MetaCommand::parse(command) {
            Some(Ok(meta)) => {
                if run_meta(engine, meta) == Flow::Quit {
                    break;
                }
            }
            Some(Err(message)) => print_error(&message),
            None => {
                let result = engine.execute(command);
                if !result.output.is_empty() {
                    println!("{}", result.output);
                }
            }
        }
    }
    Ok(())
}
