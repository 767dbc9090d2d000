//! Output formatting for the clustersim shell

use chrono::{DateTime, Utc};
use colored::*;
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Color, ContentArrangement, Table};
use sim_state::StateSnapshot;

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message.blue());
}

/// Shorten a snapshot id to the prefix the shell accepts
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Helper function to format the age of a timestamp
pub fn format_age(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = (now - then).num_seconds().max(0);
    if seconds < 60 {
        format!("{}s ago", seconds)
    } else if seconds < 3600 {
        format!("{}m ago", seconds / 60)
    } else if seconds < 86400 {
        format!("{}h {}m ago", seconds / 3600, (seconds % 3600) / 60)
    } else {
        format!("{}d ago", seconds / 86400)
    }
}

/// Render snapshots, most recent first
pub fn snapshot_table(snapshots: &[StateSnapshot], now: DateTime<Utc>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    let headers = ["ID", "Name", "Created", "Nodes", "GPUs", "Scenario", "Description"];
    table.set_header(
        headers
            .iter()
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold).fg(Color::Cyan))
            .collect::<Vec<_>>(),
    );

    for snapshot in snapshots {
        let name = if snapshot.is_baseline {
            Cell::new(format!("{} (baseline)", snapshot.name)).fg(Color::Green)
        } else {
            Cell::new(&snapshot.name)
        };
        table.add_row(vec![
            Cell::new(short_id(&snapshot.id)),
            name,
            Cell::new(format_age(snapshot.timestamp, now)),
            Cell::new(snapshot.metadata.node_count),
            Cell::new(snapshot.metadata.gpu_count),
            Cell::new(snapshot.scenario_id.as_deref().unwrap_or("-")),
            Cell::new(snapshot.description.as_deref().unwrap_or("")),
        ]);
    }
    table
}
