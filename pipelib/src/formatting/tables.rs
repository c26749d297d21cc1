//! Table formatting utilities using comfy-table.

use comfy_table::{Cell, Color, Table};
use owo_colors::OwoColorize;
use pipelib_core::{LibraryRecord, SlotInfo};

use super::output::{format_age, format_size};

fn styled_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .set_header(
            headers
                .iter()
                .map(|h| Cell::new(*h).add_attribute(comfy_table::Attribute::Bold))
                .collect::<Vec<_>>(),
        )
        .load_preset(comfy_table::presets::UTF8_FULL)
        .apply_modifier(comfy_table::modifiers::UTF8_ROUND_CORNERS)
        .set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
    table
}

/// Prints the libraries a build resolved, in load order.
pub fn print_record_table(records: &[LibraryRecord]) {
    let mut table = styled_table(&["Library", "Version", "Variables", "Trust", "Storage"]);

    for record in records {
        let (trust, trust_color) = if record.trusted {
            ("trusted", Color::Green)
        } else {
            ("sandboxed", Color::Yellow)
        };
        let variables = if record.variables.is_empty() {
            "(none)".to_string()
        } else {
            record.variables.join(", ")
        };
        table.add_row(vec![
            Cell::new(&record.name).fg(Color::White),
            Cell::new(&record.version).fg(Color::Cyan),
            Cell::new(variables),
            Cell::new(trust).fg(trust_color),
            Cell::new(&record.directory_name[..12.min(record.directory_name.len())])
                .fg(Color::DarkGrey),
        ]);
    }

    println!("{}", table);
}

/// Prints cache slots, one row per slot.
pub fn print_slot_table(slots: &[SlotInfo]) {
    let mut table = styled_table(&["Library", "Version", "Source", "Age", "Size", "Slot"]);

    for slot in slots {
        table.add_row(vec![
            Cell::new(slot.library.as_deref().unwrap_or("?")).fg(Color::White),
            Cell::new(slot.version.as_deref().unwrap_or("?")).fg(Color::Cyan),
            Cell::new(slot.scm_key.as_deref().unwrap_or("?")),
            Cell::new(format_age(slot.age())),
            Cell::new(format_size(slot.size)),
            Cell::new(&slot.directory_name[..12.min(slot.directory_name.len())])
                .fg(Color::DarkGrey),
        ]);
    }

    println!("{}", table);
}

/// Prints bundle entries one per line.
pub fn print_entry_list(entries: &[String]) {
    if entries.is_empty() {
        println!("  {} {}", "→".cyan(), "(empty)".bright_black());
        return;
    }

    for entry in entries {
        println!("  {} {}", "→".cyan(), entry.bold().white());
    }
}
