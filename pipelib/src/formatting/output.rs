use std::time::Duration;

use owo_colors::OwoColorize;

#[derive(Debug, Clone, Copy)]
pub enum SectionStyle {
    Primary,
    Warning,
}

/// Prints a section title followed by a blank line.
pub fn print_section_header(title: &str, style: SectionStyle) {
    let title = match style {
        SectionStyle::Primary => title.cyan().bold().to_string(),
        SectionStyle::Warning => title.yellow().bold().to_string(),
    };
    println!("{}\n", title);
}

/// Prints a summary box with statistics.
pub fn print_summary_box(title: &str, items: &[(&str, &str)]) {
    let title_colored = title.cyan().bold().to_string();
    let separator = "─".repeat(50);
    println!("┌─ {} {}", title_colored, separator.bright_black());
    for (key, value) in items {
        println!("│ {} {}", key.bright_black().bold(), value.bold().white());
    }
    println!("└{}", "─".repeat(60).bright_black());
}

pub fn print_key_value(key: &str, value: &str) {
    println!("  {} {}", key.bright_black().bold(), value.bold().white());
}

/// Coarse, human-readable age: `42s`, `17m`, `5h 3m`, `2d 4h`.
pub fn format_age(age: Option<Duration>) -> String {
    let Some(age) = age else {
        return "unknown".to_string();
    };
    let secs = age.as_secs();
    match secs {
        0..=59 => format!("{}s", secs),
        60..=3599 => format!("{}m", secs / 60),
        3600..=86_399 => format!("{}h {}m", secs / 3600, (secs % 3600) / 60),
        _ => format!("{}d {}h", secs / 86_400, (secs % 86_400) / 3600),
    }
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
