//! One-line status messages, indented under the current section.

use owo_colors::OwoColorize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Warning,
    /// A line relayed from the build log.
    Log,
}

impl Status {
    fn marker(self) -> String {
        match self {
            Status::Success => "✓".green().to_string(),
            Status::Warning => "⚠".yellow().to_string(),
            Status::Log => "│".bright_black().to_string(),
        }
    }

    pub fn line(self, message: &str) -> String {
        let body = match self {
            Status::Success => message.green().bold().to_string(),
            Status::Warning => message.yellow().bold().to_string(),
            Status::Log => message.to_string(),
        };
        format!("  {} {}", self.marker(), body)
    }
}

pub fn print_success(message: &str) {
    println!("{}", Status::Success.line(message));
}

pub fn print_warning(message: &str) {
    println!("{}", Status::Warning.line(message));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_lines_are_not_restyled() {
        let line = Status::Log.line("Loading library utils@1.0");
        assert!(line.starts_with("  "));
        assert!(line.ends_with(" Loading library utils@1.0"));
        assert_ne!(Status::Success.line("done"), Status::Warning.line("done"));
    }
}
