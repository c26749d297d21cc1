//! Build-log reporter for the CLI.

use pipelib_core::BuildReporter;

use crate::formatting::Status;

/// Prints build-log lines to stdout.
pub struct CliReporter;

impl BuildReporter for CliReporter {
    fn line(&self, message: &str) {
        for line in message.lines() {
            println!("{}", Status::Log.line(line));
        }
    }
}
