//! CLI output helpers.
//!
//! Colors come from `owo-colors`, tables from `comfy-table`. Everything here
//! writes to stdout; diagnostics and logs go through `tracing` on stderr.

mod output;
mod status;
mod tables;

pub use output::{
    format_age, format_size, print_key_value, print_section_header, print_summary_box, SectionStyle,
};
pub use status::{print_success, print_warning, Status};
pub use tables::{print_entry_list, print_record_table, print_slot_table};
