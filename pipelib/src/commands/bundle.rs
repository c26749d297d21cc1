use std::path::Path;

use anyhow::Result;
use pipelib_core::bundle::{dir_to_bundle, list_bundle};
use pipelib_core::BundleOptions;

use super::reporter::CliReporter;
use crate::formatting::{print_entry_list, print_key_value, print_section_header, print_success, SectionStyle};

pub fn cmd_bundle_create(
    name: &str,
    checkout: &Path,
    output: &Path,
    library_path: Option<&str>,
    include_src_test: bool,
) -> Result<()> {
    print_section_header("Bundling library", SectionStyle::Primary);
    let options = BundleOptions { include_src_test };
    let summary = dir_to_bundle(name, checkout, library_path, output, &options, &CliReporter)?;

    print_key_value("Entries", &summary.entries.to_string());
    print_key_value("Variables", &summary.variables.join(", "));
    print_success(&format!("Wrote {}", output.display()));
    println!();
    Ok(())
}

pub fn cmd_bundle_list(bundle: &Path, json: bool) -> Result<()> {
    let entries = list_bundle(bundle)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        print_section_header(&format!("{}", bundle.display()), SectionStyle::Primary);
        print_entry_list(&entries);
        println!();
    }
    Ok(())
}
