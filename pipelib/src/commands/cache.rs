use std::path::Path;

use anyhow::Result;

use super::Engine;
use crate::formatting::{
    print_section_header, print_slot_table, print_success, print_warning, SectionStyle,
};

pub fn cmd_cache_list(settings: Option<&Path>, json: bool) -> Result<()> {
    let engine = Engine::open(settings)?;
    let slots = engine.cache().list()?;

    if json {
        let rows: Vec<_> = slots
            .iter()
            .map(|slot| {
                serde_json::json!({
                    "slot": slot.directory_name,
                    "library": slot.library,
                    "version": slot.version,
                    "source": slot.scm_key,
                    "age_secs": slot.age().map(|age| age.as_secs()),
                    "size": slot.size,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    print_section_header("Cached Libraries", SectionStyle::Primary);
    if slots.is_empty() {
        print_warning(&format!("Cache at {} is empty", engine.cache().root().display()));
    } else {
        print_slot_table(&slots);
    }
    println!();
    Ok(())
}

pub fn cmd_cache_clear(settings: Option<&Path>, library: &str) -> Result<()> {
    let engine = Engine::open(settings)?;
    let removed = engine.cache().clear_library(library)?;

    if removed == 0 {
        print_section_header("Cache", SectionStyle::Warning);
        print_warning(&format!("No cached versions of {}", library));
    } else {
        print_section_header("Cache", SectionStyle::Primary);
        print_success(&format!("Cleared {} cached versions of {}", removed, library));
    }
    println!();
    Ok(())
}
