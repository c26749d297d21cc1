//! Job lifecycle hooks: keep checkout workspaces in step with job renames.

use std::path::Path;

use anyhow::Result;
use pipelib_core::JobRef;

use super::Engine;
use crate::formatting::print_success;

pub fn cmd_job_rename(settings: Option<&Path>, old: &str, new: &str) -> Result<()> {
    let engine = Engine::open(settings)?;
    engine
        .cache()
        .workspaces()
        .on_job_renamed(&JobRef::new(old), &JobRef::new(new))?;
    print_success(&format!("Moved library workspaces of {} to {}", old, new));
    Ok(())
}

pub fn cmd_job_delete(settings: Option<&Path>, job: &str) -> Result<()> {
    let engine = Engine::open(settings)?;
    engine.cache().workspaces().on_job_deleted(&JobRef::new(job))?;
    print_success(&format!("Removed library workspaces of {}", job));
    Ok(())
}
