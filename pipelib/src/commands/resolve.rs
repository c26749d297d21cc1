use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Result};
use pipelib_core::bundle::extract_bundle;
use pipelib_core::{
    BuildContext, BuildReporter, CancelToken, JobRef, LibraryUse, TracingReporter,
};

use super::reporter::CliReporter;
use super::{print_cache_stats, Engine};
use crate::formatting::{
    print_key_value, print_record_table, print_section_header, print_success, print_warning,
    SectionStyle,
};

pub struct ResolveArgs {
    pub job: String,
    pub build_dir: PathBuf,
    pub branch: Option<String>,
    pub env: Vec<(String, String)>,
    pub extract: Option<PathBuf>,
    pub json: bool,
    pub libraries: Vec<String>,
}

/// Parses `KEY=VALUE` for `--env`.
pub fn parse_env_pair(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty variable name in '{}'", raw));
    }
    Ok((key.to_string(), value.to_string()))
}

fn build_context(args: &ResolveArgs, cancel: CancelToken) -> BuildContext {
    let mut ctx = BuildContext::new(JobRef::new(args.job.as_str()), args.build_dir.clone())
        .with_cancel(cancel);
    if let Some(branch) = &args.branch {
        ctx = ctx.with_head_name(branch.as_str());
    }
    for (key, value) in &args.env {
        ctx = ctx.with_env(key.as_str(), value.as_str());
    }
    ctx
}

fn extract_all(libraries: &pipelib_core::BuildLibraries, dest: &Path) -> Result<usize> {
    let mut total = 0;
    for record in libraries.records() {
        let bundle = libraries
            .bundle(&record.name)
            .ok_or_else(|| anyhow!("bundle for {} is missing", record.name))?;
        total += extract_bundle(bundle, &dest.join(&record.directory_name))?;
    }
    Ok(total)
}

pub fn cmd_resolve(settings: Option<&Path>, args: ResolveArgs) -> Result<()> {
    let start = Instant::now();
    let engine = Engine::open(settings)?;

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        handler_token.cancel();
    })
    .map_err(|e| anyhow!("Failed to set signal handler: {}", e))?;

    let uses = args
        .libraries
        .iter()
        .map(|spec| LibraryUse::parse(spec))
        .collect::<pipelib_core::Result<Vec<_>>>()?;
    let ctx = build_context(&args, cancel);
    std::fs::create_dir_all(&ctx.build_dir)?;

    let reporter: &dyn BuildReporter = if args.json { &TracingReporter } else { &CliReporter };
    if !args.json {
        print_section_header("Resolving libraries", SectionStyle::Primary);
        print_key_value("Job", ctx.job.full_name());
        print_key_value("Settings version", &engine.settings.version().to_string());
        println!();
    }

    let libraries = engine.coordinator.resolve_all(&uses, &ctx, reporter)?;

    let extracted = match &args.extract {
        Some(dest) => Some(extract_all(&libraries, dest)?),
        None => None,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(libraries.records())?);
        libraries.close()?;
        return Ok(());
    }

    println!();
    if libraries.records().is_empty() {
        print_warning("No libraries resolved");
    } else {
        print_record_table(libraries.records());
    }
    println!();
    if let (Some(count), Some(dest)) = (extracted, &args.extract) {
        print_success(&format!("Extracted {} files to {}", count, dest.display()));
    }
    print_success(&format!(
        "Resolved {} libraries in {:.2}s",
        libraries.records().len(),
        start.elapsed().as_secs_f64()
    ));
    println!();
    print_cache_stats(engine.cache().stats());

    libraries.close()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_pair() {
        assert_eq!(
            parse_env_pair("LIB_VERSION=1.2=3").unwrap(),
            ("LIB_VERSION".to_string(), "1.2=3".to_string())
        );
        assert!(parse_env_pair("novalue").is_err());
        assert!(parse_env_pair(" =x").is_err());
    }
}
