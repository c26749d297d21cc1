mod commands;
mod formatting;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;

use commands::ResolveArgs;

#[derive(Parser)]
#[command(name = "pipelib")]
#[command(about = "Resolve, fetch and cache pipeline shared libraries")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file; defaults to ./pipelib.toml when present.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(short, long, action, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve and load libraries for one build.
    Resolve {
        /// Full name of the job, e.g. `team/app/main`.
        #[arg(long)]
        job: String,
        #[arg(long, default_value = "build")]
        build_dir: PathBuf,
        /// Branch the build runs on; substituted for `${BRANCH_NAME}`.
        #[arg(long)]
        branch: Option<String>,
        /// Build environment variable, `KEY=VALUE`. Repeatable.
        #[arg(long = "env", value_parser = commands::parse_env_pair)]
        env: Vec<(String, String)>,
        /// Also extract every bundle below this directory.
        #[arg(long)]
        extract: Option<PathBuf>,
        #[arg(long, action)]
        json: bool,
        /// Libraries as `NAME` or `NAME@VERSION`.
        libraries: Vec<String>,
    },
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
    Bundle {
        #[command(subcommand)]
        command: BundleCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List cached library versions.
    List {
        #[arg(long, action)]
        json: bool,
    },
    /// Drop every cached version of a library.
    Clear { library: String },
}

#[derive(Subcommand)]
enum JobCommands {
    Rename { old: String, new: String },
    Delete { job: String },
}

#[derive(Subcommand)]
enum BundleCommands {
    /// Bundle a library checkout directory.
    Create {
        checkout: PathBuf,
        output: PathBuf,
        #[arg(long, default_value = "library")]
        name: String,
        #[arg(long)]
        library_path: Option<String>,
        #[arg(long, action)]
        include_src_test: bool,
    },
    List {
        bundle: PathBuf,
        #[arg(long, action)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .init();

    let settings = cli.settings.as_deref();
    match cli.command {
        Commands::Resolve {
            job,
            build_dir,
            branch,
            env,
            extract,
            json,
            libraries,
        } => commands::cmd_resolve(
            settings,
            ResolveArgs {
                job,
                build_dir,
                branch,
                env,
                extract,
                json,
                libraries,
            },
        )?,
        Commands::Cache { command } => match command {
            CacheCommands::List { json } => commands::cmd_cache_list(settings, json)?,
            CacheCommands::Clear { library } => commands::cmd_cache_clear(settings, &library)?,
        },
        Commands::Job { command } => match command {
            JobCommands::Rename { old, new } => commands::cmd_job_rename(settings, &old, &new)?,
            JobCommands::Delete { job } => commands::cmd_job_delete(settings, &job)?,
        },
        Commands::Bundle { command } => match command {
            BundleCommands::Create {
                checkout,
                output,
                name,
                library_path,
                include_src_test,
            } => commands::cmd_bundle_create(
                &name,
                &checkout,
                &output,
                library_path.as_deref(),
                include_src_test,
            )?,
            BundleCommands::List { bundle, json } => commands::cmd_bundle_list(&bundle, json)?,
        },
    }

    Ok(())
}
