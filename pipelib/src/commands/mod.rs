//! Command implementations for the CLI.

mod bundle;
mod cache;
mod job;
mod reporter;
mod resolve;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use pipelib_core::{
    CacheManager, CacheStats, CheckoutWorkspaces, ConfigurationProvider,
    LibraryResolutionCoordinator, Settings, SettingsStore,
};

use crate::formatting::print_summary_box;

pub use bundle::{cmd_bundle_create, cmd_bundle_list};
pub use cache::{cmd_cache_clear, cmd_cache_list};
pub use job::{cmd_job_delete, cmd_job_rename};
pub use resolve::{cmd_resolve, parse_env_pair, ResolveArgs};

/// Settings file looked up in the working directory when none is given.
const DEFAULT_SETTINGS_FILE: &str = "pipelib.toml";

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let registry = pipelib_scm::default_registry();
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let fallback = PathBuf::from(DEFAULT_SETTINGS_FILE);
            if !fallback.is_file() {
                tracing::debug!("no settings file, using defaults");
                return Ok(Settings::default());
            }
            fallback
        }
    };
    Settings::from_file(&path, &registry)
        .with_context(|| format!("Failed to load settings from {}", path.display()))
}

/// Process-wide engine state built from one settings file.
struct Engine {
    settings: Arc<SettingsStore>,
    coordinator: LibraryResolutionCoordinator,
}

impl Engine {
    fn open(settings_path: Option<&Path>) -> Result<Self> {
        let settings = load_settings(settings_path)?;
        let options = settings.options.clone();
        let store = Arc::new(SettingsStore::new(settings)?);
        let workspaces = CheckoutWorkspaces::new(options.workspaces_dir.clone());
        let cache = Arc::new(CacheManager::new(options.cache_dir.clone(), workspaces)?);
        let provider: Arc<dyn ConfigurationProvider> = store.clone();
        Ok(Self {
            settings: store,
            coordinator: LibraryResolutionCoordinator::new(provider, cache),
        })
    }

    fn cache(&self) -> &CacheManager {
        self.coordinator.cache()
    }
}

fn print_cache_stats(stats: &CacheStats) {
    use std::sync::atomic::Ordering;

    let hit_rate = stats.hit_rate() * 100.0;
    print_summary_box(
        "Cache Statistics",
        &[
            ("Hit Rate", &format!("{:.0}%", hit_rate)),
            ("Hits", &stats.hits.load(Ordering::Relaxed).to_string()),
            ("Populated", &stats.populated.load(Ordering::Relaxed).to_string()),
            ("Refreshed", &stats.refreshed.load(Ordering::Relaxed).to_string()),
            ("Uncached", &stats.uncached.load(Ordering::Relaxed).to_string()),
        ],
    );
    println!();
}
