//! Library configuration, the settings file, and the settings store.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retriever::{LibraryRetriever, Retriever, ScmRetriever, ScmSourceRetriever};
use crate::retry::RetryPolicy;
use crate::scm::{ScmDefinition, ScmRegistry};

const DEFAULT_RETRY_DELAY_SECS: u64 = 10;

fn default_true() -> bool {
    true
}

fn default_retry_delay() -> u64 {
    DEFAULT_RETRY_DELAY_SECS
}

/// Per-library caching policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryCachingConfiguration {
    /// Minutes after which a cached version is refetched. `0` never refreshes.
    #[serde(default)]
    pub refresh_minutes: u64,
    /// Space-separated substrings; a matching version is never cached.
    #[serde(default)]
    pub excluded_versions: String,
    /// Space-separated substrings; when non-empty only matching versions are cached.
    #[serde(default)]
    pub included_versions: String,
}

impl LibraryCachingConfiguration {
    pub fn new(refresh_minutes: u64) -> Self {
        Self {
            refresh_minutes,
            ..Default::default()
        }
    }

    pub fn with_excluded(mut self, patterns: impl Into<String>) -> Self {
        self.excluded_versions = patterns.into();
        self
    }

    pub fn with_included(mut self, patterns: impl Into<String>) -> Self {
        self.included_versions = patterns.into();
        self
    }

    pub fn is_excluded(&self, version: &str) -> bool {
        self.excluded_versions
            .split_whitespace()
            .any(|pattern| version.contains(pattern))
    }

    pub fn is_included(&self, version: &str) -> bool {
        let mut patterns = self.included_versions.split_whitespace().peekable();
        if patterns.peek().is_none() {
            return true;
        }
        patterns.any(|pattern| version.contains(pattern))
    }

    /// Exclusion wins over inclusion.
    pub fn should_cache(&self, version: &str) -> bool {
        !self.is_excluded(version) && self.is_included(version)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        if self.refresh_minutes == 0 {
            None
        } else {
            Some(Duration::from_secs(self.refresh_minutes * 60))
        }
    }
}

/// A named library and the policy governing which versions of it a build may use.
#[derive(Clone)]
pub struct LibraryConfiguration {
    name: String,
    pub default_version: Option<String>,
    pub allow_version_override: bool,
    pub allow_branch_name: bool,
    pub allow_version_envvar: bool,
    pub include_in_changelog: bool,
    pub implicit: bool,
    pub retriever: Retriever,
    pub caching: Option<LibraryCachingConfiguration>,
}

impl fmt::Debug for LibraryConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryConfiguration")
            .field("name", &self.name)
            .field("default_version", &self.default_version)
            .field("allow_version_override", &self.allow_version_override)
            .field("allow_branch_name", &self.allow_branch_name)
            .field("allow_version_envvar", &self.allow_version_envvar)
            .field("implicit", &self.implicit)
            .field("retriever", &self.retriever.scm_key())
            .field("caching", &self.caching)
            .finish()
    }
}

impl LibraryConfiguration {
    /// Creates a configuration. The name is trimmed and must not be blank.
    pub fn new(name: &str, retriever: Retriever) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidConfiguration(
                "library name must not be blank".to_string(),
            ));
        }
        Ok(Self {
            name: name.to_string(),
            default_version: None,
            allow_version_override: true,
            allow_branch_name: false,
            allow_version_envvar: false,
            include_in_changelog: true,
            implicit: false,
            retriever,
            caching: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_default_version(mut self, version: impl Into<String>) -> Self {
        let version = version.into();
        let trimmed = version.trim();
        self.default_version = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
        self
    }

    pub fn with_override(mut self, allow: bool) -> Self {
        self.allow_version_override = allow;
        self
    }

    pub fn with_branch_name(mut self, allow: bool) -> Self {
        self.allow_branch_name = allow;
        self
    }

    pub fn with_version_envvar(mut self, allow: bool) -> Self {
        self.allow_version_envvar = allow;
        self
    }

    pub fn with_changelog(mut self, include: bool) -> Self {
        self.include_in_changelog = include;
        self
    }

    pub fn with_implicit(mut self, implicit: bool) -> Self {
        self.implicit = implicit;
        self
    }

    pub fn with_caching(mut self, caching: LibraryCachingConfiguration) -> Self {
        self.caching = Some(caching);
        self
    }
}

/// How a library's retriever is written in the settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RetrieverDefinition {
    /// Versions are heads, tags or commits discovered through the SCM.
    ScmSource {
        scm: ScmDefinition,
        #[serde(default)]
        library_path: Option<String>,
    },
    /// Versions are substituted into a fixed SCM reference.
    Scm {
        scm: ScmDefinition,
        #[serde(default)]
        library_path: Option<String>,
    },
}

/// Library entry as defined in `pipelib.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryDefinition {
    pub name: String,
    #[serde(default)]
    pub default_version: Option<String>,
    #[serde(default = "default_true")]
    pub allow_version_override: bool,
    #[serde(default)]
    pub allow_branch_name: bool,
    #[serde(default)]
    pub allow_version_envvar: bool,
    #[serde(default = "default_true")]
    pub include_in_changelog: bool,
    #[serde(default)]
    pub implicit: bool,
    pub retriever: RetrieverDefinition,
    #[serde(default)]
    pub caching: Option<LibraryCachingConfiguration>,
}

impl LibraryDefinition {
    /// Instantiates the retriever through `registry` and validates the entry.
    pub fn to_configuration(&self, registry: &ScmRegistry) -> Result<LibraryConfiguration> {
        let retriever = match &self.retriever {
            RetrieverDefinition::ScmSource { scm, library_path } => {
                Retriever::ScmSource(ScmSourceRetriever::new(
                    registry.source(scm)?,
                    library_path.clone(),
                )?)
            }
            RetrieverDefinition::Scm { scm, library_path } => {
                Retriever::Scm(ScmRetriever::new(registry.scm(scm)?, library_path.clone())?)
            }
        };

        let mut config = LibraryConfiguration::new(&self.name, retriever)?
            .with_override(self.allow_version_override)
            .with_branch_name(self.allow_branch_name)
            .with_version_envvar(self.allow_version_envvar)
            .with_changelog(self.include_in_changelog)
            .with_implicit(self.implicit);
        if let Some(version) = &self.default_version {
            config = config.with_default_version(version.clone());
        }
        if let Some(caching) = &self.caching {
            config = config.with_caching(caching.clone());
        }
        Ok(config)
    }
}

/// Libraries configured on one folder or job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FolderDefinition {
    #[serde(default)]
    pub libraries: Vec<LibraryDefinition>,
}

/// Top-level `pipelib.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub workspaces_dir: Option<PathBuf>,
    #[serde(default)]
    pub scm_checkout_retry_count: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default)]
    pub include_src_test_in_libraries: bool,
    #[serde(default)]
    pub libraries: Vec<LibraryDefinition>,
    #[serde(default)]
    pub folders: BTreeMap<String, FolderDefinition>,
}

/// Engine-wide options that are not tied to one library.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub cache_dir: PathBuf,
    pub workspaces_dir: PathBuf,
    pub retry: RetryPolicy,
    pub include_src_test: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        let base = default_data_dir();
        Self {
            cache_dir: base.join("cache"),
            workspaces_dir: base.join("workspaces"),
            retry: RetryPolicy::default(),
            include_src_test: false,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("pipelib"))
        .unwrap_or_else(|| std::env::temp_dir().join("pipelib"))
}

/// Runtime settings: every configured library plus engine options.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub global: Vec<LibraryConfiguration>,
    /// Keyed by folder or job full name.
    pub folders: BTreeMap<String, Vec<LibraryConfiguration>>,
    pub options: EngineOptions,
}

impl Settings {
    pub fn from_file(path: &Path, registry: &ScmRegistry) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: SettingsFile = toml::from_str(&content).map_err(|error| Error::Toml {
            error,
            context: path.display().to_string(),
        })?;
        Self::from_definitions(&file, registry)
    }

    pub fn from_definitions(file: &SettingsFile, registry: &ScmRegistry) -> Result<Self> {
        let global = file
            .libraries
            .iter()
            .map(|d| d.to_configuration(registry))
            .collect::<Result<Vec<_>>>()?;

        let mut folders = BTreeMap::new();
        for (path, folder) in &file.folders {
            let libraries = folder
                .libraries
                .iter()
                .map(|d| d.to_configuration(registry))
                .collect::<Result<Vec<_>>>()?;
            folders.insert(path.trim_matches('/').to_string(), libraries);
        }

        let defaults = EngineOptions::default();
        let settings = Self {
            global,
            folders,
            options: EngineOptions {
                cache_dir: file.cache_dir.clone().unwrap_or(defaults.cache_dir),
                workspaces_dir: file.workspaces_dir.clone().unwrap_or(defaults.workspaces_dir),
                retry: RetryPolicy::new(
                    file.scm_checkout_retry_count,
                    Duration::from_secs(file.retry_delay_secs),
                ),
                include_src_test: file.include_src_test_in_libraries,
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects duplicate library names within a single scope.
    pub fn validate(&self) -> Result<()> {
        check_unique("global", &self.global)?;
        for (path, libraries) in &self.folders {
            check_unique(path, libraries)?;
        }
        Ok(())
    }

    pub fn folder_libraries(&self, path: &str) -> &[LibraryConfiguration] {
        self.folders.get(path).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn check_unique(scope: &str, libraries: &[LibraryConfiguration]) -> Result<()> {
    let mut seen = HashSet::new();
    for library in libraries {
        if !seen.insert(library.name()) {
            return Err(Error::InvalidConfiguration(format!(
                "library {} is defined more than once in {}",
                library.name(),
                scope
            )));
        }
    }
    Ok(())
}

/// Source of the settings a build resolves against.
pub trait ConfigurationProvider: Send + Sync {
    /// A consistent view that concurrent administrative updates cannot change.
    fn snapshot(&self) -> Arc<Settings>;
}

/// Versioned, copy-on-write settings holder.
///
/// Readers get an `Arc` to an immutable snapshot; writers swap in a complete
/// new snapshot, so no build ever observes a half-updated library list.
pub struct SettingsStore {
    current: RwLock<(u64, Arc<Settings>)>,
}

impl SettingsStore {
    pub fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            current: RwLock::new((1, Arc::new(settings))),
        })
    }

    pub fn version(&self) -> u64 {
        self.current.read().map(|c| c.0).unwrap_or(0)
    }

    /// Replaces the settings wholesale and returns the new version.
    pub fn replace(&self, settings: Settings) -> Result<u64> {
        settings.validate()?;
        let mut current = self
            .current
            .write()
            .map_err(|e| Error::MutexLock(e.to_string()))?;
        current.0 += 1;
        current.1 = Arc::new(settings);
        Ok(current.0)
    }

    /// Applies `edit` to a copy of the current settings and publishes the result.
    pub fn update<F>(&self, edit: F) -> Result<u64>
    where
        F: FnOnce(&mut Settings) -> Result<()>,
    {
        let mut current = self
            .current
            .write()
            .map_err(|e| Error::MutexLock(e.to_string()))?;
        let mut next = Settings::clone(&current.1);
        edit(&mut next)?;
        next.validate()?;
        current.0 += 1;
        current.1 = Arc::new(next);
        Ok(current.0)
    }
}

impl ConfigurationProvider for SettingsStore {
    fn snapshot(&self) -> Arc<Settings> {
        match self.current.read() {
            Ok(current) => Arc::clone(&current.1),
            Err(poisoned) => Arc::clone(&poisoned.into_inner().1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusion_wins_over_inclusion() {
        let caching = LibraryCachingConfiguration::new(30)
            .with_excluded("SNAPSHOT test")
            .with_included("1.");
        assert!(caching.should_cache("1.2"));
        assert!(!caching.should_cache("1.2-SNAPSHOT"));
        assert!(!caching.should_cache("2.0"));
    }

    #[test]
    fn test_empty_include_list_includes_everything() {
        let caching = LibraryCachingConfiguration::new(0);
        assert!(caching.is_included("anything"));
        assert!(!caching.is_excluded("anything"));
        assert_eq!(caching.refresh_interval(), None);
    }

    #[test]
    fn test_parse_settings_file() {
        let toml = r#"
scm_checkout_retry_count = 2

[[libraries]]
name = "utils"
default_version = "main"
allow_version_override = false

[libraries.retriever]
type = "scm-source"
scm = { kind = "git", remote = "https://example.com/utils.git" }

[libraries.caching]
refresh_minutes = 30
excluded_versions = "test"

[folders."team-a"]
[[folders."team-a".libraries]]
name = "team-utils"

[folders."team-a".libraries.retriever]
type = "scm"
library_path = "lib/"
scm = { kind = "local", remote = "/srv/libs", reference = "${library.team-utils.version}" }
"#;
        let file: SettingsFile = toml::from_str(toml).unwrap();
        assert_eq!(file.scm_checkout_retry_count, 2);
        assert_eq!(file.retry_delay_secs, 10);
        assert_eq!(file.libraries.len(), 1);
        let utils = &file.libraries[0];
        assert!(!utils.allow_version_override);
        assert!(utils.include_in_changelog);
        assert_eq!(utils.caching.as_ref().unwrap().refresh_minutes, 30);
        let team = &file.folders["team-a"].libraries[0];
        assert!(matches!(
            team.retriever,
            RetrieverDefinition::Scm { ref library_path, .. } if library_path.as_deref() == Some("lib/")
        ));
    }
}
