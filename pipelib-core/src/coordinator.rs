//! Resolution of a build's declared libraries, and the per-build arena owning the result.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;

use crate::bundle::{self, BundleOptions};
use crate::cache::{CacheManager, FetchEnv, LibraryFetch};
use crate::config::{ConfigurationProvider, LibraryConfiguration, Settings};
use crate::context::{BuildContext, JobRef, TrustScope};
use crate::error::{Error, Result};
use crate::record::{LibrariesRecord, LibraryRecord};
use crate::report::BuildReporter;
use crate::version::VersionResolver;

/// Directory inside a build directory holding the build's bundles.
pub const LIBS_DIR: &str = "libs";

/// A library requested by a build, as `name` or `name@version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryUse {
    pub name: String,
    pub version: Option<String>,
}

impl LibraryUse {
    pub fn new(name: impl Into<String>, version: Option<&str>) -> Self {
        Self {
            name: name.into(),
            version: version.map(str::to_string),
        }
    }

    /// Parses `name@version`, splitting at the first `@`.
    pub fn parse(spec: &str) -> Result<Self> {
        let (name, version) = match spec.split_once('@') {
            Some((name, version)) => (name.trim(), Some(version.trim())),
            None => (spec.trim(), None),
        };
        if name.is_empty() {
            return Err(Error::InvalidConfiguration(format!(
                "library name is missing in '{}'",
                spec
            )));
        }
        Ok(Self::new(name, version.filter(|v| !v.is_empty())))
    }
}

impl FromStr for LibraryUse {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for LibraryUse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}@{}", self.name, version),
            None => f.write_str(&self.name),
        }
    }
}

/// Supplies library configurations that are not statically configured.
///
/// Resolvers are consulted in ascending priority order for names that the
/// job, folder and global settings do not define.
pub trait LibraryResolver: Send + Sync {
    fn name(&self) -> &str;

    /// Whether libraries from this resolver run with full trust.
    fn is_trusted(&self) -> bool;

    /// Configurations offered to `job`. `requested` maps still-unresolved
    /// names to their requested versions and is empty when only implicit
    /// libraries are wanted.
    fn for_job(
        &self,
        job: &JobRef,
        requested: &IndexMap<String, Option<String>>,
    ) -> Result<Vec<LibraryConfiguration>>;
}

/// A configuration together with the scope it was found in.
#[derive(Debug, Clone)]
pub struct ScopedLibrary {
    pub config: LibraryConfiguration,
    pub scope: TrustScope,
}

struct Lookup {
    found: IndexMap<String, ScopedLibrary>,
    missing: Vec<String>,
}

/// Resolves and loads the libraries of builds.
pub struct LibraryResolutionCoordinator {
    provider: Arc<dyn ConfigurationProvider>,
    cache: Arc<CacheManager>,
    resolvers: RwLock<Vec<(i32, Arc<dyn LibraryResolver>)>>,
}

impl LibraryResolutionCoordinator {
    pub fn new(provider: Arc<dyn ConfigurationProvider>, cache: Arc<CacheManager>) -> Self {
        Self {
            provider,
            cache,
            resolvers: RwLock::new(Vec::new()),
        }
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    /// Registers a dynamic resolver. Lower priorities are consulted first.
    pub fn register_resolver(&self, priority: i32, resolver: Arc<dyn LibraryResolver>) -> Result<()> {
        let mut resolvers = self
            .resolvers
            .write()
            .map_err(|e| Error::MutexLock(e.to_string()))?;
        tracing::debug!(resolver = resolver.name(), priority, "registered library resolver");
        resolvers.push((priority, resolver));
        resolvers.sort_by_key(|(priority, _)| *priority);
        Ok(())
    }

    fn dynamic_resolvers(&self) -> Result<Vec<Arc<dyn LibraryResolver>>> {
        let resolvers = self
            .resolvers
            .read()
            .map_err(|e| Error::MutexLock(e.to_string()))?;
        Ok(resolvers.iter().map(|(_, r)| Arc::clone(r)).collect())
    }

    /// Resolves and loads every declared library of a build, plus implicit ones.
    ///
    /// Later declarations of an already declared name are ignored. Libraries are
    /// loaded in declaration order, implicit libraries last.
    ///
    /// # Errors
    ///
    /// Fails on the first library that cannot be found, versioned or fetched.
    pub fn resolve_all(
        &self,
        uses: &[LibraryUse],
        ctx: &BuildContext,
        reporter: &dyn BuildReporter,
    ) -> Result<BuildLibraries> {
        let settings = self.provider.snapshot();

        let mut requested: IndexMap<String, Option<String>> = IndexMap::new();
        for library in uses {
            if requested.contains_key(&library.name) {
                reporter.line(&format!(
                    "Only using first definition of library {}",
                    library.name
                ));
                continue;
            }
            requested.insert(library.name.clone(), library.version.clone());
        }

        let resolvers = self.dynamic_resolvers()?;
        let Lookup { mut found, missing } = self.lookup(&settings, &resolvers, &ctx.job, &requested)?;
        if !missing.is_empty() {
            return Err(not_found(missing, resolvers.is_empty()));
        }

        for library in self.implicit_libraries(&settings, &resolvers, &ctx.job)? {
            let name = library.config.name().to_string();
            if !found.contains_key(&name) {
                requested.insert(name.clone(), None);
                found.insert(name, library);
            }
        }

        let mut libraries = BuildLibraries::open(&ctx.build_dir)?;
        for (name, version) in &requested {
            if let Some(library) = found.get(name) {
                self.load_one(&settings, &mut libraries, library, version.as_deref(), ctx, reporter)?;
            }
        }
        Ok(libraries)
    }

    /// Loads one more library into a running build.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LibraryNotFound`] if no scope defines the library.
    pub fn load(
        &self,
        libraries: &mut BuildLibraries,
        library: &LibraryUse,
        ctx: &BuildContext,
        reporter: &dyn BuildReporter,
    ) -> Result<LibraryRecord> {
        if let Some(existing) = libraries.record(&library.name) {
            reporter.line(&format!(
                "Only using first definition of library {}",
                library.name
            ));
            return Ok(existing.clone());
        }

        let settings = self.provider.snapshot();
        let mut requested = IndexMap::new();
        requested.insert(library.name.clone(), library.version.clone());
        let resolvers = self.dynamic_resolvers()?;
        let mut lookup = self.lookup(&settings, &resolvers, &ctx.job, &requested)?;
        let scoped = lookup
            .found
            .swap_remove(&library.name)
            .ok_or_else(|| Error::LibraryNotFound {
                name: library.name.clone(),
            })?;
        self.load_one(&settings, libraries, &scoped, library.version.as_deref(), ctx, reporter)
    }

    fn load_one(
        &self,
        settings: &Settings,
        libraries: &mut BuildLibraries,
        library: &ScopedLibrary,
        requested: Option<&str>,
        ctx: &BuildContext,
        reporter: &dyn BuildReporter,
    ) -> Result<LibraryRecord> {
        let config = &library.config;
        let version = VersionResolver::resolve(config, requested, ctx)?;
        reporter.line(&format!("Loading library {}@{}", config.name(), version));

        let fetch = LibraryFetch {
            config,
            version: &version,
            scope: &library.scope,
            changelog: config.include_in_changelog,
        };
        let directory_name = fetch.storage_key(true)?.directory_name();
        let target = libraries.libs_dir.join(format!("{}.tar.zst", directory_name));
        let env = FetchEnv {
            job: &ctx.job,
            retry: settings.options.retry,
            bundle: BundleOptions {
                include_src_test: settings.options.include_src_test,
            },
            cancel: &ctx.cancel,
            reporter,
        };
        let materialized = self.cache.materialize(&fetch, &target, &env)?;

        let record = LibraryRecord {
            name: config.name().to_string(),
            version: version.clone(),
            variables: materialized.summary.variables,
            trusted: library.scope.is_trusted(),
            changelog: config.include_in_changelog,
            caching: config.caching.clone(),
            directory_name,
        };
        libraries.push(record.clone(), target)?;
        Ok(record)
    }

    /// Finds configurations for `requested`: job and folders nearest first,
    /// then global settings, then dynamic resolvers.
    fn lookup(
        &self,
        settings: &Settings,
        resolvers: &[Arc<dyn LibraryResolver>],
        job: &JobRef,
        requested: &IndexMap<String, Option<String>>,
    ) -> Result<Lookup> {
        let mut found = IndexMap::new();
        let mut remaining: IndexMap<String, Option<String>> = IndexMap::new();

        for name in requested.keys() {
            match find_static(settings, job, name) {
                Some(library) => {
                    found.insert(name.clone(), library);
                }
                None => {
                    remaining.insert(name.clone(), requested[name].clone());
                }
            }
        }

        for resolver in resolvers {
            if remaining.is_empty() {
                break;
            }
            let scope = dynamic_scope(resolver.as_ref(), job);
            for config in resolver.for_job(job, &remaining)? {
                let name = config.name().to_string();
                if remaining.shift_remove(&name).is_some() {
                    tracing::debug!(library = %name, resolver = resolver.name(), "resolved dynamically");
                    found.insert(
                        name,
                        ScopedLibrary {
                            config,
                            scope: scope.clone(),
                        },
                    );
                }
            }
        }

        Ok(Lookup {
            found,
            missing: remaining.into_keys().collect(),
        })
    }

    fn implicit_libraries(
        &self,
        settings: &Settings,
        resolvers: &[Arc<dyn LibraryResolver>],
        job: &JobRef,
    ) -> Result<Vec<ScopedLibrary>> {
        let mut implicit: IndexMap<String, ScopedLibrary> = IndexMap::new();
        let mut offer = |library: ScopedLibrary| {
            if library.config.implicit && !implicit.contains_key(library.config.name()) {
                implicit.insert(library.config.name().to_string(), library);
            }
        };

        for path in job.scope_chain() {
            for config in settings.folder_libraries(&path) {
                offer(ScopedLibrary {
                    config: config.clone(),
                    scope: TrustScope::Folder(path.clone()),
                });
            }
        }
        for config in &settings.global {
            offer(ScopedLibrary {
                config: config.clone(),
                scope: TrustScope::Global,
            });
        }
        let none = IndexMap::new();
        for resolver in resolvers {
            let scope = dynamic_scope(resolver.as_ref(), job);
            for config in resolver.for_job(job, &none)? {
                offer(ScopedLibrary {
                    config,
                    scope: scope.clone(),
                });
            }
        }
        Ok(implicit.into_values().collect())
    }
}

fn find_static(settings: &Settings, job: &JobRef, name: &str) -> Option<ScopedLibrary> {
    for path in job.scope_chain() {
        if let Some(config) = settings
            .folder_libraries(&path)
            .iter()
            .find(|c| c.name() == name)
        {
            return Some(ScopedLibrary {
                config: config.clone(),
                scope: TrustScope::Folder(path),
            });
        }
    }
    settings
        .global
        .iter()
        .find(|c| c.name() == name)
        .map(|config| ScopedLibrary {
            config: config.clone(),
            scope: TrustScope::Global,
        })
}

fn dynamic_scope(resolver: &dyn LibraryResolver, job: &JobRef) -> TrustScope {
    TrustScope::Resolver {
        resolver: resolver.name().to_string(),
        job: job.full_name().to_string(),
        trusted: resolver.is_trusted(),
    }
}

fn not_found(mut missing: Vec<String>, static_only: bool) -> Error {
    if static_only && missing.len() == 1 {
        Error::LibraryNotFound {
            name: missing.remove(0),
        }
    } else {
        Error::LibrariesNotFound { names: missing }
    }
}

/// Libraries loaded by one build.
///
/// Owns the build's `libs/` directory; it is removed by [`BuildLibraries::close`]
/// or on drop. The persisted `libraries.json` record is kept.
pub struct BuildLibraries {
    build_dir: PathBuf,
    libs_dir: PathBuf,
    record: LibrariesRecord,
    bundles: Vec<PathBuf>,
    closed: bool,
}

impl BuildLibraries {
    /// Prepares an empty `libs/` directory under `build_dir`.
    pub fn open(build_dir: &Path) -> Result<Self> {
        let libs_dir = build_dir.join(LIBS_DIR);
        if libs_dir.exists() {
            fs::remove_dir_all(&libs_dir)?;
        }
        fs::create_dir_all(&libs_dir)?;
        Ok(Self {
            build_dir: build_dir.to_path_buf(),
            libs_dir,
            record: LibrariesRecord::default(),
            bundles: Vec::new(),
            closed: false,
        })
    }

    pub fn libs_dir(&self) -> &Path {
        &self.libs_dir
    }

    pub fn records(&self) -> &[LibraryRecord] {
        &self.record.libraries
    }

    pub fn record(&self, name: &str) -> Option<&LibraryRecord> {
        self.record.get(name)
    }

    /// Bundle file of a loaded library.
    pub fn bundle(&self, name: &str) -> Option<&Path> {
        self.record
            .libraries
            .iter()
            .position(|r| r.name == name)
            .map(|i| self.bundles[i].as_path())
    }

    /// Every exported global variable as `(library, variable)`.
    pub fn variables(&self) -> Vec<(&str, &str)> {
        self.record
            .libraries
            .iter()
            .flat_map(|r| r.variables.iter().map(move |v| (r.name.as_str(), v.as_str())))
            .collect()
    }

    fn push(&mut self, record: LibraryRecord, bundle: PathBuf) -> Result<()> {
        self.record.libraries.push(record);
        self.bundles.push(bundle);
        self.record.save(&self.build_dir)
    }

    /// Reads `resources/<path>` from whichever loaded library provides it.
    ///
    /// # Errors
    ///
    /// - [`Error::PathTraversal`] for absolute paths or `..` segments
    /// - [`Error::ResourceNotFound`] when no library has the resource
    /// - [`Error::AmbiguousResource`] when more than one does
    pub fn resource(&self, path: &str) -> Result<Vec<u8>> {
        if path.is_empty()
            || path.starts_with('/')
            || path.starts_with('\\')
            || Path::new(path).is_absolute()
            || path.split(['/', '\\']).any(|segment| segment == "..")
        {
            return Err(Error::PathTraversal(path.to_string()));
        }

        let mut hits = Vec::new();
        for (record, bundle) in self.record.libraries.iter().zip(&self.bundles) {
            if let Some(data) = bundle::read_resource(bundle, path)? {
                hits.push((record.name.clone(), data));
            }
        }
        match hits.len() {
            0 => Err(Error::ResourceNotFound(path.to_string())),
            1 => Ok(hits.remove(0).1),
            _ => Err(Error::AmbiguousResource {
                resource: path.to_string(),
                libraries: hits.into_iter().map(|(name, _)| name).collect(),
            }),
        }
    }

    /// Tears down the build's bundles.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        if self.libs_dir.exists() {
            fs::remove_dir_all(&self.libs_dir)?;
        }
        Ok(())
    }
}

impl Drop for BuildLibraries {
    fn drop(&mut self) {
        if !self.closed && self.libs_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&self.libs_dir) {
                tracing::warn!(path = %self.libs_dir.display(), error = %e, "failed to remove build libraries");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_library_use() {
        assert_eq!(LibraryUse::parse("utils").unwrap(), LibraryUse::new("utils", None));
        assert_eq!(
            LibraryUse::parse(" utils @ 1.0 ").unwrap(),
            LibraryUse::new("utils", Some("1.0"))
        );
        assert_eq!(
            LibraryUse::parse("utils@feature@x").unwrap(),
            LibraryUse::new("utils", Some("feature@x"))
        );
        assert_eq!(LibraryUse::parse("utils@").unwrap().version, None);
        assert!(LibraryUse::parse("@1.0").is_err());
        assert_eq!(LibraryUse::new("a", Some("b")).to_string(), "a@b");
    }

    #[test]
    fn test_not_found_message_selection() {
        assert_eq!(
            not_found(vec!["x".to_string()], true).to_string(),
            "No library named x found"
        );
        assert_eq!(
            not_found(vec!["x".to_string(), "y".to_string()], false).to_string(),
            "Could not find any definition of libraries [x, y]"
        );
    }

    #[test]
    fn test_resource_rejects_traversal() {
        let temp = tempfile::TempDir::new().unwrap();
        let libraries = BuildLibraries::open(temp.path()).unwrap();
        for path in ["../secret", "/etc/passwd", "a/../../b", "a\\..\\b", ""] {
            assert!(matches!(libraries.resource(path), Err(Error::PathTraversal(_))));
        }
        assert!(matches!(
            libraries.resource("conf/app.yaml"),
            Err(Error::ResourceNotFound(_))
        ));
    }

    #[test]
    fn test_close_removes_libs_dir() {
        let temp = tempfile::TempDir::new().unwrap();
        let libraries = BuildLibraries::open(temp.path()).unwrap();
        let libs = libraries.libs_dir().to_path_buf();
        assert!(libs.is_dir());
        libraries.close().unwrap();
        assert!(!libs.exists());
    }
}
