#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use pipelib_core::cache::CacheManager;
use pipelib_core::config::{LibraryConfiguration, Settings, SettingsStore};
use pipelib_core::context::{BuildContext, JobRef};
use pipelib_core::coordinator::LibraryResolutionCoordinator;
use pipelib_core::retriever::{Retriever, ScmRetriever, ScmSourceRetriever};
use pipelib_core::retry::RetryPolicy;
use pipelib_core::scm::{Revision, Scm, ScmSource};
use pipelib_core::workspace::CheckoutWorkspaces;
use pipelib_core::{Error, Result};
use tempfile::TempDir;

/// In-memory SCM: each version is a set of files.
pub struct FakeScm {
    key: String,
    versions: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    fetches: AtomicUsize,
    lookups: AtomicUsize,
    transient_failures: AtomicUsize,
    checkout_delay: Mutex<Duration>,
}

impl FakeScm {
    pub fn new(key: &str) -> Arc<Self> {
        Arc::new(Self {
            key: key.to_string(),
            versions: Mutex::new(BTreeMap::new()),
            fetches: AtomicUsize::new(0),
            lookups: AtomicUsize::new(0),
            transient_failures: AtomicUsize::new(0),
            checkout_delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Adds a version containing `files` (relative path to content).
    pub fn with_version(self: Arc<Self>, version: &str, files: &[(&str, &str)]) -> Arc<Self> {
        let files = files
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect();
        self.versions
            .lock()
            .unwrap()
            .insert(version.to_string(), files);
        self
    }

    /// The next `count` lookups or checkouts fail with a transient error.
    pub fn fail_next(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_checkout_delay(&self, delay: Duration) {
        *self.checkout_delay.lock().unwrap() = delay;
    }

    /// Successful checkouts so far.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self, library: &str) -> Result<()> {
        let injected = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(Error::transient(library, "simulated network failure"))
        } else {
            Ok(())
        }
    }

    fn write_version(&self, library: &str, version: &str, dest: &Path) -> Result<()> {
        let files = self
            .versions
            .lock()
            .unwrap()
            .get(version)
            .cloned()
            .ok_or_else(|| Error::permanent(library, format!("unknown version {}", version)))?;
        let delay = *self.checkout_delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        for (path, content) in files {
            let path = dest.join(path);
            fs::create_dir_all(path.parent().unwrap())?;
            fs::write(path, content)?;
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl ScmSource for FakeScm {
    fn kind(&self) -> &'static str {
        "fake"
    }

    fn key(&self) -> String {
        self.key.clone()
    }

    fn fetch_revision(&self, library: &str, version: &str, _owner: &JobRef) -> Result<Option<Revision>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.maybe_fail(library)?;
        if self.versions.lock().unwrap().contains_key(version) {
            Ok(Some(Revision {
                name: version.to_string(),
                id: format!("{}-{}", self.key, version),
            }))
        } else {
            Ok(None)
        }
    }

    fn checkout(&self, library: &str, revision: &Revision, dest: &Path, _changelog: bool) -> Result<()> {
        self.maybe_fail(library)?;
        self.write_version(library, &revision.name, dest)
    }
}

impl Scm for FakeScm {
    fn kind(&self) -> &'static str {
        "fake"
    }

    fn key(&self) -> String {
        self.key.clone()
    }

    fn checkout(
        &self,
        library: &str,
        parameters: &BTreeMap<String, String>,
        dest: &Path,
        _changelog: bool,
    ) -> Result<()> {
        self.maybe_fail(library)?;
        let version = parameters
            .get(&format!("library.{}.version", library))
            .cloned()
            .unwrap_or_default();
        self.write_version(library, &version, dest)
    }
}

pub fn source_library(name: &str, scm: Arc<FakeScm>) -> LibraryConfiguration {
    let retriever = Retriever::ScmSource(ScmSourceRetriever::new(scm, None).unwrap());
    LibraryConfiguration::new(name, retriever).unwrap()
}

pub fn scm_library(name: &str, scm: Arc<FakeScm>) -> LibraryConfiguration {
    let retriever = Retriever::Scm(ScmRetriever::new(scm, None).unwrap());
    LibraryConfiguration::new(name, retriever).unwrap()
}

/// A coordinator over temporary cache and workspace roots.
pub struct Harness {
    pub temp: TempDir,
    pub store: Arc<SettingsStore>,
    pub coordinator: LibraryResolutionCoordinator,
}

impl Harness {
    pub fn new(global: Vec<LibraryConfiguration>) -> Self {
        Self::with_folders(global, BTreeMap::new())
    }

    pub fn with_folders(
        global: Vec<LibraryConfiguration>,
        folders: BTreeMap<String, Vec<LibraryConfiguration>>,
    ) -> Self {
        let temp = TempDir::new().unwrap();
        let mut settings = Settings {
            global,
            folders,
            ..Default::default()
        };
        settings.options.cache_dir = temp.path().join("cache");
        settings.options.workspaces_dir = temp.path().join("workspaces");
        settings.options.retry = RetryPolicy::new(0, Duration::ZERO);

        let cache = CacheManager::new(
            &settings.options.cache_dir,
            CheckoutWorkspaces::new(&settings.options.workspaces_dir),
        )
        .unwrap();
        let store = Arc::new(SettingsStore::new(settings).unwrap());
        let coordinator = LibraryResolutionCoordinator::new(store.clone(), Arc::new(cache));
        Self {
            temp,
            store,
            coordinator,
        }
    }

    pub fn set_retries(&self, retries: u32) {
        self.store
            .update(|s| {
                s.options.retry = RetryPolicy::new(retries, Duration::ZERO);
                Ok(())
            })
            .unwrap();
    }

    pub fn build_dir(&self, build: &str) -> PathBuf {
        self.temp.path().join("builds").join(build)
    }

    pub fn context(&self, job: &str, build: &str) -> BuildContext {
        BuildContext::new(JobRef::new(job), self.build_dir(build))
    }
}
