//! On-disk cache of library bundles.
//!
//! Layout under the cache root:
//!
//! ```text
//! <slot>/library.tar.zst   bundle
//! <slot>/slot.json         version and bundle summary
//! <slot>.name              original library name
//! <slot>.scm               SCM identity key the bundle came from
//! <slot>.timestamp         population time, epoch seconds
//! .tmp/                    scratch space for in-flight populations
//! ```
//!
//! `<slot>` is a [`StorageKey`] digest. A slot is only written while its lock
//! is held, and only after a complete bundle has been built in `.tmp/`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::bundle::{BundleOptions, BundleSummary};
use crate::config::LibraryConfiguration;
use crate::context::{CancelToken, JobRef, TrustScope};
use crate::error::{Error, Result};
use crate::naming::StorageKey;
use crate::report::BuildReporter;
use crate::retriever::{FetchContext, LibraryRetriever, RetrieveRequest};
use crate::retry::RetryPolicy;
use crate::workspace::CheckoutWorkspaces;

const BUNDLE_FILE: &str = "library.tar.zst";
const MANIFEST_FILE: &str = "slot.json";
const TMP_DIR: &str = ".tmp";
const NAME_MARKER: &str = "name";
const SCM_MARKER: &str = "scm";
const TIMESTAMP_MARKER: &str = "timestamp";

/// One library version to materialize.
#[derive(Debug, Clone, Copy)]
pub struct LibraryFetch<'a> {
    pub config: &'a LibraryConfiguration,
    pub version: &'a str,
    pub scope: &'a TrustScope,
    pub changelog: bool,
}

impl LibraryFetch<'_> {
    /// Storage key of this fetch; `with_version` distinguishes cache slots from checkouts.
    pub fn storage_key(&self, with_version: bool) -> Result<StorageKey> {
        let mut builder = StorageKey::builder()
            .name(self.config.name())
            .scope(self.scope.id())
            .library_path(self.config.retriever.library_path());
        if with_version {
            builder = builder.version(self.version);
        }
        builder.build()
    }
}

/// Build-side inputs of a fetch.
pub struct FetchEnv<'a> {
    pub job: &'a JobRef,
    pub retry: RetryPolicy,
    pub bundle: BundleOptions,
    pub cancel: &'a CancelToken,
    pub reporter: &'a dyn BuildReporter,
}

/// How a bundle was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// The library has no caching configuration.
    Uncached,
    /// The version is excluded from caching.
    Excluded,
    /// Fetched and stored in a new slot.
    Populated,
    /// Copied from an existing slot.
    Hit,
}

/// A bundle delivered to its target.
#[derive(Debug, Clone)]
pub struct Materialized {
    pub summary: BundleSummary,
    pub outcome: CacheOutcome,
}

#[derive(Debug, Serialize, Deserialize)]
struct SlotManifest {
    version: String,
    summary: BundleSummary,
}

/// Administrative view of one slot.
#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub directory_name: String,
    pub library: Option<String>,
    pub version: Option<String>,
    pub scm_key: Option<String>,
    pub cached_at: Option<SystemTime>,
    pub size: u64,
}

impl SlotInfo {
    pub fn age(&self) -> Option<Duration> {
        self.cached_at
            .and_then(|t| SystemTime::now().duration_since(t).ok())
    }
}

/// Counters for one process lifetime.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub populated: AtomicU64,
    pub refreshed: AtomicU64,
    pub uncached: AtomicU64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.populated.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

enum SlotState {
    Missing,
    Empty,
    ForeignScm,
    Stale(u64),
    Fresh,
}

/// Maps library versions to cache slots and fetches whatever is missing.
pub struct CacheManager {
    root: PathBuf,
    workspaces: CheckoutWorkspaces,
    slot_locks: DashMap<String, Arc<Mutex<()>>>,
    stats: CacheStats,
}

impl CacheManager {
    /// Opens a cache at `root`, discarding scratch directories left by earlier crashes.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache root cannot be created.
    pub fn new(root: impl Into<PathBuf>, workspaces: CheckoutWorkspaces) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let tmp = root.join(TMP_DIR);
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
            tracing::debug!(path = %tmp.display(), "removed stale cache scratch space");
        }
        fs::create_dir_all(&tmp)?;
        Ok(Self {
            root,
            workspaces,
            slot_locks: DashMap::new(),
            stats: CacheStats::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workspaces(&self) -> &CheckoutWorkspaces {
        &self.workspaces
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Delivers the bundle for `fetch` to `target`, from cache when allowed.
    ///
    /// # Errors
    ///
    /// Propagates fetch and bundle errors; returns [`Error::CacheCorrupted`]
    /// if a freshly populated slot yields an empty bundle.
    pub fn materialize(
        &self,
        fetch: &LibraryFetch<'_>,
        target: &Path,
        env: &FetchEnv<'_>,
    ) -> Result<Materialized> {
        let name = fetch.config.name();
        let version = fetch.version;

        let caching = match &fetch.config.caching {
            Some(caching) => caching,
            None => {
                self.stats.uncached.fetch_add(1, Ordering::Relaxed);
                let summary = self.fetch_fresh(fetch, target, env)?;
                return Ok(Materialized {
                    summary,
                    outcome: CacheOutcome::Uncached,
                });
            }
        };

        if !caching.should_cache(version) {
            env.reporter
                .line(&format!("Library {}@{} is excluded from caching.", name, version));
            self.stats.uncached.fetch_add(1, Ordering::Relaxed);
            let summary = self.fetch_fresh(fetch, target, env)?;
            return Ok(Materialized {
                summary,
                outcome: CacheOutcome::Excluded,
            });
        }

        let slot = fetch.storage_key(true)?.directory_name();
        self.with_slot_lock(&slot, || {
            self.materialize_locked(fetch, &slot, caching.refresh_interval(), target, env)
        })
    }

    /// Serves or repopulates `slot`. The caller holds the slot lock.
    fn materialize_locked(
        &self,
        fetch: &LibraryFetch<'_>,
        slot: &str,
        refresh: Option<Duration>,
        target: &Path,
        env: &FetchEnv<'_>,
    ) -> Result<Materialized> {
        let name = fetch.config.name();
        let version = fetch.version;
        let scm_key = fetch.config.retriever.scm_key();
        match self.inspect(slot, &scm_key, refresh) {
            SlotState::Missing | SlotState::Fresh => {}
            SlotState::Empty => {
                env.reporter.line(&format!(
                    "Library {}@{} should have been cached but is empty, re-caching.",
                    name, version
                ));
                self.remove_slot(slot)?;
            }
            SlotState::ForeignScm => {
                env.reporter.line(&format!(
                    "Library {}@{} was cached from a different source, clearing.",
                    name, version
                ));
                self.remove_slot(slot)?;
            }
            SlotState::Stale(minutes) => {
                env.reporter.line(&format!(
                    "Library {}@{} is due for a refresh after {} minutes, clearing.",
                    name, version, minutes
                ));
                self.stats.refreshed.fetch_add(1, Ordering::Relaxed);
                self.remove_slot(slot)?;
            }
        }

        let outcome = if self.slot_dir(slot).exists() {
            env.reporter.line(&format!(
                "Library {}@{} is cached. Copying from cache.",
                name, version
            ));
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            CacheOutcome::Hit
        } else {
            self.populate(fetch, slot, &scm_key, env)?;
            env.reporter
                .line(&format!("Library {}@{} successfully cached.", name, version));
            self.stats.populated.fetch_add(1, Ordering::Relaxed);
            CacheOutcome::Populated
        };

        match self.copy_out(slot, target) {
            Ok(summary) => Ok(Materialized { summary, outcome }),
            Err(err) => {
                self.remove_slot(slot)?;
                Err(Error::CacheCorrupted {
                    library: name.to_string(),
                    version: version.to_string(),
                    message: err.to_string(),
                })
            }
        }
    }

    /// Fetches straight into `target` through a leased checkout workspace.
    fn fetch_fresh(
        &self,
        fetch: &LibraryFetch<'_>,
        target: &Path,
        env: &FetchEnv<'_>,
    ) -> Result<BundleSummary> {
        let checkout_name = fetch.storage_key(false)?.directory_name();
        let lease = self.workspaces.lease(env.job, &checkout_name)?;
        let ctx = FetchContext {
            job: env.job,
            checkout_dir: lease.path(),
            retry: env.retry,
            bundle: env.bundle,
            cancel: env.cancel,
            reporter: env.reporter,
        };
        let request = RetrieveRequest {
            name: fetch.config.name(),
            version: fetch.version,
            changelog: fetch.changelog,
        };
        fetch.config.retriever.retrieve(&request, target, &ctx)
    }

    /// Builds a slot in scratch space and promotes it once verified.
    fn populate(
        &self,
        fetch: &LibraryFetch<'_>,
        slot: &str,
        scm_key: &str,
        env: &FetchEnv<'_>,
    ) -> Result<()> {
        let scratch = tempfile::Builder::new()
            .prefix("slot-")
            .tempdir_in(self.root.join(TMP_DIR))?;
        let bundle = scratch.path().join(BUNDLE_FILE);
        let summary = self.fetch_fresh(fetch, &bundle, env)?;
        env.cancel.check()?;

        let size = fs::metadata(&bundle).map(|m| m.len()).unwrap_or(0);
        if size == 0 || summary.entries == 0 {
            return Err(Error::CacheCorrupted {
                library: fetch.config.name().to_string(),
                version: fetch.version.to_string(),
                message: "fetch produced an empty bundle".to_string(),
            });
        }

        let manifest = SlotManifest {
            version: fetch.version.to_string(),
            summary,
        };
        fs::write(
            scratch.path().join(MANIFEST_FILE),
            serde_json::to_vec_pretty(&manifest)?,
        )?;

        fs::rename(scratch.path(), self.slot_dir(slot))?;
        let marked = self
            .write_marker(slot, NAME_MARKER, fetch.config.name())
            .and_then(|()| self.write_marker(slot, SCM_MARKER, scm_key))
            .and_then(|()| {
                self.write_marker(slot, TIMESTAMP_MARKER, &epoch_secs(SystemTime::now()).to_string())
            });
        if let Err(err) = marked {
            if let Err(cleanup) = self.remove_slot(slot) {
                tracing::warn!(slot, error = %cleanup, "could not remove unmarked slot");
            }
            return Err(err);
        }
        tracing::info!(
            library = fetch.config.name(),
            version = fetch.version,
            slot,
            "cache slot populated"
        );
        Ok(())
    }

    fn copy_out(&self, slot: &str, target: &Path) -> Result<BundleSummary> {
        let dir = self.slot_dir(slot);
        let manifest: SlotManifest = serde_json::from_slice(&fs::read(dir.join(MANIFEST_FILE))?)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let copied = fs::copy(dir.join(BUNDLE_FILE), target)?;
        if copied == 0 {
            return Err(Error::Bundle("cached bundle is empty".to_string()));
        }
        Ok(manifest.summary)
    }

    fn inspect(&self, slot: &str, scm_key: &str, refresh: Option<Duration>) -> SlotState {
        let dir = self.slot_dir(slot);
        if !dir.exists() {
            return SlotState::Missing;
        }

        let bundle_ok = fs::metadata(dir.join(BUNDLE_FILE))
            .map(|m| m.len() > 0)
            .unwrap_or(false);
        let cached_at = self.read_timestamp(slot);
        if !bundle_ok || !dir.join(MANIFEST_FILE).is_file() || cached_at.is_none() {
            return SlotState::Empty;
        }

        if self.read_marker(slot, SCM_MARKER).as_deref() != Some(scm_key) {
            return SlotState::ForeignScm;
        }

        if let (Some(interval), Some(cached_at)) = (refresh, cached_at) {
            let stale = match SystemTime::now().duration_since(cached_at) {
                Ok(age) => age > interval,
                // Stamped in the future: the clock moved, so the age is unknown.
                Err(_) => true,
            };
            if stale {
                return SlotState::Stale(interval.as_secs() / 60);
            }
        }
        SlotState::Fresh
    }

    /// Runs `f` while holding the lock of `slot`.
    ///
    /// The lock entry is dropped from the map once no other caller holds it.
    fn with_slot_lock<T>(&self, slot: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self
            .slot_locks
            .entry(slot.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = match lock.lock() {
            Ok(_guard) => f(),
            Err(e) => Err(Error::MutexLock(e.to_string())),
        };
        drop(lock);
        self.slot_locks
            .remove_if(slot, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    fn slot_dir(&self, slot: &str) -> PathBuf {
        self.root.join(slot)
    }

    fn marker_path(&self, slot: &str, marker: &str) -> PathBuf {
        self.root.join(format!("{}.{}", slot, marker))
    }

    fn read_marker(&self, slot: &str, marker: &str) -> Option<String> {
        fs::read_to_string(self.marker_path(slot, marker))
            .ok()
            .map(|s| s.trim().to_string())
    }

    fn read_timestamp(&self, slot: &str) -> Option<SystemTime> {
        self.read_marker(slot, TIMESTAMP_MARKER)
            .and_then(|s| s.parse::<u64>().ok())
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
    }

    fn write_marker(&self, slot: &str, marker: &str, content: &str) -> Result<()> {
        let path = self.marker_path(slot, marker);
        let temp = self.root.join(TMP_DIR).join(format!("{}.{}", slot, marker));
        fs::write(&temp, content)?;
        fs::rename(&temp, &path)?;
        Ok(())
    }

    /// Removes a slot and its markers. The caller holds the slot lock.
    fn remove_slot(&self, slot: &str) -> Result<()> {
        let dir = self.slot_dir(slot);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        for marker in [NAME_MARKER, SCM_MARKER, TIMESTAMP_MARKER] {
            match fs::remove_file(self.marker_path(slot, marker)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::debug!(slot, "cache slot removed");
        Ok(())
    }

    /// Overrides the population time of a slot.
    pub fn set_cached_at(&self, slot: &str, at: SystemTime) -> Result<()> {
        self.with_slot_lock(slot, || {
            self.write_marker(slot, TIMESTAMP_MARKER, &epoch_secs(at).to_string())
        })
    }

    /// Removes one slot by directory name. Returns whether it existed.
    pub fn clear_slot(&self, slot: &str) -> Result<bool> {
        self.with_slot_lock(slot, || {
            let existed = self.slot_dir(slot).exists();
            self.remove_slot(slot)?;
            Ok(existed)
        })
    }

    /// Removes every slot whose name marker is exactly `library`.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache root cannot be read or a slot cannot be removed.
    pub fn clear_library(&self, library: &str) -> Result<usize> {
        let mut cleared = 0;
        for slot in self.slot_names()? {
            if self.read_marker(&slot, NAME_MARKER).as_deref() == Some(library) {
                self.clear_slot(&slot)?;
                cleared += 1;
            }
        }
        tracing::info!(library, cleared, "cleared library cache");
        Ok(cleared)
    }

    /// Every populated slot, sorted by library name.
    pub fn list(&self) -> Result<Vec<SlotInfo>> {
        let mut slots = Vec::new();
        for slot in self.slot_names()? {
            let dir = self.slot_dir(&slot);
            if !dir.is_dir() {
                continue;
            }
            let version = fs::read(dir.join(MANIFEST_FILE))
                .ok()
                .and_then(|data| serde_json::from_slice::<SlotManifest>(&data).ok())
                .map(|m| m.version);
            let size = fs::metadata(dir.join(BUNDLE_FILE)).map(|m| m.len()).unwrap_or(0);
            slots.push(SlotInfo {
                library: self.read_marker(&slot, NAME_MARKER),
                scm_key: self.read_marker(&slot, SCM_MARKER),
                cached_at: self.read_timestamp(&slot),
                version,
                size,
                directory_name: slot,
            });
        }
        slots.sort_by(|a, b| {
            a.library
                .cmp(&b.library)
                .then_with(|| a.version.cmp(&b.version))
        });
        Ok(slots)
    }

    /// Slot names that have a name marker.
    fn slot_names(&self) -> Result<Vec<String>> {
        let suffix = format!(".{}", NAME_MARKER);
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_name = entry.file_name();
            if let Some(slot) = file_name.to_str().and_then(|n| n.strip_suffix(&suffix)) {
                names.push(slot.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

fn epoch_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
