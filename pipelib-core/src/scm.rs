//! Source-control boundary: the traits SCM adapters implement, and a registry of them.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::context::JobRef;
use crate::error::{Error, Result};

static PARAMETER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_.\-]+)\}").expect("parameter pattern is valid"));

/// A concrete revision discovered by an [`ScmSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    /// The head, tag or commit name that was asked for.
    pub name: String,
    /// Immutable identifier (commit hash, directory name, ...).
    pub id: String,
}

/// An SCM that can discover revisions by name, such as a branch or tag.
///
/// Adapters report failures with [`Error::Scm`]; the `transient` flag decides
/// whether the caller retries.
pub trait ScmSource: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Stable identity of the upstream repository.
    fn key(&self) -> String;

    /// Resolves `version` to a revision, with lookups scoped to `owner`.
    ///
    /// Returns `Ok(None)` when the repository has no such head.
    fn fetch_revision(&self, library: &str, version: &str, owner: &JobRef)
        -> Result<Option<Revision>>;

    /// Checks `revision` out into `dest`, which exists and is empty.
    fn checkout(&self, library: &str, revision: &Revision, dest: &Path, changelog: bool)
        -> Result<()>;
}

/// An SCM with a fixed reference into which build parameters are substituted.
pub trait Scm: Send + Sync {
    fn kind(&self) -> &'static str;

    fn key(&self) -> String;

    /// Checks out the reference with `${name}` references replaced from `parameters`.
    fn checkout(
        &self,
        library: &str,
        parameters: &BTreeMap<String, String>,
        dest: &Path,
        changelog: bool,
    ) -> Result<()>;
}

/// Serialized description of an SCM, as written in the settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScmDefinition {
    /// Adapter kind, e.g. `git` or `local`.
    pub kind: String,
    /// Repository URL or root directory.
    pub remote: String,
    /// Reference template for fixed SCMs, e.g. `${library.utils.version}`.
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub credentials_id: Option<String>,
}

/// Replaces `${name}` references in `template` with values from `parameters`.
///
/// Unknown references are left untouched.
pub fn expand_parameters(template: &str, parameters: &BTreeMap<String, String>) -> String {
    PARAMETER_RE
        .replace_all(template, |caps: &regex::Captures<'_>| {
            parameters
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

type SourceFactory = Box<dyn Fn(&ScmDefinition) -> Result<Arc<dyn ScmSource>> + Send + Sync>;
type ScmFactory = Box<dyn Fn(&ScmDefinition) -> Result<Arc<dyn Scm>> + Send + Sync>;

/// Registry of SCM adapter factories keyed by kind.
pub struct ScmRegistry {
    sources: Mutex<HashMap<String, SourceFactory>>,
    scms: Mutex<HashMap<String, ScmFactory>>,
}

impl ScmRegistry {
    pub fn new() -> Self {
        Self {
            sources: Mutex::new(HashMap::new()),
            scms: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a factory for revision-discovering sources of `kind`.
    pub fn register_source<F>(&self, kind: &str, factory: F)
    where
        F: Fn(&ScmDefinition) -> Result<Arc<dyn ScmSource>> + Send + Sync + 'static,
    {
        if let Ok(mut sources) = self.sources.lock() {
            sources.insert(kind.to_string(), Box::new(factory));
        }
    }

    /// Registers a factory for fixed SCMs of `kind`.
    pub fn register_scm<F>(&self, kind: &str, factory: F)
    where
        F: Fn(&ScmDefinition) -> Result<Arc<dyn Scm>> + Send + Sync + 'static,
    {
        if let Ok(mut scms) = self.scms.lock() {
            scms.insert(kind.to_string(), Box::new(factory));
        }
    }

    pub fn source(&self, definition: &ScmDefinition) -> Result<Arc<dyn ScmSource>> {
        let sources = self
            .sources
            .lock()
            .map_err(|e| Error::MutexLock(e.to_string()))?;
        let factory = sources.get(&definition.kind).ok_or_else(|| {
            Error::InvalidConfiguration(format!("unknown SCM source kind '{}'", definition.kind))
        })?;
        factory(definition)
    }

    pub fn scm(&self, definition: &ScmDefinition) -> Result<Arc<dyn Scm>> {
        let scms = self
            .scms
            .lock()
            .map_err(|e| Error::MutexLock(e.to_string()))?;
        let factory = scms.get(&definition.kind).ok_or_else(|| {
            Error::InvalidConfiguration(format!("unknown SCM kind '{}'", definition.kind))
        })?;
        factory(definition)
    }

    pub fn registered_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .sources
            .lock()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        kinds.sort();
        kinds
    }
}

impl Default for ScmRegistry {
    fn default() -> Self {
        Self::new()
    }
}
