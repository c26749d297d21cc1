//! Per-build inputs consumed by library resolution.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Where a library configuration came from, and therefore how far its code is trusted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TrustScope {
    /// Configured globally; runs with full trust.
    Global,
    /// Configured on a folder or job; runs sandboxed.
    Folder(String),
    /// Offered by a dynamic resolver for one job.
    Resolver {
        resolver: String,
        job: String,
        trusted: bool,
    },
}

impl TrustScope {
    /// Storage identifier of the scope.
    ///
    /// Every kind carries its own tag, so a folder named `global` or a
    /// resolver named like a folder never shares storage with another kind.
    pub fn id(&self) -> String {
        match self {
            TrustScope::Global => "global".to_string(),
            TrustScope::Folder(path) => format!("folder:{}", path),
            TrustScope::Resolver {
                resolver,
                job,
                trusted,
            } => format!(
                "resolver:{}:{}:{}:{}",
                if *trusted { "trusted" } else { "sandboxed" },
                resolver.len(),
                resolver,
                job
            ),
        }
    }

    pub fn is_trusted(&self) -> bool {
        match self {
            TrustScope::Global => true,
            TrustScope::Folder(_) => false,
            TrustScope::Resolver { trusted, .. } => *trusted,
        }
    }
}

impl fmt::Display for TrustScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustScope::Global => f.write_str("global"),
            TrustScope::Folder(path) => f.write_str(path),
            TrustScope::Resolver { resolver, job, .. } => write!(f, "{} for {}", resolver, job),
        }
    }
}

/// A job identified by its slash-separated full name, e.g. `team/app/main`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobRef {
    full_name: String,
}

impl JobRef {
    pub fn new(full_name: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into().trim_matches('/').to_string(),
        }
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// The job itself followed by each enclosing folder, nearest first.
    pub fn scope_chain(&self) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = self.full_name.as_str();
        loop {
            if current.is_empty() {
                break;
            }
            chain.push(current.to_string());
            match current.rfind('/') {
                Some(idx) => current = &current[..idx],
                None => break,
            }
        }
        chain
    }
}

/// An SCM declared by the requesting job, used to discover its branch.
#[derive(Debug, Clone, Default)]
pub struct DeclaredScm {
    pub branches: Vec<String>,
}

/// Cooperative cancellation flag shared between a build and its fetches.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `Err(Error::Cancelled)` once the token has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps for `duration`, waking early if cancelled.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(Duration::from_millis(50)));
        }
    }
}

/// Everything a single build contributes to library resolution.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub job: JobRef,
    /// Directory owned by this build; the persisted record and bundles go here.
    pub build_dir: PathBuf,
    /// Multibranch head name, when the job is a branch project.
    pub head_name: Option<String>,
    pub scms: Vec<DeclaredScm>,
    pub env: BTreeMap<String, String>,
    pub cancel: CancelToken,
}

impl BuildContext {
    pub fn new(job: JobRef, build_dir: impl Into<PathBuf>) -> Self {
        Self {
            job,
            build_dir: build_dir.into(),
            head_name: None,
            scms: Vec::new(),
            env: BTreeMap::new(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_head_name(mut self, head: impl Into<String>) -> Self {
        self.head_name = Some(head.into());
        self
    }

    pub fn with_scm(mut self, scm: DeclaredScm) -> Self {
        self.scms.push(scm);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Branch the build runs on, if it can be determined.
    ///
    /// A multibranch head name wins; otherwise a single declared SCM with a
    /// single branch spec is used, with remote and wildcard prefixes removed.
    pub fn branch_name(&self) -> Option<String> {
        if let Some(head) = self.head_name.as_deref().filter(|h| !h.is_empty()) {
            return Some(head.to_string());
        }
        match self.scms.as_slice() {
            [scm] => match scm.branches.as_slice() {
                [branch] => normalize_branch(branch),
                _ => None,
            },
            _ => None,
        }
    }
}

fn normalize_branch(spec: &str) -> Option<String> {
    let mut branch = spec.trim();
    for prefix in ["refs/heads/", "origin/", "*/"] {
        if let Some(rest) = branch.strip_prefix(prefix) {
            branch = rest;
        }
    }
    if branch.is_empty() || branch.contains('*') {
        None
    } else {
        Some(branch.to_string())
    }
}
