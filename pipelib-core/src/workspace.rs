//! Checkout workspaces: exclusive per-build leases and job lifecycle hooks.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::context::JobRef;
use crate::error::{Error, Result};
use crate::naming::short_digest;

/// Tracks which checkout directories are in use.
///
/// A request for a busy directory is handed the first free numbered sibling
/// (`dir@2`, `dir@3`, ...) instead of waiting.
#[derive(Default)]
pub struct WorkspaceLeases {
    in_use: Mutex<HashSet<PathBuf>>,
}

impl WorkspaceLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leases `base` or a free numbered sibling and creates the directory.
    pub fn allocate(&self, base: &Path) -> Result<WorkspaceLease<'_>> {
        let path = {
            let mut in_use = self
                .in_use
                .lock()
                .map_err(|e| Error::MutexLock(e.to_string()))?;
            let mut candidate = base.to_path_buf();
            let mut n = 2u32;
            while in_use.contains(&candidate) {
                candidate = numbered_sibling(base, n);
                n += 1;
            }
            in_use.insert(candidate.clone());
            candidate
        };

        let lease = WorkspaceLease {
            leases: self,
            path,
        };
        fs::create_dir_all(&lease.path)?;
        tracing::debug!(path = %lease.path.display(), "workspace leased");
        Ok(lease)
    }

    pub fn is_leased(&self, path: &Path) -> bool {
        self.in_use
            .lock()
            .map(|in_use| in_use.contains(path))
            .unwrap_or(false)
    }

    fn release(&self, path: &Path) {
        if let Ok(mut in_use) = self.in_use.lock() {
            in_use.remove(path);
        }
    }
}

fn numbered_sibling(base: &Path, n: u32) -> PathBuf {
    let mut name = base.file_name().map(OsString::from).unwrap_or_default();
    name.push(format!("@{}", n));
    base.with_file_name(name)
}

/// An exclusively held checkout directory, released on drop.
pub struct WorkspaceLease<'a> {
    leases: &'a WorkspaceLeases,
    path: PathBuf,
}

impl WorkspaceLease<'_> {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLease<'_> {
    fn drop(&mut self) {
        self.leases.release(&self.path);
        tracing::trace!(path = %self.path.display(), "workspace released");
    }
}

/// Per-job checkout directories under a workspaces root.
///
/// Each job owns `<root>/<digest(job)>@libs/`, holding one directory per
/// library checkout.
pub struct CheckoutWorkspaces {
    root: PathBuf,
    leases: WorkspaceLeases,
}

impl CheckoutWorkspaces {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            leases: WorkspaceLeases::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory holding all library checkouts of `job`.
    pub fn job_dir(&self, job: &JobRef) -> PathBuf {
        self.root
            .join(format!("{}@libs", short_digest(job.full_name())))
    }

    /// Leases the checkout directory named `directory_name` for `job`.
    pub fn lease(&self, job: &JobRef, directory_name: &str) -> Result<WorkspaceLease<'_>> {
        self.leases.allocate(&self.job_dir(job).join(directory_name))
    }

    /// Drops the checkouts of a renamed job; the new name starts clean.
    pub fn on_job_renamed(&self, old: &JobRef, new: &JobRef) -> Result<()> {
        let old_dir = self.job_dir(old);
        if old_dir.exists() {
            fs::remove_dir_all(&old_dir)?;
            tracing::info!(
                from = old.full_name(),
                to = new.full_name(),
                "removed library checkouts of renamed job"
            );
        }
        Ok(())
    }

    /// Removes the checkouts of a deleted job.
    pub fn on_job_deleted(&self, job: &JobRef) -> Result<()> {
        let dir = self.job_dir(job);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            tracing::info!(job = job.full_name(), "removed library checkouts of deleted job");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_concurrent_leases_get_numbered_siblings() {
        let temp = TempDir::new().unwrap();
        let leases = WorkspaceLeases::new();
        let base = temp.path().join("lib");

        let first = leases.allocate(&base).unwrap();
        let second = leases.allocate(&base).unwrap();
        let third = leases.allocate(&base).unwrap();
        assert_eq!(first.path(), base);
        assert_eq!(second.path(), temp.path().join("lib@2"));
        assert_eq!(third.path(), temp.path().join("lib@3"));
        assert!(second.path().is_dir());
    }

    #[test]
    fn test_released_lease_is_reused() {
        let temp = TempDir::new().unwrap();
        let leases = WorkspaceLeases::new();
        let base = temp.path().join("lib");

        let first = leases.allocate(&base).unwrap();
        drop(first);
        assert!(!leases.is_leased(&base));
        let again = leases.allocate(&base).unwrap();
        assert_eq!(again.path(), base);
    }

    #[test]
    fn test_job_lifecycle_hooks() {
        let temp = TempDir::new().unwrap();
        let workspaces = CheckoutWorkspaces::new(temp.path());
        let old = JobRef::new("team/app");
        let new = JobRef::new("team/app-renamed");

        let lease = workspaces.lease(&old, "abc").unwrap();
        fs::write(lease.path().join("file"), "x").unwrap();
        drop(lease);
        assert!(workspaces.job_dir(&old).exists());

        workspaces.on_job_renamed(&old, &new).unwrap();
        assert!(!workspaces.job_dir(&old).exists());
        assert!(!workspaces.job_dir(&new).exists());

        workspaces.lease(&new, "abc").unwrap();
        workspaces.on_job_deleted(&new).unwrap();
        assert!(!workspaces.job_dir(&new).exists());
    }
}
