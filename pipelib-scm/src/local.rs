//! Local-directory adapters: each version is a sub-directory of a root.
//!
//! Useful for air-gapped installations and for testing library layouts
//! without a git server.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use pipelib_core::context::JobRef;
use pipelib_core::error::{Error, Result};
use pipelib_core::scm::{expand_parameters, Revision, Scm, ScmDefinition, ScmSource};
use walkdir::WalkDir;

fn root_from(definition: &ScmDefinition) -> Result<PathBuf> {
    let root = definition.remote.trim();
    if root.is_empty() {
        return Err(Error::InvalidConfiguration(
            "local SCM root must not be empty".to_string(),
        ));
    }
    Ok(PathBuf::from(root))
}

/// A version name must be a single path segment below the root.
fn version_dir(root: &Path, library: &str, version: &str) -> Result<PathBuf> {
    if version.is_empty()
        || version == "."
        || version == ".."
        || version.contains('/')
        || version.contains('\\')
    {
        return Err(Error::permanent(
            library,
            format!("'{}' is not a valid local version", version),
        ));
    }
    Ok(root.join(version))
}

/// Copies `src` into `dest`, recreating symlinks instead of following them.
fn copy_tree(src: &Path, dest: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        let relative = match entry.path().strip_prefix(src) {
            Ok(relative) if !relative.as_os_str().is_empty() => relative,
            _ => continue,
        };
        let target = dest.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
            copied += 1;
        } else {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> Result<()> {
    let destination = fs::read_link(link)?;
    std::os::unix::fs::symlink(destination, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> Result<()> {
    fs::copy(link, target)?;
    Ok(())
}

/// Root directory whose sub-directories are library versions.
pub struct LocalSource {
    root: PathBuf,
}

impl LocalSource {
    pub fn new(definition: &ScmDefinition) -> Result<Self> {
        Ok(Self {
            root: root_from(definition)?,
        })
    }
}

impl ScmSource for LocalSource {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn key(&self) -> String {
        format!("local:{}", self.root.display())
    }

    fn fetch_revision(&self, library: &str, version: &str, _owner: &JobRef) -> Result<Option<Revision>> {
        if !self.root.is_dir() {
            return Err(Error::permanent(
                library,
                format!("local library root {} does not exist", self.root.display()),
            ));
        }
        let dir = version_dir(&self.root, library, version)?;
        if !dir.is_dir() {
            return Ok(None);
        }
        Ok(Some(Revision {
            name: version.to_string(),
            id: version.to_string(),
        }))
    }

    fn checkout(&self, library: &str, revision: &Revision, dest: &Path, _changelog: bool) -> Result<()> {
        let dir = version_dir(&self.root, library, &revision.id)?;
        let copied = copy_tree(&dir, dest)?;
        tracing::debug!(library, version = %revision.name, copied, "copied local library");
        Ok(())
    }
}

/// Root directory checked out at a fixed, parameterized sub-directory.
///
/// Without a reference template the sub-directory is `${library.NAME.version}`.
pub struct LocalScm {
    root: PathBuf,
    reference: Option<String>,
}

impl LocalScm {
    pub fn new(definition: &ScmDefinition) -> Result<Self> {
        Ok(Self {
            root: root_from(definition)?,
            reference: definition.reference.clone(),
        })
    }
}

impl Scm for LocalScm {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn key(&self) -> String {
        format!("local:{}", self.root.display())
    }

    fn checkout(
        &self,
        library: &str,
        parameters: &BTreeMap<String, String>,
        dest: &Path,
        _changelog: bool,
    ) -> Result<()> {
        let template = self
            .reference
            .clone()
            .unwrap_or_else(|| format!("${{library.{}.version}}", library));
        let version = expand_parameters(&template, parameters);
        let dir = version_dir(&self.root, library, &version)?;
        if !dir.is_dir() {
            return Err(Error::permanent(
                library,
                format!("{} does not exist", dir.display()),
            ));
        }
        copy_tree(&dir, dest)?;
        Ok(())
    }
}
