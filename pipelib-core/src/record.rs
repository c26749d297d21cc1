//! Per-build record of the libraries a build used.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::LibraryCachingConfiguration;
use crate::error::Result;

/// File name of the persisted record inside a build directory.
pub const RECORD_FILE: &str = "libraries.json";

/// One resolved library of one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryRecord {
    pub name: String,
    pub version: String,
    /// Global variables exported to the build, sorted.
    pub variables: Vec<String>,
    pub trusted: bool,
    pub changelog: bool,
    /// Caching policy in effect when the library was loaded.
    pub caching: Option<LibraryCachingConfiguration>,
    /// Storage directory name derived from name, version, scope and path.
    pub directory_name: String,
}

/// All libraries of one build, in load order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibrariesRecord {
    pub libraries: Vec<LibraryRecord>,
}

impl LibrariesRecord {
    pub fn path(build_dir: &Path) -> PathBuf {
        build_dir.join(RECORD_FILE)
    }

    pub fn get(&self, name: &str) -> Option<&LibraryRecord> {
        self.libraries.iter().find(|r| r.name == name)
    }

    /// Writes the record atomically.
    pub fn save(&self, build_dir: &Path) -> Result<()> {
        fs::create_dir_all(build_dir)?;
        let content = serde_json::to_vec_pretty(self)?;
        let temp = build_dir.join(format!(".{}.tmp", RECORD_FILE));
        fs::write(&temp, content)?;
        fs::rename(&temp, Self::path(build_dir))?;
        Ok(())
    }

    /// Loads the record of a build, or an empty record if none was written.
    pub fn load(build_dir: &Path) -> Result<Self> {
        let path = Self::path(build_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read(&path)?;
        Ok(serde_json::from_slice(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let record = LibrariesRecord {
            libraries: vec![LibraryRecord {
                name: "utils".to_string(),
                version: "1.0".to_string(),
                variables: vec!["deploy".to_string()],
                trusted: true,
                changelog: false,
                caching: Some(LibraryCachingConfiguration::new(30)),
                directory_name: "abc".to_string(),
            }],
        };
        record.save(temp.path()).unwrap();
        assert_eq!(LibrariesRecord::load(temp.path()).unwrap(), record);
        assert!(record.get("utils").unwrap().trusted);
    }

    #[test]
    fn test_missing_record_is_empty() {
        let temp = TempDir::new().unwrap();
        assert!(LibrariesRecord::load(temp.path()).unwrap().libraries.is_empty());
    }
}
