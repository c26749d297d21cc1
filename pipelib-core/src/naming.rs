//! Deterministic directory names for cache slots and checkout workspaces.

use sha2::{Digest, Sha256};

/// Identity of a library's on-disk storage.
///
/// The directory name is a SHA-256 over every component, each prefixed with
/// its length, so that no two distinct tuples can produce the same digest
/// input. Raw names never reach the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKey {
    /// Library name as configured.
    pub name: String,
    /// Resolved version, absent for checkout workspaces.
    pub version: Option<String>,
    /// Trust scope identifier, as produced by `TrustScope::id`.
    pub scope: String,
    /// Sub-directory of the checkout holding the library, if any.
    pub library_path: Option<String>,
}

impl StorageKey {
    /// Creates a builder.
    pub fn builder() -> StorageKeyBuilder {
        StorageKeyBuilder::default()
    }

    /// Returns the hex-encoded directory name.
    pub fn directory_name(&self) -> String {
        let mut hasher = Sha256::new();
        update_field(&mut hasher, "name", Some(&self.name));
        update_field(&mut hasher, "version", self.version.as_deref());
        update_field(&mut hasher, "scope", Some(&self.scope));
        update_field(&mut hasher, "path", self.library_path.as_deref());
        format!("{:x}", hasher.finalize())
    }
}

fn update_field(hasher: &mut Sha256, label: &str, value: Option<&str>) {
    hasher.update(label.as_bytes());
    match value {
        Some(value) => {
            hasher.update([1u8]);
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
        None => hasher.update([0u8]),
    }
}

/// Builder for [`StorageKey`].
#[derive(Default)]
pub struct StorageKeyBuilder {
    name: Option<String>,
    version: Option<String>,
    scope: Option<String>,
    library_path: Option<String>,
}

impl StorageKeyBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn library_path(mut self, path: Option<&str>) -> Self {
        self.library_path = path.filter(|p| !p.is_empty()).map(str::to_string);
        self
    }

    /// Builds the key. Name and scope are required.
    pub fn build(self) -> crate::Result<StorageKey> {
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| crate::Error::InvalidConfiguration("library name is required".to_string()))?;
        let scope = self
            .scope
            .ok_or_else(|| crate::Error::InvalidConfiguration("trust scope is required".to_string()))?;
        Ok(StorageKey {
            name,
            version: self.version,
            scope,
            library_path: self.library_path,
        })
    }
}

/// Short, filesystem-safe digest of an arbitrary string.
pub fn short_digest(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}
