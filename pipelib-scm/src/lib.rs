pub mod git;
pub mod local;

pub use git::{GitScm, GitSource};
pub use local::{LocalScm, LocalSource};

use std::sync::Arc;

use pipelib_core::scm::{Scm, ScmRegistry, ScmSource};

/// Registry with every adapter kind this crate ships: `git` and `local`.
pub fn default_registry() -> ScmRegistry {
    let registry = ScmRegistry::new();
    registry.register_source("git", |def| {
        let source: Arc<dyn ScmSource> = Arc::new(GitSource::new(def)?);
        Ok(source)
    });
    registry.register_scm("git", |def| {
        let scm: Arc<dyn Scm> = Arc::new(GitScm::new(def)?);
        Ok(scm)
    });
    registry.register_source("local", |def| {
        let source: Arc<dyn ScmSource> = Arc::new(LocalSource::new(def)?);
        Ok(source)
    });
    registry.register_scm("local", |def| {
        let scm: Arc<dyn Scm> = Arc::new(LocalScm::new(def)?);
        Ok(scm)
    });
    registry
}
