//! Library retrievers: turn a name and a concrete version into a bundle.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::bundle::{self, BundleOptions, BundleSummary};
use crate::context::{CancelToken, JobRef};
use crate::error::{Error, Result};
use crate::report::BuildReporter;
use crate::retry::{FetchOutcome, RetryPolicy, RetryingFetcher};
use crate::scm::{Revision, Scm, ScmSource};

/// What to retrieve.
#[derive(Debug, Clone, Copy)]
pub struct RetrieveRequest<'a> {
    pub name: &'a str,
    pub version: &'a str,
    /// Whether the checkout should contribute to the build's changelog.
    pub changelog: bool,
}

/// Everything a retriever needs from its caller for one fetch.
pub struct FetchContext<'a> {
    /// Job on whose behalf revisions are looked up.
    pub job: &'a JobRef,
    /// Leased checkout directory; its previous contents are discarded.
    pub checkout_dir: &'a Path,
    pub retry: RetryPolicy,
    pub bundle: BundleOptions,
    pub cancel: &'a CancelToken,
    pub reporter: &'a dyn BuildReporter,
}

/// Produces a bundle for a library version.
pub trait LibraryRetriever: Send + Sync {
    /// Identity of the upstream SCM, recorded next to cache slots.
    fn scm_key(&self) -> String;

    /// Sub-directory of the checkout holding the library, if any.
    fn library_path(&self) -> Option<&str>;

    /// Checks the library out and writes its bundle to `target`.
    ///
    /// # Errors
    ///
    /// Fails with the last SCM error once retries are exhausted, or with any
    /// bundle validation error.
    fn retrieve(
        &self,
        request: &RetrieveRequest<'_>,
        target: &Path,
        ctx: &FetchContext<'_>,
    ) -> Result<BundleSummary>;
}

fn normalize_library_path(path: Option<String>) -> Result<Option<String>> {
    match path.map(|p| p.trim().to_string()).filter(|p| !p.is_empty()) {
        Some(path) => {
            bundle::validate_library_path(&path)?;
            Ok(Some(path))
        }
        None => Ok(None),
    }
}

fn clear_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

fn finish(
    request: &RetrieveRequest<'_>,
    library_path: Option<&str>,
    target: &Path,
    ctx: &FetchContext<'_>,
) -> Result<BundleSummary> {
    ctx.cancel.check()?;
    bundle::dir_to_bundle(
        request.name,
        ctx.checkout_dir,
        library_path,
        target,
        &ctx.bundle,
        ctx.reporter,
    )
}

/// Resolves versions as heads, tags or commits of an [`ScmSource`].
#[derive(Clone)]
pub struct ScmSourceRetriever {
    source: Arc<dyn ScmSource>,
    library_path: Option<String>,
}

impl ScmSourceRetriever {
    pub fn new(source: Arc<dyn ScmSource>, library_path: Option<String>) -> Result<Self> {
        Ok(Self {
            source,
            library_path: normalize_library_path(library_path)?,
        })
    }
}

impl LibraryRetriever for ScmSourceRetriever {
    fn scm_key(&self) -> String {
        self.source.key()
    }

    fn library_path(&self) -> Option<&str> {
        self.library_path.as_deref()
    }

    fn retrieve(
        &self,
        request: &RetrieveRequest<'_>,
        target: &Path,
        ctx: &FetchContext<'_>,
    ) -> Result<BundleSummary> {
        let fetcher = RetryingFetcher::new(ctx.retry, ctx.cancel, ctx.reporter);

        let revision: Revision = fetcher
            .fetch_with_retry(|| {
                FetchOutcome::from_result(self.source.fetch_revision(
                    request.name,
                    request.version,
                    ctx.job,
                ))
            })?
            .ok_or_else(|| Error::VersionNotFound {
                library: request.name.to_string(),
                version: request.version.to_string(),
            })?;
        tracing::debug!(
            library = request.name,
            version = request.version,
            revision = %revision.id,
            "resolved revision"
        );

        fetcher.fetch_with_retry(|| {
            FetchOutcome::from_result(clear_dir(ctx.checkout_dir).and_then(|()| {
                self.source.checkout(
                    request.name,
                    &revision,
                    ctx.checkout_dir,
                    request.changelog,
                )
            }))
        })?;

        finish(request, self.library_path(), target, ctx)
    }
}

/// Substitutes the version into a fixed [`Scm`] as `${library.NAME.version}`.
#[derive(Clone)]
pub struct ScmRetriever {
    scm: Arc<dyn Scm>,
    library_path: Option<String>,
}

impl ScmRetriever {
    pub fn new(scm: Arc<dyn Scm>, library_path: Option<String>) -> Result<Self> {
        Ok(Self {
            scm,
            library_path: normalize_library_path(library_path)?,
        })
    }

    /// Build parameters substituted into the SCM reference.
    pub fn parameters(name: &str, version: &str) -> BTreeMap<String, String> {
        let mut parameters = BTreeMap::new();
        parameters.insert(format!("library.{}.version", name), version.to_string());
        parameters
    }
}

impl LibraryRetriever for ScmRetriever {
    fn scm_key(&self) -> String {
        self.scm.key()
    }

    fn library_path(&self) -> Option<&str> {
        self.library_path.as_deref()
    }

    fn retrieve(
        &self,
        request: &RetrieveRequest<'_>,
        target: &Path,
        ctx: &FetchContext<'_>,
    ) -> Result<BundleSummary> {
        let parameters = Self::parameters(request.name, request.version);
        RetryingFetcher::new(ctx.retry, ctx.cancel, ctx.reporter).fetch_with_retry(|| {
            FetchOutcome::from_result(clear_dir(ctx.checkout_dir).and_then(|()| {
                self.scm
                    .checkout(request.name, &parameters, ctx.checkout_dir, request.changelog)
            }))
        })?;

        finish(request, self.library_path(), target, ctx)
    }
}

/// The retriever owned by a library configuration.
#[derive(Clone)]
pub enum Retriever {
    ScmSource(ScmSourceRetriever),
    Scm(ScmRetriever),
}

impl Retriever {
    fn inner(&self) -> &dyn LibraryRetriever {
        match self {
            Retriever::ScmSource(r) => r,
            Retriever::Scm(r) => r,
        }
    }
}

impl LibraryRetriever for Retriever {
    fn scm_key(&self) -> String {
        self.inner().scm_key()
    }

    fn library_path(&self) -> Option<&str> {
        self.inner().library_path()
    }

    fn retrieve(
        &self,
        request: &RetrieveRequest<'_>,
        target: &Path,
        ctx: &FetchContext<'_>,
    ) -> Result<BundleSummary> {
        self.inner().retrieve(request, target, ctx)
    }
}
