//! Core library for resolving, fetching and caching pipeline shared libraries.

pub mod bundle;
pub mod cache;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod naming;
pub mod record;
pub mod report;
pub mod retriever;
pub mod retry;
pub mod scm;
pub mod version;
pub mod workspace;

pub use bundle::{BundleOptions, BundleSummary};
pub use cache::{CacheManager, CacheOutcome, CacheStats, SlotInfo};
pub use config::{
    ConfigurationProvider, EngineOptions, LibraryCachingConfiguration, LibraryConfiguration,
    LibraryDefinition, RetrieverDefinition, Settings, SettingsFile, SettingsStore,
};
pub use context::{BuildContext, CancelToken, DeclaredScm, JobRef, TrustScope};
pub use coordinator::{BuildLibraries, LibraryResolutionCoordinator, LibraryResolver, LibraryUse};
pub use error::{Error, Result};
pub use naming::StorageKey;
pub use record::{LibrariesRecord, LibraryRecord};
pub use report::{BuildReporter, RecordingReporter, TracingReporter};
pub use retriever::{LibraryRetriever, Retriever, ScmRetriever, ScmSourceRetriever};
pub use retry::{FetchOutcome, RetryPolicy, RetryingFetcher};
pub use scm::{Revision, Scm, ScmDefinition, ScmRegistry, ScmSource};
pub use version::VersionResolver;
pub use workspace::{CheckoutWorkspaces, WorkspaceLeases};
