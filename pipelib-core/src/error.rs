//! Error types and result aliases.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error in {context}: {error}")]
    Toml {
        error: toml::de::Error,
        context: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid library configuration: {0}")]
    InvalidConfiguration(String),

    #[error("No version specified for library {library} and no default version configured")]
    NoVersion { library: String },

    #[error("Version override not permitted for library {library}")]
    OverrideNotPermitted { library: String },

    #[error("Version expression '{expression}' for library {library} is not a constant string")]
    DynamicVersion { library: String, expression: String },

    #[error("No version {version} found for library {library}")]
    VersionNotFound { library: String, version: String },

    #[error("No library named {name} found")]
    LibraryNotFound { name: String },

    #[error("Could not find any definition of libraries {}", format_names(.names))]
    LibrariesNotFound { names: Vec<String> },

    #[error("Library {library} expected to contain at least one of src or vars directories")]
    EmptyLibrary { library: String },

    #[error("Library path may not contain '..': {path}")]
    ForbiddenLibraryPath { path: String },

    #[error("Library {library} contains a symlink {path} pointing outside the checkout: {target}")]
    SymlinkEscape {
        library: String,
        path: PathBuf,
        target: PathBuf,
    },

    #[error("Path traversal rejected: {0}")]
    PathTraversal(String),

    #[error("No such library resource {0} could be found.")]
    ResourceNotFound(String),

    #[error("Library resource {resource} is ambiguous; found in libraries {}", .libraries.join(", "))]
    AmbiguousResource {
        resource: String,
        libraries: Vec<String>,
    },

    #[error("SCM error for {library}: {message}")]
    Scm {
        library: String,
        message: String,
        transient: bool,
    },

    #[error("Cache slot for library {library}@{version} is corrupted: {message}")]
    CacheCorrupted {
        library: String,
        version: String,
        message: String,
    },

    #[error("Bundle error: {0}")]
    Bundle(String),

    #[error("Library retrieval cancelled")]
    Cancelled,

    #[error("Mutex lock error: {0}")]
    MutexLock(String),
}

fn format_names(names: &[String]) -> String {
    format!("[{}]", names.join(", "))
}

impl Error {
    /// Builds a transient SCM failure, eligible for retry.
    pub fn transient(library: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Scm {
            library: library.into(),
            message: message.into(),
            transient: true,
        }
    }

    /// Builds a permanent SCM failure.
    pub fn permanent(library: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Scm {
            library: library.into(),
            message: message.into(),
            transient: false,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Toml {
            error,
            context: "pipelib.toml".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
