//! Git adapters built on libgit2.

use std::path::Path;

use git2::build::CheckoutBuilder;
use git2::{
    Cred, CredentialType, Direction, ErrorClass, FetchOptions, Oid, Remote, RemoteCallbacks,
    Repository,
};
use once_cell::sync::Lazy;
use pipelib_core::context::JobRef;
use pipelib_core::error::{Error, Result};
use pipelib_core::scm::{expand_parameters, Revision, Scm, ScmDefinition, ScmSource};
use regex::Regex;
use std::collections::BTreeMap;

static COMMIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{7,40}$").expect("commit pattern is valid"));

/// Maps a libgit2 error to an SCM error; network failures are transient.
fn scm_error(library: &str, context: &str, err: git2::Error) -> Error {
    let transient = matches!(
        err.class(),
        ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssh | ErrorClass::Os
    );
    let message = format!("{}: {}", context, err.message());
    if transient {
        Error::transient(library, message)
    } else {
        Error::permanent(library, message)
    }
}

fn callbacks<'a>(credentials_id: Option<&'a str>) -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |url, username, allowed| {
        let user = username.or(credentials_id).unwrap_or("git");
        if allowed.contains(CredentialType::SSH_KEY) {
            Cred::ssh_key_from_agent(user)
        } else if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
            let config = git2::Config::open_default()?;
            Cred::credential_helper(&config, url, username)
        } else {
            Cred::default()
        }
    });
    callbacks
}

/// Connection details shared by both git adapters.
#[derive(Debug, Clone)]
struct GitRemote {
    url: String,
    credentials_id: Option<String>,
}

impl GitRemote {
    fn from_definition(definition: &ScmDefinition) -> Result<Self> {
        let url = definition.remote.trim();
        if url.is_empty() {
            return Err(Error::InvalidConfiguration(
                "git remote must not be empty".to_string(),
            ));
        }
        Ok(Self {
            url: url.to_string(),
            credentials_id: definition.credentials_id.clone(),
        })
    }

    /// Finds `name` among the remote's heads and tags, or accepts it as a commit id.
    fn resolve(&self, library: &str, name: &str) -> Result<Option<Revision>> {
        let mut remote = Remote::create_detached(self.url.as_str())
            .map_err(|e| scm_error(library, "invalid remote", e))?;
        let heads: Vec<(String, Oid)> = {
            let connection = remote
                .connect_auth(Direction::Fetch, Some(callbacks(self.credentials_id.as_deref())), None)
                .map_err(|e| scm_error(library, &format!("could not connect to {}", self.url), e))?;
            connection
                .list()
                .map_err(|e| scm_error(library, "could not list remote references", e))?
                .iter()
                .map(|head| (head.name().to_string(), head.oid()))
                .collect()
        };

        let candidates = [
            format!("refs/heads/{}", name),
            format!("refs/tags/{}^{{}}", name),
            format!("refs/tags/{}", name),
            name.to_string(),
        ];

        for candidate in &candidates {
            if let Some((_, oid)) = heads.iter().find(|(ref_name, _)| ref_name == candidate) {
                return Ok(Some(Revision {
                    name: name.to_string(),
                    id: oid.to_string(),
                }));
            }
        }

        if COMMIT_RE.is_match(name) {
            let lower = name.to_ascii_lowercase();
            if let Some((_, oid)) = heads
                .iter()
                .find(|(_, oid)| oid.to_string().starts_with(&lower))
            {
                return Ok(Some(Revision {
                    name: name.to_string(),
                    id: oid.to_string(),
                }));
            }
            if lower.len() == 40 {
                return Ok(Some(Revision {
                    name: name.to_string(),
                    id: lower,
                }));
            }
        }
        Ok(None)
    }

    /// Fetches `revision` into a fresh repository at `dest` and checks it out.
    fn checkout(&self, library: &str, revision: &Revision, dest: &Path) -> Result<()> {
        let oid = Oid::from_str(&revision.id)
            .map_err(|e| scm_error(library, "invalid revision id", e))?;
        let repo = Repository::init(dest).map_err(|e| scm_error(library, "could not init", e))?;
        let mut remote = repo
            .remote_anonymous(&self.url)
            .map_err(|e| scm_error(library, "invalid remote", e))?;

        let mut options = FetchOptions::new();
        options.remote_callbacks(callbacks(self.credentials_id.as_deref()));
        let by_id = remote.fetch(&[revision.id.as_str()], Some(&mut options), None);
        if by_id.is_err() || repo.find_commit(oid).is_err() {
            tracing::debug!(library, url = %self.url, "fetch by id failed, fetching all refs");
            let mut options = FetchOptions::new();
            options.remote_callbacks(callbacks(self.credentials_id.as_deref()));
            remote
                .fetch(
                    &["+refs/heads/*:refs/remotes/origin/*", "+refs/tags/*:refs/tags/*"],
                    Some(&mut options),
                    None,
                )
                .map_err(|e| scm_error(library, &format!("could not fetch from {}", self.url), e))?;
        }

        let commit = repo
            .find_commit(oid)
            .map_err(|e| scm_error(library, &format!("revision {} not fetched", revision.id), e))?;
        repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))
            .map_err(|e| scm_error(library, "checkout failed", e))?;
        repo.set_head_detached(oid)
            .map_err(|e| scm_error(library, "could not update HEAD", e))?;

        tracing::debug!(library, revision = %revision.id, dest = %dest.display(), "checked out");
        Ok(())
    }
}

/// Git repository whose heads, tags and commits are library versions.
pub struct GitSource {
    remote: GitRemote,
}

impl GitSource {
    pub fn new(definition: &ScmDefinition) -> Result<Self> {
        Ok(Self {
            remote: GitRemote::from_definition(definition)?,
        })
    }
}

impl ScmSource for GitSource {
    fn kind(&self) -> &'static str {
        "git"
    }

    fn key(&self) -> String {
        self.remote.url.clone()
    }

    fn fetch_revision(&self, library: &str, version: &str, owner: &JobRef) -> Result<Option<Revision>> {
        tracing::debug!(library, version, job = owner.full_name(), "resolving git revision");
        self.remote.resolve(library, version)
    }

    fn checkout(&self, library: &str, revision: &Revision, dest: &Path, _changelog: bool) -> Result<()> {
        self.remote.checkout(library, revision, dest)
    }
}

/// Git repository checked out at a fixed reference template.
///
/// Without a template the reference is `${library.NAME.version}`.
pub struct GitScm {
    remote: GitRemote,
    reference: Option<String>,
}

impl GitScm {
    pub fn new(definition: &ScmDefinition) -> Result<Self> {
        Ok(Self {
            remote: GitRemote::from_definition(definition)?,
            reference: definition.reference.clone(),
        })
    }
}

impl Scm for GitScm {
    fn kind(&self) -> &'static str {
        "git"
    }

    fn key(&self) -> String {
        match &self.reference {
            Some(reference) => format!("{}#{}", self.remote.url, reference),
            None => self.remote.url.clone(),
        }
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
        let reference = expand_parameters(&template, parameters);
        let name = reference
            .strip_prefix("refs/heads/")
            .or_else(|| reference.strip_prefix("refs/tags/"))
            .unwrap_or(&reference);

        let revision = self.remote.resolve(library, name)?.ok_or_else(|| {
            Error::permanent(library, format!("no reference {} in {}", reference, self.remote.url))
        })?;
        self.remote.checkout(library, &revision, dest)
    }
}
