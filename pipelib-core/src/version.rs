//! Effective version resolution for a requested library.
//!
//! A requested version is one of:
//!
//! - absent or blank, meaning the configured default
//! - a literal such as `1.2` or `main`
//! - a template containing `${BRANCH_NAME}`
//! - a template containing `${env.NAME}`
//!
//! The two placeholder kinds are independent. A version may use one kind only,
//! and any other `${...}` expression is rejected rather than passed through.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::LibraryConfiguration;
use crate::context::BuildContext;
use crate::error::{Error, Result};

/// Placeholder replaced by the build's branch name.
pub const BRANCH_PLACEHOLDER: &str = "${BRANCH_NAME}";

static ENV_PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{env\.([A-Za-z_][A-Za-z0-9_]*)\}").expect("env placeholder pattern is valid")
});

/// Shape of a requested version string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionExpression {
    Absent,
    Literal(String),
    Branch(String),
    /// A template and the environment variable it references.
    Env { template: String, variable: String },
}

impl VersionExpression {
    /// Classifies a requested version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DynamicVersion`] for unknown `${...}` expressions and
    /// for templates mixing both placeholder kinds.
    pub fn parse(library: &str, requested: Option<&str>) -> Result<Self> {
        let raw = match requested.map(str::trim).filter(|v| !v.is_empty()) {
            Some(raw) => raw,
            None => return Ok(VersionExpression::Absent),
        };

        let dynamic = || Error::DynamicVersion {
            library: library.to_string(),
            expression: raw.to_string(),
        };

        let has_branch = raw.contains(BRANCH_PLACEHOLDER);
        let env_vars: Vec<String> = ENV_PLACEHOLDER_RE
            .captures_iter(raw)
            .map(|c| c[1].to_string())
            .collect();

        let without_branch = raw.replace(BRANCH_PLACEHOLDER, "");
        let remainder = ENV_PLACEHOLDER_RE.replace_all(&without_branch, "");
        if remainder.contains("${") {
            return Err(dynamic());
        }

        match (has_branch, env_vars.as_slice()) {
            (false, []) => Ok(VersionExpression::Literal(raw.to_string())),
            (true, []) => Ok(VersionExpression::Branch(raw.to_string())),
            (false, [variable]) => Ok(VersionExpression::Env {
                template: raw.to_string(),
                variable: variable.clone(),
            }),
            _ => Err(dynamic()),
        }
    }
}

/// Computes the effective version of a library for one build.
pub struct VersionResolver;

impl VersionResolver {
    /// Resolves `requested` against `config` and the build context.
    ///
    /// # Errors
    ///
    /// - [`Error::NoVersion`] when nothing was requested and no default exists,
    ///   or a placeholder could not be filled and no default exists
    /// - [`Error::OverrideNotPermitted`] for a non-default literal when overrides
    ///   are disallowed, including placeholders whose substitution is disabled
    /// - [`Error::DynamicVersion`] for expressions that are not constant strings
    pub fn resolve(
        config: &LibraryConfiguration,
        requested: Option<&str>,
        ctx: &BuildContext,
    ) -> Result<String> {
        let library = config.name();
        match VersionExpression::parse(library, requested)? {
            VersionExpression::Absent => Self::default_version(config),
            VersionExpression::Branch(template) if config.allow_branch_name => {
                match ctx.branch_name() {
                    Some(branch) => Ok(template.replace(BRANCH_PLACEHOLDER, &branch)),
                    None => Self::default_version(config),
                }
            }
            VersionExpression::Env { template, variable } if config.allow_version_envvar => {
                match ctx.env.get(&variable).filter(|v| !v.trim().is_empty()) {
                    Some(value) => Ok(ENV_PLACEHOLDER_RE
                        .replace_all(&template, regex::NoExpand(value.trim()))
                        .into_owned()),
                    None => Self::default_version(config),
                }
            }
            VersionExpression::Branch(literal)
            | VersionExpression::Env {
                template: literal, ..
            }
            | VersionExpression::Literal(literal) => Self::check_override(config, literal),
        }
    }

    fn default_version(config: &LibraryConfiguration) -> Result<String> {
        config.default_version.clone().ok_or_else(|| Error::NoVersion {
            library: config.name().to_string(),
        })
    }

    fn check_override(config: &LibraryConfiguration, literal: String) -> Result<String> {
        if config.default_version.as_deref() == Some(literal.as_str())
            || config.allow_version_override
        {
            Ok(literal)
        } else {
            Err(Error::OverrideNotPermitted {
                library: config.name().to_string(),
            })
        }
    }
}
