use std::{fmt, str::FromStr};

use getset::Getters;
use oci_spec::image::Digest;
use regex::Regex;

use crate::{MachinaError, MachinaResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The registry assumed when a reference does not name one.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// The repository namespace assumed for single-segment repositories on the default registry.
pub const DEFAULT_REPO_NAMESPACE: &str = "library";

/// The tag assumed when a reference does not name one.
pub const DEFAULT_TAG: &str = "latest";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A parsed container image reference.
///
/// Supported input formats:
/// - `repository`
/// - `repository:tag`
/// - `registry/repository:tag`
/// - `registry/repository@digest`
/// - `registry/repository:tag@digest`
///
/// Omitted parts default to [`DEFAULT_REGISTRY`], [`DEFAULT_REPO_NAMESPACE`]
/// and [`DEFAULT_TAG`], so `alpine` resolves to `docker.io/library/alpine:latest`.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct Reference {
    /// The registry where the image is hosted.
    registry: String,

    /// The repository name of the image.
    repository: String,

    /// The image tag.
    tag: String,

    /// An optional content digest pinning the image.
    digest: Option<Digest>,
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for Reference {
    type Err = MachinaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MachinaError::ImageReference(
                "input string is empty".into(),
            ));
        }

        let (remainder, digest) = match s.split_once('@') {
            Some((pre, digest_str)) => {
                let digest = digest_str.parse::<Digest>().map_err(|e| {
                    MachinaError::ImageReference(format!("invalid digest: {}", e))
                })?;
                (pre, Some(digest))
            }
            None => (s, None),
        };

        let (registry, path) = split_registry(remainder);
        let (repository, tag) = split_repository_and_tag(path)?;

        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("{}/{}", DEFAULT_REPO_NAMESPACE, repository)
        } else {
            repository.to_string()
        };

        validate_registry(&registry)?;
        validate_repository(&repository)?;
        validate_tag(&tag)?;

        Ok(Reference {
            registry,
            repository,
            tag,
            digest,
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Splits the leading registry component off a reference path.
///
/// The first path segment is a registry only if it contains a dot, a port, or
/// is the literal `localhost`, the same heuristic container tooling uses.
fn split_registry(s: &str) -> (String, &str) {
    if let Some((first, rest)) = s.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            return (first.to_string(), rest);
        }
    }
    (DEFAULT_REGISTRY.to_string(), s)
}

/// Splits `repository[:tag]`, defaulting the tag when absent.
fn split_repository_and_tag(s: &str) -> MachinaResult<(&str, String)> {
    match s.rsplit_once(':') {
        // A colon inside a path segment would be a malformed repository; only
        // treat it as a tag separator when it follows the last slash.
        Some((repo, tag)) if !tag.contains('/') => {
            if repo.is_empty() || tag.is_empty() {
                return Err(MachinaError::ImageReference(format!(
                    "invalid repository or tag: {}",
                    s
                )));
            }
            Ok((repo, tag.to_string()))
        }
        _ => Ok((s, DEFAULT_TAG.to_string())),
    }
}

/// Validates the given registry string.
///
/// The registry may contain alphanumerics, dashes and dots, with an optional
/// port number.
fn validate_registry(registry: &str) -> MachinaResult<()> {
    let re = Regex::new(r"^[a-zA-Z0-9.-]+(:[0-9]+)?$").unwrap();
    if re.is_match(registry) {
        Ok(())
    } else {
        Err(MachinaError::ImageReference(format!(
            "invalid registry: {}",
            registry
        )))
    }
}

/// Validates the repository name.
///
/// The repository name allows lowercase letters, numbers and certain
/// punctuation (._-) in slash-separated segments.
fn validate_repository(repository: &str) -> MachinaResult<()> {
    let re =
        Regex::new(r"^([a-z0-9]+(?:[._-][a-z0-9]+)*)(/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$").unwrap();
    if re.is_match(repository) {
        Ok(())
    } else {
        Err(MachinaError::ImageReference(format!(
            "invalid repository: {}",
            repository
        )))
    }
}

/// Validates the tag.
fn validate_tag(tag: &str) -> MachinaResult<()> {
    let re = Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").unwrap();
    if re.is_match(tag) {
        Ok(())
    } else {
        Err(MachinaError::ImageReference(format!("invalid tag: {}", tag)))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_bare_repository_gets_defaults() -> anyhow::Result<()> {
        let reference: Reference = "alpine".parse()?;

        assert_eq!(reference.registry(), "docker.io");
        assert_eq!(reference.repository(), "library/alpine");
        assert_eq!(reference.tag(), "latest");
        assert!(reference.digest().is_none());
        assert_eq!(reference.to_string(), "docker.io/library/alpine:latest");

        Ok(())
    }

    #[test]
    fn test_reference_with_tag() -> anyhow::Result<()> {
        let reference: Reference = "alpine:3.20".parse()?;

        assert_eq!(reference.repository(), "library/alpine");
        assert_eq!(reference.tag(), "3.20");

        Ok(())
    }

    #[test]
    fn test_reference_with_registry_and_namespace() -> anyhow::Result<()> {
        let reference: Reference = "ghcr.io/acme/widget:v1".parse()?;

        assert_eq!(reference.registry(), "ghcr.io");
        assert_eq!(reference.repository(), "acme/widget");
        assert_eq!(reference.tag(), "v1");

        Ok(())
    }

    #[test]
    fn test_reference_with_port_and_digest() -> anyhow::Result<()> {
        let digest = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        let reference: Reference =
            format!("localhost:5000/acme/widget:v1@{}", digest).parse()?;

        assert_eq!(reference.registry(), "localhost:5000");
        assert_eq!(reference.repository(), "acme/widget");
        assert_eq!(reference.tag(), "v1");
        assert_eq!(reference.digest().as_ref().unwrap().to_string(), digest);

        Ok(())
    }

    #[test]
    fn test_reference_rejects_malformed_inputs() {
        for input in ["", "  ", "Alpine", "alpine:", ":latest", "alpine@not-a-digest"] {
            assert!(
                input.parse::<Reference>().is_err(),
                "expected {:?} to be rejected",
                input
            );
        }
    }
}
