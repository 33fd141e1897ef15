//! Parses, normalizes, and renders `registry/repo:tag@digest` image
//! references, including Docker Hub defaulting.

use crate::digest::Sha256Digest;
use crate::error::{BuildError, Result};

pub const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";
const DEFAULT_TAG: &str = "latest";
const SCRATCH: &str = "scratch";

/// `(registry, repository, tag?, digest?)`. At least one of `tag`/`digest`
/// is always present after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<Sha256Digest>,
    is_scratch: bool,
}

impl ImageReference {
    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&Sha256Digest> {
        self.digest.as_ref()
    }

    pub fn is_scratch(&self) -> bool {
        self.is_scratch
    }

    /// The value to put in a manifest/blob URL path segment: the digest if
    /// present (digests are preferred for content addressing), else the tag.
    pub fn manifest_reference(&self) -> &str {
        if let Some(digest) = &self.digest {
            digest.as_str()
        } else {
            self.tag.as_deref().unwrap_or(DEFAULT_TAG)
        }
    }

    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            digest: None,
            ..self.clone()
        }
    }

    pub fn with_digest(&self, digest: Sha256Digest) -> Self {
        Self {
            digest: Some(digest),
            ..self.clone()
        }
    }

    /// Parses an image reference against the grammar
    /// `((registry/)?repository(:tag)?(@digest)?)`, with Docker Hub
    /// defaulting and the `scratch` sentinel.
    pub fn parse(input: &str) -> Result<Self> {
        if input == SCRATCH {
            return Ok(Self {
                registry: String::new(),
                repository: SCRATCH.to_string(),
                tag: None,
                digest: None,
                is_scratch: true,
            });
        }

        let (before_digest, digest) = match input.rsplit_once('@') {
            Some((rest, digest_str)) => (rest, Some(Sha256Digest::parse(digest_str)?)),
            None => (input, None),
        };

        // A tag separator is the last `:` after the last `/`, so a registry
        // port (`localhost:5000/x`) is never mistaken for a tag separator.
        let last_slash = before_digest.rfind('/');
        let tag_colon = before_digest.rfind(':').filter(|&pos| match last_slash {
            Some(slash) => pos > slash,
            None => true,
        });

        let (before_tag, tag) = match tag_colon {
            Some(pos) => (
                &before_digest[..pos],
                Some(before_digest[pos + 1..].to_string()),
            ),
            None => (before_digest, None),
        };

        if before_tag.is_empty() {
            return Err(BuildError::InvalidImageReference {
                reference: input.to_string(),
                reason: "repository name is empty".to_string(),
            });
        }

        let (registry, repository) = split_registry_and_repository(before_tag);

        if repository.is_empty() {
            return Err(BuildError::InvalidImageReference {
                reference: input.to_string(),
                reason: "repository name is empty".to_string(),
            });
        }

        let is_docker_hub = registry == DOCKER_HUB_REGISTRY;
        let repository = if is_docker_hub && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
            is_scratch: false,
        })
    }
}

/// Splits `maybe-registry/rest` into `(registry, repository)`, applying a
/// "looks like a registry" heuristic: a first path segment counts as a
/// registry host only if it contains a `.` or `:`, or is exactly
/// `localhost`. Otherwise the whole input is the repository and the
/// registry defaults to Docker Hub.
fn split_registry_and_repository(input: &str) -> (String, String) {
    match input.split_once('/') {
        Some((first, rest)) if looks_like_registry(first) => (first.to_string(), rest.to_string()),
        _ => (DOCKER_HUB_REGISTRY.to_string(), input.to_string()),
    }
}

fn looks_like_registry(segment: &str) -> bool {
    segment == "localhost" || segment.contains('.') || segment.contains(':')
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_scratch {
            return f.write_str(SCRATCH);
        }

        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_round_trips() {
        let r = ImageReference::parse("scratch").unwrap();
        assert!(r.is_scratch());
        assert_eq!(r.to_string(), "scratch");
    }

    #[test]
    fn bare_repo_defaults_to_docker_hub_and_library() {
        let r = ImageReference::parse("alpine").unwrap();
        assert_eq!(r.registry(), DOCKER_HUB_REGISTRY);
        assert_eq!(r.repository(), "library/alpine");
        assert_eq!(r.tag(), Some("latest"));
        assert_eq!(r.to_string(), "registry-1.docker.io/library/alpine:latest");
    }

    #[test]
    fn localhost_with_port_defaults_tag_to_latest() {
        let r = ImageReference::parse("localhost:5000/x").unwrap();
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.repository(), "x");
        assert_eq!(r.tag(), Some("latest"));
    }

    #[test]
    fn digest_reference_has_no_implicit_tag() {
        let hex = "a".repeat(64);
        let r = ImageReference::parse(&format!("myregistry.example.com/app@sha256:{hex}")).unwrap();
        assert_eq!(r.tag(), None);
        assert!(r.digest().is_some());
    }

    #[test]
    fn round_trip_for_explicit_tag_and_registry() {
        let original = "my.registry.io:443/team/app:v1.2.3";
        let r = ImageReference::parse(original).unwrap();
        assert_eq!(r.to_string(), original);
        let r2 = ImageReference::parse(&r.to_string()).unwrap();
        assert_eq!(r, r2);
    }

    #[test]
    fn multi_segment_docker_hub_repo_not_prefixed() {
        let r = ImageReference::parse("myuser/myapp:1.0").unwrap();
        assert_eq!(r.registry(), DOCKER_HUB_REGISTRY);
        assert_eq!(r.repository(), "myuser/myapp");
    }
}
