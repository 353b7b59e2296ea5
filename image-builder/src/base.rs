//! Base environment references.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ProvisionError, ProvisionResult};

const DEFAULT_TAG: &str = "latest";

/// Reference to the pre-built runtime image an environment starts from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BaseImage {
    name: String,
    /// `None` only for a digest reference without a tag
    tag: Option<String>,
    digest: Option<String>,
}

impl BaseImage {
    /// Parse `name[:tag][@digest]`
    pub fn parse(reference: &str) -> ProvisionResult<Self> {
        let invalid = |reason: &str| ProvisionError::InvalidBaseImage {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        if reference.is_empty() {
            return Err(invalid("reference is empty"));
        }
        if reference.chars().any(char::is_whitespace) {
            return Err(invalid("reference contains whitespace"));
        }

        let (rest, digest) = match reference.split_once('@') {
            Some((rest, digest)) if !digest.is_empty() => (rest, Some(digest.to_string())),
            Some(_) => return Err(invalid("digest is empty")),
            None => (reference, None),
        };

        // A colon before the last '/' belongs to a registry port, not a tag.
        let last_slash = rest.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&rest[..split], Some(&rest[split + 1..]))
            }
            None => (rest, None),
        };

        if name.is_empty() || name.ends_with('/') {
            return Err(invalid("image name is empty"));
        }
        if tag.is_some_and(str::is_empty) {
            return Err(invalid("tag is empty"));
        }
        // Without a digest the implicit tag is spelled out.
        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG),
            (tag, _) => tag,
        };

        Ok(Self {
            name: name.to_string(),
            tag: tag.map(str::to_string),
            digest,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tag, `latest` when none was given
    pub fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }
}

impl fmt::Display for BaseImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.tag, &self.digest) {
            (None, Some(digest)) => write!(f, "{}@{}", self.name, digest),
            (tag, digest) => {
                write!(f, "{}:{}", self.name, tag.as_deref().unwrap_or(DEFAULT_TAG))?;
                if let Some(digest) = digest {
                    write!(f, "@{}", digest)?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for BaseImage {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BaseImage {
    type Error = ProvisionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BaseImage> for String {
    fn from(image: BaseImage) -> Self {
        image.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_name_and_tag() {
        let image = BaseImage::parse("python:3.10-slim").unwrap();
        assert_eq!(image.name(), "python");
        assert_eq!(image.tag(), "3.10-slim");
        assert_eq!(image.to_string(), "python:3.10-slim");
    }

    #[test]
    fn test_parse_defaults_to_latest() {
        let image = BaseImage::parse("pytorch/pytorch").unwrap();
        assert_eq!(image.tag(), "latest");
        assert_eq!(image.to_string(), "pytorch/pytorch:latest");
    }

    #[test]
    fn test_registry_port_is_not_a_tag() {
        let image = BaseImage::parse("registry.local:5000/team/runtime").unwrap();
        assert_eq!(image.name(), "registry.local:5000/team/runtime");
        assert_eq!(image.tag(), "latest");

        let image = BaseImage::parse("registry.local:5000/team/runtime:1.2").unwrap();
        assert_eq!(image.name(), "registry.local:5000/team/runtime");
        assert_eq!(image.tag(), "1.2");
    }

    #[test]
    fn test_digest_preserved() {
        let image = BaseImage::parse("python:3.11@sha256:abc123").unwrap();
        assert_eq!(image.digest(), Some("sha256:abc123"));
        assert_eq!(image.to_string(), "python:3.11@sha256:abc123");
    }

    #[test]
    fn test_digest_only_reference_round_trips() {
        let image = BaseImage::parse("python@sha256:abc123").unwrap();
        assert_eq!(image.tag(), "latest");
        assert_eq!(image.digest(), Some("sha256:abc123"));
        assert_eq!(image.to_string(), "python@sha256:abc123");
        assert_eq!(BaseImage::parse(&image.to_string()).unwrap(), image);

        let image = BaseImage::parse("registry.local:5000/team/runtime@sha256:def").unwrap();
        assert_eq!(image.name(), "registry.local:5000/team/runtime");
        assert_eq!(image.to_string(), "registry.local:5000/team/runtime@sha256:def");
    }

    #[test]
    fn test_rejects_malformed_references() {
        for reference in ["", "python:", ":3.10", "py thon:3", "python@", "registry/:1"] {
            assert!(
                matches!(
                    BaseImage::parse(reference),
                    Err(ProvisionError::InvalidBaseImage { .. })
                ),
                "expected rejection for {:?}",
                reference
            );
        }
    }

    #[test]
    fn test_serde_uses_string_form() {
        let image = BaseImage::parse("python:3.10").unwrap();
        let json = serde_json::to_string(&image).unwrap();
        assert_eq!(json, "\"python:3.10\"");
        let back: BaseImage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, image);
    }
}
