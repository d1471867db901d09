//! Container image references.
//!
//! Parses `registry[:port]/path[:tag][@sha256:<hex>]` far enough to retag a
//! push destination and to pin a pullspec to a digest.

use crate::error::ControllerError;
use std::fmt;

/// A parsed image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Parses `reference`, rejecting empty components and whitespace.
    pub fn parse(reference: &str) -> Result<Self, ControllerError> {
        let invalid = |why: &str| {
            ControllerError::Validation(format!("invalid image reference {reference:?}: {why}"))
        };
        if reference.is_empty() || reference.chars().any(char::is_whitespace) {
            return Err(invalid("empty or contains whitespace"));
        }

        let (rest, digest) = match reference.split_once('@') {
            Some((rest, digest)) => {
                validate_digest(digest)?;
                (rest, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones are a port
        let last_slash = rest.rfind('/').map_or(0, |i| i + 1);
        let (repository, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&rest[..split], Some(&rest[split + 1..]))
            }
            None => (rest, None),
        };

        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(invalid("empty repository path component"));
        }
        if let Some(tag) = tag {
            validate_tag(tag)?;
        }

        Ok(Self {
            repository: repository.to_string(),
            tag: tag.map(str::to_string),
            digest,
        })
    }

    /// Repository without tag or digest
    #[must_use]
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Same repository with `tag`, dropping any existing tag or digest.
    pub fn with_tag(&self, tag: &str) -> Result<Self, ControllerError> {
        validate_tag(tag)?;
        Ok(Self {
            repository: self.repository.clone(),
            tag: Some(tag.to_string()),
            digest: None,
        })
    }

    /// Same repository pinned to `digest`, dropping any tag.
    pub fn with_digest(&self, digest: &str) -> Result<Self, ControllerError> {
        validate_digest(digest)?;
        Ok(Self {
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Accepts `sha256:` followed by 64 lowercase hex digits.
pub fn validate_digest(digest: &str) -> Result<(), ControllerError> {
    let valid = digest.strip_prefix("sha256:").is_some_and(|hex| {
        hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    });
    if valid {
        Ok(())
    } else {
        Err(ControllerError::Validation(format!("invalid image digest {digest:?}")))
    }
}

fn validate_tag(tag: &str) -> Result<(), ControllerError> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && !tag.starts_with(['.', '-'])
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ControllerError::Validation(format!("invalid image tag {tag:?}")))
    }
}
