//! Container image references.

use crate::config::types::{LauncherError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_TAG: &str = "latest";

/// `repository[:tag]` or `repository@digest`
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
    /// Content digest (`sha256:...`); pins the image regardless of tag
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(LauncherError::Config("empty image reference".to_string()));
        }
        if reference.chars().any(char::is_whitespace) {
            return Err(LauncherError::Config(format!(
                "image reference contains whitespace: {reference:?}"
            )));
        }

        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') {
                    return Err(LauncherError::Config(format!(
                        "malformed image digest in {reference}"
                    )));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A colon before the last '/' belongs to a registry port, not a tag.
        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match name[last_slash..].rfind(':') {
            Some(idx) => {
                let split = last_slash + idx;
                (&name[..split], &name[split + 1..])
            }
            None => (name, DEFAULT_TAG),
        };

        if repository.is_empty() || tag.is_empty() {
            return Err(LauncherError::Config(format!(
                "malformed image reference: {reference}"
            )));
        }

        Ok(Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
            digest,
        })
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.digest {
            Some(digest) => write!(f, "{}@{}", self.repository, digest),
            None => write!(f, "{}:{}", self.repository, self.tag),
        }
    }
}
