//! Identifier substitution seam
//!
//! The production mapping service (a cohort database lookup maintained
//! outside this repository) lives behind [`IdentifierSwapper`]. The
//! hashing implementation provides deterministic pseudonyms for
//! deployments and tests that run without one.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Failure talking to the mapping backend.
#[derive(Debug, Error)]
pub enum SwapError {
    #[error("mapping lookup failed: {0}")]
    Lookup(String),
}

/// Maps a patient identifier to its release pseudonym.
#[async_trait]
pub trait IdentifierSwapper: Send + Sync + 'static {
    /// Returns the substitution for `identifier`, or `None` when no mapping
    /// exists. An unmapped identifier rejects the message rather than
    /// letting it travel downstream unmapped.
    async fn substitute(&self, identifier: &str) -> Result<Option<String>, SwapError>;
}

/// Derives a stable pseudonym by hashing the identifier.
pub struct HashingSwapper {
    prefix: String,
}

impl HashingSwapper {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl IdentifierSwapper for HashingSwapper {
    async fn substitute(&self, identifier: &str) -> Result<Option<String>, SwapError> {
        if identifier.trim().is_empty() {
            return Ok(None);
        }
        let digest = Sha256::digest(identifier.as_bytes());
        Ok(Some(format!("{}{:x}", self.prefix, digest)))
    }
}
