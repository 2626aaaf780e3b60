//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entry::CacheEntry;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    /// Whether a caller should retry via queue redelivery. Malformed input
    /// never is; outages and timeouts always are.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidInput { .. })
    }
}

/// Durable record of "what was last served for path P under tag T, and when".
///
/// Writes are idempotent upserts keyed on `(path, tag)`; the two query
/// shapes are served by independent indexes and are only eventually
/// consistent with each other.
#[async_trait]
pub trait CacheStateRepo: Send + Sync {
    /// Last-writer-wins upsert for the entry's `(path, tag)` key.
    async fn upsert(&self, entry: CacheEntry) -> Result<(), RepoError>;

    /// All non-expired entries sharing a tag, in no particular order.
    async fn query_by_tag(&self, tag: &str) -> Result<Vec<CacheEntry>, RepoError>;

    /// Non-expired entries for a path, newest `revalidated_at` first.
    async fn query_by_path(&self, path: &str) -> Result<Vec<CacheEntry>, RepoError>;
}
