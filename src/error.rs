//! # Errors
//!
//! Two error families live here:
//!
//! - [`CacheError`]: everything the cache itself can fail with. Shape errors
//!   ([`CacheError::DimensionMismatch`], [`CacheError::OutOfRange`],
//!   [`CacheError::ZeroDimension`]) are fatal to the single call that raised them.
//!   [`CacheError::Provider`] only comes out of
//!   [`EmbeddingCache::from_config`](crate::cache::EmbeddingCache::from_config).
//!   The remaining variants are storage failures (see [`CacheError::is_storage`])
//!   and are always surfaced to the caller.
//! - [`EmbeddingError`]: failures of an [`EmbeddingProvider`](crate::embedder::EmbeddingProvider).
//!   [`EmbeddingCache::get`](crate::cache::EmbeddingCache::get) never returns these
//!   for a computation; it substitutes a zero vector and reports
//!   [`EmbeddingSource::Fallback`](crate::cache::EmbeddingSource::Fallback) instead.

use std::io;

/// Errors raised by the vector index, the metadata store and the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("offset {offset} out of range for index of {len} vectors")]
    OutOfRange { offset: usize, len: usize },

    #[error("vector dimension must be at least 1")]
    ZeroDimension,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("could not connect to metadata store: {0}")]
    Connection(#[from] diesel::result::ConnectionError),

    #[error("could not encode vector index: {0}")]
    IndexEncode(#[from] bincode::error::EncodeError),

    #[error("could not decode vector index: {0}")]
    IndexDecode(#[from] bincode::error::DecodeError),

    #[error("invalid metadata json: {0}")]
    Metadata(#[from] serde_json::Error),

    /// The configured embedding provider could not be built.
    #[error("could not set up embedding provider: {0}")]
    Provider(#[from] EmbeddingError),

    /// The persisted index and metadata store disagree in a way that cannot be repaired.
    #[error("cache is inconsistent: {vectors} vectors vs {rows} metadata rows")]
    Inconsistent { vectors: usize, rows: usize },
}

impl CacheError {
    /// `true` for failures of the persistence layer (disk, SQLite, index file).
    pub fn is_storage(&self) -> bool {
        !matches!(
            self,
            CacheError::DimensionMismatch { .. }
                | CacheError::OutOfRange { .. }
                | CacheError::ZeroDimension
                | CacheError::Provider(_)
        )
    }
}

/// Failure of the external embedding computation.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embeddings endpoint returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("embeddings endpoint returned no data")]
    EmptyResponse,

    #[error("expected {expected} embeddings, got {actual}")]
    Incomplete { expected: usize, actual: usize },

    #[error("embedding model error: {0}")]
    Model(String),
}
