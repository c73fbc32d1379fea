//! # Embedding Cache (library root)
//!
//! Local embedding infrastructure for the job search pipeline. Texts (CV sections,
//! LinkedIn entries, job postings) are embedded once, kept on disk, and compared
//! with exact nearest-neighbour search.
//!
//! - Content hashing for cache keys (`hasher`).
//! - Append-only flat L2 vector index (`vector_index`).
//! - SQLite metadata via Diesel (`metadata_store`, `models`, `schema`).
//! - Embedding providers: OpenAI-compatible HTTP and local MiniLM (`embedder`).
//! - The cache-or-compute orchestrator (`cache`).
//! - A JSON file cache for parsed documents (`file_cache`).
//! - YAML configuration (`config`) and error types (`error`).
//!
//! ## On-disk layout
//! ```text
//! <cache_dir>/
//!   embeddings.index   bincode snapshot of the vector index
//!   metadata.db        SQLite, table `embeddings`
//! ```
//! A vector's offset in the index is always its metadata row id minus one.
//!
//! ## Modules
//! - [`cache`], [`config`], [`embedder`], [`error`], [`file_cache`], [`hasher`],
//!   [`metadata_store`], [`models`], [`schema`], [`vector_index`]

use directories::ProjectDirs;
use std::error::Error;

pub mod cache;
pub mod config;
pub mod embedder;
pub mod error;
pub mod file_cache;
pub mod hasher;
pub mod metadata_store;
pub mod models;
pub mod schema;
pub mod vector_index;

pub use cache::{Embedding, EmbeddingCache, EmbeddingSource, SimilarText};
pub use embedder::{Embedder, EmbeddingProvider};
pub use error::{CacheError, EmbeddingError};

/// Return the per-platform configuration directory used by the pipeline.
///
/// This uses [`directories::ProjectDirs`] with the application triple
/// `("com", "job-search", "embedding-cache")`.
///
/// The directory is **not** created by this function.
///
/// # Errors
/// Returns an error if the platform configuration directory cannot be determined
/// (which is rare but possible in heavily sandboxed environments).
pub fn config_dir() -> Result<std::path::PathBuf, Box<dyn Error>> {
    let proj_dirs = ProjectDirs::from("com", "job-search", "embedding-cache")
        .ok_or("Unable to determine config directory")?;
    Ok(proj_dirs.config_dir().to_path_buf())
}
