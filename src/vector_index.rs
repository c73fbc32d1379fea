//! # FlatIndex
//!
//! Exact (brute force) nearest-neighbour index over fixed-dimension `f32` vectors.
//!
//! The cache targets a few hundred to a few thousand texts, so a linear scan is cheap
//! and gives exact, reproducible answers. Vectors live in one contiguous `Vec<f32>`;
//! the vector at offset `i` occupies `data[i * dimension..(i + 1) * dimension]`.
//!
//! ## Responsibilities
//! - **Append**: [`FlatIndex::add`] assigns sequential offsets starting at 0.
//! - **Search**: [`FlatIndex::search`] ranks by squared Euclidean distance, ties broken
//!   by insertion order.
//! - **Reconstruct**: [`FlatIndex::reconstruct`] returns a stored vector by offset.
//! - **Persistence**: [`FlatIndex::save`] writes a `bincode` snapshot atomically,
//!   [`FlatIndex::load`] reads it back.
//!
//! ## Quick Example
//! ```rust
//! use embedding_cache::vector_index::FlatIndex;
//!
//! # fn main() -> Result<(), embedding_cache::error::CacheError> {
//! let mut index = FlatIndex::new(2);
//! index.add(&[0.0, 0.0])?;
//! index.add(&[3.0, 4.0])?;
//! let hits = index.search(&[0.5, 0.0], 1)?;
//! assert_eq!(hits[0].offset, 0);
//! # Ok(()) }
//! ```

use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    fs,
    io::Write,
    path::Path,
};
use tempfile::NamedTempFile;

use crate::error::CacheError;

/// One search hit: where the vector sits in the index and how far it is from the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Zero-based insertion position.
    pub offset: usize,
    /// Squared Euclidean distance to the query.
    pub distance: f32,
}

/// Append-only flat L2 index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatIndex {
    dimension: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    /// Create an empty index for vectors of length `dimension`.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    /// Load the index persisted at `path`, or start an empty one if no file exists.
    ///
    /// # Errors
    /// - [`CacheError::ZeroDimension`] if `dimension` is 0.
    /// - [`CacheError::DimensionMismatch`] if the persisted index was built for a
    ///   different dimension. Changing the dimension requires clearing the cache.
    /// - I/O or decode errors if the file exists but cannot be read.
    pub fn open_or_create(path: &Path, dimension: usize) -> Result<Self, CacheError> {
        if dimension == 0 {
            return Err(CacheError::ZeroDimension);
        }
        if !path.exists() {
            return Ok(Self::new(dimension));
        }
        let index = Self::load(path)?;
        if index.dimension != dimension {
            return Err(CacheError::DimensionMismatch {
                expected: dimension,
                actual: index.dimension,
            });
        }
        Ok(index)
    }

    /// Vector length accepted by this index.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            return 0;
        }
        self.data.len() / self.dimension
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append `vector` and return the offset it was stored at.
    ///
    /// # Errors
    /// [`CacheError::DimensionMismatch`] if `vector.len() != self.dimension()`.
    pub fn add(&mut self, vector: &[f32]) -> Result<usize, CacheError> {
        self.check_dimension(vector)?;
        let offset = self.len();
        self.data.extend_from_slice(vector);
        Ok(offset)
    }

    /// Return up to `k` stored vectors closest to `query`, nearest first.
    ///
    /// Distances are squared Euclidean. Equal distances keep insertion order. An empty
    /// index, or `k == 0`, yields an empty list.
    ///
    /// # Errors
    /// [`CacheError::DimensionMismatch`] if `query.len() != self.dimension()`.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, CacheError> {
        self.check_dimension(query)?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<Neighbor> = self
            .data
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(offset, stored)| Neighbor {
                offset,
                distance: squared_euclidean_distance(query, stored),
            })
            .collect();

        hits.sort_by(|a, b| match a.distance.total_cmp(&b.distance) {
            Ordering::Equal => a.offset.cmp(&b.offset),
            other => other,
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Copy out the vector stored at `offset`.
    ///
    /// # Errors
    /// [`CacheError::OutOfRange`] if `offset >= self.len()`.
    pub fn reconstruct(&self, offset: usize) -> Result<Vec<f32>, CacheError> {
        let len = self.len();
        if offset >= len {
            return Err(CacheError::OutOfRange { offset, len });
        }
        let start = offset * self.dimension;
        Ok(self.data[start..start + self.dimension].to_vec())
    }

    /// Drop every vector.
    pub fn reset(&mut self) {
        self.data.clear();
    }

    /// Keep only the first `len` vectors. No-op if the index is already that short.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len * self.dimension);
    }

    /// Write the index to `path`.
    ///
    /// The snapshot is written to a temporary file next to `path` and renamed over it,
    /// so a crash mid-write leaves the previous snapshot intact.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let bytes = bincode::serde::encode_to_vec(self, bincode::config::standard())?;

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Read an index previously written by [`FlatIndex::save`].
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let bytes = fs::read(path)?;
        let (index, _): (FlatIndex, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        if index.dimension == 0 || index.data.len() % index.dimension != 0 {
            return Err(CacheError::IndexDecode(
                bincode::error::DecodeError::Other("vector data is not a multiple of the dimension"),
            ));
        }
        Ok(index)
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), CacheError> {
        if vector.len() != self.dimension {
            return Err(CacheError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

/// `Σ (a[i] - b[i])²` over two equal-length slices.
pub fn squared_euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}
