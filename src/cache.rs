//! # EmbeddingCache
//!
//! Cache-or-compute front door for embeddings. Composes:
//!
//! - a [`FlatIndex`] holding the vectors (`<dir>/embeddings.index`),
//! - a [`MetadataStore`] holding text and metadata (`<dir>/metadata.db`),
//! - an [`EmbeddingProvider`] that computes vectors on a miss.
//!
//! Row `id` in the store and vector offset in the index are tied by
//! `offset = id - 1`.
//!
//! ## Failure policy
//! - Provider failures never reach the caller of [`EmbeddingCache::get`]: a zero vector
//!   comes back instead. [`EmbeddingCache::get_detailed`] reports it as
//!   [`EmbeddingSource::Fallback`].
//! - Storage failures (disk, SQLite, index file) are returned as errors.
//!
//! ## Write ordering
//! A new entry is written as: append vector, save index, insert row. If the insert
//! fails the append is rolled back. A crash between saving the index and inserting
//! the row leaves one orphan vector at the tail, which [`EmbeddingCache::open`] trims.
//!
//! ## Quick Example
//! ```no_run
//! use embedding_cache::cache::EmbeddingCache;
//! use embedding_cache::embedder::{OpenAiEmbedder, OPENAI_DIMENSION, OPENAI_DEFAULT_MODEL};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let embedder = OpenAiEmbedder::new("https://api.openai.com/v1", "sk-...", OPENAI_DEFAULT_MODEL);
//! let mut cache = EmbeddingCache::open("cache", OPENAI_DIMENSION, embedder)?;
//! let v = cache.get("cloud architecture", None, true).await?;
//! let similar = cache.search_similar(&v, 5)?;
//! println!("{} neighbours", similar.len());
//! # Ok(()) }
//! ```

use serde_json::Value as JsonValue;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::embedder::{Embedder, EmbeddingProvider};
use crate::error::{CacheError, EmbeddingError};
use crate::hasher::content_hash;
use crate::metadata_store::{CacheEntry, MetadataStore, Upsert};
use crate::models::{offset_to_row_id, row_id_to_offset};
use crate::vector_index::FlatIndex;

/// File name of the persisted vector index inside the cache directory.
pub const INDEX_FILE: &str = "embeddings.index";
/// File name of the SQLite metadata store inside the cache directory.
pub const METADATA_FILE: &str = "metadata.db";

/// Where a returned vector came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingSource {
    /// Input text was empty; the vector is all zeros.
    Empty,
    /// Served from the cache without calling the provider.
    Cached,
    /// Freshly computed by the provider.
    Computed,
    /// The provider failed; the vector is all zeros and nothing was stored.
    Fallback,
}

/// A vector plus its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub source: EmbeddingSource,
}

/// One result of [`EmbeddingCache::search_similar`].
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarText {
    pub text: String,
    pub metadata: Option<JsonValue>,
    /// Squared Euclidean distance to the query.
    pub distance: f32,
}

/// Snapshot of cache size and location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub dimension: usize,
    pub dir: PathBuf,
}

/// Persistent text → embedding cache.
pub struct EmbeddingCache<P> {
    dir: PathBuf,
    index_path: PathBuf,
    index: FlatIndex,
    store: MetadataStore,
    provider: P,
}

impl EmbeddingCache<Embedder> {
    /// Build a cache backed by the provider `config` selects.
    ///
    /// # Errors
    /// - [`CacheError::Provider`] if the provider cannot be built (model download).
    /// - [`CacheError::DimensionMismatch`] if a local model's output size differs
    ///   from the configured dimension.
    /// - Anything [`EmbeddingCache::open`] returns.
    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        let dimension = config.resolved_dimension();
        let embedder = Embedder::from_config(config)?;
        if let Some(actual) = embedder.dimension() {
            if actual != dimension {
                return Err(CacheError::DimensionMismatch {
                    expected: dimension,
                    actual,
                });
            }
        }
        Self::open(&config.cache_dir, dimension, embedder)
    }
}

impl<P: EmbeddingProvider> EmbeddingCache<P> {
    /// Open the cache rooted at `dir`, creating the directory and files as needed.
    ///
    /// An existing index is loaded and checked against the metadata store. Orphan
    /// vectors at the tail of the index are dropped.
    ///
    /// # Errors
    /// - [`CacheError::ZeroDimension`] if `dimension` is 0.
    /// - [`CacheError::DimensionMismatch`] if the persisted index has another dimension.
    /// - [`CacheError::Inconsistent`] if the store has rows the index cannot back.
    /// - Any storage error while creating or reading the files.
    pub fn open(dir: impl AsRef<Path>, dimension: usize, provider: P) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let index_path = dir.join(INDEX_FILE);
        let index = FlatIndex::open_or_create(&index_path, dimension)?;
        let store = MetadataStore::open(&dir.join(METADATA_FILE))?;

        let mut cache = Self {
            dir,
            index_path,
            index,
            store,
            provider,
        };
        cache.reconcile()?;

        info!(
            "Opened embedding cache at {} with {} entries",
            cache.dir.display(),
            cache.index.len()
        );
        Ok(cache)
    }

    fn reconcile(&mut self) -> Result<(), CacheError> {
        let rows = self.store.count()?;
        let max_row_id = self.store.max_row_id()?.unwrap_or(0) as usize;
        let vectors = self.index.len();

        if max_row_id != rows || rows > vectors {
            return Err(CacheError::Inconsistent { vectors, rows });
        }
        if vectors > rows {
            warn!(
                "Dropping {} orphan vector(s) left by an interrupted insert",
                vectors - rows
            );
            self.index.truncate(rows);
            self.index.save(&self.index_path)?;
        }
        Ok(())
    }

    /// Embedding for `text`, from cache when possible.
    ///
    /// - Empty text returns a zero vector without touching storage or the provider.
    /// - With `use_cache`, a hit is returned as stored; a miss is computed and stored
    ///   under `metadata`.
    /// - Without `use_cache`, the provider is always called and nothing is stored.
    /// - A provider failure yields a zero vector.
    ///
    /// # Errors
    /// Only storage errors. See [`EmbeddingCache::get_detailed`] to tell a masked
    /// provider failure from a real result.
    pub async fn get(
        &mut self,
        text: &str,
        metadata: Option<&JsonValue>,
        use_cache: bool,
    ) -> Result<Vec<f32>, CacheError> {
        Ok(self.get_detailed(text, metadata, use_cache).await?.vector)
    }

    /// Same as [`EmbeddingCache::get`] but also reports where the vector came from.
    pub async fn get_detailed(
        &mut self,
        text: &str,
        metadata: Option<&JsonValue>,
        use_cache: bool,
    ) -> Result<Embedding, CacheError> {
        if text.is_empty() {
            debug!("Empty text, returning zero vector");
            return Ok(self.zero_embedding(EmbeddingSource::Empty));
        }

        if use_cache {
            if let Some(vector) = self.cached_vector(text)? {
                debug!("Cache hit for text: {}", preview(text));
                return Ok(Embedding {
                    vector,
                    source: EmbeddingSource::Cached,
                });
            }
            debug!("Cache miss for text: {}", preview(text));
        }

        debug!("Computing embedding for text: {}", preview(text));
        let outcome = self.provider.compute_embedding(text).await;
        self.finish_computed(text, outcome, metadata, use_cache)
    }

    /// Embeddings for `texts`, one per input in the same order.
    ///
    /// `metadata_list[i]` goes with `texts[i]`; a short list is padded with `None`.
    /// Misses are sent to the provider as one batch. If the batch fails, each miss is
    /// retried alone so one bad text cannot zero the others.
    pub async fn get_many(
        &mut self,
        texts: &[String],
        metadata_list: Option<&[Option<JsonValue>]>,
        use_cache: bool,
    ) -> Result<Vec<Vec<f32>>, CacheError> {
        let embeddings = self.get_many_detailed(texts, metadata_list, use_cache).await?;
        Ok(embeddings.into_iter().map(|e| e.vector).collect())
    }

    /// Batch form of [`EmbeddingCache::get_detailed`].
    pub async fn get_many_detailed(
        &mut self,
        texts: &[String],
        metadata_list: Option<&[Option<JsonValue>]>,
        use_cache: bool,
    ) -> Result<Vec<Embedding>, CacheError> {
        let mut results = vec![self.zero_embedding(EmbeddingSource::Fallback); texts.len()];
        let mut misses = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            if text.is_empty() {
                results[i].source = EmbeddingSource::Empty;
                continue;
            }
            if use_cache {
                if let Some(vector) = self.cached_vector(text)? {
                    results[i] = Embedding {
                        vector,
                        source: EmbeddingSource::Cached,
                    };
                    continue;
                }
            }
            misses.push(i);
        }

        if misses.is_empty() {
            return Ok(results);
        }

        debug!("Computing {} embedding(s) in one batch", misses.len());
        let batch: Vec<String> = misses.iter().map(|&i| texts[i].clone()).collect();
        let outcomes: Vec<Result<Vec<f32>, EmbeddingError>> =
            match self.provider.compute_embeddings(&batch).await {
                Ok(vectors) if vectors.len() == batch.len() => {
                    vectors.into_iter().map(Ok).collect()
                }
                batch_result => {
                    if let Err(err) = batch_result {
                        warn!("Batch embedding failed ({}), retrying one by one", err);
                    } else {
                        warn!("Batch embedding returned the wrong count, retrying one by one");
                    }
                    let mut outcomes = Vec::with_capacity(batch.len());
                    for text in &batch {
                        outcomes.push(self.provider.compute_embedding(text).await);
                    }
                    outcomes
                }
            };

        for (i, outcome) in misses.into_iter().zip(outcomes) {
            let metadata = metadata_list
                .and_then(|list| list.get(i))
                .and_then(|m| m.as_ref());
            results[i] = self.finish_computed(&texts[i], outcome, metadata, use_cache)?;
        }
        Ok(results)
    }

    /// Cache `vector` for `text` and return its offset.
    ///
    /// If `text` is already cached only its metadata is replaced; the stored vector
    /// and offset stay as they are.
    ///
    /// # Errors
    /// [`CacheError::DimensionMismatch`] for a vector of the wrong length, or any
    /// storage error.
    pub fn store(
        &mut self,
        text: &str,
        vector: &[f32],
        metadata: Option<&JsonValue>,
    ) -> Result<usize, CacheError> {
        let hash = content_hash(text);

        if let Some(row_id) = self.store.lookup_by_hash(&hash)? {
            self.store.upsert(&hash, text, metadata)?;
            return Ok(row_id_to_offset(row_id));
        }

        let offset = self.index.add(vector)?;
        if let Err(err) = self.index.save(&self.index_path) {
            self.index.truncate(offset);
            return Err(err);
        }

        match self.store.upsert(&hash, text, metadata) {
            Ok(Upsert::Inserted(row_id)) if row_id_to_offset(row_id) == offset => {
                debug!("Cached text at offset {}: {}", offset, preview(text));
                Ok(offset)
            }
            Ok(upsert) => Err(CacheError::Inconsistent {
                vectors: self.index.len(),
                rows: upsert.row_id() as usize,
            }),
            Err(err) => {
                self.rollback_append(offset);
                Err(err)
            }
        }
    }

    /// The `k` cached texts nearest to `vector`, nearest first.
    pub fn search_similar(&mut self, vector: &[f32], k: usize) -> Result<Vec<SimilarText>, CacheError> {
        let hits = self.index.search(vector, k)?;

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let Some((text, metadata)) = self.store.lookup_by_row_id(offset_to_row_id(hit.offset))?
            else {
                return Err(CacheError::Inconsistent {
                    vectors: self.index.len(),
                    rows: self.store.count()?,
                });
            };
            results.push(SimilarText {
                text,
                metadata,
                distance: hit.distance,
            });
        }
        Ok(results)
    }

    /// The stored entry for `text`, if cached.
    pub fn entry(&mut self, text: &str) -> Result<Option<CacheEntry>, CacheError> {
        match self.store.lookup_by_hash(&content_hash(text))? {
            Some(row_id) => self.store.entry(row_id),
            None => Ok(None),
        }
    }

    /// Remove every entry.
    ///
    /// The store is cleared first, then the index, so an interruption in between is
    /// repaired by the next [`EmbeddingCache::open`].
    pub fn clear(&mut self) -> Result<(), CacheError> {
        self.store.clear()?;
        self.index.reset();
        self.index.save(&self.index_path)?;
        info!("Cleared embedding cache at {}", self.dir.display());
        Ok(())
    }

    /// Number of cached texts.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.index.dimension()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            dimension: self.dimension(),
            dir: self.dir.clone(),
        }
    }

    fn cached_vector(&mut self, text: &str) -> Result<Option<Vec<f32>>, CacheError> {
        match self.store.lookup_by_hash(&content_hash(text))? {
            Some(row_id) => Ok(Some(self.index.reconstruct(row_id_to_offset(row_id))?)),
            None => Ok(None),
        }
    }

    fn finish_computed(
        &mut self,
        text: &str,
        outcome: Result<Vec<f32>, EmbeddingError>,
        metadata: Option<&JsonValue>,
        use_cache: bool,
    ) -> Result<Embedding, CacheError> {
        let vector = match outcome {
            Ok(vector) if vector.len() == self.dimension() => vector,
            Ok(vector) => {
                warn!(
                    "Provider returned {} values, expected {}; using zero vector",
                    vector.len(),
                    self.dimension()
                );
                return Ok(self.zero_embedding(EmbeddingSource::Fallback));
            }
            Err(err) => {
                warn!("Error getting embedding: {}; using zero vector", err);
                return Ok(self.zero_embedding(EmbeddingSource::Fallback));
            }
        };

        if use_cache {
            self.store(text, &vector, metadata)?;
        }
        Ok(Embedding {
            vector,
            source: EmbeddingSource::Computed,
        })
    }

    fn rollback_append(&mut self, offset: usize) {
        self.index.truncate(offset);
        if let Err(err) = self.index.save(&self.index_path) {
            warn!("Could not persist rolled back index: {}", err);
        }
    }

    fn zero_embedding(&self, source: EmbeddingSource) -> Embedding {
        Embedding {
            vector: vec![0.0; self.dimension()],
            source,
        }
    }
}

/// First 50 characters of `text`, for log lines.
fn preview(text: &str) -> String {
    let mut preview: String = text.chars().take(50).collect();
    if preview.len() < text.len() {
        preview.push_str("...");
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::prelude::*;
    use serde_json::json;
    use std::cell::{Cell, RefCell};
    use std::collections::{HashMap, HashSet};
    use tempfile::{TempDir, tempdir};

    const DIM: usize = 3;

    fn setup() {
        let _ = tracing_subscriber::fmt::try_init();
    }

    /// Returns canned vectors and counts calls.
    #[derive(Default)]
    struct FakeProvider {
        vectors: HashMap<String, Vec<f32>>,
        failing: HashSet<String>,
        fail_batches: bool,
        calls: Cell<usize>,
        batch_calls: Cell<usize>,
        seen: RefCell<Vec<String>>,
    }

    impl FakeProvider {
        fn with(pairs: &[(&str, [f32; DIM])]) -> Self {
            Self {
                vectors: pairs
                    .iter()
                    .map(|(t, v)| (t.to_string(), v.to_vec()))
                    .collect(),
                ..Self::default()
            }
        }

        fn failing(mut self, text: &str) -> Self {
            self.failing.insert(text.to_string());
            self
        }
    }

    impl EmbeddingProvider for FakeProvider {
        async fn compute_embedding(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.calls.set(self.calls.get() + 1);
            self.seen.borrow_mut().push(text.to_string());
            if self.failing.contains(text) {
                return Err(EmbeddingError::Model("boom".into()));
            }
            Ok(self
                .vectors
                .get(text)
                .cloned()
                .unwrap_or_else(|| vec![text.len() as f32, 1.0, 0.0]))
        }

        async fn compute_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.batch_calls.set(self.batch_calls.get() + 1);
            if self.fail_batches {
                return Err(EmbeddingError::EmptyResponse);
            }
            let mut out = Vec::new();
            for text in texts {
                out.push(self.compute_embedding(text).await?);
            }
            Ok(out)
        }
    }

    fn open(provider: FakeProvider) -> (TempDir, EmbeddingCache<FakeProvider>) {
        setup();
        let dir = tempdir().unwrap();
        let cache = EmbeddingCache::open(dir.path().join("cache"), DIM, provider).unwrap();
        (dir, cache)
    }

    fn scenario_provider() -> FakeProvider {
        FakeProvider::with(&[
            ("cloud architecture", [1.0, 0.0, 0.0]),
            ("team leadership", [0.0, 0.0, 1.0]),
            ("cloud security", [0.9, 0.1, 0.0]),
        ])
    }

    #[tokio::test]
    async fn empty_text_is_zero_vector_without_provider_or_storage() {
        let (_dir, mut cache) = open(FakeProvider::default());
        let embedding = cache.get_detailed("", None, true).await.unwrap();
        assert_eq!(embedding.vector, vec![0.0; DIM]);
        assert_eq!(embedding.source, EmbeddingSource::Empty);
        assert_eq!(cache.provider().calls.get(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn second_get_is_a_cache_hit() {
        let (_dir, mut cache) = open(scenario_provider());
        let meta = json!({"source": "cv"});

        let first = cache
            .get_detailed("cloud architecture", Some(&meta), true)
            .await
            .unwrap();
        let second = cache
            .get_detailed("cloud architecture", None, true)
            .await
            .unwrap();

        assert_eq!(first.source, EmbeddingSource::Computed);
        assert_eq!(second.source, EmbeddingSource::Cached);
        assert_eq!(first.vector, vec![1.0, 0.0, 0.0]);
        assert_eq!(second.vector, first.vector);
        assert_eq!(cache.provider().calls.get(), 1);
    }

    #[tokio::test]
    async fn use_cache_false_always_computes_and_never_stores() {
        let (_dir, mut cache) = open(scenario_provider());
        cache.get("team leadership", None, false).await.unwrap();
        cache.get("team leadership", None, false).await.unwrap();
        assert_eq!(cache.provider().calls.get(), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.entry("team leadership").unwrap(), None);
    }

    #[tokio::test]
    async fn provider_failure_falls_back_to_zero_vector() {
        let (_dir, mut cache) = open(FakeProvider::default().failing("flaky"));
        let embedding = cache.get_detailed("flaky", None, true).await.unwrap();
        assert_eq!(embedding.vector, vec![0.0; DIM]);
        assert_eq!(embedding.source, EmbeddingSource::Fallback);
        assert!(cache.is_empty());

        // nothing was cached, so the provider is asked again
        cache.get("flaky", None, true).await.unwrap();
        assert_eq!(cache.provider().calls.get(), 2);
    }

    #[tokio::test]
    async fn wrong_dimension_from_provider_is_a_fallback() {
        let mut provider = FakeProvider::default();
        provider.vectors.insert("short".into(), vec![1.0]);
        let (_dir, mut cache) = open(provider);
        let embedding = cache.get_detailed("short", None, true).await.unwrap();
        assert_eq!(embedding.source, EmbeddingSource::Fallback);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn row_ids_track_offsets() {
        let (_dir, mut cache) = open(FakeProvider::default());
        let texts = ["a", "bb", "ccc", "dddd"];
        for text in texts {
            cache.get(text, None, true).await.unwrap();
        }
        assert_eq!(cache.len(), texts.len());
        assert_eq!(cache.store.count().unwrap(), texts.len());
        for (offset, text) in texts.iter().enumerate() {
            let entry = cache.entry(text).unwrap().unwrap();
            assert_eq!(entry.vector_offset, offset);
            assert_eq!(
                cache.store.lookup_by_hash(&content_hash(text)).unwrap(),
                Some(offset_to_row_id(offset))
            );
        }
    }

    #[tokio::test]
    async fn duplicate_store_updates_metadata_only() {
        let (_dir, mut cache) = open(FakeProvider::default());
        let first = cache
            .store("cloud security", &[1.0, 2.0, 3.0], Some(&json!({"v": 1})))
            .unwrap();
        let second = cache
            .store("cloud security", &[9.0, 9.0, 9.0], Some(&json!({"v": 2})))
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);

        let row_id = cache
            .store
            .lookup_by_hash(&content_hash("cloud security"))
            .unwrap()
            .unwrap();
        let (text, metadata) = cache.store.lookup_by_row_id(row_id).unwrap().unwrap();
        assert_eq!(text, "cloud security");
        assert_eq!(metadata, Some(json!({"v": 2})));
        assert_eq!(
            cache.get("cloud security", None, true).await.unwrap(),
            vec![1.0, 2.0, 3.0]
        );
    }

    #[test]
    fn store_rejects_wrong_dimension() {
        let (_dir, mut cache) = open(FakeProvider::default());
        assert!(matches!(
            cache.store("x", &[1.0], None),
            Err(CacheError::DimensionMismatch { expected: 3, actual: 1 })
        ));
        assert!(cache.is_empty());
        assert_eq!(cache.entry("x").unwrap(), None);
    }

    #[tokio::test]
    async fn search_similar_finds_the_cloud_texts() {
        let (_dir, mut cache) = open(scenario_provider());
        let a = cache.get("cloud architecture", None, true).await.unwrap();
        cache.get("team leadership", None, true).await.unwrap();
        cache
            .get("cloud security", Some(&json!({"kind": "skill"})), true)
            .await
            .unwrap();

        let results = cache.search_similar(&a, 2).unwrap();
        let texts: Vec<&str> = results.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["cloud architecture", "cloud security"]);
        assert_eq!(results[0].distance, 0.0);
        assert!(results[1].distance > 0.0);
        assert_eq!(results[1].metadata, Some(json!({"kind": "skill"})));

        let all = cache.search_similar(&a, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn search_on_empty_cache_is_empty() {
        let (_dir, mut cache) = open(FakeProvider::default());
        assert!(cache.search_similar(&[1.0, 0.0, 0.0], 5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_empties_everything() {
        let (_dir, mut cache) = open(scenario_provider());
        let a = cache.get("cloud architecture", None, true).await.unwrap();
        cache.get("team leadership", None, true).await.unwrap();

        cache.clear().unwrap();
        assert!(cache.is_empty());
        assert!(cache.search_similar(&a, 5).unwrap().is_empty());

        let again = cache
            .get_detailed("cloud architecture", None, true)
            .await
            .unwrap();
        assert_eq!(again.source, EmbeddingSource::Computed);
        assert_eq!(cache.entry("cloud architecture").unwrap().unwrap().vector_offset, 0);
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        setup();
        let dir = tempdir().unwrap();
        {
            let mut cache = EmbeddingCache::open(dir.path(), DIM, scenario_provider()).unwrap();
            cache.get("team leadership", None, true).await.unwrap();
        }
        let mut cache = EmbeddingCache::open(dir.path(), DIM, FakeProvider::default()).unwrap();
        let embedding = cache
            .get_detailed("team leadership", None, true)
            .await
            .unwrap();
        assert_eq!(embedding.source, EmbeddingSource::Cached);
        assert_eq!(embedding.vector, vec![0.0, 0.0, 1.0]);
        assert_eq!(cache.provider().calls.get(), 0);
    }

    #[tokio::test]
    async fn open_trims_orphan_vectors() {
        setup();
        let dir = tempdir().unwrap();
        {
            let mut cache = EmbeddingCache::open(dir.path(), DIM, FakeProvider::default()).unwrap();
            cache.get("one", None, true).await.unwrap();
        }
        // simulate a crash after the index was saved but before the row was written
        let index_path = dir.path().join(INDEX_FILE);
        let mut index = FlatIndex::load(&index_path).unwrap();
        index.add(&[7.0, 7.0, 7.0]).unwrap();
        index.save(&index_path).unwrap();

        let mut cache = EmbeddingCache::open(dir.path(), DIM, FakeProvider::default()).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(FlatIndex::load(&index_path).unwrap().len(), 1);
        cache.get("two", None, true).await.unwrap();
        assert_eq!(cache.entry("two").unwrap().unwrap().vector_offset, 1);
    }

    #[tokio::test]
    async fn open_rejects_rows_without_vectors() {
        setup();
        let dir = tempdir().unwrap();
        {
            let mut cache = EmbeddingCache::open(dir.path(), DIM, FakeProvider::default()).unwrap();
            cache.get("one", None, true).await.unwrap();
        }
        fs::remove_file(dir.path().join(INDEX_FILE)).unwrap();
        assert!(matches!(
            EmbeddingCache::open(dir.path(), DIM, FakeProvider::default()),
            Err(CacheError::Inconsistent { vectors: 0, rows: 1 })
        ));
    }

    #[test]
    fn open_rejects_other_dimension() {
        setup();
        let dir = tempdir().unwrap();
        {
            let mut cache = EmbeddingCache::open(dir.path(), DIM, FakeProvider::default()).unwrap();
            cache.store("x", &[1.0, 2.0, 3.0], None).unwrap();
        }
        assert!(matches!(
            EmbeddingCache::open(dir.path(), 4, FakeProvider::default()),
            Err(CacheError::DimensionMismatch { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn open_rejects_zero_dimension() {
        setup();
        let dir = tempdir().unwrap();
        assert!(matches!(
            EmbeddingCache::open(dir.path(), 0, FakeProvider::default()),
            Err(CacheError::ZeroDimension)
        ));
        assert!(!dir.path().join(METADATA_FILE).exists());
    }

    #[test]
    fn from_config_rejects_zero_dimension() {
        setup();
        let dir = tempdir().unwrap();
        let config = CacheConfig {
            cache_dir: dir.path().to_path_buf(),
            dimension: Some(0),
            ..CacheConfig::default()
        };
        assert!(matches!(
            EmbeddingCache::from_config(&config),
            Err(CacheError::ZeroDimension)
        ));
    }

    #[test]
    fn from_config_builds_openai_cache() {
        setup();
        let dir = tempdir().unwrap();
        let config = CacheConfig {
            cache_dir: dir.path().join("cache"),
            api_key: "k".into(),
            ..CacheConfig::default()
        };
        let cache = EmbeddingCache::from_config(&config).unwrap();
        assert!(matches!(cache.provider(), Embedder::OpenAi(_)));
        assert_eq!(cache.dimension(), crate::embedder::OPENAI_DIMENSION);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn failed_row_insert_rolls_back_the_vector() {
        setup();
        let dir = tempdir().unwrap();
        let mut cache = EmbeddingCache::open(dir.path(), DIM, FakeProvider::default()).unwrap();
        cache.get("a", None, true).await.unwrap();

        // a second connection makes every further insert abort
        let db_url = dir.path().join(METADATA_FILE).to_string_lossy().into_owned();
        let mut conn = SqliteConnection::establish(&db_url).unwrap();
        diesel::sql_query(
            "CREATE TRIGGER reject_inserts BEFORE INSERT ON embeddings \
             BEGIN SELECT RAISE(ABORT, 'no'); END",
        )
        .execute(&mut conn)
        .unwrap();

        let err = cache.get("bb", None, true).await.unwrap_err();
        assert!(matches!(err, CacheError::Database(_)));
        assert_eq!(cache.len(), 1);
        assert_eq!(FlatIndex::load(&dir.path().join(INDEX_FILE)).unwrap().len(), 1);
        assert_eq!(cache.entry("bb").unwrap(), None);

        diesel::sql_query("DROP TRIGGER reject_inserts")
            .execute(&mut conn)
            .unwrap();
        cache.get("bb", None, true).await.unwrap();
        assert_eq!(cache.entry("bb").unwrap().unwrap().vector_offset, 1);

        drop(cache);
        let reopened = EmbeddingCache::open(dir.path(), DIM, FakeProvider::default()).unwrap();
        assert_eq!(reopened.len(), 2);
    }

    #[tokio::test]
    async fn get_many_keeps_order_and_batches_misses() {
        let (_dir, mut cache) = open(scenario_provider());
        cache.get("cloud architecture", None, true).await.unwrap();
        let calls_before = cache.provider().calls.get();

        let texts: Vec<String> = ["cloud architecture", "", "team leadership", "cloud security"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let metadata = vec![None, None, Some(json!({"i": 2}))];
        let embeddings = cache
            .get_many_detailed(&texts, Some(metadata.as_slice()), true)
            .await
            .unwrap();

        let sources: Vec<EmbeddingSource> = embeddings.iter().map(|e| e.source).collect();
        assert_eq!(
            sources,
            vec![
                EmbeddingSource::Cached,
                EmbeddingSource::Empty,
                EmbeddingSource::Computed,
                EmbeddingSource::Computed,
            ]
        );
        assert_eq!(embeddings[1].vector, vec![0.0; DIM]);
        assert_eq!(embeddings[3].vector, vec![0.9, 0.1, 0.0]);
        assert_eq!(cache.provider().batch_calls.get(), 1);
        assert_eq!(cache.provider().calls.get() - calls_before, 2);

        // metadata list was shorter than texts: the last item has none
        assert_eq!(
            cache.entry("team leadership").unwrap().unwrap().metadata,
            Some(json!({"i": 2}))
        );
        assert_eq!(cache.entry("cloud security").unwrap().unwrap().metadata, None);
    }

    #[tokio::test]
    async fn get_many_retries_individually_when_batch_fails() {
        let mut provider = scenario_provider().failing("team leadership");
        provider.fail_batches = true;
        let (_dir, mut cache) = open(provider);

        let texts = vec!["cloud architecture".to_string(), "team leadership".to_string()];
        let embeddings = cache.get_many_detailed(&texts, None, true).await.unwrap();

        assert_eq!(embeddings[0].source, EmbeddingSource::Computed);
        assert_eq!(embeddings[0].vector, vec![1.0, 0.0, 0.0]);
        assert_eq!(embeddings[1].source, EmbeddingSource::Fallback);
        assert_eq!(cache.len(), 1);
        assert_eq!(
            *cache.provider().seen.borrow(),
            vec!["cloud architecture".to_string(), "team leadership".to_string()]
        );
    }

    #[tokio::test]
    async fn get_many_without_cache_stores_nothing() {
        let (_dir, mut cache) = open(scenario_provider());
        let texts = vec!["cloud security".to_string()];
        let vectors = cache.get_many(&texts, None, false).await.unwrap();
        assert_eq!(vectors, vec![vec![0.9, 0.1, 0.0]]);
        assert!(cache.is_empty());
    }

    #[test]
    fn stats_report_size_and_location() {
        let (_dir, mut cache) = open(FakeProvider::default());
        cache.store("x", &[0.0, 0.0, 1.0], None).unwrap();
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.dimension, DIM);
        assert_eq!(stats.dir, cache.dir().to_path_buf());
    }

    #[test]
    fn preview_truncates_long_text() {
        assert_eq!(preview("short"), "short");
        let long = "x".repeat(80);
        assert_eq!(preview(&long), format!("{}...", "x".repeat(50)));
    }
}
