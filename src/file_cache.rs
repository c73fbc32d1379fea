//! # FileCache
//!
//! Small JSON-on-disk cache for expensive intermediate results of the pipeline, such
//! as parsed CVs or LinkedIn exports.
//!
//! Two kinds of entries share one directory and one `metadata.json` index:
//!
//! - **Keyed values** ([`FileCache::set`] / [`FileCache::get`]): any serializable value
//!   under a string key. The key is hashed to a 32-char file name. Entries expire
//!   after [`DEFAULT_EXPIRY`] unless [`FileCache::with_expiry`] says otherwise.
//! - **File-derived values** ([`FileCache::cache_files`] /
//!   [`FileCache::cached_files`]): one value per input file, keyed by the file kind
//!   and the SHA-256 of the file's content, so an edited file is a miss. These do
//!   not expire.
//!
//! Unreadable or corrupt value files are treated as misses. A corrupt `metadata.json`
//! makes [`FileCache::open`] fail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info};

use crate::error::CacheError;

/// Keyed values older than this are misses.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

const INDEX_FILE: &str = "metadata.json";

/// Bookkeeping for one cached file, persisted in `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCacheRecord {
    pub cached_at: DateTime<Utc>,
    /// Caller key, for keyed values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Source file, for file-derived values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

pub struct FileCache {
    dir: PathBuf,
    expiry: Duration,
    records: BTreeMap<String, FileCacheRecord>,
}

impl FileCache {
    /// Open the cache in `dir`, creating it if needed and loading any existing index.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let index_path = dir.join(INDEX_FILE);
        let records = if index_path.exists() {
            serde_json::from_str(&fs::read_to_string(&index_path)?)?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            dir,
            expiry: DEFAULT_EXPIRY,
            records,
        })
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of index records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Value stored under `key`, unless missing, expired or unreadable.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let hashed = hash_key(key);
        let record = self.records.get(&hashed)?;
        if self.is_expired(record) {
            debug!("Cache entry for {} expired", key);
            return None;
        }
        self.read_value(&hashed)
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), CacheError> {
        let hashed = hash_key(key);
        self.write_value(&hashed, value)?;
        self.records.insert(
            hashed,
            FileCacheRecord {
                cached_at: Utc::now(),
                key: Some(key.to_string()),
                original_path: None,
                file_size: None,
            },
        );
        self.save_index()
    }

    /// Values previously cached for exactly these file contents.
    ///
    /// `files` maps a kind (`"cv"`, `"linkedin"`, ...) to a path. Paths that do not
    /// exist are ignored. Returns `None` if any existing file has no cached value.
    pub fn cached_files(
        &self,
        files: &BTreeMap<String, PathBuf>,
    ) -> Result<Option<BTreeMap<String, JsonValue>>, CacheError> {
        let mut values = BTreeMap::new();
        for (kind, path) in files {
            if !path.exists() {
                continue;
            }
            let key = file_key(kind, path)?;
            if !self.records.contains_key(&key) {
                debug!("Cache miss for {}", kind);
                return Ok(None);
            }
            match self.read_value(&key) {
                Some(value) => {
                    debug!("Cache hit for {}", kind);
                    values.insert(kind.clone(), value);
                }
                None => return Ok(None),
            }
        }
        Ok(Some(values))
    }

    /// Cache `parsed[kind]` against the current content of each file in `files`.
    ///
    /// Missing files are skipped. A kind with no parsed value is cached as `null`.
    pub fn cache_files(
        &mut self,
        files: &BTreeMap<String, PathBuf>,
        parsed: &BTreeMap<String, JsonValue>,
    ) -> Result<(), CacheError> {
        for (kind, path) in files {
            if !path.exists() {
                continue;
            }
            let key = file_key(kind, path)?;
            let value = parsed.get(kind).unwrap_or(&JsonValue::Null);
            self.write_value(&key, value)?;
            self.records.insert(
                key,
                FileCacheRecord {
                    cached_at: Utc::now(),
                    key: None,
                    original_path: Some(path.clone()),
                    file_size: Some(fs::metadata(path)?.len()),
                },
            );
            debug!("Cached {} data", kind);
        }
        self.save_index()
    }

    /// Delete everything, including the directory contents.
    pub fn clear(&mut self) -> Result<(), CacheError> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        fs::create_dir_all(&self.dir)?;
        self.records.clear();
        info!("Cleared file cache at {}", self.dir.display());
        Ok(())
    }

    fn is_expired(&self, record: &FileCacheRecord) -> bool {
        // a timestamp in the future counts as fresh
        let age = (Utc::now() - record.cached_at).to_std().unwrap_or_default();
        age > self.expiry
    }

    fn value_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    fn read_value<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let content = fs::read_to_string(self.value_path(name)).ok()?;
        match serde_json::from_str(&content) {
            Ok(value) => Some(value),
            Err(err) => {
                debug!("Ignoring unreadable cache file {}: {}", name, err);
                None
            }
        }
    }

    fn write_value<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), CacheError> {
        fs::write(self.value_path(name), serde_json::to_vec(value)?)?;
        Ok(())
    }

    fn save_index(&self) -> Result<(), CacheError> {
        let json = serde_json::to_string_pretty(&self.records)?;
        fs::write(self.dir.join(INDEX_FILE), json)?;
        Ok(())
    }
}

/// First 32 hex chars of the key's SHA-256.
fn hash_key(key: &str) -> String {
    let mut digest = sha256::digest(key);
    digest.truncate(32);
    digest
}

fn file_key(kind: &str, path: &Path) -> Result<String, CacheError> {
    let bytes = fs::read(path)?;
    Ok(format!("{}_{}", kind, sha256::digest(bytes.as_slice())))
}
