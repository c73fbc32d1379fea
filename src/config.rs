//! This module provides loading of the embedding cache configuration.
//!
//! It defines the `CacheConfig` struct, which holds where the cache lives, which
//! embedding provider computes misses and with what model, and a `load_config`
//! function to read it from a YAML file. Every field has a default, so an empty file
//! is a valid configuration.
//!
//! # Examples
//!
//! ```no_run
//! use embedding_cache::config::load_config;
//!
//! let config = load_config("/path/to/embedding_cache.yaml").unwrap();
//! println!("{:?}", config.cache_dir);
//! ```

use serde::{Deserialize, Serialize};
use std::{env, error::Error, fs, path::PathBuf};

use tracing::*;

use crate::embedder::{MINILM_DEFAULT_MODEL, MINILM_DIMENSION, OPENAI_DEFAULT_MODEL, OPENAI_DIMENSION};

/// Environment variable consulted when `api_key` is empty.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Which embedder computes cache misses.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible `/embeddings` endpoint at `api_base`.
    #[default]
    OpenAi,
    /// Local BERT sentence-embedding model run with Candle.
    MiniLm,
}

/// Represents the cache configuration.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding `embeddings.index` and `metadata.db`.
    pub cache_dir: PathBuf,

    /// `openai` or `minilm`.
    pub provider: ProviderKind,

    /// Length of every vector; the provider's native size when unset. Changing it
    /// requires clearing the cache.
    pub dimension: Option<usize>,

    /// Base URL of the OpenAI-compatible API.
    pub api_base: String,

    /// API key; empty means "read `OPENAI_API_KEY`".
    pub api_key: String,

    /// Model name for `openai`, Hugging Face repo id for `minilm`.
    pub model: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            provider: ProviderKind::default(),
            dimension: None,
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: None,
        }
    }
}

impl CacheConfig {
    /// The configured key, or the value of `OPENAI_API_KEY` when none is configured.
    pub fn resolved_api_key(&self) -> String {
        if self.api_key.is_empty() {
            env::var(API_KEY_ENV).unwrap_or_default()
        } else {
            self.api_key.clone()
        }
    }

    /// The configured model, or the provider's default.
    pub fn resolved_model(&self) -> String {
        match (&self.model, self.provider) {
            (Some(model), _) => model.clone(),
            (None, ProviderKind::OpenAi) => OPENAI_DEFAULT_MODEL.to_string(),
            (None, ProviderKind::MiniLm) => MINILM_DEFAULT_MODEL.to_string(),
        }
    }

    /// The configured dimension, or the provider's default.
    pub fn resolved_dimension(&self) -> usize {
        match (self.dimension, self.provider) {
            (Some(dimension), _) => dimension,
            (None, ProviderKind::OpenAi) => OPENAI_DIMENSION,
            (None, ProviderKind::MiniLm) => MINILM_DIMENSION,
        }
    }
}

/// `<config_dir>/cache`, falling back to `./cache` when no platform directory exists.
pub fn default_cache_dir() -> PathBuf {
    crate::config_dir()
        .map(|dir| dir.join("cache"))
        .unwrap_or_else(|_| PathBuf::from("cache"))
}

/// Loads the cache configuration from a YAML file.
///
/// # Returns
///
/// - `Ok(CacheConfig)`: The loaded configuration, defaults filled in.
/// - `Err(Box<dyn Error>)`: The file could not be read or is not valid YAML.
pub fn load_config(file: &str) -> Result<CacheConfig, Box<dyn Error>> {
    debug!("Loading config from: {}", file);
    let content = fs::read_to_string(file)?;
    let config: CacheConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}
