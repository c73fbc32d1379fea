//! # Embedding providers
//!
//! The cache does not compute embeddings itself; it asks an [`EmbeddingProvider`].
//! Two are shipped:
//!
//! - [`OpenAiEmbedder`]: any OpenAI-compatible `/embeddings` endpoint
//!   (default model `text-embedding-ada-002`, 1536 dimensions).
//! - [`MiniLmEmbedder`]: `sentence-transformers/all-MiniLM-L6-v2` (or another BERT
//!   sentence model) run locally with Candle (384 dimensions). Weights are fetched
//!   from the Hugging Face Hub on first load.
//!
//! [`Embedder`] wraps both so a [`CacheConfig`] can pick one at runtime.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, DTYPE};
use hf_hub::{Repo, RepoType, api::sync::Api};
use serde::{Deserialize, Serialize};
use std::fs;
use tokenizers::{PaddingParams, Tokenizer};
use tracing::{debug, info};

use crate::config::{CacheConfig, ProviderKind};
use crate::error::EmbeddingError;

/// Default OpenAI embedding model.
pub const OPENAI_DEFAULT_MODEL: &str = "text-embedding-ada-002";
/// Output size of [`OPENAI_DEFAULT_MODEL`].
pub const OPENAI_DIMENSION: usize = 1536;
/// Default Hugging Face repo for [`MiniLmEmbedder`].
pub const MINILM_DEFAULT_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";
/// Output size of [`MINILM_DEFAULT_MODEL`].
pub const MINILM_DIMENSION: usize = 384;

/// Something that turns text into a vector.
///
/// Implementations may fail; the cache decides what a failure means for its caller.
#[allow(async_fn_in_trait)]
pub trait EmbeddingProvider {
    /// Embed one text.
    async fn compute_embedding(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed several texts, one vector per input in the same order.
    ///
    /// The default calls [`compute_embedding`](Self::compute_embedding) in sequence.
    async fn compute_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.compute_embedding(text).await?);
        }
        Ok(vectors)
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: EmbeddingInput<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum EmbeddingInput<'a> {
    One(&'a str),
    Many(&'a [String]),
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

/// Client for an OpenAI-compatible embeddings endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl OpenAiEmbedder {
    /// # Parameters
    /// - `api_base`: e.g. `https://api.openai.com/v1`; `/embeddings` is appended.
    /// - `api_key`: sent as a bearer token; skipped when empty (local servers).
    /// - `model`: model name passed through verbatim.
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.api_base.trim_end_matches('/'))
    }

    async fn request(&self, input: EmbeddingInput<'_>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = EmbeddingRequest {
            model: &self.model,
            input,
        };
        let mut request = self.client.post(self.endpoint()).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        debug!("Requesting embeddings from {}", self.endpoint());
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let mut parsed: EmbeddingResponse = response.json().await?;
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

impl EmbeddingProvider for OpenAiEmbedder {
    async fn compute_embedding(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.request(EmbeddingInput::One(text))
            .await?
            .into_iter()
            .next()
            .ok_or(EmbeddingError::EmptyResponse)
    }

    async fn compute_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.request(EmbeddingInput::Many(texts)).await?;
        if vectors.len() != texts.len() {
            return Err(EmbeddingError::Incomplete {
                expected: texts.len(),
                actual: vectors.len(),
            });
        }
        Ok(vectors)
    }
}

/// Sentence-transformers BERT model run locally with Candle.
///
/// Any BERT-architecture repo with `config.json`, `tokenizer.json` and
/// `model.safetensors` works; [`MINILM_DEFAULT_MODEL`] is the usual choice. Output
/// vectors are mean-pooled over real tokens and L2-normalised.
pub struct MiniLmEmbedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    dimension: usize,
}

impl MiniLmEmbedder {
    /// Fetch `model_id` from the Hugging Face Hub (or the local hub cache) and load it
    /// on the CPU.
    pub fn load(model_id: &str) -> Result<Self, EmbeddingError> {
        let device = Device::Cpu;
        info!("Loading embedding model {}", model_id);

        let repo = Repo::with_revision(model_id.to_string(), RepoType::Model, "main".to_string());
        let api_repo = Api::new().map_err(model_error)?.repo(repo);
        let fetch = |name: &str| api_repo.get(name).map_err(model_error);

        let config = fs::read_to_string(fetch("config.json")?).map_err(model_error)?;
        let config: Config = serde_json::from_str(&config).map_err(model_error)?;

        let mut tokenizer = Tokenizer::from_file(fetch("tokenizer.json")?).map_err(model_error)?;
        // batches are padded to their longest member; the attention mask hides the rest
        tokenizer.with_padding(Some(PaddingParams::default()));

        let weights = fetch("model.safetensors")?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DTYPE, &device) }
            .map_err(model_error)?;
        let model = BertModel::load(vb, &config).map_err(model_error)?;

        Ok(Self {
            model,
            tokenizer,
            device,
            dimension: config.hidden_size,
        })
    }

    /// Length of the vectors this model produces.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Encode `texts` in one forward pass, one normalised vector per text.
    pub fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(model_error)?;

        let stack = |rows: Vec<&[u32]>| -> Result<Tensor, candle_core::Error> {
            let rows = rows
                .into_iter()
                .map(|row| Tensor::new(row, &self.device))
                .collect::<Result<Vec<_>, _>>()?;
            Tensor::stack(&rows, 0)
        };
        let token_ids = stack(encodings.iter().map(|e| e.get_ids()).collect()).map_err(model_error)?;
        let type_ids = stack(encodings.iter().map(|e| e.get_type_ids()).collect()).map_err(model_error)?;
        let mask = stack(encodings.iter().map(|e| e.get_attention_mask()).collect()).map_err(model_error)?;

        let output = self
            .model
            .forward(&token_ids, &type_ids, Some(&mask))
            .map_err(model_error)?;
        let pooled = mean_pooling(&output, &mask).map_err(model_error)?;
        let normalised = normalize_rows(&pooled).map_err(model_error)?;

        debug!("Encoded {} text(s) locally", texts.len());
        normalised.to_vec2::<f32>().map_err(model_error)
    }
}

/// Mean over the token axis of `[batch, seq, hidden]`, counting only unmasked tokens.
fn mean_pooling(embeddings: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
    let mask = mask.to_dtype(DType::F32)?.unsqueeze(2)?;
    let sum = embeddings.broadcast_mul(&mask)?.sum(1)?;
    let count = mask.sum(1)?.clamp(1f32, f32::INFINITY)?;
    sum.broadcast_div(&count)
}

/// Scale each row of `[batch, hidden]` to unit length.
fn normalize_rows(tensor: &Tensor) -> candle_core::Result<Tensor> {
    let norms = tensor.sqr()?.sum_keepdim(1)?.sqrt()?;
    tensor.broadcast_div(&norms)
}

fn model_error(err: impl std::fmt::Display) -> EmbeddingError {
    EmbeddingError::Model(err.to_string())
}

impl EmbeddingProvider for MiniLmEmbedder {
    async fn compute_embedding(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.encode_batch(&[text])?
            .into_iter()
            .next()
            .ok_or(EmbeddingError::EmptyResponse)
    }

    async fn compute_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let texts: Vec<&str> = texts.iter().map(String::as_str).collect();
        self.encode_batch(&texts)
    }
}

/// The provider named by a [`CacheConfig`].
pub enum Embedder {
    OpenAi(OpenAiEmbedder),
    MiniLm(MiniLmEmbedder),
}

impl Embedder {
    /// Build the provider selected by `config.provider`.
    ///
    /// For `minilm` this downloads or loads the model, which can take a while.
    pub fn from_config(config: &CacheConfig) -> Result<Self, EmbeddingError> {
        match config.provider {
            ProviderKind::OpenAi => Ok(Embedder::OpenAi(OpenAiEmbedder::new(
                config.api_base.clone(),
                config.resolved_api_key(),
                config.resolved_model(),
            ))),
            ProviderKind::MiniLm => Ok(Embedder::MiniLm(MiniLmEmbedder::load(
                &config.resolved_model(),
            )?)),
        }
    }

    /// Vector length the provider is known to produce. Remote models report `None`.
    pub fn dimension(&self) -> Option<usize> {
        match self {
            Embedder::OpenAi(_) => None,
            Embedder::MiniLm(model) => Some(model.dimension()),
        }
    }
}

impl EmbeddingProvider for Embedder {
    async fn compute_embedding(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        match self {
            Embedder::OpenAi(embedder) => embedder.compute_embedding(text).await,
            Embedder::MiniLm(embedder) => embedder.compute_embedding(text).await,
        }
    }

    async fn compute_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        match self {
            Embedder::OpenAi(embedder) => embedder.compute_embeddings(texts).await,
            Embedder::MiniLm(embedder) => embedder.compute_embeddings(texts).await,
        }
    }
}
