//! Embedding provider abstraction and implementations.
//!
//! Two backends sit behind [`EmbeddingProvider`]:
//! - **[`OpenAiEmbeddings`]** — batched HTTP (up to 2048 inputs per call)
//!   with base64-encoded float32 responses and exponential backoff on rate
//!   limits;
//! - **[`OllamaEmbeddings`]** — a loopback service that embeds one text per
//!   call.
//!
//! Also provides the vector utilities shared across the store and the
//! clustering code:
//! - [`vec_to_blob`] — encode a `Vec<f32>` as little-endian bytes for SQLite
//! - [`blob_to_vec`] — decode a SQLite BLOB back into a `Vec<f32>`
//! - [`cosine_similarity`] — similarity between two vectors
//!
//! The blob layout is packed little-endian IEEE-754 float32, `4 * dims`
//! bytes; identical bytes go to the KNN extension, so any layout drift
//! silently corrupts search results.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;

/// Texts are cut at this many chars right before embedding, a safe margin
/// under the 8k-token model caps with variable tokenization.
pub const EMBED_MAX_CHARS: usize = 20_000;

const MAX_RETRIES: u32 = 5;
const INITIAL_DELAY: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Static metadata for an embedding model.
#[derive(Debug, Clone, Copy)]
pub struct ModelInfo {
    pub model_id: &'static str,
    pub dimensions: usize,
    pub cost_per_1m_tokens: f64,
    pub max_tokens: usize,
    pub description: &'static str,
}

pub const OPENAI_MODELS: &[ModelInfo] = &[
    ModelInfo {
        model_id: "text-embedding-3-small",
        dimensions: 1536,
        cost_per_1m_tokens: 0.02,
        max_tokens: 8191,
        description: "Best balance of quality and cost. Recommended for most uses.",
    },
    ModelInfo {
        model_id: "text-embedding-3-large",
        dimensions: 3072,
        cost_per_1m_tokens: 0.13,
        max_tokens: 8191,
        description: "Highest precision, for complex topics and maximum search quality.",
    },
];

pub const OLLAMA_MODELS: &[ModelInfo] = &[
    ModelInfo {
        model_id: "nomic-embed-text",
        dimensions: 768,
        cost_per_1m_tokens: 0.0,
        max_tokens: 8192,
        description: "Good quality, compact (275MB). Runs locally, free.",
    },
    ModelInfo {
        model_id: "mxbai-embed-large",
        dimensions: 1024,
        cost_per_1m_tokens: 0.0,
        max_tokens: 512,
        description: "Very good quality, larger (~670MB). Local and free.",
    },
];

/// Look up a model's metadata by provider and id.
pub fn model_info(provider: &str, model: &str) -> Option<&'static ModelInfo> {
    let table = match provider {
        "openai" => OPENAI_MODELS,
        "ollama" => OLLAMA_MODELS,
        _ => return None,
    };
    table.iter().find(|m| m.model_id == model)
}

/// Errors from embedding backends. Only `RateLimited` and `Connect` are
/// worth retrying at the job level; everything else aborts the operation.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("API key not configured for {0}")]
    MissingApiKey(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),
    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("model not installed: {0}")]
    ModelNotInstalled(String),
    #[error("cannot reach provider: {0}")]
    Connect(String),
    #[error("provider error: {0}")]
    Api(String),
}

impl ProviderError {
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Connect(_)
        )
    }
}

/// Result of a provider health probe.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthCheck {
    pub healthy: bool,
    pub provider: String,
    pub model: String,
    pub message: String,
    pub latency_ms: Option<i64>,
    pub details: serde_json::Value,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider tag as stored with embeddings (e.g. `"openai"`).
    fn name(&self) -> &str;
    fn model_id(&self) -> &str;
    fn dimensions(&self) -> usize;
    fn cost_per_1m_tokens(&self) -> f64;

    /// Embed a batch of texts, returning vectors in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;

    async fn embed_single(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut result = self.embed(&[text.to_string()]).await?;
        result
            .pop()
            .ok_or_else(|| ProviderError::Api("empty embedding response".to_string()))
    }

    async fn health_check(&self) -> HealthCheck;

    fn estimate_cost(&self, tokens: u64) -> f64 {
        tokens as f64 / 1_000_000.0 * self.cost_per_1m_tokens()
    }
}

/// Instantiate a provider by tag, with the table's default model when none
/// is given.
pub fn create_provider(
    provider: &str,
    model: Option<&str>,
) -> Result<Box<dyn EmbeddingProvider>, ProviderError> {
    match provider {
        "openai" => {
            let model = model.unwrap_or("text-embedding-3-small");
            Ok(Box::new(OpenAiEmbeddings::new(model)?))
        }
        "ollama" => {
            let model = model.unwrap_or("nomic-embed-text");
            Ok(Box::new(OllamaEmbeddings::new(model)?))
        }
        other => Err(ProviderError::Api(format!(
            "Unknown embedding provider: {}. Available: openai, ollama",
            other
        ))),
    }
}

// ============ OpenAI provider ============

/// Batched embedding provider over the OpenAI API.
///
/// Requests base64-encoded responses (~75% smaller than float arrays) and
/// decodes them as packed little-endian float32. Rate limits back off
/// 2s, 4s, ... capped at 60s for up to 5 attempts; a 429 mentioning "quota"
/// is terminal.
pub struct OpenAiEmbeddings {
    info: &'static ModelInfo,
    api_key: String,
    http: reqwest::Client,
}

impl OpenAiEmbeddings {
    pub fn new(model: &str) -> Result<Self, ProviderError> {
        let info = model_info("openai", model).ok_or_else(|| {
            ProviderError::Api(format!(
                "Unknown OpenAI model: {}. Available: {:?}",
                model,
                OPENAI_MODELS.iter().map(|m| m.model_id).collect::<Vec<_>>()
            ))
        })?;

        let api_key = std::env::var("OPENAI_API_KEY")
            .unwrap_or_default()
            .trim()
            .to_string();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ProviderError::Api(e.to_string()))?;

        Ok(OpenAiEmbeddings {
            info,
            api_key,
            http,
        })
    }

    /// Embed a large input set as concurrent sub-batches under a semaphore.
    ///
    /// `batch_size` is capped at the API's 2048-inputs-per-request limit.
    /// The progress callback receives `(processed, total)` after each
    /// sub-batch.
    pub async fn embed_parallel(
        &self,
        texts: &[String],
        batch_size: usize,
        max_concurrent: usize,
        progress: Option<&(dyn Fn(usize, usize) + Send + Sync)>,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let batch_size = batch_size.clamp(1, 2048);
        let semaphore = Semaphore::new(max_concurrent.max(1));
        let processed = AtomicUsize::new(0);

        let batches: Vec<(usize, &[String])> = texts
            .chunks(batch_size)
            .enumerate()
            .map(|(i, chunk)| (i * batch_size, chunk))
            .collect();

        let futures = batches.into_iter().map(|(offset, batch)| {
            let semaphore = &semaphore;
            let processed = &processed;
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| ProviderError::Api("semaphore closed".to_string()))?;
                let vectors = self.embed(batch).await?;
                let done = processed.fetch_add(batch.len(), Ordering::SeqCst) + batch.len();
                if let Some(progress) = progress {
                    progress(done, texts.len());
                }
                Ok::<(usize, Vec<Vec<f32>>), ProviderError>((offset, vectors))
            }
        });

        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        for (offset, vectors) in futures::future::try_join_all(futures).await? {
            for (i, vector) in vectors.into_iter().enumerate() {
                results[offset + i] = Some(vector);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn name(&self) -> &str {
        "openai"
    }
    fn model_id(&self) -> &str {
        self.info.model_id
    }
    fn dimensions(&self) -> usize {
        self.info.dimensions
    }
    fn cost_per_1m_tokens(&self) -> f64 {
        self.info.cost_per_1m_tokens
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if self.api_key.is_empty() {
            return Err(ProviderError::MissingApiKey("openai".to_string()));
        }

        let truncated: Vec<&str> = texts
            .iter()
            .map(|t| truncate_chars(t, EMBED_MAX_CHARS))
            .collect();

        let body = json!({
            "model": self.info.model_id,
            "input": truncated,
            "encoding_format": "base64",
        });

        let mut delay = INITIAL_DELAY;

        for attempt in 0..MAX_RETRIES {
            let response = self
                .http
                .post("https://api.openai.com/v1/embeddings")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| ProviderError::Connect(e.to_string()))?;

            let status = response.status();

            if status.is_success() {
                let json: serde_json::Value = response
                    .json()
                    .await
                    .map_err(|e| ProviderError::Api(e.to_string()))?;
                return parse_embeddings_response(&json, texts.len());
            }

            if status.as_u16() == 429 {
                let body_text = response.text().await.unwrap_or_default();
                if body_text.to_lowercase().contains("quota") {
                    return Err(ProviderError::QuotaExhausted(
                        "OpenAI credits exhausted; top up at platform.openai.com".to_string(),
                    ));
                }
                tracing::warn!(
                    attempt = attempt + 1,
                    max = MAX_RETRIES,
                    delay_s = delay.as_secs(),
                    "embedding rate limit, backing off"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_BACKOFF);
                continue;
            }

            if status.as_u16() == 401 {
                return Err(ProviderError::Auth(
                    "OpenAI API key rejected; check OPENAI_API_KEY".to_string(),
                ));
            }

            let body_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api(format!(
                "OpenAI API error {}: {}",
                status, body_text
            )));
        }

        Err(ProviderError::RateLimited {
            attempts: MAX_RETRIES,
        })
    }

    async fn health_check(&self) -> HealthCheck {
        if self.api_key.is_empty() {
            return HealthCheck {
                healthy: false,
                provider: self.name().to_string(),
                model: self.model_id().to_string(),
                message: "API key not set".to_string(),
                latency_ms: None,
                details: json!({"error": "OPENAI_API_KEY environment variable not set"}),
            };
        }

        let start = Instant::now();
        match self.embed_single("test").await {
            Ok(_) => HealthCheck {
                healthy: true,
                provider: self.name().to_string(),
                model: self.model_id().to_string(),
                message: "Connected".to_string(),
                latency_ms: Some(start.elapsed().as_millis() as i64),
                details: json!({"dimensions": self.dimensions()}),
            },
            Err(e) => HealthCheck {
                healthy: false,
                provider: self.name().to_string(),
                model: self.model_id().to_string(),
                message: e.to_string(),
                latency_ms: None,
                details: json!({"retriable": e.retriable()}),
            },
        }
    }
}

/// Decode an embeddings response. Items carry an `index` and either a
/// base64 string of packed little-endian float32 or a plain float array.
fn parse_embeddings_response(
    json: &serde_json::Value,
    expected: usize,
) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ProviderError::Api("missing data array in response".to_string()))?;

    let mut embeddings: Vec<Option<Vec<f32>>> = vec![None; expected];

    for item in data {
        let index = item
            .get("index")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ProviderError::Api("missing index in response item".to_string()))?
            as usize;
        if index >= expected {
            return Err(ProviderError::Api(format!(
                "response index {} out of range",
                index
            )));
        }

        let embedding = item
            .get("embedding")
            .ok_or_else(|| ProviderError::Api("missing embedding in response item".to_string()))?;

        let vector = match embedding {
            serde_json::Value::String(encoded) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| ProviderError::Api(format!("base64 decode failed: {}", e)))?;
                blob_to_vec(&bytes)
            }
            serde_json::Value::Array(values) => values
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect(),
            _ => {
                return Err(ProviderError::Api(
                    "embedding is neither base64 nor array".to_string(),
                ))
            }
        };

        embeddings[index] = Some(vector);
    }

    embeddings
        .into_iter()
        .enumerate()
        .map(|(i, v)| v.ok_or_else(|| ProviderError::Api(format!("missing embedding {}", i))))
        .collect()
}

// ============ Ollama provider ============

/// Local embedding provider over a loopback HTTP service. The service embeds
/// one input per call; batches loop.
pub struct OllamaEmbeddings {
    info: &'static ModelInfo,
    base_url: String,
    http: reqwest::Client,
}

impl OllamaEmbeddings {
    pub fn new(model: &str) -> Result<Self, ProviderError> {
        let info = model_info("ollama", model).ok_or_else(|| {
            ProviderError::Api(format!(
                "Unknown Ollama model: {}. Available: {:?}",
                model,
                OLLAMA_MODELS.iter().map(|m| m.model_id).collect::<Vec<_>>()
            ))
        })?;

        let base_url = std::env::var("OLLAMA_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:11434".to_string())
            .trim_end_matches('/')
            .to_string();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::Api(e.to_string()))?;

        Ok(OllamaEmbeddings {
            info,
            base_url,
            http,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddings {
    fn name(&self) -> &str {
        "ollama"
    }
    fn model_id(&self) -> &str {
        self.info.model_id
    }
    fn dimensions(&self) -> usize {
        self.info.dimensions
    }
    fn cost_per_1m_tokens(&self) -> f64 {
        0.0
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut results = Vec::with_capacity(texts.len());

        for text in texts {
            let response = self
                .http
                .post(format!("{}/api/embeddings", self.base_url))
                .json(&json!({
                    "model": self.info.model_id,
                    "prompt": truncate_chars(text, EMBED_MAX_CHARS),
                }))
                .send()
                .await
                .map_err(|e| {
                    if e.is_connect() {
                        ProviderError::Connect(format!(
                            "Ollama unreachable at {}; is it running?",
                            self.base_url
                        ))
                    } else {
                        ProviderError::Api(e.to_string())
                    }
                })?;

            let status = response.status();
            if status.as_u16() == 404 {
                return Err(ProviderError::ModelNotInstalled(format!(
                    "model '{}' not found; run 'ollama pull {}'",
                    self.info.model_id, self.info.model_id
                )));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ProviderError::Api(format!(
                    "Ollama error {}: {}",
                    status, body
                )));
            }

            let json: serde_json::Value = response
                .json()
                .await
                .map_err(|e| ProviderError::Api(e.to_string()))?;
            let vector: Vec<f32> = json
                .get("embedding")
                .and_then(|v| v.as_array())
                .ok_or_else(|| ProviderError::Api("missing embedding in response".to_string()))?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();

            results.push(vector);
        }

        Ok(results)
    }

    async fn health_check(&self) -> HealthCheck {
        let start = Instant::now();

        let version = match self
            .http
            .get(format!("{}/api/version", self.base_url))
            .send()
            .await
        {
            Ok(resp) => resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("version").and_then(|s| s.as_str()).map(String::from)),
            Err(_) => {
                return HealthCheck {
                    healthy: false,
                    provider: self.name().to_string(),
                    model: self.model_id().to_string(),
                    message: "Ollama unreachable".to_string(),
                    latency_ms: None,
                    details: json!({
                        "url": self.base_url,
                        "hint": "start it with 'ollama serve'",
                    }),
                };
            }
        };

        match self.embed_single("test").await {
            Ok(_) => HealthCheck {
                healthy: true,
                provider: self.name().to_string(),
                model: self.model_id().to_string(),
                message: match &version {
                    Some(v) => format!("Connected (v{})", v),
                    None => "Connected".to_string(),
                },
                latency_ms: Some(start.elapsed().as_millis() as i64),
                details: json!({
                    "dimensions": self.dimensions(),
                    "version": version,
                    "url": self.base_url,
                }),
            },
            Err(e) => HealthCheck {
                healthy: false,
                provider: self.name().to_string(),
                model: self.model_id().to_string(),
                message: e.to_string(),
                latency_ms: None,
                details: json!({"retriable": e.retriable()}),
            },
        }
    }
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes in little-endian order, producing a BLOB
/// of `vec.len() * 4` bytes, the exact layout the KNN extension indexes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector. Reverses [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity between two vectors, in `[-1.0, 1.0]`. Returns `0.0`
/// for empty or mismatched inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Cut a string at `max` bytes, backing off to a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_round_trip_all_dims() {
        for dims in crate::migrate::SUPPORTED_DIMS {
            let vec: Vec<f32> = (0..dims).map(|i| (i as f32) * 0.5 - 3.25).collect();
            let blob = vec_to_blob(&vec);
            assert_eq!(blob.len(), dims * 4);
            assert_eq!(blob_to_vec(&blob), vec);
        }
    }

    #[test]
    fn test_blob_bytes_little_endian() {
        let blob = vec_to_blob(&[1.0f32]);
        assert_eq!(blob, 1.0f32.to_le_bytes().to_vec());
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_and_opposite() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let s = "aä"; // 'ä' is two bytes starting at index 1
        assert_eq!(truncate_chars(s, 2), "a");
        assert_eq!(truncate_chars(s, 3), "aä");
        assert_eq!(truncate_chars("hello", 100), "hello");
    }

    #[test]
    fn test_model_info_lookup() {
        let small = model_info("openai", "text-embedding-3-small").unwrap();
        assert_eq!(small.dimensions, 1536);
        let nomic = model_info("ollama", "nomic-embed-text").unwrap();
        assert_eq!(nomic.dimensions, 768);
        assert!(model_info("openai", "bogus").is_none());
        assert!(model_info("bogus", "x").is_none());
    }

    #[test]
    fn test_parse_base64_response() {
        let vector = vec![0.25f32, -1.5, 3.0];
        let encoded = base64::engine::general_purpose::STANDARD.encode(vec_to_blob(&vector));
        let json = serde_json::json!({
            "data": [{"index": 0, "embedding": encoded}]
        });
        let parsed = parse_embeddings_response(&json, 1).unwrap();
        assert_eq!(parsed, vec![vector]);
    }

    #[test]
    fn test_parse_float_response_out_of_order() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [2.0, 2.0]},
                {"index": 0, "embedding": [1.0, 1.0]}
            ]
        });
        let parsed = parse_embeddings_response(&json, 2).unwrap();
        assert_eq!(parsed[0], vec![1.0, 1.0]);
        assert_eq!(parsed[1], vec![2.0, 2.0]);
    }

    #[test]
    fn test_parse_missing_item_is_error() {
        let json = serde_json::json!({
            "data": [{"index": 0, "embedding": [1.0]}]
        });
        assert!(parse_embeddings_response(&json, 2).is_err());
    }

    #[test]
    fn test_estimate_cost() {
        let provider = OpenAiEmbeddings::new("text-embedding-3-small").unwrap();
        let cost = provider.estimate_cost(1_000_000);
        assert!((cost - 0.02).abs() < 1e-9);
    }
}
