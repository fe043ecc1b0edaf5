//! Configuration parsing and validation.
//!
//! Clippings is configured via a TOML file (default: `config/clip.toml`).
//! The config defines the database path, the optional sqlite-vec extension,
//! chunking parameters, provider defaults, digest settings, daily rate caps,
//! and the server bind address. Secrets are never stored in the file:
//! the upstream reading-service token comes from `READWISE_TOKEN`, the paid
//! provider key from `OPENAI_API_KEY`, and the local embedding service URL
//! from `OLLAMA_BASE_URL`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub reading_service: ReadingServiceConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub digest: DigestConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Name or path of the sqlite-vec loadable extension (e.g. `"vec0"`).
    /// When unset the store runs lexical-only and vector operations return
    /// a descriptive error.
    #[serde(default)]
    pub vector_extension: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8484".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            min_chunk_size: default_min_chunk_size(),
        }
    }
}

fn default_chunk_size() -> usize {
    crate::chunker::CHUNK_SIZE
}
fn default_chunk_overlap() -> usize {
    crate::chunker::CHUNK_OVERLAP
}
fn default_min_chunk_size() -> usize {
    crate::chunker::MIN_CHUNK_SIZE
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReadingServiceConfig {
    #[serde(default = "default_reading_base_url")]
    pub base_url: String,
}

impl Default for ReadingServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_reading_base_url(),
        }
    }
}

fn default_reading_base_url() -> String {
    "https://readwise.io/api".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Default provider for embed jobs and semantic search: `openai` or
    /// `ollama`.
    #[serde(default = "default_embed_provider")]
    pub provider: String,
    #[serde(default = "default_embed_model")]
    pub model: String,
    #[serde(default = "default_embed_batch_size")]
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embed_provider(),
            model: default_embed_model(),
            batch_size: default_embed_batch_size(),
        }
    }
}

fn default_embed_provider() -> String {
    "openai".to_string()
}
fn default_embed_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_embed_batch_size() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct DigestConfig {
    #[serde(default = "default_digest_model")]
    pub model: String,
    #[serde(default = "default_digest_days")]
    pub days: i64,
    #[serde(default = "default_num_clusters")]
    pub num_clusters: usize,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            model: default_digest_model(),
            days: default_digest_days(),
            num_clusters: default_num_clusters(),
        }
    }
}

fn default_digest_model() -> String {
    "gpt-4.1-mini".to_string()
}
fn default_digest_days() -> i64 {
    7
}
fn default_num_clusters() -> usize {
    7
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_true")]
    pub require_cost_confirm: bool,
    #[serde(default = "default_max_llm_calls")]
    pub max_llm_calls_per_day: i64,
    #[serde(default = "default_max_embed_calls")]
    pub max_embed_calls_per_day: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            require_cost_confirm: true,
            max_llm_calls_per_day: default_max_llm_calls(),
            max_embed_calls_per_day: default_max_embed_calls(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_llm_calls() -> i64 {
    50
}
fn default_max_embed_calls() -> i64 {
    200
}

impl Config {
    /// Upstream reading-service token from the environment.
    pub fn reading_service_token(&self) -> Option<String> {
        std::env::var("READWISE_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be smaller than chunk_size");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    match config.embedding.provider.as_str() {
        "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be openai or ollama.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_in() {
        let config: Config = toml::from_str(
            r#"
            [db]
            path = "data/clippings.sqlite"
            "#,
        )
        .unwrap();
        assert_eq!(config.chunking.chunk_size, 800);
        assert_eq!(config.chunking.chunk_overlap, 160);
        assert_eq!(config.embedding.provider, "openai");
        assert_eq!(config.digest.days, 7);
        assert!(config.limits.require_cost_confirm);
        assert!(config.db.vector_extension.is_none());
    }

    #[test]
    fn test_overrides() {
        let config: Config = toml::from_str(
            r#"
            [db]
            path = "x.db"
            vector_extension = "vec0"

            [embedding]
            provider = "ollama"
            model = "nomic-embed-text"
            batch_size = 32
            "#,
        )
        .unwrap();
        assert_eq!(config.db.vector_extension.as_deref(), Some("vec0"));
        assert_eq!(config.embedding.provider, "ollama");
        assert_eq!(config.embedding.batch_size, 32);
    }
}
