//! Chat provider abstraction for digest generation.
//!
//! Mirrors the embedding provider surface: a model table with per-million
//! input/output pricing, exponential backoff on rate limits, and a health
//! probe. The digest pipeline is the only consumer; every call lands in the
//! usage ledger.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio::time::Instant;

use crate::embedding::HealthCheck;

const MAX_RETRIES: u32 = 5;
const INITIAL_DELAY: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub const DEFAULT_DIGEST_MODEL: &str = "gpt-4.1-mini";

/// Static metadata for a chat model.
#[derive(Debug, Clone, Copy)]
pub struct ChatModelInfo {
    pub model_id: &'static str,
    pub cost_per_1m_input: f64,
    pub cost_per_1m_output: f64,
    pub max_context: usize,
    pub description: &'static str,
}

pub const OPENAI_CHAT_MODELS: &[ChatModelInfo] = &[
    ChatModelInfo {
        model_id: "gpt-4.1-nano",
        cost_per_1m_input: 0.10,
        cost_per_1m_output: 0.40,
        max_context: 1_047_576,
        description: "Fastest and cheapest. For simple tasks.",
    },
    ChatModelInfo {
        model_id: "gpt-4.1-mini",
        cost_per_1m_input: 0.40,
        cost_per_1m_output: 1.60,
        max_context: 1_047_576,
        description: "Good balance of quality and cost. Recommended for digests.",
    },
    ChatModelInfo {
        model_id: "gpt-4o-mini",
        cost_per_1m_input: 0.15,
        cost_per_1m_output: 0.60,
        max_context: 128_000,
        description: "Cheap alternative with good quality on simple tasks.",
    },
    ChatModelInfo {
        model_id: "gpt-4o",
        cost_per_1m_input: 2.50,
        cost_per_1m_output: 10.00,
        max_context: 128_000,
        description: "High quality, for complex analyses.",
    },
];

pub fn chat_model_info(model: &str) -> Option<&'static ChatModelInfo> {
    OPENAI_CHAT_MODELS.iter().find(|m| m.model_id == model)
}

/// One chat message: `role` is `system`, `user`, or `assistant`.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Response from a chat completion, with usage for the ledger.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub latency_ms: i64,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("API key not configured for {0}")]
    MissingApiKey(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),
    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("model not available: {0}")]
    ModelUnavailable(String),
    #[error("LLM error: {0}")]
    Api(String),
}

impl LlmError {
    pub fn retriable(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. })
    }
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model_id(&self) -> &str;
    fn cost_per_1m_input(&self) -> f64;
    fn cost_per_1m_output(&self) -> f64;

    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: Option<i64>,
    ) -> Result<ChatResponse, LlmError>;

    async fn health_check(&self) -> HealthCheck;

    fn estimate_cost(&self, tokens_input: i64, tokens_output: i64) -> f64 {
        tokens_input as f64 / 1_000_000.0 * self.cost_per_1m_input()
            + tokens_output as f64 / 1_000_000.0 * self.cost_per_1m_output()
    }
}

pub fn create_chat_provider(model: Option<&str>) -> Result<Box<dyn ChatProvider>, LlmError> {
    let model = model.unwrap_or(DEFAULT_DIGEST_MODEL);
    Ok(Box::new(OpenAiChat::new(model)?))
}

/// Chat provider over the OpenAI completions API.
pub struct OpenAiChat {
    info: &'static ChatModelInfo,
    api_key: String,
    http: reqwest::Client,
}

impl OpenAiChat {
    pub fn new(model: &str) -> Result<Self, LlmError> {
        let info = chat_model_info(model).ok_or_else(|| {
            LlmError::Api(format!(
                "Unknown chat model: {}. Available: {:?}",
                model,
                OPENAI_CHAT_MODELS
                    .iter()
                    .map(|m| m.model_id)
                    .collect::<Vec<_>>()
            ))
        })?;

        let api_key = std::env::var("OPENAI_API_KEY")
            .unwrap_or_default()
            .trim()
            .to_string();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| LlmError::Api(e.to_string()))?;

        Ok(OpenAiChat {
            info,
            api_key,
            http,
        })
    }
}

#[async_trait]
impl ChatProvider for OpenAiChat {
    fn name(&self) -> &str {
        "openai"
    }
    fn model_id(&self) -> &str {
        self.info.model_id
    }
    fn cost_per_1m_input(&self) -> f64 {
        self.info.cost_per_1m_input
    }
    fn cost_per_1m_output(&self) -> f64 {
        self.info.cost_per_1m_output
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: Option<i64>,
    ) -> Result<ChatResponse, LlmError> {
        if self.api_key.is_empty() {
            return Err(LlmError::MissingApiKey("openai".to_string()));
        }

        let message_values: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();

        let mut body = json!({
            "model": self.info.model_id,
            "messages": message_values,
            "temperature": temperature,
        });
        if let Some(max_tokens) = max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        let mut delay = INITIAL_DELAY;

        for attempt in 0..MAX_RETRIES {
            let start = Instant::now();
            let response = self
                .http
                .post("https://api.openai.com/v1/chat/completions")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| LlmError::Api(e.to_string()))?;

            let status = response.status();

            if status.is_success() {
                let json: serde_json::Value = response
                    .json()
                    .await
                    .map_err(|e| LlmError::Api(e.to_string()))?;

                let content = json["choices"][0]["message"]["content"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let model = json["model"].as_str().unwrap_or(self.info.model_id);

                return Ok(ChatResponse {
                    content,
                    model: model.to_string(),
                    tokens_input: json["usage"]["prompt_tokens"].as_i64().unwrap_or(0),
                    tokens_output: json["usage"]["completion_tokens"].as_i64().unwrap_or(0),
                    latency_ms: start.elapsed().as_millis() as i64,
                });
            }

            match status.as_u16() {
                429 => {
                    let body_text = response.text().await.unwrap_or_default();
                    if body_text.to_lowercase().contains("quota") {
                        return Err(LlmError::QuotaExhausted(
                            "OpenAI credits exhausted; top up at platform.openai.com".to_string(),
                        ));
                    }
                    tracing::warn!(
                        attempt = attempt + 1,
                        max = MAX_RETRIES,
                        delay_s = delay.as_secs(),
                        "chat rate limit, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
                401 => {
                    return Err(LlmError::Auth(
                        "OpenAI API key rejected; check OPENAI_API_KEY".to_string(),
                    ))
                }
                404 => {
                    return Err(LlmError::ModelUnavailable(format!(
                        "model '{}' not available; pick another model",
                        self.info.model_id
                    )))
                }
                _ => {
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(LlmError::Api(format!(
                        "OpenAI API error {}: {}",
                        status, body_text
                    )));
                }
            }
        }

        Err(LlmError::RateLimited {
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
        let probe = self
            .chat(&[ChatMessage::user("Say 'OK'")], 0.0, Some(5))
            .await;

        match probe {
            Ok(_) => HealthCheck {
                healthy: true,
                provider: self.name().to_string(),
                model: self.model_id().to_string(),
                message: "Connected".to_string(),
                latency_ms: Some(start.elapsed().as_millis() as i64),
                details: json!({
                    "max_context": self.info.max_context,
                    "cost_input_1m": self.cost_per_1m_input(),
                    "cost_output_1m": self.cost_per_1m_output(),
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

/// Project token and dollar numbers for a digest over `chunks_count` chunks
/// without calling the model.
pub fn estimate_digest_cost(chunks_count: i64, model: &str) -> serde_json::Value {
    let info = chat_model_info(model).unwrap_or(&OPENAI_CHAT_MODELS[1]);
    let avg_tokens_per_chunk = 200i64;

    // Chunk content plus prompt scaffolding, doubled for the two passes
    // (clustering, summaries).
    let estimated_input = (chunks_count * avg_tokens_per_chunk + 2000) * 2;
    let estimated_output = 3500i64;

    let input_cost = estimated_input as f64 / 1_000_000.0 * info.cost_per_1m_input;
    let output_cost = estimated_output as f64 / 1_000_000.0 * info.cost_per_1m_output;

    json!({
        "model": info.model_id,
        "chunks_count": chunks_count,
        "estimated_input_tokens": estimated_input,
        "estimated_output_tokens": estimated_output,
        "input_cost_usd": (input_cost * 10_000.0).round() / 10_000.0,
        "output_cost_usd": (output_cost * 10_000.0).round() / 10_000.0,
        "total_cost_usd": ((input_cost + output_cost) * 10_000.0).round() / 10_000.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_model_lookup() {
        assert!(chat_model_info("gpt-4.1-mini").is_some());
        assert!(chat_model_info("gpt-5-imaginary").is_none());
    }

    #[test]
    fn test_estimate_cost_formula() {
        let provider = OpenAiChat::new("gpt-4.1-mini").unwrap();
        let cost = provider.estimate_cost(1_000_000, 1_000_000);
        assert!((cost - (0.40 + 1.60)).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_digest_cost_shape() {
        let estimate = estimate_digest_cost(100, "gpt-4.1-mini");
        assert_eq!(estimate["chunks_count"], 100);
        assert_eq!(estimate["estimated_input_tokens"], (100 * 200 + 2000) * 2);
        assert!(estimate["total_cost_usd"].as_f64().unwrap() > 0.0);
    }
}
