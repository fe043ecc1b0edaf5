//! Prompt registry.
//!
//! Three templates are baked in; the admin surface can override a template's
//! body, temperature, and max-tokens, persisted by key. The variable list of
//! a key is fixed: custom bodies use the same `{placeholder}` names.

use anyhow::Result;
use serde::Serialize;

use crate::store::Store;

pub const KEY_DIGEST_SUMMARY: &str = "digest_summary";
pub const KEY_TOPIC_NAMING_HYBRID: &str = "topic_naming_hybrid";
pub const KEY_CLUSTERING_PURE_LLM: &str = "clustering_pure_llm";

pub const PROMPT_KEYS: [&str; 3] = [
    KEY_DIGEST_SUMMARY,
    KEY_TOPIC_NAMING_HYBRID,
    KEY_CLUSTERING_PURE_LLM,
];

/// A prompt template with metadata, as served to callers: either the baked
/// default or the persisted customization merged over it.
#[derive(Debug, Clone, Serialize)]
pub struct PromptTemplate {
    pub key: String,
    pub category: String,
    pub name: String,
    pub description: String,
    pub template: String,
    pub variables: Vec<String>,
    pub temperature: f64,
    pub max_tokens: i64,
    pub is_custom: bool,
}

struct DefaultPrompt {
    key: &'static str,
    category: &'static str,
    name: &'static str,
    description: &'static str,
    template: &'static str,
    variables: &'static [&'static str],
    temperature: f64,
    max_tokens: i64,
}

const DEFAULT_PROMPTS: &[DefaultPrompt] = &[
    DefaultPrompt {
        key: KEY_DIGEST_SUMMARY,
        category: "digest",
        name: "Digest summary",
        description: "Generates the overall title, summary, and highlights from the clustered topics. Called once per digest after clustering.",
        template: "You are a personal knowledge assistant. This week the user read about the following topics:\n\n{topics_joined}\n\nProduce:\n1. A concise title (max 60 chars) naming the 2-3 main themes, e.g. \"AI tools, productivity & coding\"\n2. A summary (3-5 sentences): what occupied the user this week?\n3. 3-5 highlights: the most important insights or most interesting points\n\nAnswer in JSON format:\n{\n  \"title\": \"...\",\n  \"summary\": \"...\",\n  \"highlights\": [\"...\", \"...\", \"...\"]\n}",
        variables: &["topics_joined"],
        temperature: 0.4,
        max_tokens: 900,
    },
    DefaultPrompt {
        key: KEY_TOPIC_NAMING_HYBRID,
        category: "digest",
        name: "Topic naming (hybrid)",
        description: "Names and summarizes a single topic cluster. Called once per cluster under the hybrid strategy.",
        template: "Analyze these related text excerpts and produce:\n1. A short, precise topic name (max 4 words)\n2. A summary of the topic (2-3 sentences)\n3. 2-3 key points as a list\n\nExcerpts:\n{samples_joined}\n\nAnswer in JSON format:\n{\"topic_name\": \"...\", \"summary\": \"...\", \"key_points\": [\"...\", \"...\"]}",
        variables: &["samples_joined"],
        temperature: 0.3,
        max_tokens: 300,
    },
    DefaultPrompt {
        key: KEY_CLUSTERING_PURE_LLM,
        category: "digest",
        name: "Clustering (pure LLM)",
        description: "Clusters all chunks and names the topics in a single call. Alternative to the hybrid strategy; uses more tokens but fewer calls.",
        template: "Analyze these {chunk_count} text excerpts and group them into {num_clusters} thematic clusters.\n\nFor each cluster:\n1. Assign a short topic name (max 4 words)\n2. Write a summary (2-3 sentences)\n3. List 2-3 key points\n4. List the chunk indices (the numbers in square brackets)\n\nExcerpts:\n{summaries_text}\n\nAnswer in JSON format:\n{\n  \"clusters\": [\n    {\n      \"topic_name\": \"...\",\n      \"summary\": \"...\",\n      \"key_points\": [\"...\", \"...\"],\n      \"chunk_indices\": [0, 5, 12]\n    }\n  ]\n}",
        variables: &["chunk_count", "num_clusters", "summaries_text"],
        temperature: 0.3,
        max_tokens: 2000,
    },
];

fn default_for(key: &str) -> Option<&'static DefaultPrompt> {
    DEFAULT_PROMPTS.iter().find(|p| p.key == key)
}

/// The baked-in template for a key.
pub fn get_default_prompt(key: &str) -> Option<PromptTemplate> {
    default_for(key).map(|d| PromptTemplate {
        key: d.key.to_string(),
        category: d.category.to_string(),
        name: d.name.to_string(),
        description: d.description.to_string(),
        template: d.template.to_string(),
        variables: d.variables.iter().map(|v| v.to_string()).collect(),
        temperature: d.temperature,
        max_tokens: d.max_tokens,
        is_custom: false,
    })
}

/// Effective template for a key: a stored customization overrides body,
/// temperature, and max-tokens; name, description, and variables stay the
/// defaults.
pub async fn get_prompt(store: &Store, key: &str) -> Result<Option<PromptTemplate>> {
    let Some(mut prompt) = get_default_prompt(key) else {
        return Ok(None);
    };

    if let Some(custom) = store.get_custom_prompt(key).await? {
        prompt.template = custom.template;
        prompt.temperature = custom.temperature;
        prompt.max_tokens = custom.max_tokens;
        prompt.is_custom = true;
    }

    Ok(Some(prompt))
}

/// Effective templates for every known key.
pub async fn list_prompts(store: &Store) -> Result<Vec<PromptTemplate>> {
    let mut prompts = Vec::with_capacity(PROMPT_KEYS.len());
    for key in PROMPT_KEYS {
        if let Some(prompt) = get_prompt(store, key).await? {
            prompts.push(prompt);
        }
    }
    Ok(prompts)
}

/// Persist a customization. Returns false for unknown keys.
pub async fn save_prompt(
    store: &Store,
    key: &str,
    template: &str,
    temperature: f64,
    max_tokens: i64,
) -> Result<bool> {
    if default_for(key).is_none() {
        return Ok(false);
    }
    store
        .save_custom_prompt(key, template, temperature, max_tokens)
        .await?;
    Ok(true)
}

/// Drop a customization so the default applies again. Returns false for
/// unknown keys.
pub async fn reset_prompt(store: &Store, key: &str) -> Result<bool> {
    if default_for(key).is_none() {
        return Ok(false);
    }
    store.delete_custom_prompt(key).await?;
    Ok(true)
}

impl PromptTemplate {
    /// Substitute `{name}` placeholders. Unknown placeholders in the body
    /// are left as-is.
    pub fn render(&self, variables: &[(&str, &str)]) -> String {
        let mut rendered = self.template.clone();
        for (name, value) in variables {
            rendered = rendered.replace(&format!("{{{}}}", name), value);
        }
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_exist_for_all_keys() {
        for key in PROMPT_KEYS {
            let prompt = get_default_prompt(key).unwrap();
            assert!(!prompt.template.is_empty());
            assert!(!prompt.variables.is_empty());
            assert!(!prompt.is_custom);
        }
        assert!(get_default_prompt("bogus").is_none());
    }

    #[test]
    fn test_templates_reference_their_variables() {
        for key in PROMPT_KEYS {
            let prompt = get_default_prompt(key).unwrap();
            for var in &prompt.variables {
                assert!(
                    prompt.template.contains(&format!("{{{}}}", var)),
                    "{} missing placeholder {}",
                    key,
                    var
                );
            }
        }
    }

    #[test]
    fn test_render_substitutes() {
        let prompt = get_default_prompt(KEY_TOPIC_NAMING_HYBRID).unwrap();
        let rendered = prompt.render(&[("samples_joined", "SAMPLE TEXT")]);
        assert!(rendered.contains("SAMPLE TEXT"));
        assert!(!rendered.contains("{samples_joined}"));
        // JSON braces in the template body survive rendering.
        assert!(rendered.contains("\"topic_name\""));
    }
}
