//! Clustering strategies for digest generation.
//!
//! Two ways to group chunks into topics:
//! 1. **Hybrid** — k-means over chunk embeddings, then one LLM call per
//!    cluster for naming and summary. Cheaper in tokens.
//! 2. **Pure LLM** — a single LLM call clusters and names up to 100
//!    abbreviated chunks at once.

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::Value;

use crate::embedding::cosine_similarity;
use crate::llm::{ChatMessage, ChatProvider};
use crate::prompts::{self, KEY_CLUSTERING_PURE_LLM, KEY_TOPIC_NAMING_HYBRID};
use crate::store::{DigestChunk, Store};

pub const DEFAULT_NUM_CLUSTERS: usize = 7;
/// Minimum chunks per surviving cluster.
pub const MIN_CLUSTER_SIZE: usize = 3;
const KMEANS_MAX_ITERATIONS: usize = 50;
/// Sample chunks sent to the naming prompt per cluster.
const MAX_SAMPLES_PER_CLUSTER: usize = 10;
/// Pure-LLM clustering sees at most this many chunks.
const MAX_CHUNKS_PURE_LLM: usize = 100;

/// A cluster of related chunks forming a named topic.
#[derive(Debug, Clone, Serialize)]
pub struct TopicCluster {
    pub topic_index: i64,
    pub topic_name: String,
    pub summary: String,
    pub chunk_ids: Vec<i64>,
    pub key_points: Vec<String>,
}

/// Result of a clustering run, with the token spend it incurred.
#[derive(Debug, Clone)]
pub struct ClusteringResult {
    pub strategy: String,
    pub clusters: Vec<TopicCluster>,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub cost_usd: f64,
}

impl ClusteringResult {
    fn empty(strategy: &str) -> Self {
        ClusteringResult {
            strategy: strategy.to_string(),
            clusters: Vec::new(),
            tokens_input: 0,
            tokens_output: 0,
            cost_usd: 0.0,
        }
    }
}

/// K-means over embedding vectors with cosine distance.
///
/// Centroids are seeded k-means++-style: the first is point 0, each further
/// centroid is the point maximizing its minimum `1 - cos` distance to the
/// chosen set. Converges when the assignment vector stops changing, capped
/// at 50 rounds. `n <= k` degenerates to one point per cluster.
pub fn kmeans_cluster(embeddings: &[Vec<f32>], k: usize) -> Vec<usize> {
    let n = embeddings.len();
    if n == 0 {
        return Vec::new();
    }
    if n <= k {
        return (0..n).collect();
    }

    let dim = embeddings[0].len();

    let mut centroid_indices: Vec<usize> = vec![0];
    for _ in 1..k {
        let mut max_dist = -1.0f32;
        let mut max_idx = 0usize;
        for (i, emb) in embeddings.iter().enumerate() {
            if centroid_indices.contains(&i) {
                continue;
            }
            let min_dist = centroid_indices
                .iter()
                .map(|&c| 1.0 - cosine_similarity(emb, &embeddings[c]))
                .fold(f32::INFINITY, f32::min);
            if min_dist > max_dist {
                max_dist = min_dist;
                max_idx = i;
            }
        }
        centroid_indices.push(max_idx);
    }

    let mut centroids: Vec<Vec<f32>> = centroid_indices
        .iter()
        .map(|&i| embeddings[i].clone())
        .collect();
    let mut assignments = vec![0usize; n];

    for _ in 0..KMEANS_MAX_ITERATIONS {
        let new_assignments: Vec<usize> = embeddings
            .iter()
            .map(|emb| {
                let mut best_cluster = 0;
                let mut best_sim = -2.0f32;
                for (c_idx, centroid) in centroids.iter().enumerate() {
                    let sim = cosine_similarity(emb, centroid);
                    if sim > best_sim {
                        best_sim = sim;
                        best_cluster = c_idx;
                    }
                }
                best_cluster
            })
            .collect();

        if new_assignments == assignments {
            break;
        }
        assignments = new_assignments;

        for (c_idx, centroid) in centroids.iter_mut().enumerate() {
            let members: Vec<&Vec<f32>> = embeddings
                .iter()
                .zip(assignments.iter())
                .filter(|(_, &a)| a == c_idx)
                .map(|(e, _)| e)
                .collect();
            if members.is_empty() {
                continue;
            }
            let mut mean = vec![0.0f32; dim];
            for member in &members {
                for (d, value) in member.iter().enumerate() {
                    mean[d] += value;
                }
            }
            for value in &mut mean {
                *value /= members.len() as f32;
            }
            *centroid = mean;
        }
    }

    assignments
}

/// Strip markdown code fences from an LLM response so the JSON inside
/// parses.
pub fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    inner.trim()
}

/// Cluster chunks with the requested strategy. `hybrid` requires every
/// chunk to carry its embedding.
pub async fn cluster_chunks(
    store: &Store,
    llm: &dyn ChatProvider,
    chunks: &[DigestChunk],
    strategy: &str,
    num_clusters: usize,
) -> Result<ClusteringResult> {
    match strategy {
        "hybrid" => {
            if chunks.iter().any(|c| c.embedding.is_none()) {
                return Err(anyhow!("hybrid strategy requires chunks with embeddings"));
            }
            hybrid_cluster(store, llm, chunks, num_clusters).await
        }
        "pure_llm" => pure_llm_cluster(store, llm, chunks, num_clusters).await,
        other => Err(anyhow!("unknown clustering strategy: {}", other)),
    }
}

/// K-means over embeddings, then one naming call per surviving cluster.
/// A JSON-decode failure on a cluster falls back to "Theme {n}" with empty
/// summary and key points.
pub async fn hybrid_cluster(
    store: &Store,
    llm: &dyn ChatProvider,
    chunks: &[DigestChunk],
    num_clusters: usize,
) -> Result<ClusteringResult> {
    if chunks.is_empty() {
        return Ok(ClusteringResult::empty("hybrid"));
    }

    let prompt = prompts::get_prompt(store, KEY_TOPIC_NAMING_HYBRID)
        .await?
        .ok_or_else(|| anyhow!("prompt '{}' not found", KEY_TOPIC_NAMING_HYBRID))?;

    let embeddings: Vec<Vec<f32>> = chunks
        .iter()
        .map(|c| c.embedding.clone().unwrap_or_default())
        .collect();

    let k = (num_clusters.min(chunks.len() / MIN_CLUSTER_SIZE)).max(1);
    tracing::info!(chunks = chunks.len(), k, "clustering chunks");

    let assignments = kmeans_cluster(&embeddings, k);

    let mut members_by_cluster: Vec<Vec<&DigestChunk>> = vec![Vec::new(); k.max(chunks.len())];
    for (chunk, &cluster) in chunks.iter().zip(assignments.iter()) {
        members_by_cluster[cluster].push(chunk);
    }

    let mut result = ClusteringResult::empty("hybrid");

    for (cluster_id, members) in members_by_cluster.iter().enumerate() {
        if members.len() < (MIN_CLUSTER_SIZE / 2).max(1) {
            continue;
        }

        let samples: Vec<String> = members
            .iter()
            .take(MAX_SAMPLES_PER_CLUSTER)
            .map(|c| {
                let text = crate::embedding::truncate_chars(&c.chunk_text, 500);
                format!("[{}] {}", c.title, text)
            })
            .collect();
        let samples_joined = samples.join("\n---\n");

        let rendered = prompt.render(&[("samples_joined", samples_joined.as_str())]);

        let (topic_name, summary, key_points) = match llm
            .chat(
                &[ChatMessage::user(rendered)],
                prompt.temperature,
                Some(prompt.max_tokens),
            )
            .await
        {
            Ok(response) => {
                result.tokens_input += response.tokens_input;
                result.tokens_output += response.tokens_output;
                result.cost_usd +=
                    llm.estimate_cost(response.tokens_input, response.tokens_output);

                match serde_json::from_str::<Value>(strip_code_fences(&response.content)) {
                    Ok(data) => (
                        data.get("topic_name")
                            .and_then(|v| v.as_str())
                            .unwrap_or(&format!("Theme {}", cluster_id + 1))
                            .to_string(),
                        data.get("summary")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        string_list(data.get("key_points")),
                    ),
                    Err(_) => {
                        tracing::warn!(cluster_id, "failed to parse topic naming response");
                        (format!("Theme {}", cluster_id + 1), String::new(), Vec::new())
                    }
                }
            }
            Err(e) => {
                tracing::error!(cluster_id, error = %e, "topic naming call failed");
                (format!("Theme {}", cluster_id + 1), String::new(), Vec::new())
            }
        };

        result.clusters.push(TopicCluster {
            topic_index: result.clusters.len() as i64,
            topic_name,
            summary,
            chunk_ids: members.iter().map(|c| c.id).collect(),
            key_points,
        });
    }

    Ok(result)
}

/// One LLM call clusters up to 100 abbreviated chunks. On a JSON-decode
/// failure the whole set collapses into a single fallback topic.
pub async fn pure_llm_cluster(
    store: &Store,
    llm: &dyn ChatProvider,
    chunks: &[DigestChunk],
    num_clusters: usize,
) -> Result<ClusteringResult> {
    if chunks.is_empty() {
        return Ok(ClusteringResult::empty("pure_llm"));
    }

    let prompt = prompts::get_prompt(store, KEY_CLUSTERING_PURE_LLM)
        .await?
        .ok_or_else(|| anyhow!("prompt '{}' not found", KEY_CLUSTERING_PURE_LLM))?;

    let visible = &chunks[..chunks.len().min(MAX_CHUNKS_PURE_LLM)];
    let summaries: Vec<String> = visible
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let text = crate::embedding::truncate_chars(&c.chunk_text, 300);
            format!("[{}] ({}) {}", i, c.title, text)
        })
        .collect();
    let summaries_text = summaries.join("\n");

    let rendered = prompt.render(&[
        ("chunk_count", summaries.len().to_string().as_str()),
        ("num_clusters", num_clusters.to_string().as_str()),
        ("summaries_text", summaries_text.as_str()),
    ]);

    let response = llm
        .chat(
            &[ChatMessage::user(rendered)],
            prompt.temperature,
            Some(prompt.max_tokens),
        )
        .await?;

    let tokens_input = response.tokens_input;
    let tokens_output = response.tokens_output;
    let cost_usd = llm.estimate_cost(tokens_input, tokens_output);

    let clusters = match serde_json::from_str::<Value>(strip_code_fences(&response.content)) {
        Ok(data) => {
            let llm_clusters = data
                .get("clusters")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();

            llm_clusters
                .iter()
                .enumerate()
                .map(|(i, lc)| {
                    let chunk_ids = lc
                        .get("chunk_indices")
                        .and_then(|v| v.as_array())
                        .map(|indices| {
                            indices
                                .iter()
                                .filter_map(|v| v.as_u64())
                                .filter(|&idx| (idx as usize) < visible.len())
                                .map(|idx| visible[idx as usize].id)
                                .collect()
                        })
                        .unwrap_or_default();

                    TopicCluster {
                        topic_index: i as i64,
                        topic_name: lc
                            .get("topic_name")
                            .and_then(|v| v.as_str())
                            .unwrap_or(&format!("Theme {}", i + 1))
                            .to_string(),
                        summary: lc
                            .get("summary")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        chunk_ids,
                        key_points: string_list(lc.get("key_points")),
                    }
                })
                .collect()
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to parse clustering response");
            vec![TopicCluster {
                topic_index: 0,
                topic_name: "All content".to_string(),
                summary: "Automatic grouping failed".to_string(),
                chunk_ids: chunks.iter().map(|c| c.id).collect(),
                key_points: Vec::new(),
            }]
        }
    };

    Ok(ClusteringResult {
        strategy: "pure_llm".to_string(),
        clusters,
        tokens_input,
        tokens_output,
        cost_usd,
    })
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(x: f32, y: f32) -> Vec<f32> {
        let norm = (x * x + y * y).sqrt();
        vec![x / norm, y / norm]
    }

    #[test]
    fn test_kmeans_empty_and_small() {
        assert!(kmeans_cluster(&[], 3).is_empty());
        let points = vec![unit(1.0, 0.0), unit(0.0, 1.0)];
        assert_eq!(kmeans_cluster(&points, 5), vec![0, 1]);
    }

    #[test]
    fn test_kmeans_separates_two_directions() {
        let points = vec![
            unit(1.0, 0.0),
            unit(0.99, 0.05),
            unit(0.98, -0.05),
            unit(0.0, 1.0),
            unit(0.05, 0.99),
            unit(-0.05, 0.98),
        ];
        let assignments = kmeans_cluster(&points, 2);
        assert_eq!(assignments.len(), 6);
        assert_eq!(assignments[0], assignments[1]);
        assert_eq!(assignments[0], assignments[2]);
        assert_eq!(assignments[3], assignments[4]);
        assert_eq!(assignments[3], assignments[5]);
        assert_ne!(assignments[0], assignments[3]);
    }

    #[test]
    fn test_kmeans_deterministic() {
        let points: Vec<Vec<f32>> = (0..20)
            .map(|i| unit((i % 5) as f32 + 1.0, (i / 5) as f32 + 1.0))
            .collect();
        assert_eq!(kmeans_cluster(&points, 3), kmeans_cluster(&points, 3));
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn test_string_list() {
        let value = serde_json::json!(["a", "b", 3]);
        assert_eq!(string_list(Some(&value)), vec!["a", "b"]);
        assert!(string_list(None).is_empty());
    }
}
