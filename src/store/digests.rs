//! Generated digest persistence: the digest row plus its topic and citation
//! children, written in one transaction.

use anyhow::Result;
use serde::Serialize;
use sqlx::Row;

use crate::clustering::TopicCluster;

use super::Store;

/// Summary row returned by the digest listing.
#[derive(Debug, Clone, Serialize)]
pub struct DigestSummary {
    pub id: i64,
    pub name: String,
    pub date_from: String,
    pub date_to: String,
    pub strategy: String,
    pub model_id: String,
    pub docs_analyzed: i64,
    pub chunks_analyzed: i64,
    pub cost_usd: f64,
    pub created_at: String,
}

/// Full digest row including the summary text and topic/highlight JSON.
#[derive(Debug, Clone, Serialize)]
pub struct DigestDetail {
    pub id: i64,
    pub name: String,
    pub date_from: String,
    pub date_to: String,
    pub time_range_days: i64,
    pub strategy: String,
    pub model_id: String,
    pub summary_text: String,
    pub topics_json: String,
    pub highlights_json: Option<String>,
    pub docs_analyzed: i64,
    pub chunks_analyzed: i64,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub cost_usd: f64,
    pub created_at: String,
}

#[allow(clippy::too_many_arguments)]
impl Store {
    /// Persist a generated digest with its topics and one citation per
    /// `(topic, chunk)` pair. Returns the digest id.
    pub async fn save_generated_digest(
        &self,
        name: &str,
        time_range_days: i64,
        date_from: &str,
        date_to: &str,
        strategy: &str,
        model_id: &str,
        summary_text: &str,
        topics: &[TopicCluster],
        highlights_json: Option<&str>,
        docs_analyzed: i64,
        chunks_analyzed: i64,
        tokens_input: i64,
        tokens_output: i64,
        cost_usd: f64,
        excerpts: &[(i64, i64, String)],
    ) -> Result<i64> {
        let topics_json = serde_json::to_string(topics)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO generated_digests (
                name, date_from, date_to, time_range_days, strategy, model_id,
                summary_text, topics_json, highlights_json,
                docs_analyzed, chunks_analyzed, tokens_input, tokens_output, cost_usd
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(name)
        .bind(date_from)
        .bind(date_to)
        .bind(time_range_days)
        .bind(strategy)
        .bind(model_id)
        .bind(summary_text)
        .bind(&topics_json)
        .bind(highlights_json)
        .bind(docs_analyzed)
        .bind(chunks_analyzed)
        .bind(tokens_input)
        .bind(tokens_output)
        .bind(cost_usd)
        .execute(&mut *tx)
        .await?;

        let digest_id: i64 = sqlx::query_scalar("SELECT last_insert_rowid()")
            .fetch_one(&mut *tx)
            .await?;

        for topic in topics {
            sqlx::query(
                r#"
                INSERT INTO digest_topics (digest_id, topic_index, topic_name, summary, key_points_json, chunk_count)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(digest_id)
            .bind(topic.topic_index)
            .bind(&topic.topic_name)
            .bind(&topic.summary)
            .bind(serde_json::to_string(&topic.key_points)?)
            .bind(topic.chunk_ids.len() as i64)
            .execute(&mut *tx)
            .await?;
        }

        // excerpts: (topic_index, chunk_id, excerpt); document resolved here
        // so each citation carries the full provenance tuple.
        for (topic_index, chunk_id, excerpt) in excerpts {
            let document_id: Option<i64> =
                sqlx::query_scalar("SELECT document_id FROM chunks WHERE id = ?")
                    .bind(chunk_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            let Some(document_id) = document_id else {
                continue;
            };

            sqlx::query(
                r#"
                INSERT INTO digest_citations (digest_id, topic_index, chunk_id, document_id, excerpt)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(digest_id)
            .bind(topic_index)
            .bind(chunk_id)
            .bind(document_id)
            .bind(excerpt)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(digest_id)
    }

    pub async fn list_digests(&self, limit: i64) -> Result<Vec<DigestSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, date_from, date_to, strategy, model_id,
                   docs_analyzed, chunks_analyzed, cost_usd, created_at
            FROM generated_digests
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| DigestSummary {
                id: row.get("id"),
                name: row.get("name"),
                date_from: row.get("date_from"),
                date_to: row.get("date_to"),
                strategy: row.get("strategy"),
                model_id: row.get("model_id"),
                docs_analyzed: row.get("docs_analyzed"),
                chunks_analyzed: row.get("chunks_analyzed"),
                cost_usd: row.get("cost_usd"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    pub async fn get_digest(&self, id: i64) -> Result<Option<DigestDetail>> {
        let row = sqlx::query("SELECT * FROM generated_digests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| DigestDetail {
            id: row.get("id"),
            name: row.get("name"),
            date_from: row.get("date_from"),
            date_to: row.get("date_to"),
            time_range_days: row.get("time_range_days"),
            strategy: row.get("strategy"),
            model_id: row.get("model_id"),
            summary_text: row.get("summary_text"),
            topics_json: row.get("topics_json"),
            highlights_json: row.get("highlights_json"),
            docs_analyzed: row.get("docs_analyzed"),
            chunks_analyzed: row.get("chunks_analyzed"),
            tokens_input: row.get("tokens_input"),
            tokens_output: row.get("tokens_output"),
            cost_usd: row.get("cost_usd"),
            created_at: row.get("created_at"),
        }))
    }
}
