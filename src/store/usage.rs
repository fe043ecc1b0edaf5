//! Append-only usage ledger: one row per external API call, plus the
//! aggregation queries behind the cost dashboard.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::Serialize;
use sqlx::Row;

use super::Store;

/// One external API call to record.
#[derive(Debug, Clone, Default)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    pub operation: String,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub cost_usd: f64,
    pub latency_ms: Option<i64>,
    pub success: bool,
    pub error_message: Option<String>,
    pub metadata_json: Option<String>,
}

/// Aggregation window for usage stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsagePeriod {
    Today,
    Week,
    Month,
    All,
}

impl UsagePeriod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "today" => Some(UsagePeriod::Today),
            "week" => Some(UsagePeriod::Week),
            "month" => Some(UsagePeriod::Month),
            "all" => Some(UsagePeriod::All),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UsagePeriod::Today => "today",
            UsagePeriod::Week => "week",
            UsagePeriod::Month => "month",
            UsagePeriod::All => "all",
        }
    }

    /// RFC3339 lower bound for the window, or None for `all`.
    fn since(&self) -> Option<String> {
        let now = Utc::now();
        match self {
            UsagePeriod::Today => Some(
                now.date_naive()
                    .and_hms_opt(0, 0, 0)
                    .map(|d| d.and_utc().to_rfc3339())
                    .unwrap_or_default(),
            ),
            UsagePeriod::Week => Some((now - Duration::days(7)).to_rfc3339()),
            UsagePeriod::Month => Some((now - Duration::days(30)).to_rfc3339()),
            UsagePeriod::All => None,
        }
    }
}

/// Per-group totals inside a usage report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageBucket {
    pub requests: i64,
    pub total_cost: f64,
    pub tokens_in: i64,
    pub tokens_out: i64,
}

/// Aggregated usage over a period.
#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub period: String,
    pub total_cost: f64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub requests: i64,
    pub avg_latency_ms: f64,
    pub errors: i64,
    pub by_provider: HashMap<String, UsageBucket>,
    pub by_operation: HashMap<String, UsageBucket>,
}

impl Store {
    /// Append one usage row. Never updates existing rows.
    pub async fn record_usage(&self, record: &UsageRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO api_usage (
                created_at, provider, model, operation, tokens_input, tokens_output,
                cost_usd, latency_ms, success, error_message, metadata_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&record.provider)
        .bind(&record.model)
        .bind(&record.operation)
        .bind(record.tokens_input)
        .bind(record.tokens_output)
        .bind(record.cost_usd)
        .bind(record.latency_ms)
        .bind(record.success as i64)
        .bind(&record.error_message)
        .bind(&record.metadata_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn usage_stats(&self, period: UsagePeriod) -> Result<UsageStats> {
        let since = period.since();
        let filter = match &since {
            Some(_) => "WHERE created_at >= ?",
            None => "",
        };

        let sql = format!(
            r#"
            SELECT provider, operation, tokens_input, tokens_output, cost_usd,
                   latency_ms, success
            FROM api_usage {}
            "#,
            filter
        );
        let mut query = sqlx::query(&sql);
        if let Some(since) = &since {
            query = query.bind(since);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut stats = UsageStats {
            period: period.as_str().to_string(),
            total_cost: 0.0,
            tokens_in: 0,
            tokens_out: 0,
            requests: 0,
            avg_latency_ms: 0.0,
            errors: 0,
            by_provider: HashMap::new(),
            by_operation: HashMap::new(),
        };

        let mut latency_total = 0i64;
        let mut latency_count = 0i64;

        for row in &rows {
            let provider: String = row.get("provider");
            let operation: String = row.get("operation");
            let tokens_in: i64 = row.get("tokens_input");
            let tokens_out: i64 = row.get("tokens_output");
            let cost: f64 = row.get("cost_usd");
            let latency: Option<i64> = row.get("latency_ms");
            let success: i64 = row.get("success");

            stats.requests += 1;
            stats.total_cost += cost;
            stats.tokens_in += tokens_in;
            stats.tokens_out += tokens_out;
            if success == 0 {
                stats.errors += 1;
            }
            if let Some(latency) = latency {
                latency_total += latency;
                latency_count += 1;
            }

            let bucket = stats.by_provider.entry(provider).or_default();
            bucket.requests += 1;
            bucket.total_cost += cost;
            bucket.tokens_in += tokens_in;
            bucket.tokens_out += tokens_out;

            let bucket = stats.by_operation.entry(operation).or_default();
            bucket.requests += 1;
            bucket.total_cost += cost;
            bucket.tokens_in += tokens_in;
            bucket.tokens_out += tokens_out;
        }

        if latency_count > 0 {
            stats.avg_latency_ms = latency_total as f64 / latency_count as f64;
        }

        Ok(stats)
    }

    /// Number of successful calls for an operation since UTC midnight, for
    /// the daily rate caps.
    pub async fn count_calls_today(&self, operation: &str) -> Result<i64> {
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|d| d.and_utc().to_rfc3339())
            .unwrap_or_default();

        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM api_usage WHERE operation = ? AND created_at >= ?",
        )
        .bind(operation)
        .bind(&midnight)
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }
}
