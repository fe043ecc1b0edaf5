//! Custom prompt overrides and the app-settings key-value store.

use anyhow::Result;
use chrono::Utc;
use sqlx::Row;

use super::Store;

/// A persisted prompt customization. Only the body and generation settings
/// are overridable; the variable list stays fixed per key.
#[derive(Debug, Clone)]
pub struct CustomPrompt {
    pub template: String,
    pub temperature: f64,
    pub max_tokens: i64,
}

impl Store {
    pub async fn get_custom_prompt(&self, key: &str) -> Result<Option<CustomPrompt>> {
        let row = sqlx::query(
            "SELECT template, temperature, max_tokens FROM custom_prompts WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| CustomPrompt {
            template: row.get("template"),
            temperature: row.get("temperature"),
            max_tokens: row.get("max_tokens"),
        }))
    }

    pub async fn save_custom_prompt(
        &self,
        key: &str,
        template: &str,
        temperature: f64,
        max_tokens: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO custom_prompts (key, template, temperature, max_tokens, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                template = excluded.template,
                temperature = excluded.temperature,
                max_tokens = excluded.max_tokens,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(template)
        .bind(temperature)
        .bind(max_tokens)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_custom_prompt(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM custom_prompts WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM app_settings WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO app_settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
