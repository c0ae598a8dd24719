//! Persisted role overrides, layered over the TOML `[roles.*]` tables at
//! startup.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::warn;

use super::{now_ms, SqliteStore};
use crate::error::StoreError;
use crate::providers::{GenerationOptions, ModelTarget, Role, RoleBinding};

#[derive(Serialize, Deserialize)]
struct StoredTarget {
    provider: String,
    model: String,
}

impl SqliteStore {
    pub async fn save_role(&self, role: Role, binding: &RoleBinding) -> Result<(), StoreError> {
        let fallbacks: Vec<StoredTarget> = binding
            .fallbacks
            .iter()
            .map(|t| StoredTarget {
                provider: t.provider.clone(),
                model: t.model.clone(),
            })
            .collect();
        let fallbacks_json = serde_json::to_string(&fallbacks).unwrap_or_else(|_| "[]".to_string());

        sqlx::query(
            r#"
            INSERT INTO provider_roles (role, provider, model, temperature, max_tokens, fallbacks_json, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(role) DO UPDATE SET
                provider = excluded.provider,
                model = excluded.model,
                temperature = excluded.temperature,
                max_tokens = excluded.max_tokens,
                fallbacks_json = excluded.fallbacks_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(role.as_str())
        .bind(&binding.primary.provider)
        .bind(&binding.primary.model)
        .bind(binding.options.temperature as f64)
        .bind(binding.options.max_tokens as i64)
        .bind(fallbacks_json)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_roles(&self) -> Result<HashMap<Role, RoleBinding>, StoreError> {
        let rows = sqlx::query("SELECT * FROM provider_roles")
            .fetch_all(&self.pool)
            .await?;

        let defaults = GenerationOptions::default();
        let mut roles = HashMap::new();
        for row in rows {
            let name: String = row.get("role");
            let Some(role) = Role::parse(&name) else {
                warn!(role = %name, "ignoring stored binding for unknown role");
                continue;
            };
            let temperature: Option<f64> = row.get("temperature");
            let max_tokens: Option<i64> = row.get("max_tokens");
            let fallbacks_json: String = row.get("fallbacks_json");
            let fallbacks: Vec<StoredTarget> =
                serde_json::from_str(&fallbacks_json).unwrap_or_default();

            roles.insert(
                role,
                RoleBinding {
                    primary: ModelTarget::new(
                        row.get::<String, _>("provider"),
                        row.get::<String, _>("model"),
                    ),
                    fallbacks: fallbacks
                        .into_iter()
                        .map(|t| ModelTarget::new(t.provider, t.model))
                        .collect(),
                    options: GenerationOptions {
                        temperature: temperature.map(|t| t as f32).unwrap_or(defaults.temperature),
                        max_tokens: max_tokens
                            .map(|m| m as u32)
                            .unwrap_or(defaults.max_tokens),
                    },
                },
            );
        }
        Ok(roles)
    }

    pub async fn delete_role(&self, role: Role) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM provider_roles WHERE role = ?")
            .bind(role.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
