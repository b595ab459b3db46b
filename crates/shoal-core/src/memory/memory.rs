use crate::auth::identity::AgentIdentity;
use crate::error::ShoalError;
use crate::session::message::micros_to_rfc3339;
use crate::storage::store::{Dialect, Store};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sqlx::Row;
use std::sync::Arc;

pub const MAX_KEY_LEN: usize = 255;
pub const MAX_VALUE_BYTES: usize = 100 * 1024;
pub const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;

/// Listing entry; values are only returned by `get`.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryEntryMeta {
    pub key: String,
    pub scope: &'static str,
    pub session_id: Option<String>,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

/// Per-agent key/value store.
///
/// Entries are strictly scoped to their owning `agent_id`; the same key
/// lives independently in the global namespace (`session_id = None`) and
/// in any session namespace. Expired entries behave as absent and are
/// garbage-collected when touched.
pub struct AgentMemoryStore {
    store: Arc<Store>,
}

impl AgentMemoryStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Upsert. `expires_in` is seconds from now; zero or negative means no
    /// expiration. With `overwrite = false` an unexpired entry wins.
    pub async fn set(
        &self,
        caller: &AgentIdentity,
        key: &str,
        value: &Value,
        session_id: Option<&str>,
        expires_in: Option<i64>,
        overwrite: bool,
    ) -> Result<MemoryEntryMeta, ShoalError> {
        let key = validate_key(key)?;
        let value_json = serde_json::to_string(value)
            .map_err(|e| ShoalError::internal(format!("json encode: {e}")))?;
        if value_json.len() > MAX_VALUE_BYTES {
            return Err(ShoalError::Validation(format!(
                "value must serialize to at most {MAX_VALUE_BYTES} bytes"
            )));
        }

        let scope = scope_column(session_id);
        let now = Utc::now().timestamp_micros();
        let expires_at = match expires_in {
            Some(seconds) if seconds > 0 => Some(now + seconds * 1_000_000),
            _ => None,
        };

        if !overwrite {
            let existing = sqlx::query(&self.store.sql(
                "SELECT expires_at FROM agent_memory \
                 WHERE agent_id = ? AND session_id = ? AND mem_key = ?",
            ))
            .bind(&caller.agent_id)
            .bind(&scope)
            .bind(key)
            .fetch_optional(self.store.pool())
            .await?;
            if let Some(row) = existing {
                let entry_expiry: Option<i64> = row.try_get("expires_at")?;
                if !is_expired(entry_expiry, now) {
                    return Err(ShoalError::MemoryConflict(key.to_string()));
                }
            }
        }

        // One upsert statement keeps concurrent writers last-commit-wins.
        let upsert = match self.store.dialect() {
            Dialect::Sqlite | Dialect::Postgres => {
                "INSERT INTO agent_memory \
                 (agent_id, session_id, mem_key, mem_value, created_at, updated_at, expires_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT (agent_id, session_id, mem_key) DO UPDATE SET \
                 mem_value = excluded.mem_value, updated_at = excluded.updated_at, \
                 expires_at = excluded.expires_at"
            }
            Dialect::MySql => {
                "INSERT INTO agent_memory \
                 (agent_id, session_id, mem_key, mem_value, created_at, updated_at, expires_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?) \
                 ON DUPLICATE KEY UPDATE \
                 mem_value = VALUES(mem_value), updated_at = VALUES(updated_at), \
                 expires_at = VALUES(expires_at)"
            }
        };
        sqlx::query(&self.store.sql(upsert))
            .bind(&caller.agent_id)
            .bind(&scope)
            .bind(key)
            .bind(&value_json)
            .bind(now)
            .bind(now)
            .bind(expires_at)
            .execute(self.store.pool())
            .await?;

        Ok(MemoryEntryMeta {
            key: key.to_string(),
            scope: scope_name(session_id),
            session_id: session_id.map(str::to_string),
            updated_at: micros_to_rfc3339(now),
            expires_at: expires_at.map(micros_to_rfc3339),
        })
    }

    pub async fn get(
        &self,
        caller: &AgentIdentity,
        key: &str,
        session_id: Option<&str>,
    ) -> Result<Value, ShoalError> {
        let key = validate_key(key)?;
        let scope = scope_column(session_id);
        let now = Utc::now().timestamp_micros();

        let row = sqlx::query(&self.store.sql(
            "SELECT id, mem_value, expires_at FROM agent_memory \
             WHERE agent_id = ? AND session_id = ? AND mem_key = ?",
        ))
        .bind(&caller.agent_id)
        .bind(&scope)
        .bind(key)
        .fetch_optional(self.store.pool())
        .await?
        .ok_or_else(|| ShoalError::MemoryNotFound(key.to_string()))?;

        let expires_at: Option<i64> = row.try_get("expires_at")?;
        if is_expired(expires_at, now) {
            let id: i64 = row.try_get("id")?;
            self.collect_expired_row(id).await;
            return Err(ShoalError::MemoryNotFound(key.to_string()));
        }

        let value_json: String = row.try_get("mem_value")?;
        serde_json::from_str(&value_json)
            .map_err(|e| ShoalError::internal(format!("corrupt memory value: {e}")))
    }

    pub async fn list(
        &self,
        caller: &AgentIdentity,
        session_id: Option<&str>,
        prefix: Option<&str>,
        limit: i64,
    ) -> Result<Vec<MemoryEntryMeta>, ShoalError> {
        if !(1..=MAX_LIST_LIMIT).contains(&limit) {
            return Err(ShoalError::Validation(format!(
                "limit must be between 1 and {MAX_LIST_LIMIT}"
            )));
        }
        let scope = scope_column(session_id);
        let now = Utc::now().timestamp_micros();

        // Lazy sweep: listing is a natural point to drop this agent's
        // expired entries.
        let _ = sqlx::query(&self.store.sql(
            "DELETE FROM agent_memory \
             WHERE agent_id = ? AND expires_at IS NOT NULL AND expires_at <= ?",
        ))
        .bind(&caller.agent_id)
        .bind(now)
        .execute(self.store.pool())
        .await;

        let pattern = format!("{}%", escape_like(prefix.unwrap_or("")));
        let rows = sqlx::query(&self.store.sql(
            "SELECT mem_key, updated_at, expires_at FROM agent_memory \
             WHERE agent_id = ? AND session_id = ? \
               AND mem_key LIKE ? ESCAPE '\\' \
               AND (expires_at IS NULL OR expires_at > ?) \
             ORDER BY mem_key ASC LIMIT ?",
        ))
        .bind(&caller.agent_id)
        .bind(&scope)
        .bind(&pattern)
        .bind(now)
        .bind(limit)
        .fetch_all(self.store.pool())
        .await?;

        rows.into_iter()
            .map(|row| {
                let updated_at: i64 = row.try_get("updated_at")?;
                let expires_at: Option<i64> = row.try_get("expires_at")?;
                Ok(MemoryEntryMeta {
                    key: row.try_get("mem_key")?,
                    scope: scope_name(session_id),
                    session_id: session_id.map(str::to_string),
                    updated_at: micros_to_rfc3339(updated_at),
                    expires_at: expires_at.map(micros_to_rfc3339),
                })
            })
            .collect()
    }

    /// Delete an entry. `MemoryNotFound` when it was already absent;
    /// nothing else is touched either way.
    pub async fn delete(
        &self,
        caller: &AgentIdentity,
        key: &str,
        session_id: Option<&str>,
    ) -> Result<(), ShoalError> {
        let key = validate_key(key)?;
        let scope = scope_column(session_id);

        let affected = sqlx::query(&self.store.sql(
            "DELETE FROM agent_memory WHERE agent_id = ? AND session_id = ? AND mem_key = ?",
        ))
        .bind(&caller.agent_id)
        .bind(&scope)
        .bind(key)
        .execute(self.store.pool())
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(ShoalError::MemoryNotFound(key.to_string()));
        }
        Ok(())
    }

    async fn collect_expired_row(&self, id: i64) {
        let result = sqlx::query(&self.store.sql("DELETE FROM agent_memory WHERE id = ?"))
            .bind(id)
            .execute(self.store.pool())
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to collect expired memory row");
        }
    }
}

/// Global scope is stored as `''` so the `(agent_id, session_id, mem_key)`
/// uniqueness constraint works identically on every backend.
fn scope_column(session_id: Option<&str>) -> String {
    session_id.unwrap_or("").to_string()
}

fn scope_name(session_id: Option<&str>) -> &'static str {
    if session_id.is_some() {
        "session"
    } else {
        "global"
    }
}

fn is_expired(expires_at: Option<i64>, now: i64) -> bool {
    matches!(expires_at, Some(at) if at <= now)
}

fn validate_key(key: &str) -> Result<&str, ShoalError> {
    if key.is_empty() {
        return Err(ShoalError::Validation("key must not be empty".into()));
    }
    if key.chars().count() > MAX_KEY_LEN {
        return Err(ShoalError::Validation(format!(
            "key must be at most {MAX_KEY_LEN} characters"
        )));
    }
    Ok(key)
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
