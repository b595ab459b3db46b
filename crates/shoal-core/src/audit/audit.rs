use crate::error::ShoalError;
use crate::session::message::micros_to_rfc3339;
use crate::storage::store::Store;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sqlx::Row;
use std::sync::Arc;

/// Outcome recorded with every audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditResult {
    Success,
    Error,
    Denied,
}

impl AuditResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Denied => "denied",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: i64,
    pub timestamp: String,
    pub agent_id: String,
    pub event_type: String,
    pub session_id: Option<String>,
    pub result: String,
    pub details: Value,
}

/// Filters for the admin audit query. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub start_us: Option<i64>,
    pub end_us: Option<i64>,
    pub limit: i64,
}

/// Append-only audit log. One record per authorization decision and per
/// mutation; records are never updated or deleted.
pub struct AuditLog {
    store: Arc<Store>,
}

impl AuditLog {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        agent_id: &str,
        event_type: &str,
        session_id: Option<&str>,
        result: AuditResult,
        details: Value,
    ) -> Result<(), ShoalError> {
        let details_json = serde_json::to_string(&details)
            .map_err(|e| ShoalError::internal(format!("unserializable audit details: {e}")))?;

        sqlx::query(&self.store.sql(
            "INSERT INTO audit_log (timestamp, agent_id, event_type, session_id, result, details) \
             VALUES (?, ?, ?, ?, ?, ?)",
        ))
        .bind(Utc::now().timestamp_micros())
        .bind(agent_id)
        .bind(event_type)
        .bind(session_id)
        .bind(result.as_str())
        .bind(&details_json)
        .execute(self.store.pool())
        .await?;

        Ok(())
    }

    pub async fn query(&self, filter: &AuditQuery) -> Result<Vec<AuditRecord>, ShoalError> {
        let limit = filter.limit.clamp(1, 1000);
        let rows = sqlx::query(&self.store.sql(
            "SELECT id, timestamp, agent_id, event_type, session_id, result, details \
             FROM audit_log \
             WHERE (? = '' OR agent_id = ?) \
               AND (? = '' OR session_id = ?) \
               AND timestamp >= ? AND timestamp <= ? \
             ORDER BY timestamp DESC, id DESC LIMIT ?",
        ))
        .bind(filter.agent_id.as_deref().unwrap_or(""))
        .bind(filter.agent_id.as_deref().unwrap_or(""))
        .bind(filter.session_id.as_deref().unwrap_or(""))
        .bind(filter.session_id.as_deref().unwrap_or(""))
        .bind(filter.start_us.unwrap_or(0))
        .bind(filter.end_us.unwrap_or(i64::MAX))
        .bind(limit)
        .fetch_all(self.store.pool())
        .await?;

        rows.into_iter()
            .map(|row| {
                let details_json: String = row.try_get("details")?;
                let timestamp_us: i64 = row.try_get("timestamp")?;
                Ok(AuditRecord {
                    id: row.try_get("id")?,
                    timestamp: micros_to_rfc3339(timestamp_us),
                    agent_id: row.try_get("agent_id")?,
                    event_type: row.try_get("event_type")?,
                    session_id: row.try_get("session_id")?,
                    result: row.try_get("result")?,
                    details: serde_json::from_str(&details_json).unwrap_or(Value::Null),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    async fn open_log() -> (AuditLog, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!("shoal_test_{}.db", Uuid::new_v4()));
        let url = format!("sqlite://{}", path.display());
        let store = Arc::new(Store::connect(&url, 5).await.expect("open store"));
        (AuditLog::new(store), path)
    }

    #[tokio::test]
    async fn records_are_appended_and_queryable() {
        let (log, path) = open_log().await;
        log.record("a1", "add_message", Some("session_x"), AuditResult::Success, json!({}))
            .await
            .unwrap();
        log.record("a2", "get_messages", Some("session_x"), AuditResult::Denied, json!({}))
            .await
            .unwrap();
        log.record("a1", "set_memory", None, AuditResult::Error, json!({"code": "X"}))
            .await
            .unwrap();

        let all = log
            .query(&AuditQuery {
                limit: 50,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let by_agent = log
            .query(&AuditQuery {
                agent_id: Some("a1".into()),
                limit: 50,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_agent.len(), 2);
        assert!(by_agent.iter().all(|r| r.agent_id == "a1"));

        let by_session = log
            .query(&AuditQuery {
                session_id: Some("session_x".into()),
                limit: 50,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_session.len(), 2);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn time_window_filters() {
        let (log, path) = open_log().await;
        let before = Utc::now().timestamp_micros();
        log.record("a1", "create_session", None, AuditResult::Success, json!({}))
            .await
            .unwrap();
        let after = Utc::now().timestamp_micros();

        let inside = log
            .query(&AuditQuery {
                start_us: Some(before),
                end_us: Some(after),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(inside.len(), 1);

        let outside = log
            .query(&AuditQuery {
                start_us: Some(after + 1),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(outside.is_empty());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn newest_records_come_first() {
        let (log, path) = open_log().await;
        for i in 0..5 {
            log.record("a1", &format!("event_{i}"), None, AuditResult::Success, json!({}))
                .await
                .unwrap();
        }
        let records = log
            .query(&AuditQuery {
                limit: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event_type, "event_4");
        assert_eq!(records[1].event_type, "event_3");
        let _ = std::fs::remove_file(path);
    }
}
