use crate::audit::audit::{AuditLog, AuditQuery};
use crate::auth::identity::{AgentIdentity, Permission};
use crate::auth::token::TokenService;
use crate::bridge::bridge::BroadcastBridge;
use crate::error::ShoalError;
use crate::metrics::metrics::Metrics;
use crate::notify::hub::NotificationHub;
use crate::storage::store::Store;
use crate::tools::tool::{caller_or_err, opt_i64, opt_str, Tool};
use async_trait::async_trait;
use chrono::DateTime;
use serde_json::{json, Value};
use std::sync::Arc;

// ── get_performance_metrics ──────────────────────────────────────────────────

pub struct GetPerformanceMetricsTool {
    metrics: Arc<Metrics>,
    tokens: Arc<TokenService>,
    store: Arc<Store>,
    hub: Arc<NotificationHub>,
    bridge: Option<Arc<BroadcastBridge>>,
}

impl GetPerformanceMetricsTool {
    pub fn new(
        metrics: Arc<Metrics>,
        tokens: Arc<TokenService>,
        store: Arc<Store>,
        hub: Arc<NotificationHub>,
        bridge: Option<Arc<BroadcastBridge>>,
    ) -> Self {
        Self {
            metrics,
            tokens,
            store,
            hub,
            bridge,
        }
    }
}

#[async_trait]
impl Tool for GetPerformanceMetricsTool {
    fn name(&self) -> &str {
        "get_performance_metrics"
    }

    fn description(&self) -> &str {
        "Operation counters, latency percentiles, identity-cache hit \
         ratio, pool stats, and notification counters."
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn required_permission(&self) -> Option<Permission> {
        Some(Permission::Debug)
    }

    fn authorize(&self, caller: &AgentIdentity) -> bool {
        caller.has(Permission::Debug) || caller.is_admin()
    }

    async fn call(
        &self,
        _caller: Option<&AgentIdentity>,
        _args: Value,
    ) -> Result<Value, ShoalError> {
        let (hits, misses) = self.tokens.cache_stats();
        let lookups = hits + misses;
        let pool = self.store.stats();
        let bridge = self.bridge.as_ref().map(|b| {
            let (forwarded, failed) = b.stats();
            json!({ "forwarded": forwarded, "failed": failed })
        });

        Ok(json!({
            "enabled": self.metrics.enabled(),
            "tools": self.metrics.snapshot(),
            "identity_cache": {
                "hits": hits,
                "misses": misses,
                "hit_ratio": if lookups > 0 { hits as f64 / lookups as f64 } else { 0.0 },
            },
            "pool": { "size": pool.size, "idle": pool.idle },
            "notifications": { "dropped_events": self.hub.dropped_events() },
            "bridge": bridge,
        }))
    }
}

// ── get_usage_guidance ───────────────────────────────────────────────────────

const USAGE_GUIDANCE: &str = "\
shoal is a shared blackboard for collaborating agents.

Getting started:
1. authenticate_agent with your stable agent_id and agent_type; keep the
   returned sct_ token and pass it with every call. Call refresh_token
   before expires_at.
2. create_session once per collaboration, or join an existing session by
   its session_id.
3. add_message to publish. Pick visibility deliberately:
   - public: every participant sees it (the default).
   - private: only you ever read it back; use it for scratch notes.
   - agent_only: only agents of your own type see it.
   - admin_only: operators only.
4. get_messages pages through history; get_messages_since with the last
   cursor is the cheap way to poll. Prefer subscribing to session_changed
   push events and re-reading on each hint.

Finding things:
- search_context does fuzzy matching; start with the default threshold
  and lower it if results are too sparse.
- search_by_sender tolerates spelling variants like 'cursor analyst' vs
  'cursor_analyst'.
- search_by_timerange takes inclusive RFC 3339 UTC bounds.

Remembering things:
- set_memory/get_memory are private to your agent identity and are never
  shared. Use session_id for state tied to one collaboration and
  expires_in for anything that should age out.

All responses carry success=true or success=false with a stable error
code; recoverable=true means a retry after backoff is reasonable.";

pub struct GetUsageGuidanceTool;

#[async_trait]
impl Tool for GetUsageGuidanceTool {
    fn name(&self) -> &str {
        "get_usage_guidance"
    }

    fn description(&self) -> &str {
        "Static orientation document for agents joining the server."
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn call(
        &self,
        _caller: Option<&AgentIdentity>,
        _args: Value,
    ) -> Result<Value, ShoalError> {
        Ok(json!({ "guidance": USAGE_GUIDANCE }))
    }
}

// ── get_audit_log ────────────────────────────────────────────────────────────

pub struct GetAuditLogTool {
    audit: Arc<AuditLog>,
}

impl GetAuditLogTool {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self { audit }
    }
}

#[async_trait]
impl Tool for GetAuditLogTool {
    fn name(&self) -> &str {
        "get_audit_log"
    }

    fn description(&self) -> &str {
        "Query the append-only audit log by agent, session, and time \
         window. Newest records first."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent_id": { "type": "string" },
                "session_id": { "type": "string" },
                "start_time": { "type": "string", "format": "date-time" },
                "end_time": { "type": "string", "format": "date-time" },
                "limit": { "type": "integer", "minimum": 1, "maximum": 1000, "default": 100 }
            }
        })
    }

    fn required_permission(&self) -> Option<Permission> {
        Some(Permission::Admin)
    }

    async fn call(
        &self,
        caller: Option<&AgentIdentity>,
        args: Value,
    ) -> Result<Value, ShoalError> {
        caller_or_err(caller)?;

        let parse_bound = |key: &str| -> Result<Option<i64>, ShoalError> {
            match opt_str(&args, key)? {
                Some(raw) => DateTime::parse_from_rfc3339(raw)
                    .map(|dt| Some(dt.timestamp_micros()))
                    .map_err(|_| {
                        ShoalError::Validation(format!(
                            "'{key}' must be an RFC 3339 timestamp with offset"
                        ))
                    }),
                None => Ok(None),
            }
        };

        let filter = AuditQuery {
            agent_id: opt_str(&args, "agent_id")?.map(str::to_string),
            session_id: opt_str(&args, "session_id")?.map(str::to_string),
            start_us: parse_bound("start_time")?,
            end_us: parse_bound("end_time")?,
            limit: opt_i64(&args, "limit")?.unwrap_or(100),
        };

        let records = self.audit.query(&filter).await?;
        let count = records.len();
        Ok(json!({
            "records": records,
            "count": count,
        }))
    }
}
