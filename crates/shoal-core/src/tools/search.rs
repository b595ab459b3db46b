use crate::auth::identity::AgentIdentity;
use crate::error::ShoalError;
use crate::search::search::{
    SearchEngine, SearchScope, DEFAULT_SEARCH_LIMIT, DEFAULT_SENDER_LIMIT,
    DEFAULT_TIMERANGE_LIMIT, MAX_QUERY_LEN, MAX_SEARCH_LIMIT,
};
use crate::tools::tool::{caller_or_err, opt_bool, opt_f64, opt_i64, opt_str, require_str, Tool};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

/// Timestamps at the boundary must carry an offset; naive strings are
/// rejected rather than guessed at.
fn parse_utc(raw: &str, field: &str) -> Result<DateTime<Utc>, ShoalError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            ShoalError::Validation(format!(
                "'{field}' must be an RFC 3339 timestamp with offset, e.g. 2026-01-01T00:00:00Z"
            ))
        })
}

// ── search_context ───────────────────────────────────────────────────────────

pub struct SearchContextTool {
    search: Arc<SearchEngine>,
}

impl SearchContextTool {
    pub fn new(search: Arc<SearchEngine>) -> Self {
        Self { search }
    }
}

#[async_trait]
impl Tool for SearchContextTool {
    fn name(&self) -> &str {
        "search_context"
    }

    fn description(&self) -> &str {
        "Fuzzy search over the caller-visible messages of one session, \
         ranked by score then recency."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "query": { "type": "string", "minLength": 1, "maxLength": MAX_QUERY_LEN },
                "fuzzy_threshold": {
                    "type": "number",
                    "minimum": 0,
                    "maximum": 100,
                    "default": 60.0
                },
                "limit": { "type": "integer", "minimum": 1, "maximum": MAX_SEARCH_LIMIT, "default": DEFAULT_SEARCH_LIMIT },
                "search_metadata": { "type": "boolean", "default": false },
                "search_scope": {
                    "type": "string",
                    "enum": ["all", "public", "private", "agent_only"],
                    "default": "all"
                }
            },
            "required": ["session_id", "query"]
        })
    }

    async fn call(
        &self,
        caller: Option<&AgentIdentity>,
        args: Value,
    ) -> Result<Value, ShoalError> {
        let caller = caller_or_err(caller)?;
        let session_id = require_str(&args, "session_id")?;
        let query = require_str(&args, "query")?;
        let fuzzy_threshold = opt_f64(&args, "fuzzy_threshold")?.unwrap_or(60.0);
        let limit = opt_i64(&args, "limit")?.unwrap_or(DEFAULT_SEARCH_LIMIT);
        let search_metadata = opt_bool(&args, "search_metadata")?.unwrap_or(false);
        let scope = match opt_str(&args, "search_scope")? {
            Some(raw) => SearchScope::parse(raw).ok_or_else(|| {
                ShoalError::Validation(
                    "search_scope must be one of: all, public, private, agent_only".into(),
                )
            })?,
            None => SearchScope::All,
        };

        let hits = self
            .search
            .search_context(
                caller,
                session_id,
                query,
                fuzzy_threshold,
                limit,
                search_metadata,
                scope,
            )
            .await?;

        Ok(json!({
            "results": hits.iter().map(|h| h.to_json()).collect::<Vec<_>>(),
            "count": hits.len(),
        }))
    }
}

// ── search_by_sender ─────────────────────────────────────────────────────────

pub struct SearchBySenderTool {
    search: Arc<SearchEngine>,
}

impl SearchBySenderTool {
    pub fn new(search: Arc<SearchEngine>) -> Self {
        Self { search }
    }
}

#[async_trait]
impl Tool for SearchBySenderTool {
    fn name(&self) -> &str {
        "search_by_sender"
    }

    fn description(&self) -> &str {
        "Messages from one sender, matched case-insensitively with '-', \
         '_', and spaces treated as equivalent."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "sender": { "type": "string", "minLength": 1 },
                "limit": { "type": "integer", "minimum": 1, "maximum": 500, "default": DEFAULT_SENDER_LIMIT }
            },
            "required": ["session_id", "sender"]
        })
    }

    async fn call(
        &self,
        caller: Option<&AgentIdentity>,
        args: Value,
    ) -> Result<Value, ShoalError> {
        let caller = caller_or_err(caller)?;
        let session_id = require_str(&args, "session_id")?;
        let sender = require_str(&args, "sender")?;
        let limit = opt_i64(&args, "limit")?.unwrap_or(DEFAULT_SENDER_LIMIT);

        let messages = self
            .search
            .search_by_sender(caller, session_id, sender, limit)
            .await?;

        Ok(json!({
            "messages": messages.iter().map(|m| m.to_json()).collect::<Vec<_>>(),
            "count": messages.len(),
        }))
    }
}

// ── search_by_timerange ──────────────────────────────────────────────────────

pub struct SearchByTimerangeTool {
    search: Arc<SearchEngine>,
}

impl SearchByTimerangeTool {
    pub fn new(search: Arc<SearchEngine>) -> Self {
        Self { search }
    }
}

#[async_trait]
impl Tool for SearchByTimerangeTool {
    fn name(&self) -> &str {
        "search_by_timerange"
    }

    fn description(&self) -> &str {
        "Messages whose timestamps fall inside an inclusive UTC window."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "start_time": { "type": "string", "format": "date-time" },
                "end_time": { "type": "string", "format": "date-time" },
                "limit": { "type": "integer", "minimum": 1, "maximum": 500, "default": DEFAULT_TIMERANGE_LIMIT }
            },
            "required": ["session_id", "start_time", "end_time"]
        })
    }

    async fn call(
        &self,
        caller: Option<&AgentIdentity>,
        args: Value,
    ) -> Result<Value, ShoalError> {
        let caller = caller_or_err(caller)?;
        let session_id = require_str(&args, "session_id")?;
        let start = parse_utc(require_str(&args, "start_time")?, "start_time")?;
        let end = parse_utc(require_str(&args, "end_time")?, "end_time")?;
        let limit = opt_i64(&args, "limit")?.unwrap_or(DEFAULT_TIMERANGE_LIMIT);

        let messages = self
            .search
            .search_by_timerange(caller, session_id, start, end, limit)
            .await?;

        Ok(json!({
            "messages": messages.iter().map(|m| m.to_json()).collect::<Vec<_>>(),
            "count": messages.len(),
        }))
    }
}
