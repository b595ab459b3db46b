use crate::auth::identity::{AgentIdentity, Permission};
use crate::error::ShoalError;
use crate::memory::memory::{AgentMemoryStore, DEFAULT_LIST_LIMIT, MAX_KEY_LEN};
use crate::tools::tool::{
    caller_or_err, opt_bool, opt_i64, opt_str, require_str, require_value, Tool,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

// ── set_memory ───────────────────────────────────────────────────────────────

pub struct SetMemoryTool {
    memory: Arc<AgentMemoryStore>,
}

impl SetMemoryTool {
    pub fn new(memory: Arc<AgentMemoryStore>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for SetMemoryTool {
    fn name(&self) -> &str {
        "set_memory"
    }

    fn description(&self) -> &str {
        "Store a JSON value in the caller's private memory. Global by \
         default; pass session_id for a session-scoped entry."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": { "type": "string", "minLength": 1, "maxLength": MAX_KEY_LEN },
                "value": { "description": "Any JSON value." },
                "session_id": {
                    "type": "string",
                    "description": "Scope to one session; omit for the global namespace."
                },
                "expires_in": {
                    "type": ["integer", "string"],
                    "description": "Seconds until expiry; zero or negative means never."
                },
                "overwrite": { "type": "boolean", "default": true }
            },
            "required": ["key", "value"]
        })
    }

    fn required_permission(&self) -> Option<Permission> {
        Some(Permission::Write)
    }

    async fn call(
        &self,
        caller: Option<&AgentIdentity>,
        args: Value,
    ) -> Result<Value, ShoalError> {
        let caller = caller_or_err(caller)?;
        let key = require_str(&args, "key")?;
        let value = require_value(&args, "value")?;
        let session_id = opt_str(&args, "session_id")?;
        let expires_in = opt_i64(&args, "expires_in")?;
        let overwrite = opt_bool(&args, "overwrite")?.unwrap_or(true);

        let meta = self
            .memory
            .set(caller, key, &value, session_id, expires_in, overwrite)
            .await?;

        Ok(json!({
            "key": meta.key,
            "scope": meta.scope,
            "updated_at": meta.updated_at,
            "expires_at": meta.expires_at,
        }))
    }
}

// ── get_memory ───────────────────────────────────────────────────────────────

pub struct GetMemoryTool {
    memory: Arc<AgentMemoryStore>,
}

impl GetMemoryTool {
    pub fn new(memory: Arc<AgentMemoryStore>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for GetMemoryTool {
    fn name(&self) -> &str {
        "get_memory"
    }

    fn description(&self) -> &str {
        "Read one of the caller's memory entries. Expired entries behave \
         as absent."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": { "type": "string" },
                "session_id": { "type": "string" }
            },
            "required": ["key"]
        })
    }

    async fn call(
        &self,
        caller: Option<&AgentIdentity>,
        args: Value,
    ) -> Result<Value, ShoalError> {
        let caller = caller_or_err(caller)?;
        let key = require_str(&args, "key")?;
        let session_id = opt_str(&args, "session_id")?;

        let value = self.memory.get(caller, key, session_id).await?;
        Ok(json!({ "key": key, "value": value }))
    }
}

// ── list_memory ──────────────────────────────────────────────────────────────

pub struct ListMemoryTool {
    memory: Arc<AgentMemoryStore>,
}

impl ListMemoryTool {
    pub fn new(memory: Arc<AgentMemoryStore>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for ListMemoryTool {
    fn name(&self) -> &str {
        "list_memory"
    }

    fn description(&self) -> &str {
        "List the caller's unexpired memory keys in one scope, optionally \
         narrowed by key prefix."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "prefix": { "type": "string" },
                "limit": { "type": "integer", "minimum": 1, "maximum": 500, "default": DEFAULT_LIST_LIMIT }
            }
        })
    }

    async fn call(
        &self,
        caller: Option<&AgentIdentity>,
        args: Value,
    ) -> Result<Value, ShoalError> {
        let caller = caller_or_err(caller)?;
        let session_id = opt_str(&args, "session_id")?;
        let prefix = opt_str(&args, "prefix")?;
        let limit = opt_i64(&args, "limit")?.unwrap_or(DEFAULT_LIST_LIMIT);

        let entries = self.memory.list(caller, session_id, prefix, limit).await?;
        let count = entries.len();
        Ok(json!({
            "entries": entries,
            "count": count,
        }))
    }
}

// ── delete_memory ────────────────────────────────────────────────────────────

pub struct DeleteMemoryTool {
    memory: Arc<AgentMemoryStore>,
}

impl DeleteMemoryTool {
    pub fn new(memory: Arc<AgentMemoryStore>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for DeleteMemoryTool {
    fn name(&self) -> &str {
        "delete_memory"
    }

    fn description(&self) -> &str {
        "Delete one of the caller's memory entries. Deleting an absent key \
         reports MEMORY_NOT_FOUND and touches nothing else."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": { "type": "string" },
                "session_id": { "type": "string" }
            },
            "required": ["key"]
        })
    }

    fn required_permission(&self) -> Option<Permission> {
        Some(Permission::Write)
    }

    async fn call(
        &self,
        caller: Option<&AgentIdentity>,
        args: Value,
    ) -> Result<Value, ShoalError> {
        let caller = caller_or_err(caller)?;
        let key = require_str(&args, "key")?;
        let session_id = opt_str(&args, "session_id")?;

        self.memory.delete(caller, key, session_id).await?;
        Ok(json!({ "deleted": true, "key": key }))
    }
}
