use crate::auth::identity::{AgentIdentity, Permission};
use crate::error::ShoalError;
use crate::session::message::{MessageType, Visibility, MAX_CONTENT_LEN, MAX_PURPOSE_LEN};
use crate::session::session::{SessionCore, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};
use crate::tools::tool::{caller_or_err, opt_i64, opt_object, opt_str, require_str, Tool};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

// ── create_session ───────────────────────────────────────────────────────────

pub struct CreateSessionTool {
    sessions: Arc<SessionCore>,
}

impl CreateSessionTool {
    pub fn new(sessions: Arc<SessionCore>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Tool for CreateSessionTool {
    fn name(&self) -> &str {
        "create_session"
    }

    fn description(&self) -> &str {
        "Create a new shared session. The caller becomes its creator."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "purpose": {
                    "type": "string",
                    "minLength": 1,
                    "maxLength": MAX_PURPOSE_LEN,
                    "description": "What this session is for."
                },
                "metadata": { "type": "object" }
            },
            "required": ["purpose"]
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
        let purpose = require_str(&args, "purpose")?;
        let metadata = opt_object(&args, "metadata")?;

        let session = self.sessions.create_session(caller, purpose, metadata).await?;
        Ok(json!({
            "session_id": session.id,
            "created_at": crate::session::message::micros_to_rfc3339(session.created_at_us),
        }))
    }
}

// ── get_session ──────────────────────────────────────────────────────────────

pub struct GetSessionTool {
    sessions: Arc<SessionCore>,
}

impl GetSessionTool {
    pub fn new(sessions: Arc<SessionCore>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Tool for GetSessionTool {
    fn name(&self) -> &str {
        "get_session"
    }

    fn description(&self) -> &str {
        "Fetch a session plus the tail of messages visible to the caller."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" }
            },
            "required": ["session_id"]
        })
    }

    async fn call(
        &self,
        caller: Option<&AgentIdentity>,
        args: Value,
    ) -> Result<Value, ShoalError> {
        let caller = caller_or_err(caller)?;
        let session_id = require_str(&args, "session_id")?;
        let view = self.sessions.get_session(caller, session_id).await?;
        Ok(view.to_json())
    }
}

// ── add_message ──────────────────────────────────────────────────────────────

pub struct AddMessageTool {
    sessions: Arc<SessionCore>,
}

impl AddMessageTool {
    pub fn new(sessions: Arc<SessionCore>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Tool for AddMessageTool {
    fn name(&self) -> &str {
        "add_message"
    }

    fn description(&self) -> &str {
        "Append a message to a session. The sender is always the \
         authenticated caller. Subscribers are notified after commit."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "content": {
                    "type": "string",
                    "minLength": 1,
                    "maxLength": MAX_CONTENT_LEN,
                },
                "visibility": {
                    "type": "string",
                    "enum": ["public", "private", "agent_only", "admin_only"],
                    "default": "public"
                },
                "metadata": { "type": "object" },
                "parent_message_id": {
                    "type": "integer",
                    "description": "Id of an existing message in the same session."
                }
            },
            "required": ["session_id", "content"]
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
        let session_id = require_str(&args, "session_id")?;
        let content = require_str(&args, "content")?;
        let visibility = match opt_str(&args, "visibility")? {
            Some(raw) => Visibility::parse(raw).ok_or_else(|| {
                ShoalError::Validation(
                    "visibility must be one of: public, private, agent_only, admin_only".into(),
                )
            })?,
            None => Visibility::Public,
        };
        let metadata = opt_object(&args, "metadata")?;
        let parent_message_id = opt_i64(&args, "parent_message_id")?;

        let message = self
            .sessions
            .add_message(
                caller,
                session_id,
                content,
                visibility,
                MessageType::AgentResponse,
                metadata,
                parent_message_id,
            )
            .await?;

        Ok(json!({
            "message_id": message.id,
            "timestamp": message.timestamp(),
        }))
    }
}

// ── get_messages ─────────────────────────────────────────────────────────────

pub struct GetMessagesTool {
    sessions: Arc<SessionCore>,
}

impl GetMessagesTool {
    pub fn new(sessions: Arc<SessionCore>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Tool for GetMessagesTool {
    fn name(&self) -> &str {
        "get_messages"
    }

    fn description(&self) -> &str {
        "Ordered page of session messages visible to the caller."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "limit": { "type": "integer", "minimum": 1, "maximum": MAX_PAGE_LIMIT, "default": DEFAULT_PAGE_LIMIT },
                "offset": { "type": "integer", "minimum": 0, "default": 0 },
                "visibility_filter": {
                    "type": "string",
                    "enum": ["public", "private", "agent_only", "admin_only"],
                    "description": "Narrow to one visibility class, within what the caller may see."
                }
            },
            "required": ["session_id"]
        })
    }

    async fn call(
        &self,
        caller: Option<&AgentIdentity>,
        args: Value,
    ) -> Result<Value, ShoalError> {
        let caller = caller_or_err(caller)?;
        let session_id = require_str(&args, "session_id")?;
        let limit = opt_i64(&args, "limit")?.unwrap_or(DEFAULT_PAGE_LIMIT);
        let offset = opt_i64(&args, "offset")?.unwrap_or(0);
        let visibility_filter = match opt_str(&args, "visibility_filter")? {
            Some(raw) => Some(Visibility::parse(raw).ok_or_else(|| {
                ShoalError::Validation(
                    "visibility_filter must be one of: public, private, agent_only, admin_only"
                        .into(),
                )
            })?),
            None => None,
        };

        let messages = self
            .sessions
            .get_messages(caller, session_id, limit, offset, visibility_filter)
            .await?;

        Ok(json!({
            "messages": messages.iter().map(|m| m.to_json()).collect::<Vec<_>>(),
            "count": messages.len(),
        }))
    }
}

// ── get_messages_since ───────────────────────────────────────────────────────

pub struct GetMessagesSinceTool {
    sessions: Arc<SessionCore>,
}

impl GetMessagesSinceTool {
    pub fn new(sessions: Arc<SessionCore>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Tool for GetMessagesSinceTool {
    fn name(&self) -> &str {
        "get_messages_since"
    }

    fn description(&self) -> &str {
        "Incremental fetch: messages strictly after a message-id cursor, \
         in order. Use the returned cursor for the next call."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "cursor": {
                    "type": "integer",
                    "minimum": 0,
                    "description": "Message id of the last message already seen; 0 for the beginning."
                }
            },
            "required": ["session_id", "cursor"]
        })
    }

    async fn call(
        &self,
        caller: Option<&AgentIdentity>,
        args: Value,
    ) -> Result<Value, ShoalError> {
        let caller = caller_or_err(caller)?;
        let session_id = require_str(&args, "session_id")?;
        let cursor = opt_i64(&args, "cursor")?
            .ok_or_else(|| ShoalError::Validation("'cursor' is required".into()))?;
        if cursor < 0 {
            return Err(ShoalError::Validation("cursor must not be negative".into()));
        }

        let messages = self
            .sessions
            .get_messages_since(caller, session_id, cursor)
            .await?;
        let next_cursor = messages.last().map(|m| m.id).unwrap_or(cursor);

        Ok(json!({
            "messages": messages.iter().map(|m| m.to_json()).collect::<Vec<_>>(),
            "count": messages.len(),
            "cursor": next_cursor,
        }))
    }
}
