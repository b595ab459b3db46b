use crate::auth::identity::AgentType;
use crate::error::ShoalError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::any::AnyRow;
use sqlx::Row;

pub const MAX_PURPOSE_LEN: usize = 500;
pub const MAX_CONTENT_LEN: usize = 100_000;
pub const MAX_METADATA_BYTES: usize = 10 * 1024;

/// Who may read a message. Resolution lives in [`super::visibility`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
    AgentOnly,
    AdminOnly,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::AgentOnly => "agent_only",
            Self::AdminOnly => "admin_only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Self::Public),
            "private" => Some(Self::Private),
            "agent_only" => Some(Self::AgentOnly),
            "admin_only" => Some(Self::AdminOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    AgentResponse,
    System,
    Error,
    Admin,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentResponse => "agent_response",
            Self::System => "system",
            Self::Error => "error",
            Self::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agent_response" => Some(Self::AgentResponse),
            "system" => Some(Self::System),
            "error" => Some(Self::Error),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

/// RFC 3339 rendering of a stored microsecond timestamp.
pub fn micros_to_rfc3339(timestamp_us: i64) -> String {
    DateTime::<Utc>::from_timestamp_micros(timestamp_us)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Micros, true))
        .unwrap_or_default()
}

/// One row of the append-only message log. Never mutated after insert.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: i64,
    pub session_id: String,
    pub sender: String,
    pub sender_type: AgentType,
    pub content: String,
    pub visibility: Visibility,
    pub message_type: MessageType,
    pub metadata: Value,
    pub parent_message_id: Option<i64>,
    pub timestamp_us: i64,
}

impl MessageRecord {
    pub fn timestamp(&self) -> String {
        micros_to_rfc3339(self.timestamp_us)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "session_id": self.session_id,
            "sender": self.sender,
            "sender_type": self.sender_type.as_str(),
            "content": self.content,
            "visibility": self.visibility.as_str(),
            "message_type": self.message_type.as_str(),
            "metadata": self.metadata,
            "parent_message_id": self.parent_message_id,
            "timestamp": self.timestamp(),
        })
    }

    pub fn from_row(row: &AnyRow) -> Result<Self, ShoalError> {
        let sender_type_raw: String = row.try_get("sender_type")?;
        let visibility_raw: String = row.try_get("visibility")?;
        let message_type_raw: String = row.try_get("message_type")?;
        let metadata_json: String = row.try_get("metadata")?;

        Ok(Self {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            sender: row.try_get("sender")?,
            sender_type: AgentType::parse(&sender_type_raw)
                .ok_or_else(|| corrupt("sender_type", &sender_type_raw))?,
            content: row.try_get("content")?,
            visibility: Visibility::parse(&visibility_raw)
                .ok_or_else(|| corrupt("visibility", &visibility_raw))?,
            message_type: MessageType::parse(&message_type_raw)
                .ok_or_else(|| corrupt("message_type", &message_type_raw))?,
            metadata: serde_json::from_str(&metadata_json).unwrap_or(Value::Null),
            parent_message_id: row.try_get("parent_message_id")?,
            timestamp_us: row.try_get("timestamp")?,
        })
    }

    /// Columns selected by every message query, matching [`Self::from_row`].
    pub const COLUMNS: &'static str = "id, session_id, sender, sender_type, content, \
         visibility, message_type, metadata, parent_message_id, timestamp";
}

fn corrupt(column: &str, value: &str) -> ShoalError {
    ShoalError::DatabaseUnavailable(format!("corrupt {column} value '{value}' in messages row"))
}

/// One row of the sessions table.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub purpose: String,
    pub created_by: String,
    pub created_at_us: i64,
    pub updated_at_us: i64,
    pub is_active: bool,
    pub metadata: Value,
}

impl SessionRecord {
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "purpose": self.purpose,
            "created_by": self.created_by,
            "created_at": micros_to_rfc3339(self.created_at_us),
            "updated_at": micros_to_rfc3339(self.updated_at_us),
            "is_active": self.is_active,
            "metadata": self.metadata,
        })
    }

    pub fn from_row(row: &AnyRow) -> Result<Self, ShoalError> {
        let is_active: i64 = row.try_get("is_active")?;
        let metadata_json: String = row.try_get("metadata")?;
        Ok(Self {
            id: row.try_get("id")?,
            purpose: row.try_get("purpose")?,
            created_by: row.try_get("created_by")?,
            created_at_us: row.try_get("created_at")?,
            updated_at_us: row.try_get("updated_at")?,
            is_active: is_active != 0,
            metadata: serde_json::from_str(&metadata_json).unwrap_or(Value::Null),
        })
    }
}
