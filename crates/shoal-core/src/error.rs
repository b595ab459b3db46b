use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

/// Severity attached to every failure envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// Every failure the engine can surface, each with a stable wire code.
///
/// Tool handlers return `Result<Value, ShoalError>`; the registry turns an
/// `Err` into the uniform failure envelope via [`ShoalError::envelope`].
#[derive(Debug, Error)]
pub enum ShoalError {
    #[error("authentication required")]
    AuthRequired,
    #[error("invalid or unknown token")]
    InvalidToken,
    #[error("token has expired")]
    ExpiredToken,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("{0}")]
    Validation(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session is inactive: {0}")]
    SessionInactive(String),
    #[error("message not found: {0}")]
    MessageNotFound(i64),
    #[error("no memory entry for key '{0}'")]
    MemoryNotFound(String),
    #[error("memory key '{0}' already exists")]
    MemoryConflict(String),
    #[error("rate limited")]
    RateLimited,
    #[error("database unavailable: {0}")]
    DatabaseUnavailable(String),
    #[error("operation timed out after {0}s")]
    Timeout(u64),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("unknown schema version {found} (this build supports up to {supported})")]
    SchemaMismatch { found: i64, supported: i64 },
    #[error("internal error ({correlation_id})")]
    Internal { correlation_id: String },
}

impl ShoalError {
    /// Build an `Internal` error with a fresh correlation id, logging the
    /// underlying cause. The cause never reaches the caller.
    pub fn internal(cause: impl std::fmt::Display) -> Self {
        let correlation_id = Uuid::new_v4().to_string();
        tracing::error!(%correlation_id, "internal error: {cause}");
        Self::Internal { correlation_id }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::ExpiredToken => "EXPIRED_TOKEN",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::SessionInactive(_) => "SESSION_INACTIVE",
            Self::MessageNotFound(_) => "MESSAGE_NOT_FOUND",
            Self::MemoryNotFound(_) => "MEMORY_NOT_FOUND",
            Self::MemoryConflict(_) => "MEMORY_CONFLICT",
            Self::RateLimited => "RATE_LIMITED",
            Self::DatabaseUnavailable(_) => "DATABASE_UNAVAILABLE",
            Self::Timeout(_) => "TIMEOUT",
            Self::Config(_) => "CONFIG_ERROR",
            Self::SchemaMismatch { .. } => "SCHEMA_MISMATCH",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::MemoryNotFound(_) | Self::MessageNotFound(_) => Severity::Info,
            Self::AuthRequired
            | Self::InvalidToken
            | Self::ExpiredToken
            | Self::PermissionDenied(_)
            | Self::Validation(_)
            | Self::SessionNotFound(_)
            | Self::SessionInactive(_)
            | Self::MemoryConflict(_)
            | Self::RateLimited => Severity::Warn,
            Self::DatabaseUnavailable(_) | Self::Timeout(_) => Severity::Error,
            Self::Config(_) | Self::SchemaMismatch { .. } | Self::Internal { .. } => {
                Severity::Critical
            }
        }
    }

    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            Self::DatabaseUnavailable(_) | Self::Timeout(_) | Self::RateLimited
        )
    }

    fn details(&self) -> Option<Value> {
        match self {
            Self::Internal { correlation_id } => {
                Some(json!({ "correlation_id": correlation_id }))
            }
            Self::SchemaMismatch { found, supported } => {
                Some(json!({ "found": found, "supported": supported }))
            }
            _ => None,
        }
    }

    fn suggestions(&self) -> Option<Vec<&'static str>> {
        match self {
            Self::AuthRequired | Self::InvalidToken => {
                Some(vec!["call authenticate_agent to obtain a token"])
            }
            Self::ExpiredToken => Some(vec![
                "call refresh_token before expiry, or authenticate_agent again",
            ]),
            Self::MemoryConflict(_) => Some(vec!["pass overwrite=true to replace the entry"]),
            Self::DatabaseUnavailable(_) | Self::RateLimited => {
                Some(vec!["retry after a short backoff"])
            }
            _ => None,
        }
    }

    /// The uniform failure envelope returned by every tool.
    pub fn envelope(&self) -> Value {
        let mut body = json!({
            "success": false,
            "error": self.to_string(),
            "code": self.code(),
            "severity": self.severity().as_str(),
            "recoverable": self.recoverable(),
        });
        if let Some(details) = self.details() {
            body["details"] = details;
        }
        if let Some(suggestions) = self.suggestions() {
            body["suggestions"] = json!(suggestions);
        }
        body
    }
}

impl From<sqlx::Error> for ShoalError {
    fn from(e: sqlx::Error) -> Self {
        Self::DatabaseUnavailable(e.to_string())
    }
}
