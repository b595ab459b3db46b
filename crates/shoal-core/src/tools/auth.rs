use crate::auth::identity::{AgentIdentity, AgentType, Permission};
use crate::auth::token::TokenService;
use crate::error::ShoalError;
use crate::tools::tool::{require_str, str_array, Tool};
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde_json::{json, Value};
use std::sync::Arc;

fn agent_type_values() -> Vec<&'static str> {
    AgentType::all().iter().map(|t| t.as_str()).collect()
}

// ── authenticate_agent ───────────────────────────────────────────────────────

pub struct AuthenticateTool {
    tokens: Arc<TokenService>,
}

impl AuthenticateTool {
    pub fn new(tokens: Arc<TokenService>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl Tool for AuthenticateTool {
    fn name(&self) -> &str {
        "authenticate_agent"
    }

    fn description(&self) -> &str {
        "Mint an opaque agent token. Requested permissions are intersected \
         with policy for the agent type; unknown permissions are dropped."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent_id": {
                    "type": "string",
                    "minLength": 1,
                    "maxLength": 64,
                    "description": "Stable identity of the calling agent."
                },
                "agent_type": {
                    "type": "string",
                    "enum": agent_type_values(),
                },
                "requested_permissions": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Any of: read, write, debug, admin."
                }
            },
            "required": ["agent_id", "agent_type"]
        })
    }

    fn requires_token(&self) -> bool {
        false
    }

    fn required_permission(&self) -> Option<Permission> {
        None
    }

    async fn call(
        &self,
        _caller: Option<&AgentIdentity>,
        args: Value,
    ) -> Result<Value, ShoalError> {
        let agent_id = require_str(&args, "agent_id")?;
        let agent_type_raw = require_str(&args, "agent_type")?;
        let agent_type = AgentType::parse(agent_type_raw).ok_or_else(|| {
            ShoalError::Validation(format!(
                "agent_type must be one of: {}",
                agent_type_values().join(", ")
            ))
        })?;
        let requested = str_array(&args, "requested_permissions")?;

        let grant = self.tokens.authenticate(agent_id, agent_type, &requested).await?;

        Ok(json!({
            "token": grant.token,
            "token_type": grant.token_type,
            "expires_at": grant.expires_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            "permissions": grant.permissions.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
            "agent_id": agent_id,
            "agent_type": agent_type.as_str(),
        }))
    }
}

// ── refresh_token ────────────────────────────────────────────────────────────

pub struct RefreshTokenTool {
    tokens: Arc<TokenService>,
}

impl RefreshTokenTool {
    pub fn new(tokens: Arc<TokenService>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl Tool for RefreshTokenTool {
    fn name(&self) -> &str {
        "refresh_token"
    }

    fn description(&self) -> &str {
        "Rotate a token before it expires. The old token is revoked; the \
         new one carries the same identity and a full lifetime."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "token": { "type": "string", "description": "The current sct_ token." }
            },
            "required": ["token"]
        })
    }

    // The credential is the argument itself.
    fn requires_token(&self) -> bool {
        false
    }

    fn required_permission(&self) -> Option<Permission> {
        None
    }

    async fn call(
        &self,
        _caller: Option<&AgentIdentity>,
        args: Value,
    ) -> Result<Value, ShoalError> {
        let token = require_str(&args, "token")?;
        let grant = self.tokens.refresh(token).await?;
        Ok(json!({
            "token": grant.token,
            "token_type": grant.token_type,
            "expires_at": grant.expires_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        }))
    }
}

// ── revoke_token ─────────────────────────────────────────────────────────────

pub struct RevokeTokenTool {
    tokens: Arc<TokenService>,
}

impl RevokeTokenTool {
    pub fn new(tokens: Arc<TokenService>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl Tool for RevokeTokenTool {
    fn name(&self) -> &str {
        "revoke_token"
    }

    fn description(&self) -> &str {
        "Revoke a token immediately. Fails if the token is already unknown, \
         expired, or revoked."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "token": { "type": "string", "description": "The sct_ token to revoke." }
            },
            "required": ["token"]
        })
    }

    fn requires_token(&self) -> bool {
        false
    }

    fn required_permission(&self) -> Option<Permission> {
        None
    }

    async fn call(
        &self,
        _caller: Option<&AgentIdentity>,
        args: Value,
    ) -> Result<Value, ShoalError> {
        let token = require_str(&args, "token")?;
        self.tokens.revoke(token).await?;
        Ok(json!({ "revoked": true }))
    }
}
