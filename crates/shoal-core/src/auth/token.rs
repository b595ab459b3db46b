use crate::auth::identity::{self, AgentIdentity, AgentType, Permission};
use crate::error::ShoalError;
use crate::storage::store::Store;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Upper bound on how long a resolved identity may be served from cache.
const RESOLVE_CACHE_TTL: Duration = Duration::from_secs(30);

const MAX_AGENT_ID_LEN: usize = 64;

/// Claims inside the signed bearer that an opaque `sct_` token protects.
/// The bearer itself never leaves the process.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    agent_type: String,
    perms: Vec<String>,
    jti: String,
    iat: i64,
    exp: i64,
}

/// Result of `authenticate` and `refresh`.
#[derive(Debug, Clone, Serialize)]
pub struct AuthGrant {
    pub token: String,
    pub token_type: &'static str,
    pub expires_at: DateTime<Utc>,
    pub permissions: Vec<Permission>,
}

struct CachedIdentity {
    identity: AgentIdentity,
    valid_until: DateTime<Utc>,
}

/// Mints, resolves, refreshes, and revokes opaque agent tokens.
///
/// Externally a token is `sct_` + a UUID; internally that id maps to a row
/// holding an HS256-signed bearer. The service keeps the current signing
/// secret plus at most one previous secret so a rotation does not cut off
/// live sessions.
pub struct TokenService {
    store: Arc<Store>,
    encoding: EncodingKey,
    decoding: DecodingKey,
    previous_decoding: Option<DecodingKey>,
    ttl: Duration,
    cache: DashMap<String, CachedIdentity>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl TokenService {
    pub fn new(store: Arc<Store>, secret: &str, previous_secret: Option<&str>, ttl: Duration) -> Self {
        Self {
            store,
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            previous_decoding: previous_secret.map(|s| DecodingKey::from_secret(s.as_bytes())),
            ttl,
            cache: DashMap::new(),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    /// Mint a token for `(agent_id, agent_type)` with the requested
    /// permissions intersected against policy.
    pub async fn authenticate(
        &self,
        agent_id: &str,
        agent_type: AgentType,
        requested_permissions: &[String],
    ) -> Result<AuthGrant, ShoalError> {
        let agent_id = agent_id.trim();
        if agent_id.is_empty() {
            return Err(ShoalError::Validation("agent_id must not be empty".into()));
        }
        if agent_id.chars().count() > MAX_AGENT_ID_LEN {
            return Err(ShoalError::Validation(format!(
                "agent_id must be at most {MAX_AGENT_ID_LEN} characters"
            )));
        }

        let permissions = identity::grant(agent_type, requested_permissions);
        self.mint(agent_id, agent_type, permissions).await
    }

    /// Resolve an opaque token to the identity it was minted for.
    pub async fn resolve(&self, token: &str) -> Result<AgentIdentity, ShoalError> {
        let now = Utc::now();
        if let Some(cached) = self.cache.get(token) {
            if cached.valid_until > now {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(cached.identity.clone());
            }
        }
        self.cache.remove(token);
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let row = sqlx::query(
            &self
                .store
                .sql("SELECT jwt, expires_at, revoked FROM tokens WHERE token_id = ?"),
        )
        .bind(token)
        .fetch_optional(self.store.pool())
        .await?
        .ok_or(ShoalError::InvalidToken)?;

        let revoked: i64 = row.try_get("revoked")?;
        if revoked != 0 {
            return Err(ShoalError::InvalidToken);
        }
        let expires_at_us: i64 = row.try_get("expires_at")?;
        if expires_at_us <= now.timestamp_micros() {
            return Err(ShoalError::ExpiredToken);
        }

        let jwt: String = row.try_get("jwt")?;
        let claims = self.verify(&jwt)?;
        let agent_type =
            AgentType::parse(&claims.agent_type).ok_or(ShoalError::InvalidToken)?;
        let permissions = claims
            .perms
            .iter()
            .filter_map(|p| Permission::parse(p))
            .collect();
        let authenticated_at = Utc
            .timestamp_micros(claims.iat)
            .single()
            .unwrap_or_else(Utc::now);

        let resolved = AgentIdentity {
            agent_id: claims.sub,
            agent_type,
            permissions,
            token_id: token.to_string(),
            authenticated_at,
        };

        let remaining = Duration::from_micros(
            (expires_at_us - now.timestamp_micros()).max(0) as u64,
        );
        self.cache.insert(
            token.to_string(),
            CachedIdentity {
                identity: resolved.clone(),
                valid_until: now + RESOLVE_CACHE_TTL.min(remaining),
            },
        );

        Ok(resolved)
    }

    /// Rotate a token: the old one is revoked, the new one carries the same
    /// identity triple and a full lifetime.
    pub async fn refresh(&self, token: &str) -> Result<AuthGrant, ShoalError> {
        let resolved = self.resolve(token).await?;
        self.mark_revoked(token).await?;
        self.cache.remove(token);
        self.mint(
            &resolved.agent_id,
            resolved.agent_type,
            resolved.permissions,
        )
        .await
    }

    /// Revoke a token. Fails with `InvalidToken` when the token is already
    /// unknown, expired, or revoked.
    pub async fn revoke(&self, token: &str) -> Result<(), ShoalError> {
        let now = Utc::now().timestamp_micros();
        let affected = sqlx::query(&self.store.sql(
            "UPDATE tokens SET revoked = 1 WHERE token_id = ? AND revoked = 0 AND expires_at > ?",
        ))
        .bind(token)
        .bind(now)
        .execute(self.store.pool())
        .await?
        .rows_affected();

        self.cache.remove(token);
        if affected == 0 {
            return Err(ShoalError::InvalidToken);
        }
        Ok(())
    }

    /// `(hits, misses)` of the in-process resolve cache.
    pub fn cache_stats(&self) -> (u64, u64) {
        (
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
        )
    }

    async fn mint(
        &self,
        agent_id: &str,
        agent_type: AgentType,
        permissions: Vec<Permission>,
    ) -> Result<AuthGrant, ShoalError> {
        let token_id = format!("sct_{}", Uuid::new_v4());
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(self.ttl)
                .map_err(|e| ShoalError::internal(format!("token ttl out of range: {e}")))?;

        let claims = Claims {
            sub: agent_id.to_string(),
            agent_type: agent_type.as_str().to_string(),
            perms: permissions.iter().map(|p| p.as_str().to_string()).collect(),
            jti: token_id.clone(),
            iat: now.timestamp_micros(),
            exp: expires_at.timestamp(),
        };
        let jwt = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| ShoalError::internal(format!("failed to sign bearer: {e}")))?;

        let permissions_csv = permissions
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(",");

        sqlx::query(&self.store.sql(
            "INSERT INTO tokens (token_id, agent_id, agent_type, permissions, jwt, issued_at, expires_at, revoked) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 0)",
        ))
        .bind(&token_id)
        .bind(agent_id)
        .bind(agent_type.as_str())
        .bind(&permissions_csv)
        .bind(&jwt)
        .bind(now.timestamp_micros())
        .bind(expires_at.timestamp_micros())
        .execute(self.store.pool())
        .await?;

        tracing::debug!(agent_type = agent_type.as_str(), "minted token");

        Ok(AuthGrant {
            token: token_id,
            token_type: "Protected",
            expires_at,
            permissions,
        })
    }

    async fn mark_revoked(&self, token: &str) -> Result<(), ShoalError> {
        sqlx::query(&self.store.sql("UPDATE tokens SET revoked = 1 WHERE token_id = ?"))
            .bind(token)
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    fn verify(&self, jwt: &str) -> Result<Claims, ShoalError> {
        // Expiry is gated by the token row; the signature check here guards
        // against tampering with stored rows.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        match decode::<Claims>(jwt, &self.decoding, &validation) {
            Ok(data) => Ok(data.claims),
            Err(_) => match &self.previous_decoding {
                Some(previous) => decode::<Claims>(jwt, previous, &validation)
                    .map(|data| data.claims)
                    .map_err(|_| ShoalError::InvalidToken),
                None => Err(ShoalError::InvalidToken),
            },
        }
    }
}
