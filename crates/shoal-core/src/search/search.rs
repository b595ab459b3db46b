use crate::auth::identity::AgentIdentity;
use crate::error::ShoalError;
use crate::search::score::fuzzy_score;
use crate::session::message::{MessageRecord, Visibility};
use crate::session::visibility::visible_sql;
use crate::storage::store::Store;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::sync::Arc;

pub const MAX_QUERY_LEN: usize = 1000;
pub const DEFAULT_SEARCH_LIMIT: i64 = 10;
pub const MAX_SEARCH_LIMIT: i64 = 50;
pub const DEFAULT_SENDER_LIMIT: i64 = 50;
pub const DEFAULT_TIMERANGE_LIMIT: i64 = 100;
const MAX_LIST_LIMIT: i64 = 500;

/// How many caller-visible messages a single query will scan, newest
/// first. Sized so a ~10k-message session is searched in full.
pub const SCAN_CAP: i64 = 10_000;

/// Narrowing requested by the caller, intersected with what they may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    All,
    Public,
    Private,
    AgentOnly,
}

impl SearchScope {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(Self::All),
            "public" => Some(Self::Public),
            "private" => Some(Self::Private),
            "agent_only" => Some(Self::AgentOnly),
            _ => None,
        }
    }

    fn admits(&self, message: &MessageRecord) -> bool {
        match self {
            Self::All => true,
            Self::Public => message.visibility == Visibility::Public,
            Self::Private => message.visibility == Visibility::Private,
            Self::AgentOnly => message.visibility == Visibility::AgentOnly,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub message: MessageRecord,
    pub score: f64,
    pub matched_fields: Vec<&'static str>,
}

impl SearchHit {
    pub fn to_json(&self) -> Value {
        json!({
            "message": self.message.to_json(),
            "score": self.score,
            "matched_fields": self.matched_fields,
        })
    }
}

/// Per-session search over the caller-visible slice of the message log.
pub struct SearchEngine {
    store: Arc<Store>,
}

impl SearchEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Fuzzy content search, ranked `(score desc, timestamp desc, id desc)`.
    #[allow(clippy::too_many_arguments)]
    pub async fn search_context(
        &self,
        caller: &AgentIdentity,
        session_id: &str,
        query: &str,
        fuzzy_threshold: f64,
        limit: i64,
        search_metadata: bool,
        scope: SearchScope,
    ) -> Result<Vec<SearchHit>, ShoalError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ShoalError::Validation("query must not be empty".into()));
        }
        if query.chars().count() > MAX_QUERY_LEN {
            return Err(ShoalError::Validation(format!(
                "query must be at most {MAX_QUERY_LEN} characters"
            )));
        }
        if !(0.0..=100.0).contains(&fuzzy_threshold) {
            return Err(ShoalError::Validation(
                "fuzzy_threshold must be between 0 and 100".into(),
            ));
        }
        if !(1..=MAX_SEARCH_LIMIT).contains(&limit) {
            return Err(ShoalError::Validation(format!(
                "limit must be between 1 and {MAX_SEARCH_LIMIT}"
            )));
        }

        let candidates = self.visible_slice(caller, session_id).await?;

        let mut hits: Vec<SearchHit> = Vec::new();
        for message in candidates {
            if !scope.admits(&message) {
                continue;
            }
            let content_score = fuzzy_score(query, &message.content);
            let metadata_score = if search_metadata && !message.metadata.is_null() {
                fuzzy_score(query, &message.metadata.to_string())
            } else {
                0.0
            };

            let mut matched_fields = Vec::new();
            if content_score >= fuzzy_threshold {
                matched_fields.push("content");
            }
            if search_metadata && metadata_score >= fuzzy_threshold {
                matched_fields.push("metadata");
            }
            if matched_fields.is_empty() {
                continue;
            }

            hits.push(SearchHit {
                message,
                score: content_score.max(metadata_score),
                matched_fields,
            });
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(b.message.timestamp_us.cmp(&a.message.timestamp_us))
                .then(b.message.id.cmp(&a.message.id))
        });
        hits.truncate(limit as usize);
        Ok(hits)
    }

    /// Messages from one sender, matched tolerantly: `"cursor analyst"`,
    /// `"cursor_analyst"`, and `"Cursor-Analyst"` all name the same agent.
    pub async fn search_by_sender(
        &self,
        caller: &AgentIdentity,
        session_id: &str,
        sender: &str,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, ShoalError> {
        let wanted = normalize_sender(sender);
        if wanted.is_empty() {
            return Err(ShoalError::Validation("sender must not be empty".into()));
        }
        if !(1..=MAX_LIST_LIMIT).contains(&limit) {
            return Err(ShoalError::Validation(format!(
                "limit must be between 1 and {MAX_LIST_LIMIT}"
            )));
        }

        let mut candidates = self.visible_slice(caller, session_id).await?;
        candidates.reverse(); // oldest first
        let mut matches: Vec<MessageRecord> = candidates
            .into_iter()
            .filter(|m| normalize_sender(&m.sender) == wanted)
            .collect();
        matches.truncate(limit as usize);
        Ok(matches)
    }

    /// Messages inside `[start, end]` (inclusive, UTC), oldest first.
    pub async fn search_by_timerange(
        &self,
        caller: &AgentIdentity,
        session_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, ShoalError> {
        if end < start {
            return Err(ShoalError::Validation(
                "end_time must not be before start_time".into(),
            ));
        }
        if !(1..=MAX_LIST_LIMIT).contains(&limit) {
            return Err(ShoalError::Validation(format!(
                "limit must be between 1 and {MAX_LIST_LIMIT}"
            )));
        }
        self.ensure_session(session_id).await?;

        let (clause, binds) = visible_sql(caller);
        let sql = self.store.sql(&format!(
            "SELECT {} FROM messages \
             WHERE session_id = ? AND timestamp >= ? AND timestamp <= ? AND {clause} \
             ORDER BY timestamp ASC, id ASC LIMIT ?",
            MessageRecord::COLUMNS
        ));
        let mut query = sqlx::query(&sql)
            .bind(session_id)
            .bind(start.timestamp_micros())
            .bind(end.timestamp_micros());
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query.bind(limit).fetch_all(self.store.pool()).await?;

        rows.iter().map(MessageRecord::from_row).collect()
    }

    /// Newest-first caller-visible messages, capped at [`SCAN_CAP`].
    async fn visible_slice(
        &self,
        caller: &AgentIdentity,
        session_id: &str,
    ) -> Result<Vec<MessageRecord>, ShoalError> {
        self.ensure_session(session_id).await?;

        let (clause, binds) = visible_sql(caller);
        let sql = self.store.sql(&format!(
            "SELECT {} FROM messages WHERE session_id = ? AND {clause} \
             ORDER BY timestamp DESC, id DESC LIMIT ?",
            MessageRecord::COLUMNS
        ));
        let mut query = sqlx::query(&sql).bind(session_id);
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query.bind(SCAN_CAP).fetch_all(self.store.pool()).await?;

        rows.iter().map(MessageRecord::from_row).collect()
    }

    async fn ensure_session(&self, session_id: &str) -> Result<(), ShoalError> {
        sqlx::query(&self.store.sql("SELECT id FROM sessions WHERE id = ?"))
            .bind(session_id)
            .fetch_optional(self.store.pool())
            .await?
            .ok_or_else(|| ShoalError::SessionNotFound(session_id.to_string()))?;
        Ok(())
    }
}

/// Canonical sender form: lowercase with `-`, `_`, and spaces removed.
fn normalize_sender(sender: &str) -> String {
    sender
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .collect()
}
