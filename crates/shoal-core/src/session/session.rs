use crate::auth::identity::AgentIdentity;
use crate::bridge::bridge::BroadcastBridge;
use crate::error::ShoalError;
use crate::notify::hub::{NotificationHub, SessionEvent};
use crate::session::message::{
    MessageRecord, MessageType, SessionRecord, Visibility, MAX_CONTENT_LEN, MAX_METADATA_BYTES,
    MAX_PURPOSE_LEN,
};
use crate::session::visibility::visible_sql;
use crate::storage::store::Store;
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::Row;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub const DEFAULT_PAGE_LIMIT: i64 = 50;
pub const MAX_PAGE_LIMIT: i64 = 500;
const SESSION_TAIL_LEN: i64 = 10;

/// Process-wide microsecond stamps, strictly increasing even if the wall
/// clock steps backwards. Message order within a session is `(timestamp,
/// id)`; this keeps the first component non-decreasing on its own.
struct StampGen {
    last: AtomicI64,
}

impl StampGen {
    fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }

    fn next(&self) -> i64 {
        loop {
            let now = Utc::now().timestamp_micros();
            let last = self.last.load(Ordering::SeqCst);
            let candidate = now.max(last + 1);
            if self
                .last
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return candidate;
            }
        }
    }
}

/// `get_session` result: the session row plus a visible tail.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub session: SessionRecord,
    pub recent: Vec<MessageRecord>,
    pub visible_count: i64,
}

impl SessionView {
    pub fn to_json(&self) -> Value {
        json!({
            "session": self.session.to_json(),
            "recent_messages": self.recent.iter().map(|m| m.to_json()).collect::<Vec<_>>(),
            "visible_message_count": self.visible_count,
        })
    }
}

/// Session lifecycle and the ordered message log.
///
/// Every read filters by the caller's identity; every successful append
/// bumps the session's `updated_at` and publishes a change event after the
/// transaction commits.
pub struct SessionCore {
    store: Arc<Store>,
    hub: Arc<NotificationHub>,
    bridge: Option<Arc<BroadcastBridge>>,
    stamp: StampGen,
}

impl SessionCore {
    pub fn new(
        store: Arc<Store>,
        hub: Arc<NotificationHub>,
        bridge: Option<Arc<BroadcastBridge>>,
    ) -> Self {
        Self {
            store,
            hub,
            bridge,
            stamp: StampGen::new(),
        }
    }

    pub async fn create_session(
        &self,
        caller: &AgentIdentity,
        purpose: &str,
        metadata: Option<Value>,
    ) -> Result<SessionRecord, ShoalError> {
        let purpose = purpose.trim();
        if purpose.is_empty() {
            return Err(ShoalError::Validation("purpose must not be empty".into()));
        }
        if purpose.chars().count() > MAX_PURPOSE_LEN {
            return Err(ShoalError::Validation(format!(
                "purpose must be at most {MAX_PURPOSE_LEN} characters"
            )));
        }
        let metadata = validate_metadata(metadata, None)?;

        let id = new_session_id();
        let now = self.stamp.next();
        let metadata_json = encode_json(&metadata)?;

        sqlx::query(&self.store.sql(
            "INSERT INTO sessions (id, purpose, created_by, created_at, updated_at, is_active, metadata) \
             VALUES (?, ?, ?, ?, ?, 1, ?)",
        ))
        .bind(&id)
        .bind(purpose)
        .bind(&caller.agent_id)
        .bind(now)
        .bind(now)
        .bind(&metadata_json)
        .execute(self.store.pool())
        .await?;

        tracing::info!(session_id = %id, created_by = %caller.agent_id, "session created");

        Ok(SessionRecord {
            id,
            purpose: purpose.to_string(),
            created_by: caller.agent_id.clone(),
            created_at_us: now,
            updated_at_us: now,
            is_active: true,
            metadata,
        })
    }

    pub async fn get_session(
        &self,
        caller: &AgentIdentity,
        session_id: &str,
    ) -> Result<SessionView, ShoalError> {
        let session = self.fetch_session(session_id).await?;

        let (clause, binds) = visible_sql(caller);
        let count_sql = self.store.sql(&format!(
            "SELECT COUNT(*) AS n FROM messages WHERE session_id = ? AND {clause}"
        ));
        let mut count_query = sqlx::query(&count_sql).bind(session_id);
        for bind in &binds {
            count_query = count_query.bind(bind);
        }
        let visible_count: i64 = count_query
            .fetch_one(self.store.pool())
            .await?
            .try_get("n")?;

        let tail_sql = self.store.sql(&format!(
            "SELECT {} FROM messages WHERE session_id = ? AND {clause} \
             ORDER BY timestamp DESC, id DESC LIMIT ?",
            MessageRecord::COLUMNS
        ));
        let mut tail_query = sqlx::query(&tail_sql).bind(session_id);
        for bind in &binds {
            tail_query = tail_query.bind(bind);
        }
        let rows = tail_query
            .bind(SESSION_TAIL_LEN)
            .fetch_all(self.store.pool())
            .await?;

        let mut recent: Vec<MessageRecord> = rows
            .iter()
            .map(MessageRecord::from_row)
            .collect::<Result<_, _>>()?;
        recent.reverse();

        Ok(SessionView {
            session,
            recent,
            visible_count,
        })
    }

    /// Append a message. The sender is always the authenticated caller;
    /// clients cannot override it.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_message(
        &self,
        caller: &AgentIdentity,
        session_id: &str,
        content: &str,
        visibility: Visibility,
        message_type: MessageType,
        metadata: Option<Value>,
        parent_message_id: Option<i64>,
    ) -> Result<MessageRecord, ShoalError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ShoalError::Validation(
                "content must not be empty after trimming".into(),
            ));
        }
        if content.chars().count() > MAX_CONTENT_LEN {
            return Err(ShoalError::Validation(format!(
                "content must be at most {MAX_CONTENT_LEN} characters"
            )));
        }
        let metadata = validate_metadata(metadata, Some(MAX_METADATA_BYTES))?;

        let session = self.fetch_session(session_id).await?;
        if !session.is_active {
            return Err(ShoalError::SessionInactive(session_id.to_string()));
        }

        if let Some(parent_id) = parent_message_id {
            let parent = sqlx::query(
                &self
                    .store
                    .sql("SELECT id FROM messages WHERE id = ? AND session_id = ?"),
            )
            .bind(parent_id)
            .bind(session_id)
            .fetch_optional(self.store.pool())
            .await?;
            if parent.is_none() {
                return Err(ShoalError::Validation(format!(
                    "parent_message_id {parent_id} does not exist in this session"
                )));
            }
        }

        let timestamp_us = self.stamp.next();
        let metadata_json = encode_json(&metadata)?;

        let mut tx = self.store.pool().begin().await?;

        let insert = "INSERT INTO messages \
             (session_id, sender, sender_type, content, visibility, message_type, metadata, parent_message_id, timestamp) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)";
        let id: i64 = if self.store.dialect().supports_returning() {
            let sql = self.store.sql(&format!("{insert} RETURNING id"));
            sqlx::query(&sql)
                .bind(session_id)
                .bind(&caller.agent_id)
                .bind(caller.agent_type.as_str())
                .bind(content)
                .bind(visibility.as_str())
                .bind(message_type.as_str())
                .bind(&metadata_json)
                .bind(parent_message_id)
                .bind(timestamp_us)
                .fetch_one(&mut *tx)
                .await?
                .try_get("id")?
        } else {
            sqlx::query(&self.store.sql(insert))
                .bind(session_id)
                .bind(&caller.agent_id)
                .bind(caller.agent_type.as_str())
                .bind(content)
                .bind(visibility.as_str())
                .bind(message_type.as_str())
                .bind(&metadata_json)
                .bind(parent_message_id)
                .bind(timestamp_us)
                .execute(&mut *tx)
                .await?;
            self.store.last_insert_id(&mut tx).await?
        };

        sqlx::query(&self.store.sql("UPDATE sessions SET updated_at = ? WHERE id = ?"))
            .bind(timestamp_us)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        // Notify only after the transaction is durable; the publish path
        // never blocks and the bridge is fire-and-forget.
        let event = SessionEvent::new_message(session_id, id, timestamp_us);
        self.hub.publish(session_id, event.clone());
        if let Some(bridge) = &self.bridge {
            bridge.forward(event);
        }

        Ok(MessageRecord {
            id,
            session_id: session_id.to_string(),
            sender: caller.agent_id.clone(),
            sender_type: caller.agent_type,
            content: content.to_string(),
            visibility,
            message_type,
            metadata,
            parent_message_id,
            timestamp_us,
        })
    }

    /// Ordered page of caller-visible messages.
    pub async fn get_messages(
        &self,
        caller: &AgentIdentity,
        session_id: &str,
        limit: i64,
        offset: i64,
        visibility_filter: Option<Visibility>,
    ) -> Result<Vec<MessageRecord>, ShoalError> {
        if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
            return Err(ShoalError::Validation(format!(
                "limit must be between 1 and {MAX_PAGE_LIMIT}"
            )));
        }
        if offset < 0 {
            return Err(ShoalError::Validation("offset must not be negative".into()));
        }
        self.fetch_session(session_id).await?;

        let (clause, binds) = visible_sql(caller);
        let filter_clause = match visibility_filter {
            Some(_) => " AND visibility = ?",
            None => "",
        };
        let sql = self.store.sql(&format!(
            "SELECT {} FROM messages WHERE session_id = ? AND {clause}{filter_clause} \
             ORDER BY timestamp ASC, id ASC LIMIT ? OFFSET ?",
            MessageRecord::COLUMNS
        ));

        let mut query = sqlx::query(&sql).bind(session_id);
        for bind in &binds {
            query = query.bind(bind);
        }
        if let Some(filter) = visibility_filter {
            query = query.bind(filter.as_str());
        }
        let rows = query
            .bind(limit)
            .bind(offset)
            .fetch_all(self.store.pool())
            .await?;

        rows.iter().map(MessageRecord::from_row).collect()
    }

    /// Messages strictly after `cursor` (a message id), in order. Ids are
    /// assigned in commit order, so the cursor is total and monotonic.
    pub async fn get_messages_since(
        &self,
        caller: &AgentIdentity,
        session_id: &str,
        cursor: i64,
    ) -> Result<Vec<MessageRecord>, ShoalError> {
        self.fetch_session(session_id).await?;

        let (clause, binds) = visible_sql(caller);
        let sql = self.store.sql(&format!(
            "SELECT {} FROM messages WHERE session_id = ? AND id > ? AND {clause} \
             ORDER BY timestamp ASC, id ASC LIMIT ?",
            MessageRecord::COLUMNS
        ));

        let mut query = sqlx::query(&sql).bind(session_id).bind(cursor);
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query
            .bind(MAX_PAGE_LIMIT)
            .fetch_all(self.store.pool())
            .await?;

        rows.iter().map(MessageRecord::from_row).collect()
    }

    async fn fetch_session(&self, session_id: &str) -> Result<SessionRecord, ShoalError> {
        let row = sqlx::query(&self.store.sql(
            "SELECT id, purpose, created_by, created_at, updated_at, is_active, metadata \
             FROM sessions WHERE id = ?",
        ))
        .bind(session_id)
        .fetch_optional(self.store.pool())
        .await?
        .ok_or_else(|| ShoalError::SessionNotFound(session_id.to_string()))?;

        SessionRecord::from_row(&row)
    }
}

fn new_session_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("session_{}", &hex[..16])
}

/// Metadata must be a JSON object when present; `None` becomes `{}`.
fn validate_metadata(
    metadata: Option<Value>,
    max_bytes: Option<usize>,
) -> Result<Value, ShoalError> {
    let metadata = metadata.unwrap_or_else(|| json!({}));
    if !metadata.is_object() {
        return Err(ShoalError::Validation("metadata must be a JSON object".into()));
    }
    if let Some(max) = max_bytes {
        let serialized = encode_json(&metadata)?;
        if serialized.len() > max {
            return Err(ShoalError::Validation(format!(
                "metadata must serialize to at most {max} bytes"
            )));
        }
    }
    Ok(metadata)
}

fn encode_json(value: &Value) -> Result<String, ShoalError> {
    serde_json::to_string(value).map_err(|e| ShoalError::internal(format!("json encode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::identity::{AgentType, Permission};
    use std::path::PathBuf;

    async fn open_core() -> (SessionCore, Arc<NotificationHub>, PathBuf) {
        let path = std::env::temp_dir().join(format!("shoal_test_{}.db", Uuid::new_v4()));
        let url = format!("sqlite://{}", path.display());
        let store = Arc::new(Store::connect(&url, 5).await.expect("open store"));
        let hub = Arc::new(NotificationHub::new());
        let core = SessionCore::new(store, hub.clone(), None);
        (core, hub, path)
    }

    fn agent(agent_id: &str, agent_type: AgentType) -> AgentIdentity {
        AgentIdentity {
            agent_id: agent_id.into(),
            agent_type,
            permissions: vec![Permission::Read, Permission::Write],
            token_id: "sct_test".into(),
            authenticated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn session_ids_have_the_expected_shape() {
        let (core, _hub, path) = open_core().await;
        let a1 = agent("a1", AgentType::Claude);
        let session = core.create_session(&a1, "planning", None).await.unwrap();
        assert!(session.id.starts_with("session_"));
        assert_eq!(session.id.len(), "session_".len() + 16);
        assert_eq!(session.created_by, "a1");
        assert!(session.is_active);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn empty_or_oversized_purpose_is_rejected() {
        let (core, _hub, path) = open_core().await;
        let a1 = agent("a1", AgentType::Claude);
        assert!(core.create_session(&a1, "   ", None).await.is_err());
        assert!(core
            .create_session(&a1, &"p".repeat(501), None)
            .await
            .is_err());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn add_message_bumps_updated_at() {
        let (core, _hub, path) = open_core().await;
        let a1 = agent("a1", AgentType::Claude);
        let session = core.create_session(&a1, "s", None).await.unwrap();

        let msg = core
            .add_message(
                &a1,
                &session.id,
                "hello world",
                Visibility::Public,
                MessageType::AgentResponse,
                None,
                None,
            )
            .await
            .unwrap();

        let view = core.get_session(&a1, &session.id).await.unwrap();
        assert_eq!(view.session.updated_at_us, msg.timestamp_us);
        assert!(view.session.updated_at_us > view.session.created_at_us);
        assert_eq!(view.visible_count, 1);
        assert_eq!(view.recent.len(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn content_is_trimmed_and_validated() {
        let (core, _hub, path) = open_core().await;
        let a1 = agent("a1", AgentType::Claude);
        let session = core.create_session(&a1, "s", None).await.unwrap();

        let msg = core
            .add_message(
                &a1,
                &session.id,
                "  padded  ",
                Visibility::Public,
                MessageType::AgentResponse,
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(msg.content, "padded");

        let err = core
            .add_message(
                &a1,
                &session.id,
                "   ",
                Visibility::Public,
                MessageType::AgentResponse,
                None,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn missing_session_and_unknown_parent_are_rejected() {
        let (core, _hub, path) = open_core().await;
        let a1 = agent("a1", AgentType::Claude);

        let err = core
            .add_message(
                &a1,
                "session_0000000000000000",
                "hi",
                Visibility::Public,
                MessageType::AgentResponse,
                None,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SESSION_NOT_FOUND");

        let session = core.create_session(&a1, "s", None).await.unwrap();
        let err = core
            .add_message(
                &a1,
                &session.id,
                "hi",
                Visibility::Public,
                MessageType::AgentResponse,
                None,
                Some(999),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn inactive_session_rejects_appends() {
        let (core, _hub, path) = open_core().await;
        let a1 = agent("a1", AgentType::Claude);
        let session = core.create_session(&a1, "s", None).await.unwrap();

        sqlx::query("UPDATE sessions SET is_active = 0 WHERE id = ?")
            .bind(&session.id)
            .execute(core.store.pool())
            .await
            .unwrap();

        let err = core
            .add_message(
                &a1,
                &session.id,
                "hi",
                Visibility::Public,
                MessageType::AgentResponse,
                None,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SESSION_INACTIVE");
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn messages_come_back_in_timestamp_id_order() {
        let (core, _hub, path) = open_core().await;
        let a1 = agent("a1", AgentType::Claude);
        let session = core.create_session(&a1, "s", None).await.unwrap();

        for i in 0..5 {
            core.add_message(
                &a1,
                &session.id,
                &format!("msg {i}"),
                Visibility::Public,
                MessageType::AgentResponse,
                None,
                None,
            )
            .await
            .unwrap();
        }

        let messages = core
            .get_messages(&a1, &session.id, 50, 0, None)
            .await
            .unwrap();
        assert_eq!(messages.len(), 5);
        for pair in messages.windows(2) {
            assert!(pair[0].timestamp_us < pair[1].timestamp_us);
            assert!(pair[0].id < pair[1].id);
        }

        // Pagination returns a consistent prefix.
        let first_two = core
            .get_messages(&a1, &session.id, 2, 0, None)
            .await
            .unwrap();
        assert_eq!(first_two[0].id, messages[0].id);
        assert_eq!(first_two[1].id, messages[1].id);
        let next_two = core
            .get_messages(&a1, &session.id, 2, 2, None)
            .await
            .unwrap();
        assert_eq!(next_two[0].id, messages[2].id);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn visibility_rules_apply_to_reads() {
        let (core, _hub, path) = open_core().await;
        let a1 = agent("a1", AgentType::Claude);
        let a2 = agent("a2", AgentType::Gemini);
        let a3 = agent("a3", AgentType::Claude);
        let session = core.create_session(&a1, "s", None).await.unwrap();

        for (content, visibility) in [
            ("open", Visibility::Public),
            ("secret", Visibility::Private),
            ("claude-only", Visibility::AgentOnly),
        ] {
            core.add_message(
                &a1,
                &session.id,
                content,
                visibility,
                MessageType::AgentResponse,
                None,
                None,
            )
            .await
            .unwrap();
        }

        let owner_sees = core
            .get_messages(&a1, &session.id, 50, 0, None)
            .await
            .unwrap();
        assert_eq!(owner_sees.len(), 3);

        let gemini_sees = core
            .get_messages(&a2, &session.id, 50, 0, None)
            .await
            .unwrap();
        assert_eq!(gemini_sees.len(), 1);
        assert_eq!(gemini_sees[0].content, "open");

        let claude_sees = core
            .get_messages(&a3, &session.id, 50, 0, None)
            .await
            .unwrap();
        assert_eq!(claude_sees.len(), 2);
        assert!(claude_sees.iter().any(|m| m.content == "claude-only"));
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn visibility_filter_intersects_with_entitlement() {
        let (core, _hub, path) = open_core().await;
        let a1 = agent("a1", AgentType::Claude);
        let a2 = agent("a2", AgentType::Gemini);
        let session = core.create_session(&a1, "s", None).await.unwrap();

        core.add_message(
            &a1,
            &session.id,
            "mine",
            Visibility::Private,
            MessageType::AgentResponse,
            None,
            None,
        )
        .await
        .unwrap();
        core.add_message(
            &a1,
            &session.id,
            "open",
            Visibility::Public,
            MessageType::AgentResponse,
            None,
            None,
        )
        .await
        .unwrap();

        // The owner can narrow to private; another agent gets nothing.
        let own_private = core
            .get_messages(&a1, &session.id, 50, 0, Some(Visibility::Private))
            .await
            .unwrap();
        assert_eq!(own_private.len(), 1);

        let others_private = core
            .get_messages(&a2, &session.id, 50, 0, Some(Visibility::Private))
            .await
            .unwrap();
        assert!(others_private.is_empty());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn since_cursor_returns_strictly_newer_messages() {
        let (core, _hub, path) = open_core().await;
        let a1 = agent("a1", AgentType::Claude);
        let session = core.create_session(&a1, "s", None).await.unwrap();

        let first = core
            .add_message(
                &a1,
                &session.id,
                "one",
                Visibility::Public,
                MessageType::AgentResponse,
                None,
                None,
            )
            .await
            .unwrap();
        let second = core
            .add_message(
                &a1,
                &session.id,
                "two",
                Visibility::Public,
                MessageType::AgentResponse,
                None,
                None,
            )
            .await
            .unwrap();

        let newer = core
            .get_messages_since(&a1, &session.id, first.id)
            .await
            .unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].id, second.id);

        let none = core
            .get_messages_since(&a1, &session.id, second.id)
            .await
            .unwrap();
        assert!(none.is_empty());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn change_event_is_published_after_commit() {
        let (core, hub, path) = open_core().await;
        let a1 = agent("a1", AgentType::Claude);
        let session = core.create_session(&a1, "s", None).await.unwrap();

        let mut subscription = hub.subscribe(&session.id);
        let msg = core
            .add_message(
                &a1,
                &session.id,
                "ping",
                Visibility::Public,
                MessageType::AgentResponse,
                None,
                None,
            )
            .await
            .unwrap();

        let event = subscription.recv().await.expect("event");
        assert_eq!(event.session_id, session.id);
        assert_eq!(event.hint.message_id, Some(msg.id));

        // The message the event points at is already readable.
        let messages = core
            .get_messages_since(&a1, &session.id, msg.id - 1)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn metadata_must_be_an_object() {
        let (core, _hub, path) = open_core().await;
        let a1 = agent("a1", AgentType::Claude);
        let session = core.create_session(&a1, "s", None).await.unwrap();

        let err = core
            .add_message(
                &a1,
                &session.id,
                "hi",
                Visibility::Public,
                MessageType::AgentResponse,
                Some(json!([1, 2])),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let err = core
            .create_session(&a1, "s2", Some(json!("nope")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn stamps_are_strictly_increasing() {
        let stamps = StampGen::new();
        let mut last = 0;
        for _ in 0..1000 {
            let next = stamps.next();
            assert!(next > last);
            last = next;
        }
    }
}
