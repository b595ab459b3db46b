use crate::auth::identity::{AgentIdentity, Permission};
use crate::session::message::{MessageRecord, Visibility};

/// The one visibility decision used everywhere a message is returned:
/// paged reads, incremental reads, search, session summaries, and
/// subscription payload construction all go through this function or its
/// SQL rendering below.
pub fn is_visible(caller: &AgentIdentity, message: &MessageRecord) -> bool {
    if message.sender == caller.agent_id {
        return true;
    }
    match message.visibility {
        Visibility::Public => true,
        Visibility::Private => false,
        Visibility::AgentOnly => message.sender_type == caller.agent_type,
        Visibility::AdminOnly => caller.has(Permission::Admin),
    }
}

/// SQL predicate equivalent to [`is_visible`], for the paged read path.
/// Kept next to the function so the two cannot drift; a test exercises
/// them against the full enum cross-product.
pub fn visible_sql(caller: &AgentIdentity) -> (&'static str, Vec<String>) {
    let clause = "(sender = ? \
        OR visibility = 'public' \
        OR (visibility = 'agent_only' AND sender_type = ?) \
        OR (visibility = 'admin_only' AND ? = 'admin'))";
    let binds = vec![
        caller.agent_id.clone(),
        caller.agent_type.as_str().to_string(),
        if caller.has(Permission::Admin) {
            "admin".to_string()
        } else {
            "none".to_string()
        },
    ];
    (clause, binds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::identity::AgentType;
    use crate::session::message::MessageType;
    use chrono::Utc;
    use serde_json::json;

    fn caller(agent_id: &str, agent_type: AgentType, admin: bool) -> AgentIdentity {
        let mut permissions = vec![Permission::Read, Permission::Write];
        if admin {
            permissions.push(Permission::Admin);
        }
        AgentIdentity {
            agent_id: agent_id.into(),
            agent_type,
            permissions,
            token_id: "sct_test".into(),
            authenticated_at: Utc::now(),
        }
    }

    fn message(sender: &str, sender_type: AgentType, visibility: Visibility) -> MessageRecord {
        MessageRecord {
            id: 1,
            session_id: "session_x".into(),
            sender: sender.into(),
            sender_type,
            content: "c".into(),
            visibility,
            message_type: MessageType::AgentResponse,
            metadata: json!({}),
            parent_message_id: None,
            timestamp_us: 0,
        }
    }

    #[test]
    fn sender_always_sees_own_messages() {
        let me = caller("a1", AgentType::Claude, false);
        for visibility in [
            Visibility::Public,
            Visibility::Private,
            Visibility::AgentOnly,
            Visibility::AdminOnly,
        ] {
            assert!(is_visible(&me, &message("a1", AgentType::Claude, visibility)));
        }
    }

    #[test]
    fn public_is_visible_to_anyone() {
        let other = caller("a2", AgentType::Gemini, false);
        assert!(is_visible(
            &other,
            &message("a1", AgentType::Claude, Visibility::Public)
        ));
    }

    #[test]
    fn private_is_owner_only() {
        let other = caller("a2", AgentType::Claude, false);
        assert!(!is_visible(
            &other,
            &message("a1", AgentType::Claude, Visibility::Private)
        ));
        // Not even admins read another agent's private messages.
        let admin = caller("root", AgentType::Admin, true);
        assert!(!is_visible(
            &admin,
            &message("a1", AgentType::Claude, Visibility::Private)
        ));
    }

    #[test]
    fn agent_only_keys_on_sender_type() {
        let same_type = caller("a3", AgentType::Claude, false);
        let other_type = caller("a2", AgentType::Gemini, false);
        let msg = message("a1", AgentType::Claude, Visibility::AgentOnly);
        assert!(is_visible(&same_type, &msg));
        assert!(!is_visible(&other_type, &msg));
    }

    #[test]
    fn admin_only_needs_admin_permission() {
        let admin = caller("root", AgentType::Admin, true);
        let plain = caller("a2", AgentType::Claude, false);
        let msg = message("a1", AgentType::Claude, Visibility::AdminOnly);
        assert!(is_visible(&admin, &msg));
        assert!(!is_visible(&plain, &msg));
    }

    /// The SQL predicate must agree with `is_visible` over every
    /// combination of visibility, sender type, and caller shape.
    #[tokio::test]
    async fn sql_predicate_matches_function() {
        use crate::storage::store::Store;
        use std::sync::Arc;
        use uuid::Uuid;

        let path = std::env::temp_dir().join(format!("shoal_test_{}.db", Uuid::new_v4()));
        let url = format!("sqlite://{}", path.display());
        let store = Arc::new(Store::connect(&url, 5).await.expect("open store"));

        // One message per (sender, sender_type, visibility) combination.
        let senders = ["a1", "a2"];
        let mut expected_rows = Vec::new();
        let mut next_id = 1i64;
        for sender in senders {
            for sender_type in AgentType::all() {
                for visibility in [
                    Visibility::Public,
                    Visibility::Private,
                    Visibility::AgentOnly,
                    Visibility::AdminOnly,
                ] {
                    sqlx::query(&store.sql(
                        "INSERT INTO messages (session_id, sender, sender_type, content, \
                         visibility, message_type, metadata, parent_message_id, timestamp) \
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    ))
                    .bind("session_x")
                    .bind(sender)
                    .bind(sender_type.as_str())
                    .bind("body")
                    .bind(visibility.as_str())
                    .bind(MessageType::AgentResponse.as_str())
                    .bind("{}")
                    .bind(Option::<i64>::None)
                    .bind(next_id)
                    .execute(store.pool())
                    .await
                    .unwrap();
                    expected_rows.push(message(sender, *sender_type, visibility));
                    next_id += 1;
                }
            }
        }

        let callers = [
            caller("a1", AgentType::Claude, false),
            caller("a2", AgentType::Gemini, false),
            caller("root", AgentType::Admin, true),
            caller("a9", AgentType::Test, false),
        ];

        for who in &callers {
            let (clause, binds) = visible_sql(who);
            let sql = store.sql(&format!(
                "SELECT COUNT(*) AS n FROM messages WHERE session_id = ? AND {clause}"
            ));
            let mut query = sqlx::query(&sql).bind("session_x");
            for bind in binds {
                query = query.bind(bind);
            }
            let row = query.fetch_one(store.pool()).await.unwrap();
            let via_sql: i64 = sqlx::Row::try_get(&row, "n").unwrap();

            let via_fn = expected_rows
                .iter()
                .filter(|m| is_visible(who, m))
                .count() as i64;
            assert_eq!(via_sql, via_fn, "disagreement for caller {}", who.agent_id);
        }

        drop(store);
        let _ = std::fs::remove_file(path);
    }
}
