use super::store::Dialect;

/// Highest schema version this build understands. Startup refuses to run
/// against anything newer.
pub const LATEST_VERSION: i64 = 1;

/// Forward-only, numbered migrations. Each entry is applied exactly once,
/// in order, and recorded in `schema_version`.
pub fn migrations(dialect: Dialect) -> Vec<(i64, Vec<String>)> {
    vec![(1, ddl_v1(dialect))]
}

fn ddl_v1(dialect: Dialect) -> Vec<String> {
    // Dialect-specific tokens; everything else is common SQL.
    let (auto_pk, key_ty) = match dialect {
        Dialect::Sqlite => ("INTEGER PRIMARY KEY AUTOINCREMENT", "TEXT"),
        Dialect::Postgres => ("BIGSERIAL PRIMARY KEY", "TEXT"),
        Dialect::MySql => ("BIGINT PRIMARY KEY AUTO_INCREMENT", "VARCHAR(255)"),
    };

    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS sessions (
                id         {key_ty} PRIMARY KEY,
                purpose    TEXT     NOT NULL,
                created_by {key_ty} NOT NULL,
                created_at BIGINT   NOT NULL,
                updated_at BIGINT   NOT NULL,
                is_active  BIGINT   NOT NULL DEFAULT 1,
                metadata   TEXT     NOT NULL
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS messages (
                id                {auto_pk},
                session_id        {key_ty} NOT NULL,
                sender            {key_ty} NOT NULL,
                sender_type       {key_ty} NOT NULL,
                content           TEXT     NOT NULL,
                visibility        {key_ty} NOT NULL,
                message_type      {key_ty} NOT NULL,
                metadata          TEXT     NOT NULL,
                parent_message_id BIGINT,
                timestamp         BIGINT   NOT NULL
            )"
        ),
        "CREATE INDEX idx_messages_session_order ON messages (session_id, timestamp, id)"
            .to_string(),
        "CREATE INDEX idx_messages_sender ON messages (sender)".to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS agent_memory (
                id         {auto_pk},
                agent_id   {key_ty} NOT NULL,
                session_id {key_ty} NOT NULL DEFAULT '',
                mem_key    {key_ty} NOT NULL,
                mem_value  TEXT     NOT NULL,
                created_at BIGINT   NOT NULL,
                updated_at BIGINT   NOT NULL,
                expires_at BIGINT,
                CONSTRAINT uq_agent_memory UNIQUE (agent_id, session_id, mem_key)
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id         {auto_pk},
                timestamp  BIGINT   NOT NULL,
                agent_id   {key_ty} NOT NULL,
                event_type {key_ty} NOT NULL,
                session_id {key_ty},
                result     {key_ty} NOT NULL,
                details    TEXT     NOT NULL
            )"
        ),
        "CREATE INDEX idx_audit_log_time ON audit_log (timestamp)".to_string(),
        "CREATE INDEX idx_audit_log_agent ON audit_log (agent_id)".to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS tokens (
                token_id    {key_ty} PRIMARY KEY,
                agent_id    {key_ty} NOT NULL,
                agent_type  {key_ty} NOT NULL,
                permissions TEXT     NOT NULL,
                jwt         TEXT     NOT NULL,
                issued_at   BIGINT   NOT NULL,
                expires_at  BIGINT   NOT NULL,
                revoked     BIGINT   NOT NULL DEFAULT 0
            )"
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_strictly_increasing() {
        let migrations = migrations(Dialect::Sqlite);
        let mut previous = 0;
        for (version, statements) in &migrations {
            assert!(*version > previous);
            assert!(!statements.is_empty());
            previous = *version;
        }
        assert_eq!(previous, LATEST_VERSION);
    }

    #[test]
    fn dialects_agree_on_table_set() {
        for dialect in [Dialect::Sqlite, Dialect::Postgres, Dialect::MySql] {
            let ddl = ddl_v1(dialect).join("\n");
            for table in ["sessions", "messages", "agent_memory", "audit_log", "tokens"] {
                assert!(ddl.contains(table), "{dialect:?} is missing {table}");
            }
        }
    }
}
