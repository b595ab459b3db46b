use crate::error::ShoalError;
use crate::storage::schema;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use sqlx::{Executor, Row};
use std::time::Duration;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

const SQLITE_PRAGMAS: &str = "\
    PRAGMA journal_mode = WAL; \
    PRAGMA synchronous = NORMAL; \
    PRAGMA busy_timeout = 5000; \
    PRAGMA temp_store = MEMORY; \
    PRAGMA cache_size = -8192;";

/// The relational backend selected by `DATABASE_URL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
    MySql,
}

impl Dialect {
    pub fn from_url(url: &str) -> Result<Self, ShoalError> {
        let scheme = url.split("://").next().unwrap_or("");
        match scheme {
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySql),
            other => Err(ShoalError::Config(format!(
                "unsupported database scheme '{other}' (expected sqlite, postgres, or mysql)"
            ))),
        }
    }

    /// Rewrite `?` placeholders into the dialect's native form. Queries are
    /// written once with `?` and translated here, so callers never see
    /// dialect differences.
    pub fn sql(&self, query: &str) -> String {
        match self {
            Self::Postgres => {
                let mut out = String::with_capacity(query.len() + 8);
                let mut n = 0;
                let mut in_quote = false;
                for c in query.chars() {
                    match c {
                        '\'' => {
                            in_quote = !in_quote;
                            out.push(c);
                        }
                        '?' if !in_quote => {
                            n += 1;
                            out.push('$');
                            out.push_str(&n.to_string());
                        }
                        _ => out.push(c),
                    }
                }
                out
            }
            _ => query.to_string(),
        }
    }

    pub fn supports_returning(&self) -> bool {
        !matches!(self, Self::MySql)
    }
}

/// Pool-level counters surfaced by the telemetry tools.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub size: u32,
    pub idle: usize,
}

/// Pooled connection handle over the URL-selected backend.
///
/// Higher layers write plain SQL with `?` placeholders and i64/TEXT values;
/// every dialect difference (placeholders, id generation, boolean and JSON
/// encoding) is absorbed here and in [`schema`].
#[derive(Debug)]
pub struct Store {
    pool: AnyPool,
    dialect: Dialect,
}

impl Store {
    pub async fn connect(database_url: &str, pool_size: u32) -> Result<Self, ShoalError> {
        sqlx::any::install_default_drivers();
        let dialect = Dialect::from_url(database_url)?;

        let mut url = database_url.to_string();
        if dialect == Dialect::Sqlite && !url.contains('?') && !url.contains(":memory:") {
            // Create the database file on first open.
            url.push_str("?mode=rwc");
        }

        let mut options = AnyPoolOptions::new()
            .max_connections(pool_size.max(1))
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .test_before_acquire(true);

        if dialect == Dialect::Sqlite {
            options = options.after_connect(|conn, _meta| {
                Box::pin(async move {
                    conn.execute(sqlx::raw_sql(SQLITE_PRAGMAS)).await?;
                    Ok(())
                })
            });
        }

        let pool = options
            .connect(&url)
            .await
            .map_err(|e| ShoalError::DatabaseUnavailable(e.to_string()))?;

        let store = Self { pool, dialect };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Shorthand for `self.dialect().sql(query)`.
    pub fn sql(&self, query: &str) -> String {
        self.dialect.sql(query)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
        }
    }

    /// Row id of the most recent insert on this transaction's connection.
    /// Only needed where `INSERT ... RETURNING` is unavailable.
    pub async fn last_insert_id(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Any>,
    ) -> Result<i64, ShoalError> {
        let query = match self.dialect {
            Dialect::Sqlite => "SELECT last_insert_rowid() AS id",
            Dialect::MySql => "SELECT LAST_INSERT_ID() AS id",
            Dialect::Postgres => "SELECT lastval() AS id",
        };
        let row = sqlx::query(query).fetch_one(&mut **tx).await?;
        Ok(row.try_get("id")?)
    }

    async fn migrate(&self) -> Result<(), ShoalError> {
        self.pool
            .execute("CREATE TABLE IF NOT EXISTS schema_version (version BIGINT NOT NULL)")
            .await?;

        let row = sqlx::query("SELECT MAX(version) AS v FROM schema_version")
            .fetch_one(&self.pool)
            .await?;
        let current: i64 = row.try_get::<Option<i64>, _>("v")?.unwrap_or(0);

        if current > schema::LATEST_VERSION {
            return Err(ShoalError::SchemaMismatch {
                found: current,
                supported: schema::LATEST_VERSION,
            });
        }

        for (version, statements) in schema::migrations(self.dialect) {
            if version <= current {
                continue;
            }
            for statement in &statements {
                self.pool.execute(statement.as_str()).await?;
            }
            sqlx::query(&self.sql("INSERT INTO schema_version (version) VALUES (?)"))
                .bind(version)
                .execute(&self.pool)
                .await?;
            tracing::info!(version, "applied schema migration");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("shoal.db").display());
        let store = Store::connect(&url, 5).await.expect("open store");
        (store, dir)
    }

    #[test]
    fn dialect_from_url() {
        assert_eq!(Dialect::from_url("sqlite://x.db").unwrap(), Dialect::Sqlite);
        assert_eq!(
            Dialect::from_url("postgres://u@h/db").unwrap(),
            Dialect::Postgres
        );
        assert_eq!(Dialect::from_url("mysql://u@h/db").unwrap(), Dialect::MySql);
        assert!(Dialect::from_url("redis://h").is_err());
    }

    #[test]
    fn postgres_placeholders_are_numbered() {
        let sql = Dialect::Postgres.sql("SELECT * FROM t WHERE a = ? AND b = ?");
        assert_eq!(sql, "SELECT * FROM t WHERE a = $1 AND b = $2");
    }

    #[test]
    fn placeholders_inside_quotes_are_preserved() {
        let sql = Dialect::Postgres.sql("SELECT '?' AS q FROM t WHERE a = ?");
        assert_eq!(sql, "SELECT '?' AS q FROM t WHERE a = $1");
    }

    #[test]
    fn sqlite_and_mysql_keep_question_marks() {
        let query = "SELECT * FROM t WHERE a = ?";
        assert_eq!(Dialect::Sqlite.sql(query), query);
        assert_eq!(Dialect::MySql.sql(query), query);
    }

    #[tokio::test]
    async fn migrations_run_on_connect() {
        let (store, _dir) = open_temp_store().await;
        // All five tables must exist and be queryable.
        for table in ["sessions", "messages", "agent_memory", "audit_log", "tokens"] {
            let count = format!("SELECT COUNT(*) AS n FROM {table}");
            let row = sqlx::query(&count).fetch_one(store.pool()).await.unwrap();
            let n: i64 = row.try_get("n").unwrap();
            assert_eq!(n, 0);
        }
    }

    #[tokio::test]
    async fn reconnect_is_idempotent() {
        let (store, dir) = open_temp_store().await;
        let url = format!("sqlite://{}", dir.path().join("shoal.db").display());
        drop(store);
        // Second connect sees the recorded version and applies nothing.
        let store = Store::connect(&url, 5).await.expect("reopen");
        let row = sqlx::query("SELECT COUNT(*) AS n FROM schema_version")
            .fetch_one(store.pool())
            .await
            .unwrap();
        let n: i64 = row.try_get("n").unwrap();
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn future_schema_version_is_refused() {
        let (store, dir) = open_temp_store().await;
        sqlx::query("INSERT INTO schema_version (version) VALUES (999)")
            .execute(store.pool())
            .await
            .unwrap();
        let url = format!("sqlite://{}", dir.path().join("shoal.db").display());
        drop(store);

        let err = Store::connect(&url, 5).await.unwrap_err();
        assert_eq!(err.code(), "SCHEMA_MISMATCH");
    }
}
