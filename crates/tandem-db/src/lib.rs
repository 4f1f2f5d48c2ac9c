pub mod chats;

use sqlx::any::AnyPoolOptions;
use thiserror::Error;

pub type DbPool = sqlx::AnyPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseEngine {
    Sqlite,
    Postgres,
}

impl DatabaseEngine {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Optional tuning knobs applied after each PostgreSQL connection is established.
#[derive(Debug, Clone, Default)]
pub struct PgConnectOptions {
    /// `statement_timeout` in seconds (0 = disabled).
    pub statement_timeout_secs: u64,
}

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, sqlx::Error> {
    create_pool_full(database_url, max_connections, None).await
}

pub async fn create_pool_full(
    database_url: &str,
    max_connections: u32,
    pg_options: Option<PgConnectOptions>,
) -> Result<DbPool, sqlx::Error> {
    let engine = detect_database_engine(database_url)?;

    // Required once before using sqlx::Any.
    sqlx::any::install_default_drivers();

    let connect_url = match engine {
        DatabaseEngine::Sqlite => normalize_sqlite_url_for_any(database_url),
        DatabaseEngine::Postgres => database_url.to_string(),
    };

    let pg_opts = pg_options.unwrap_or_default();
    let pool = AnyPoolOptions::new()
        .max_connections(max_connections)
        .after_connect(move |conn, _meta| {
            let pg_opts = pg_opts.clone();
            Box::pin(async move {
                match engine {
                    DatabaseEngine::Sqlite => {
                        // Upstream writers share this file.
                        sqlx::query("PRAGMA busy_timeout = 5000;")
                            .execute(&mut *conn)
                            .await?;
                        sqlx::query("PRAGMA foreign_keys = ON;")
                            .execute(&mut *conn)
                            .await?;
                    }
                    DatabaseEngine::Postgres => {
                        if pg_opts.statement_timeout_secs > 0 {
                            let sql = format!(
                                "SET statement_timeout = '{}s'",
                                pg_opts.statement_timeout_secs
                            );
                            sqlx::query(&sql).execute(&mut *conn).await?;
                        }
                        sqlx::query("SET timezone = 'UTC'")
                            .execute(&mut *conn)
                            .await?;
                    }
                }
                Ok(())
            })
        })
        .connect(&connect_url)
        .await?;

    tracing::info!(engine = engine.as_str(), max_connections, "database pool ready");
    Ok(pool)
}

pub fn detect_database_engine(database_url: &str) -> Result<DatabaseEngine, sqlx::Error> {
    let normalized = database_url.trim().to_ascii_lowercase();
    if normalized.starts_with("sqlite:") {
        Ok(DatabaseEngine::Sqlite)
    } else if normalized.starts_with("postgres://") || normalized.starts_with("postgresql://") {
        Ok(DatabaseEngine::Postgres)
    } else {
        Err(sqlx::Error::Configuration(
            format!("unsupported database URL scheme in '{}'", database_url).into(),
        ))
    }
}

fn normalize_sqlite_url_for_any(url: &str) -> String {
    // sqlx::Any wants absolute Windows paths as sqlite:///C:/..., configs
    // usually say sqlite://C:/...
    if !url.starts_with("sqlite://") {
        return url.to_string();
    }
    let rest = &url["sqlite://".len()..];
    if rest.starts_with('/') {
        return url.to_string();
    }
    let bytes = rest.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        format!("sqlite:///{rest}")
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::{create_pool, detect_database_engine, normalize_sqlite_url_for_any, DatabaseEngine};

    #[tokio::test]
    async fn create_pool_supports_default_sqlite_mode() {
        let pool = create_pool("sqlite::memory:", 1).await.expect("pool");
        let value: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&pool)
            .await
            .expect("query");
        assert_eq!(value, 1);
    }

    #[test]
    fn detects_engine_from_url_scheme() {
        assert_eq!(
            detect_database_engine("sqlite://tandem.db?mode=rwc").unwrap(),
            DatabaseEngine::Sqlite
        );
        assert_eq!(
            detect_database_engine("postgresql://u:p@localhost/tandem").unwrap(),
            DatabaseEngine::Postgres
        );
        assert!(detect_database_engine("mysql://localhost/tandem").is_err());
    }

    #[test]
    fn windows_drive_paths_get_a_third_slash() {
        assert_eq!(
            normalize_sqlite_url_for_any("sqlite://C:/data/tandem.db"),
            "sqlite:///C:/data/tandem.db"
        );
        assert_eq!(
            normalize_sqlite_url_for_any("sqlite:///var/lib/tandem.db"),
            "sqlite:///var/lib/tandem.db"
        );
        assert_eq!(normalize_sqlite_url_for_any("sqlite::memory:"), "sqlite::memory:");
    }
}
