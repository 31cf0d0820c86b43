use std::path::Path;
use std::str::FromStr;

use sea_orm::{DatabaseConnection, SqlxSqliteConnector};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

/// Special path for a throwaway in-memory database
pub const IN_MEMORY: &str = ":memory:";

pub async fn init_pool(db_path: &str) -> Result<DatabaseConnection, sqlx::Error> {
    let pool = if db_path == IN_MEMORY {
        // One connection that never recycles, otherwise the database vanishes
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        let abs_path = std::fs::canonicalize(db_path)
            .unwrap_or_else(|_| std::path::PathBuf::from(db_path));
        tracing::info!("Database absolute path: {:?}", abs_path);

        // Ensure parent directory exists
        if let Some(parent) = Path::new(db_path).parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?
    };

    run_migrations(&pool).await?;

    Ok(SqlxSqliteConnector::from_sqlx_sqlite_pool(pool))
}

async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations applied successfully");
    Ok(())
}

/// Current UTC time as stored in every `*_at` column.
///
/// Fixed-width RFC 3339 with microseconds, so string order is time order.
pub fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
