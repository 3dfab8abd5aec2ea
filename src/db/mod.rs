use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::SqlitePool;

use crate::error::FeedError;

const DEFAULT_DB_FILENAME: &str = "chartfeed.db";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn resolve_db_filename() -> String {
    std::env::var("CHARTFEED_DB_FILENAME")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_DB_FILENAME.to_string())
}

fn resolve_db_path(data_dir: &Path) -> Result<PathBuf, FeedError> {
    std::fs::create_dir_all(data_dir)?;
    Ok(data_dir.join(resolve_db_filename()))
}

pub async fn initialize_schema(pool: &SqlitePool) -> Result<(), FeedError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS feed_kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at_ms INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn initialize_pool_from_path(path: &Path) -> Result<SqlitePool, FeedError> {
    let connect_options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePool::connect_with(connect_options).await?;
    initialize_schema(&pool).await?;

    Ok(pool)
}

pub async fn initialize_pool(data_dir: &Path) -> Result<SqlitePool, FeedError> {
    let db_path = resolve_db_path(data_dir)?;
    initialize_pool_from_path(&db_path).await
}
