//! Persistence layer: SQLite through sqlx.
//!
//! Pool setup, migrations, row models and repositories. The job table is
//! written by the scheduler while workers and the purge task read it, so the
//! database always runs in WAL mode.

pub mod models;
pub mod repositories;
pub mod retry;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use tracing::{info, warn};

use crate::Result;

pub type DbPool = Pool<Sqlite>;

const DEFAULT_POOL_SIZE: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(15);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Open (creating if needed) the database at `database_url` with the default
/// pool size.
pub async fn init_pool(database_url: &str) -> Result<DbPool> {
    init_pool_with_size(database_url, DEFAULT_POOL_SIZE).await
}

pub async fn init_pool_with_size(database_url: &str, max_connections: u32) -> Result<DbPool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true)
        .pragma("temp_store", "MEMORY")
        .pragma("wal_autocheckpoint", "1000");

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(options)
        .await?;

    // In-memory databases report "memory" and cannot switch.
    let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
        .fetch_one(&pool)
        .await?;
    if !mode.eq_ignore_ascii_case("wal") && !mode.eq_ignore_ascii_case("memory") {
        warn!(journal_mode = %mode, "Database is not in WAL mode");
    }

    info!(max_connections, journal_mode = %mode, "Database pool ready");
    Ok(pool)
}

pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations applied");
    Ok(())
}

/// File-backed pool with migrations applied, for unit tests.
#[cfg(test)]
pub(crate) async fn test_pool(dir: &std::path::Path) -> DbPool {
    let url = format!("sqlite:{}?mode=rwc", dir.join("test.db").display());
    let pool = init_pool_with_size(&url, 4).await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}
