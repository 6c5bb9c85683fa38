//! Per-user naming counters.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::retry::retry_on_sqlite_busy;

#[async_trait]
pub trait CounterRepository: Send + Sync {
    /// Atomically increment and return the user's counter. The first call
    /// for a user returns 1.
    async fn next_value(&self, user_id: i64) -> Result<i64>;
    async fn current_value(&self, user_id: i64) -> Result<i64>;
}

pub struct SqlxCounterRepository {
    pool: SqlitePool,
}

impl SqlxCounterRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CounterRepository for SqlxCounterRepository {
    async fn next_value(&self, user_id: i64) -> Result<i64> {
        retry_on_sqlite_busy("next_counter", || async {
            let (value,): (i64,) = sqlx::query_as(
                "INSERT INTO user_counters (user_id, value) VALUES (?, 1) \
                 ON CONFLICT(user_id) DO UPDATE SET value = value + 1 \
                 RETURNING value",
            )
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
            Ok(value)
        })
        .await
    }

    async fn current_value(&self, user_id: i64) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT value FROM user_counters WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v).unwrap_or(0))
    }
}
