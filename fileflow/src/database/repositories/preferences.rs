//! User preference repository.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{RenamePatternDbModel, UserPreferencesDbModel};
use crate::database::retry::retry_on_sqlite_busy;

#[async_trait]
pub trait PreferenceRepository: Send + Sync {
    async fn get_preferences(&self, user_id: i64) -> Result<Option<UserPreferencesDbModel>>;
    async fn upsert_profile(
        &self,
        user_id: i64,
        username: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<()>;
    /// Set the active template. `name` is the saved pattern it came from.
    async fn set_active_pattern(
        &self,
        user_id: i64,
        name: Option<&str>,
        template: Option<&str>,
    ) -> Result<()>;
    async fn set_permanent_thumbnail(&self, user_id: i64, path: Option<&str>) -> Result<()>;
    /// Store (or clear) the one-shot thumbnail. Returns the path it replaced.
    async fn set_next_thumbnail(
        &self,
        user_id: i64,
        path: Option<&str>,
        set_at: &str,
    ) -> Result<Option<String>>;
    /// Clear the one-shot thumbnail, returning its path and when it was set.
    async fn take_next_thumbnail(&self, user_id: i64) -> Result<Option<(String, String)>>;

    async fn save_pattern(&self, pattern: &RenamePatternDbModel) -> Result<()>;
    async fn get_pattern(&self, user_id: i64, name: &str) -> Result<Option<RenamePatternDbModel>>;
    async fn list_patterns(&self, user_id: i64) -> Result<Vec<RenamePatternDbModel>>;
    async fn delete_pattern(&self, user_id: i64, name: &str) -> Result<bool>;
    /// Bump a saved pattern's usage count. Returns whether it exists.
    async fn record_pattern_usage(&self, user_id: i64, name: &str) -> Result<bool>;
}

pub struct SqlxPreferenceRepository {
    pool: SqlitePool,
}

impl SqlxPreferenceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PreferenceRepository for SqlxPreferenceRepository {
    async fn get_preferences(&self, user_id: i64) -> Result<Option<UserPreferencesDbModel>> {
        let row = sqlx::query_as::<_, UserPreferencesDbModel>(
            "SELECT * FROM user_preferences WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn upsert_profile(
        &self,
        user_id: i64,
        username: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        retry_on_sqlite_busy("upsert_profile", || async {
            sqlx::query(
                r#"
                INSERT INTO user_preferences (user_id, username, display_name, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(user_id) DO UPDATE SET
                    username = excluded.username,
                    display_name = excluded.display_name,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(user_id)
            .bind(username)
            .bind(display_name)
            .bind(&now)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn set_active_pattern(
        &self,
        user_id: i64,
        name: Option<&str>,
        template: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        retry_on_sqlite_busy("set_active_pattern", || async {
            sqlx::query(
                r#"
                INSERT INTO user_preferences (user_id, active_pattern, active_pattern_name, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(user_id) DO UPDATE SET
                    active_pattern = excluded.active_pattern,
                    active_pattern_name = excluded.active_pattern_name,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(user_id)
            .bind(template)
            .bind(name)
            .bind(&now)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn set_permanent_thumbnail(&self, user_id: i64, path: Option<&str>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        retry_on_sqlite_busy("set_permanent_thumbnail", || async {
            sqlx::query(
                r#"
                INSERT INTO user_preferences (user_id, permanent_thumbnail, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(user_id) DO UPDATE SET
                    permanent_thumbnail = excluded.permanent_thumbnail,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(user_id)
            .bind(path)
            .bind(&now)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn set_next_thumbnail(
        &self,
        user_id: i64,
        path: Option<&str>,
        set_at: &str,
    ) -> Result<Option<String>> {
        let mut tx = self.pool.begin().await?;
        let previous: Option<(Option<String>,)> =
            sqlx::query_as("SELECT next_thumbnail FROM user_preferences WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
        sqlx::query(
            r#"
            INSERT INTO user_preferences (user_id, next_thumbnail, next_thumbnail_set_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                next_thumbnail = excluded.next_thumbnail,
                next_thumbnail_set_at = excluded.next_thumbnail_set_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(path)
        .bind(path.map(|_| set_at))
        .bind(set_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(previous.and_then(|(p,)| p))
    }

    async fn take_next_thumbnail(&self, user_id: i64) -> Result<Option<(String, String)>> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT next_thumbnail, next_thumbnail_set_at FROM user_preferences WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((Some(path), set_at)) = row else {
            return Ok(None);
        };
        sqlx::query(
            "UPDATE user_preferences SET next_thumbnail = NULL, next_thumbnail_set_at = NULL, \
             updated_at = ? WHERE user_id = ?",
        )
        .bind(&now)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some((path, set_at.unwrap_or_default())))
    }

    async fn save_pattern(&self, pattern: &RenamePatternDbModel) -> Result<()> {
        retry_on_sqlite_busy("save_pattern", || async {
            sqlx::query(
                r#"
                INSERT INTO rename_patterns (user_id, name, template, created_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(user_id, name) DO UPDATE SET template = excluded.template
                "#,
            )
            .bind(pattern.user_id)
            .bind(&pattern.name)
            .bind(&pattern.template)
            .bind(&pattern.created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_pattern(&self, user_id: i64, name: &str) -> Result<Option<RenamePatternDbModel>> {
        let row = sqlx::query_as::<_, RenamePatternDbModel>(
            "SELECT * FROM rename_patterns WHERE user_id = ? AND name = ?",
        )
        .bind(user_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_patterns(&self, user_id: i64) -> Result<Vec<RenamePatternDbModel>> {
        let rows = sqlx::query_as::<_, RenamePatternDbModel>(
            "SELECT * FROM rename_patterns WHERE user_id = ? ORDER BY created_at, name",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_pattern(&self, user_id: i64, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM rename_patterns WHERE user_id = ? AND name = ?")
            .bind(user_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_pattern_usage(&self, user_id: i64, name: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        retry_on_sqlite_busy("record_pattern_usage", || async {
            let result = sqlx::query(
                "UPDATE rename_patterns SET usage_count = usage_count + 1, last_used_at = ? \
                 WHERE user_id = ? AND name = ?",
            )
            .bind(&now)
            .bind(user_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }
}
