use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use uuid::Uuid;

use shared::{
    domain::UserId,
    protocol::{AuthUser, Session},
};

/// Key under which the default session is persisted.
pub const DEFAULT_SESSION_KEY: &str = "default";

/// Local persistence for the backend session tokens.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // every connection to an in-memory database sees its own empty schema
        let max_connections = if is_memory_url(database_url) { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open session database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to migrate session database")?;
        Ok(Self { pool })
    }

    pub async fn save_session(&self, storage_key: &str, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO auth_session
                (storage_key, user_id, email, access_token, refresh_token, expires_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(storage_key) DO UPDATE SET
                user_id = excluded.user_id,
                email = excluded.email,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(storage_key)
        .bind(session.user.id.0.to_string())
        .bind(session.user.email.as_deref())
        .bind(&session.access_token)
        .bind(&session.refresh_token)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to persist session '{storage_key}'"))?;
        Ok(())
    }

    pub async fn load_session(&self, storage_key: &str) -> Result<Option<Session>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, email, access_token, refresh_token, expires_at
            FROM auth_session
            WHERE storage_key = ?
            "#,
        )
        .bind(storage_key)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load session '{storage_key}'"))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let raw_user_id: String = row.try_get("user_id")?;
        let user_id = Uuid::parse_str(&raw_user_id)
            .with_context(|| format!("stored session has malformed user id '{raw_user_id}'"))?;
        let expires_at: DateTime<Utc> = row.try_get("expires_at")?;

        Ok(Some(Session {
            access_token: row.try_get("access_token")?,
            refresh_token: row.try_get("refresh_token")?,
            expires_at,
            user: AuthUser {
                id: UserId(user_id),
                email: row.try_get("email")?,
            },
        }))
    }

    /// Returns whether a row was removed.
    pub async fn clear_session(&self, storage_key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM auth_session WHERE storage_key = ?")
            .bind(storage_key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to clear session '{storage_key}'"))?;
        Ok(result.rows_affected() > 0)
    }
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
