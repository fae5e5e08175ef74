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

/// Per-session device database living at the session's storage path.
///
/// The only durable fact the core cares about is whether a paired identity
/// exists; everything else a protocol backend keeps here is its own business.
#[derive(Clone)]
pub struct DeviceStore {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub identity_blob: Vec<u8>,
    pub paired_at: DateTime<Utc>,
}

impl DeviceStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open device store '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to migrate device store")?;
        Ok(Self { pool })
    }

    pub async fn open_path(path: &Path) -> Result<Self> {
        Self::new(&sqlite_url_for_path(path)).await
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn load_identity(&self) -> Result<Option<DeviceIdentity>> {
        let row = sqlx::query("SELECT identity_blob, paired_at FROM device_identity WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("failed to load device identity")?;
        row.map(|row| {
            Ok(DeviceIdentity {
                identity_blob: row.try_get("identity_blob")?,
                paired_at: row.try_get("paired_at")?,
            })
        })
        .transpose()
    }

    pub async fn has_identity(&self) -> Result<bool> {
        Ok(self.load_identity().await?.is_some())
    }

    pub async fn save_identity(&self, identity_blob: &[u8]) -> Result<DeviceIdentity> {
        let paired_at = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO device_identity (id, identity_blob, paired_at, updated_at)
            VALUES (1, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                identity_blob = excluded.identity_blob,
                paired_at = excluded.paired_at,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(identity_blob)
        .bind(paired_at)
        .execute(&self.pool)
        .await
        .context("failed to save device identity")?;
        Ok(DeviceIdentity {
            identity_blob: identity_blob.to_vec(),
            paired_at,
        })
    }

    /// Forgets the paired identity. Returns whether one was present.
    pub async fn clear_identity(&self) -> Result<bool> {
        let result = sqlx::query("DELETE FROM device_identity WHERE id = 1")
            .execute(&self.pool)
            .await
            .context("failed to clear device identity")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub fn sqlite_url_for_path(path: &Path) -> String {
    format!("sqlite://{}", path.to_string_lossy().replace('\\', "/"))
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
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
