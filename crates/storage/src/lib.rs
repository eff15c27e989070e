use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Mutex,
};
use tracing::debug;

/// Slot holding the serialized session token.
pub const AUTH_TOKEN_SLOT: &str = "auth_token";

const DEFAULT_DATABASE_URL: &str = "sqlite://./data/client.db";
const IN_MEMORY_DATABASE_URL: &str = "sqlite::memory:";

/// Slot holding the cached message sequence of one conversation.
pub fn message_cache_slot(conversation_id: &str) -> String {
    format!("messages:{conversation_id}")
}

/// Durable client-side key/value slots.
///
/// Every write is all-or-nothing from the caller's point of view: either
/// the new value is stored or an error is returned and the old value stays.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn load(&self, slot: &str) -> Result<Option<String>>;
    async fn save(&self, slot: &str, value: &str) -> Result<()>;
    async fn remove(&self, slot: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to `sqlite::memory:` opens its own database.
        let max_connections = if database_url == IN_MEMORY_DATABASE_URL {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open sqlite database '{database_url}'"))?;
        let storage = Self { pool };
        storage.ensure_slot_table().await?;
        Ok(storage)
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

    async fn ensure_slot_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS client_slots (
                slot       TEXT PRIMARY KEY NOT NULL,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure client_slots table exists")?;
        Ok(())
    }

    pub async fn list_slots(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT slot FROM client_slots ORDER BY slot")
            .fetch_all(&self.pool)
            .await
            .context("failed to list client slots")?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("slot").map_err(anyhow::Error::from))
            .collect()
    }
}

#[async_trait]
impl KeyValueStore for Storage {
    async fn load(&self, slot: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM client_slots WHERE slot = ?")
            .bind(slot)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load slot '{slot}'"))?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    async fn save(&self, slot: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO client_slots (slot, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(slot) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(slot)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save slot '{slot}'"))?;
        debug!(slot, bytes = value.len(), "storage: slot saved");
        Ok(())
    }

    async fn remove(&self, slot: &str) -> Result<()> {
        sqlx::query("DELETE FROM client_slots WHERE slot = ?")
            .bind(slot)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to remove slot '{slot}'"))?;
        debug!(slot, "storage: slot removed");
        Ok(())
    }
}

/// Process-local slots, for ephemeral sessions and tests.
#[derive(Default)]
pub struct MemoryStore {
    slots: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_slots<R>(&self, f: impl FnOnce(&mut HashMap<String, String>) -> R) -> Result<R> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(f(&mut slots))
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn load(&self, slot: &str) -> Result<Option<String>> {
        self.with_slots(|slots| slots.get(slot).cloned())
    }

    async fn save(&self, slot: &str, value: &str) -> Result<()> {
        self.with_slots(|slots| {
            slots.insert(slot.to_string(), value.to_string());
        })
    }

    async fn remove(&self, slot: &str) -> Result<()> {
        self.with_slots(|slots| {
            slots.remove(slot);
        })
    }
}

/// Normalizes a user-supplied database location and makes sure its parent
/// directory exists.
pub fn prepare_database_url(raw_database_url: &str) -> Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_sqlite_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return DEFAULT_DATABASE_URL.to_string();
    }

    if raw_database_url.starts_with(IN_MEMORY_DATABASE_URL)
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
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
    if database_url == IN_MEMORY_DATABASE_URL || !database_url.starts_with("sqlite:") {
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
