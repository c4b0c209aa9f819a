// Credential persistence in a SQLite database

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::store::TokenStore;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS auth_kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

/// Token store backed by the `auth_kv` table of a SQLite file
pub struct SqliteTokenStore {
    conn: Mutex<Connection>,
}

impl SqliteTokenStore {
    /// Open (or create) the session database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create session directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        tracing::debug!("Opened session database: {}", path.display());
        Self::init(conn)
    }

    /// Store that lives only as long as the process
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(SCHEMA, [])
            .context("Failed to create auth_kv table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("SQLite connection lock poisoned"))
    }

    /// When `key` was last written
    pub fn updated_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self
            .conn()?
            .query_row(
                "SELECT updated_at FROM auth_kv WHERE key = ?",
                [key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to read timestamp for {}", key))?;

        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .with_context(|| format!("Failed to parse datetime: {}", s))
        })
        .transpose()
    }
}

impl TokenStore for SqliteTokenStore {
    fn load(&self, key: &str) -> Result<Option<String>> {
        self.conn()?
            .query_row("SELECT value FROM auth_kv WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()
            .with_context(|| format!("Failed to load {} from SQLite", key))
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO auth_kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("Failed to save {} to SQLite", key))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM auth_kv WHERE key = ?", [key])
            .with_context(|| format!("Failed to remove {} from SQLite", key))?;
        Ok(())
    }
}
