use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use vigil_core::collab::{AuthError, IdentityResolver, SettingsProvider, TaskStore};
use vigil_core::task::{PingRecord, PingTask};

pub const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("settings value is not valid JSON: {0}")]
    Settings(String),
    #[error("store mutex poisoned")]
    Lock,
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// SQLite-backed implementation of the hub's external collaborators: the
/// client token table, ping task distribution, measurement-result
/// persistence, and the public settings document.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Lock)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        let conn = self.lock()?;
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let conn = self.lock()?;
            let sql = include_str!("../migrations/0001_init.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, name: &str) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn upsert_client(
        &self,
        identity: &str,
        token: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO clients (identity, token, name, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(identity) DO UPDATE SET token = ?2, name = ?3",
            params![identity, token, name, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn identity_by_token(&self, token: &str) -> Result<Option<String>, StorageError> {
        let conn = self.lock()?;
        let identity = conn
            .query_row(
                "SELECT identity FROM clients WHERE token = ?1",
                params![token],
                |row| row.get(0),
            )
            .optional()?;
        Ok(identity)
    }

    pub fn insert_ping_task(&self, task: &PingTask) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO ping_tasks (id, client, kind, target, interval_secs)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                task.id,
                task.client,
                task.kind,
                task.target,
                task.interval_secs
            ],
        )?;
        Ok(())
    }

    pub fn ping_tasks_for_client(&self, client: &str) -> Result<Vec<PingTask>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, client, kind, target, interval_secs
             FROM ping_tasks WHERE client = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![client], |row| {
            Ok(PingTask {
                id: row.get(0)?,
                client: row.get(1)?,
                kind: row.get(2)?,
                target: row.get(3)?,
                interval_secs: row.get(4)?,
            })
        })?;
        let mut tasks = Vec::new();
        for task in rows {
            tasks.push(task?);
        }
        Ok(tasks)
    }

    pub fn insert_ping_record(&self, record: &PingRecord) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO ping_records (client, task_id, value, kind, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.client,
                record.task_id,
                record.value,
                record.kind,
                record.finished_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn ping_records_for_client(&self, client: &str) -> Result<Vec<PingRecord>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT client, task_id, value, kind, finished_at
             FROM ping_records WHERE client = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![client], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (client, task_id, value, kind, finished_at) = row?;
            records.push(PingRecord {
                client,
                task_id,
                value,
                kind,
                finished_at: parse_timestamp(&finished_at)?,
            });
        }
        Ok(records)
    }

    pub fn set_setting(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value.to_string()],
        )?;
        Ok(())
    }

    pub fn settings(&self) -> Result<Map<String, Value>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut settings = Map::new();
        for row in rows {
            let (key, raw) = row?;
            let value: Value =
                serde_json::from_str(&raw).map_err(|err| StorageError::Settings(err.to_string()))?;
            settings.insert(key, value);
        }
        Ok(settings)
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(format!("{raw}: {err}")))
}

impl IdentityResolver for Store {
    fn resolve(&self, token: &str) -> Result<String, AuthError> {
        if token.is_empty() {
            return Err(AuthError);
        }
        match self.identity_by_token(token) {
            Ok(Some(identity)) => Ok(identity),
            // Missing and invalid tokens collapse into one uniform error.
            Ok(None) | Err(_) => Err(AuthError),
        }
    }
}

impl TaskStore for Store {
    fn ping_tasks(&self, identity: &str) -> anyhow::Result<Vec<PingTask>> {
        Ok(self.ping_tasks_for_client(identity)?)
    }

    fn save_ping_record(&self, record: PingRecord) -> anyhow::Result<()> {
        self.insert_ping_record(&record)?;
        Ok(())
    }
}

impl SettingsProvider for Store {
    fn public_settings(&self) -> anyhow::Result<Map<String, Value>> {
        Ok(self.settings()?)
    }
}
