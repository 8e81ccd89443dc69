use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

/// Persisted engagement state for one scope.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatState {
    pub heartbeat: f64,
    pub is_tense: bool,
    pub focus_text: String,
    /// Unix seconds; 0 means no hold timer is running.
    pub tense_until: i64,
}

impl HeartbeatState {
    pub fn idle() -> Self {
        Self {
            heartbeat: 0.0,
            is_tense: false,
            focus_text: String::new(),
            tense_until: 0,
        }
    }
}

/// Key-value-by-scope store for engagement state, upserted after every
/// decision.
pub struct HeartbeatStore {
    conn: Mutex<Connection>,
}

impl HeartbeatStore {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Heartbeat store lock poisoned: {}", e))
    }

    /// Create or open the store.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// In-memory store, used by tests and as the degraded mode backing.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS heartbeat_state (
                scope TEXT PRIMARY KEY,
                heartbeat REAL NOT NULL,
                is_tense INTEGER NOT NULL,
                focus_text TEXT NOT NULL,
                tense_until INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            )"#,
            [],
        )?;
        Ok(())
    }

    pub fn load(&self, scope: &str) -> Result<Option<HeartbeatState>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT heartbeat, is_tense, focus_text, tense_until
             FROM heartbeat_state WHERE scope = ?1",
            [scope],
            |row| {
                Ok(HeartbeatState {
                    heartbeat: row.get(0)?,
                    is_tense: row.get::<_, i64>(1)? != 0,
                    focus_text: row.get(2)?,
                    tense_until: row.get(3)?,
                })
            },
        );

        match result {
            Ok(state) => Ok(Some(state)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, scope: &str, state: &HeartbeatState) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO heartbeat_state (scope, heartbeat, is_tense, focus_text, tense_until, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(scope) DO UPDATE SET
                 heartbeat = excluded.heartbeat,
                 is_tense = excluded.is_tense,
                 focus_text = excluded.focus_text,
                 tense_until = excluded.tense_until,
                 updated_at = excluded.updated_at",
            params![
                scope,
                state.heartbeat,
                state.is_tense as i64,
                state.focus_text,
                state.tense_until,
                Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }
}
