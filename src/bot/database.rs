//! Persistent SQLite store for users, processed events and AI exchanges.

use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bot::recipe_ai::Level;

/// Version written to `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    Sqlite(rusqlite::Error),
    /// The file was written by a newer build.
    SchemaVersion { found: i64 },
    /// A stored value could not be decoded.
    Corrupt(String),
    Poisoned,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "io error: {e}"),
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StorageError::SchemaVersion { found } => {
                write!(f, "database schema version {found} is newer than supported version {SCHEMA_VERSION}")
            }
            StorageError::Corrupt(e) => write!(f, "corrupt row: {e}"),
            StorageError::Poisoned => write!(f, "database lock poisoned"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            StorageError::Sqlite(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

/// Conversation mode of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Idle,
    /// Free text goes to Recipe AI.
    Chat,
}

impl Mode {
    fn from_str(s: &str) -> Self {
        match s {
            "chat" => Mode::Chat,
            _ => Mode::Idle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Idle => "idle",
            Mode::Chat => "chat",
        }
    }
}

/// Per-user state blob, stored as JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default)]
    pub spiciness: Level,
    #[serde(default)]
    pub saltiness: Level,
}

/// Durable state of one user.
#[derive(Debug, Clone, PartialEq)]
pub struct UserState {
    pub user_id: i64,
    pub username: Option<String>,
    pub mode: Mode,
    pub preferences: Preferences,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Committed events, the first one included.
    pub event_count: i64,
    pub exchange_count: i64,
}

/// One question/answer pair with Recipe AI.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub question: String,
    pub answer: String,
}

/// Everything one event changes. `None` leaves the column as it is, except
/// for `username`, which always mirrors the sender's current handle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mutation {
    pub username: Option<String>,
    pub mode: Option<Mode>,
    pub preferences: Option<Preferences>,
    pub exchange: Option<Exchange>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Committed,
    /// The event key was committed before; nothing changed.
    Duplicate { reply: String },
}

/// Persistent SQLite database for the bot.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(StorageError::Io)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        let db = Self::init(conn)?;

        let (users, events) = db.counts()?;
        info!("Loaded database from {:?} ({} users, {} processed events)", path, users, events);
        Ok(db)
    }

    /// Create a new in-memory database.
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.busy_timeout(Duration::from_secs(5))?;

        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(StorageError::SchemaVersion { found: version });
        }

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY,
                username TEXT,
                mode TEXT NOT NULL DEFAULT 'idle',
                preferences TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                event_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS events (
                event_key TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                reply TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS exchanges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(user_id),
                event_key TEXT NOT NULL UNIQUE,
                question TEXT NOT NULL,
                answer TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at);
            CREATE INDEX IF NOT EXISTS idx_exchanges_user_id ON exchanges(user_id);
        "#,
        )?;
        if version < SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    fn counts(&self) -> Result<(i64, i64), StorageError> {
        let conn = self.conn()?;
        let users = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        let events = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok((users, events))
    }

    /// Current state of a user, `None` if never seen.
    pub fn read_state(&self, user_id: i64) -> Result<Option<UserState>, StorageError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT u.user_id, u.username, u.mode, u.preferences, u.created_at, u.last_seen_at, u.event_count,
                        (SELECT COUNT(*) FROM exchanges e WHERE e.user_id = u.user_id)
                 FROM users u WHERE u.user_id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((user_id, username, mode, preferences, created_at, last_seen_at, event_count, exchange_count)) = row
        else {
            return Ok(None);
        };

        Ok(Some(UserState {
            user_id,
            username,
            mode: Mode::from_str(&mode),
            preferences: serde_json::from_str(&preferences)
                .map_err(|e| StorageError::Corrupt(format!("preferences of {user_id}: {e}")))?,
            created_at: parse_time(&created_at)?,
            last_seen_at: parse_time(&last_seen_at)?,
            event_count,
            exchange_count,
        }))
    }

    /// Reply stored for an already committed event.
    pub fn processed_reply(&self, event_key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn()?;
        let reply = conn
            .query_row("SELECT reply FROM events WHERE event_key = ?1", params![event_key], |row| row.get(0))
            .optional()?;
        Ok(reply)
    }

    /// Apply one event's mutation atomically.
    ///
    /// The event row, the user upsert and the optional exchange are written in
    /// a single transaction. If `event_key` was committed before, nothing is
    /// written and the stored reply is returned instead.
    pub fn write_state(
        &self,
        user_id: i64,
        event_key: &str,
        mutation: &Mutation,
        reply: &str,
    ) -> Result<WriteOutcome, StorageError> {
        let now = timestamp(Utc::now());
        let preferences = mutation
            .preferences
            .map(|p| serde_json::to_string(&p))
            .transpose()
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;

        let mut conn = self.conn()?;
        // Dropping `tx` without commit rolls back.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            "INSERT INTO events (event_key, user_id, reply, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(event_key) DO NOTHING",
            params![event_key, user_id, reply, now],
        )?;
        if inserted == 0 {
            let reply: String =
                tx.query_row("SELECT reply FROM events WHERE event_key = ?1", params![event_key], |row| row.get(0))?;
            debug!("Event {event_key} already committed");
            return Ok(WriteOutcome::Duplicate { reply });
        }

        tx.execute(
            "INSERT INTO users (user_id, username, mode, preferences, created_at, last_seen_at, event_count)
             VALUES (?1, ?2, COALESCE(?3, 'idle'), COALESCE(?4, '{}'), ?5, ?5, 1)
             ON CONFLICT(user_id) DO UPDATE SET
                username = ?2,
                mode = COALESCE(?3, mode),
                preferences = COALESCE(?4, preferences),
                last_seen_at = ?5,
                event_count = event_count + 1",
            params![user_id, mutation.username, mutation.mode.map(|m| m.as_str()), preferences, now],
        )?;

        if let Some(ref exchange) = mutation.exchange {
            tx.execute(
                "INSERT INTO exchanges (user_id, event_key, question, answer, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![user_id, event_key, exchange.question, exchange.answer, now],
            )?;
        }

        tx.commit()?;
        Ok(WriteOutcome::Committed)
    }

    /// Delete processed-event rows older than `older_than`. Exchanges keep their key.
    pub fn prune_events(&self, older_than: Duration) -> Result<usize, StorageError> {
        let age = chrono::Duration::from_std(older_than).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let cutoff = timestamp(Utc::now() - age);
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM events WHERE created_at <= ?1", params![cutoff])?;
        Ok(deleted)
    }

    /// Close the connection, flushing the WAL.
    pub fn close(self) -> Result<(), StorageError> {
        let conn = self.conn.into_inner().map_err(|_| StorageError::Poisoned)?;
        conn.close().map_err(|(_, e)| StorageError::Sqlite(e))
    }

    /// Make every exchange insert fail, to exercise rollback.
    #[cfg(test)]
    pub(crate) fn fail_exchange_inserts(&self) {
        self.conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER fail_exchange BEFORE INSERT ON exchanges
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .unwrap();
    }
}

/// Fixed-width so stored values compare lexicographically.
fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("timestamp '{s}': {e}")))
}
