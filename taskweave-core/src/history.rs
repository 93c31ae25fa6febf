//! Local session history.
//!
//! Sessions are cached on disk so a restarted client can restore the
//! conversation and step lists without the server. The cache is a small
//! SQLite database with embedded migrations managed via PRAGMA
//! user_version. Staleness is enforced at read time: a session older than
//! the configured age is evicted instead of restored, and the last-active
//! pointer expires on its own, shorter, clock.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::HistoryConfig;
use crate::error::Result;
use crate::event::TaskIdentity;
use crate::timeline::{ChatMessage, ChatRole, FlowPhase};

/// Dialogs (user turn plus everything until the next user turn) kept when
/// restoring a session into a new prompt's context.
pub const MAX_RESTORE_DIALOGS: usize = 5;

/// Current schema version
const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: session snapshots plus the last-active pointer
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        session_id     TEXT PRIMARY KEY,
        updated_at     INTEGER NOT NULL,  -- unix millis
        identity_space TEXT,
        identity_id    TEXT,
        turns          JSON NOT NULL,
        phases         JSON NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at);

    CREATE TABLE IF NOT EXISTS last_active (
        slot        INTEGER PRIMARY KEY CHECK (slot = 0),
        session_id  TEXT NOT NULL,
        updated_at  INTEGER NOT NULL
    );
    "#,
];

fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            info!(version, "Running history cache migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "History cache migrations complete"
        );
    }

    Ok(())
}

// ============================================
// Snapshot model
// ============================================

/// Everything persisted for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub updated_at: DateTime<Utc>,
    /// Identity of the most recent task or flow, for continuation
    pub identity: Option<TaskIdentity>,
    pub turns: Vec<ChatMessage>,
    pub phases: Vec<FlowPhase>,
}

impl SessionSnapshot {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            updated_at: Utc::now(),
            identity: None,
            turns: Vec::new(),
            phases: Vec::new(),
        }
    }
}

/// Index of the first turn to keep when replaying `turns` as context for a
/// new prompt: the last [`MAX_RESTORE_DIALOGS`] user turns and everything
/// after them.
pub fn restore_start(turns: &[ChatMessage]) -> usize {
    let mut dialogs = 0;
    for (index, turn) in turns.iter().enumerate().rev() {
        if turn.role == ChatRole::User {
            dialogs += 1;
            if dialogs == MAX_RESTORE_DIALOGS {
                return index;
            }
        }
    }
    0
}

// ============================================
// Store trait
// ============================================

/// Persistence backend for session history.
pub trait HistoryStore {
    fn save(&self, snapshot: &SessionSnapshot) -> Result<()>;

    /// Load a session, enforcing the staleness window. A session past its
    /// age is evicted and reported as absent.
    fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>>;

    fn set_last_active(&self, session_id: &str) -> Result<()>;

    /// The session to offer for resumption, unless the pointer has expired.
    fn last_active(&self) -> Result<Option<String>>;

    /// Delete every session past the staleness window. Returns the count.
    fn evict_stale(&self) -> Result<usize>;

    /// All cached sessions, newest first.
    fn list(&self) -> Result<Vec<SessionSummary>>;
}

/// One row of the cached-session listing.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub updated_at: DateTime<Utc>,
    pub turn_count: usize,
}

// ============================================
// SQLite store
// ============================================

/// On-disk history cache (single connection behind a mutex).
pub struct SqliteHistory {
    conn: Mutex<Connection>,
    config: HistoryConfig,
}

impl SqliteHistory {
    /// Open (and migrate) the cache at `path`.
    pub fn open(path: &PathBuf, config: HistoryConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    /// In-memory cache, mainly for tests.
    pub fn open_in_memory(config: HistoryConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    fn session_cutoff(&self) -> i64 {
        (Utc::now() - Duration::days(self.config.chat_max_age_days as i64)).timestamp_millis()
    }

    fn pointer_cutoff(&self) -> i64 {
        (Utc::now() - Duration::hours(self.config.resume_max_age_hours as i64)).timestamp_millis()
    }
}

impl HistoryStore for SqliteHistory {
    fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let turns = serde_json::to_string(&snapshot.turns)?;
        let phases = serde_json::to_string(&snapshot.phases)?;
        let (space, id) = match &snapshot.identity {
            Some(identity) => (Some(identity.space.as_str()), Some(identity.id.as_str())),
            None => (None, None),
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO sessions
             (session_id, updated_at, identity_space, identity_id, turns, phases)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                snapshot.session_id,
                snapshot.updated_at.timestamp_millis(),
                space,
                id,
                turns,
                phases,
            ],
        )?;
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        let cutoff = self.session_cutoff();
        let conn = self.conn.lock().unwrap();

        let row = conn
            .query_row(
                "SELECT updated_at, identity_space, identity_id, turns, phases
                 FROM sessions WHERE session_id = ?1",
                [session_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((updated_at, space, id, turns, phases)) = row else {
            return Ok(None);
        };

        if updated_at < cutoff {
            debug!(session_id, "evicting stale session on load");
            conn.execute("DELETE FROM sessions WHERE session_id = ?1", [session_id])?;
            return Ok(None);
        }

        let identity = match (space, id) {
            (Some(space), Some(id)) => space
                .parse()
                .ok()
                .map(|space| TaskIdentity { space, id }),
            _ => None,
        };

        Ok(Some(SessionSnapshot {
            session_id: session_id.to_string(),
            updated_at: DateTime::from_timestamp_millis(updated_at).unwrap_or_else(Utc::now),
            identity,
            turns: serde_json::from_str(&turns)?,
            phases: serde_json::from_str(&phases)?,
        }))
    }

    fn set_last_active(&self, session_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO last_active (slot, session_id, updated_at)
             VALUES (0, ?1, ?2)",
            rusqlite::params![session_id, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    fn last_active(&self) -> Result<Option<String>> {
        let cutoff = self.pointer_cutoff();
        let conn = self.conn.lock().unwrap();

        let row = conn
            .query_row(
                "SELECT session_id, updated_at FROM last_active WHERE slot = 0",
                [],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        match row {
            Some((session_id, updated_at)) if updated_at >= cutoff => Ok(Some(session_id)),
            Some(_) => {
                debug!("last-active pointer expired");
                conn.execute("DELETE FROM last_active WHERE slot = 0", [])?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn evict_stale(&self) -> Result<usize> {
        let cutoff = self.session_cutoff();
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM sessions WHERE updated_at < ?1", [cutoff])?;
        if deleted > 0 {
            info!(deleted, "evicted stale sessions");
        }
        Ok(deleted)
    }

    fn list(&self) -> Result<Vec<SessionSummary>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT session_id, updated_at, turns FROM sessions ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (session_id, updated_at, turns) = row?;
            let turn_count = serde_json::from_str::<Vec<ChatMessage>>(&turns)
                .map(|t| t.len())
                .unwrap_or(0);
            summaries.push(SessionSummary {
                session_id,
                updated_at: DateTime::from_timestamp_millis(updated_at).unwrap_or_else(Utc::now),
                turn_count,
            });
        }
        Ok(summaries)
    }
}

// ============================================
// In-memory store
// ============================================

/// Map-backed store with the same staleness rules, for ephemeral use.
#[derive(Default)]
pub struct MemoryHistory {
    config: HistoryConfig,
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    sessions: std::collections::HashMap<String, SessionSnapshot>,
    last_active: Option<(String, DateTime<Utc>)>,
}

impl MemoryHistory {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(MemoryInner::default()),
        }
    }
}

impl HistoryStore for MemoryHistory {
    fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .sessions
            .insert(snapshot.session_id.clone(), snapshot.clone());
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        let cutoff = Utc::now() - Duration::days(self.config.chat_max_age_days as i64);
        let mut inner = self.inner.lock().unwrap();
        match inner.sessions.get(session_id) {
            Some(snapshot) if snapshot.updated_at >= cutoff => Ok(Some(snapshot.clone())),
            Some(_) => {
                inner.sessions.remove(session_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set_last_active(&self, session_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.last_active = Some((session_id.to_string(), Utc::now()));
        Ok(())
    }

    fn last_active(&self) -> Result<Option<String>> {
        let cutoff = Utc::now() - Duration::hours(self.config.resume_max_age_hours as i64);
        let mut inner = self.inner.lock().unwrap();
        match &inner.last_active {
            Some((session_id, at)) if *at >= cutoff => Ok(Some(session_id.clone())),
            Some(_) => {
                inner.last_active = None;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn evict_stale(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(self.config.chat_max_age_days as i64);
        let mut inner = self.inner.lock().unwrap();
        let before = inner.sessions.len();
        inner.sessions.retain(|_, s| s.updated_at >= cutoff);
        Ok(before - inner.sessions.len())
    }

    fn list(&self) -> Result<Vec<SessionSummary>> {
        let inner = self.inner.lock().unwrap();
        let mut summaries: Vec<SessionSummary> = inner
            .sessions
            .values()
            .map(|s| SessionSummary {
                session_id: s.session_id.clone(),
                updated_at: s.updated_at,
                turn_count: s.turns.len(),
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}
