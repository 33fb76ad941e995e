//! Multi-process transport: a per-run SQLite session database.
//!
//! The coordinator creates the file and its schema under the user data path,
//! named by the run's session id; workers attach by the same id from their
//! command-line arguments. SQLite's locking provides the cross-process mutual
//! exclusion, and pop-and-remove is one immediate transaction, so each
//! command is delivered to exactly one worker no matter how many processes
//! pull concurrently.

use anyhow::{Context, anyhow};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::WorkChannel;
use crate::queue::IndexerCommand;
use crate::storage::fragment::GraphFragment;
use crate::utils::config::{PackagePaths, SESSION_BUSY_TIMEOUT};
use crate::{Result, SlotId};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS commands (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS fragments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    slot INTEGER NOT NULL,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_fragments_slot ON fragments(slot);
CREATE TABLE IF NOT EXISTS heartbeats (
    slot INTEGER PRIMARY KEY,
    path TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS announced (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS crashed (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS finished (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    slot INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS flags (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
"#;

/// Path of the session database for a run id under the user data path.
pub fn session_db_path(user_data_path: &Path, session_id: &str) -> PathBuf {
    user_data_path
        .join(PackagePaths::get().session_dir_name())
        .join(format!("{session_id}.session"))
}

pub struct SessionDb {
    conn: Mutex<Connection>,
    path: PathBuf,
    owner: bool,
}

impl SessionDb {
    /// Create the session database for a new run. Coordinator only; the file
    /// is removed again when this handle drops.
    pub fn create(user_data_path: &Path, session_id: &str) -> Result<Self> {
        let path = session_db_path(user_data_path, session_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create session directory {}", parent.display()))?;
        }
        let db = Self::open(&path, true)?;
        db.conn
            .lock()
            .unwrap()
            .execute_batch(SCHEMA)
            .context("create session schema")?;
        Ok(db)
    }

    /// Attach to an existing session database. Worker side; fails when the
    /// coordinator never created the session.
    pub fn attach(user_data_path: &Path, session_id: &str) -> Result<Self> {
        let path = session_db_path(user_data_path, session_id);
        if !path.exists() {
            return Err(anyhow!("no session database at {}", path.display()));
        }
        Self::open(&path, false)
    }

    fn open(path: &Path, owner: bool) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open session database {}", path.display()))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .context("enable WAL on session database")?;
        conn.busy_timeout(SESSION_BUSY_TIMEOUT)
            .context("set session busy timeout")?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
            owner,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl WorkChannel for SessionDb {
    fn load_commands(&self, commands: Vec<IndexerCommand>) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin load transaction")?;
        {
            let mut stmt = tx
                .prepare("INSERT INTO commands (path, data) VALUES (?1, ?2)")
                .context("prepare command insert")?;
            for command in &commands {
                let data = serde_json::to_string(command).context("serialize command")?;
                let path = command.source_path.to_string_lossy();
                stmt.execute(params![path.as_ref(), data])
                    .context("insert command")?;
            }
        }
        tx.commit().context("commit command load")
    }

    fn pop_command(&self) -> Result<Option<IndexerCommand>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin pop transaction")?;
        let row: Option<(i64, String)> = tx
            .query_row("SELECT id, data FROM commands LIMIT 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()
            .context("select next command")?;
        let Some((id, data)) = row else {
            return Ok(None);
        };
        tx.execute("DELETE FROM commands WHERE id = ?1", params![id])
            .context("delete consumed command")?;
        tx.commit().context("commit command pop")?;
        let command = serde_json::from_str(&data).context("deserialize command")?;
        Ok(Some(command))
    }

    fn queue_len(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM commands", [], |row| row.get(0))
            .context("count commands")?;
        Ok(count.max(0) as usize)
    }

    fn clear_queue(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM commands", [])
            .context("clear command queue")?;
        Ok(())
    }

    fn push_fragment(&self, slot: SlotId, fragment: &GraphFragment) -> Result<()> {
        let data = serde_json::to_string(fragment).context("serialize fragment")?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO fragments (slot, data) VALUES (?1, ?2)",
            params![slot, data],
        )
        .context("insert fragment")?;
        Ok(())
    }

    fn pop_fragment(&self, slot: SlotId) -> Result<Option<GraphFragment>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin fragment pop")?;
        let row: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, data FROM fragments WHERE slot = ?1 ORDER BY id LIMIT 1",
                params![slot],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("select next fragment")?;
        let Some((id, data)) = row else {
            return Ok(None);
        };
        tx.execute("DELETE FROM fragments WHERE id = ?1", params![id])
            .context("delete popped fragment")?;
        tx.commit().context("commit fragment pop")?;
        let fragment = serde_json::from_str(&data).context("deserialize fragment")?;
        Ok(Some(fragment))
    }

    fn start_indexing_file(&self, slot: SlotId, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin heartbeat transaction")?;
        let stale: Option<String> = tx
            .query_row(
                "SELECT path FROM heartbeats WHERE slot = ?1",
                params![slot],
                |row| row.get(0),
            )
            .optional()
            .context("read stale heartbeat")?;
        if let Some(stale) = stale {
            tx.execute("INSERT INTO crashed (path) VALUES (?1)", params![stale])
                .context("record crashed file")?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO heartbeats (slot, path) VALUES (?1, ?2)",
            params![slot, path_str.as_ref()],
        )
        .context("write heartbeat")?;
        tx.execute(
            "INSERT INTO announced (path) VALUES (?1)",
            params![path_str.as_ref()],
        )
        .context("announce file")?;
        tx.commit().context("commit heartbeat")
    }

    fn finish_indexing_file(&self, slot: SlotId) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin finish transaction")?;
        tx.execute("DELETE FROM heartbeats WHERE slot = ?1", params![slot])
            .context("clear heartbeat")?;
        tx.execute("INSERT INTO finished (slot) VALUES (?1)", params![slot])
            .context("signal finished slot")?;
        tx.commit().context("commit finish")
    }

    fn take_announced_files(&self) -> Result<Vec<PathBuf>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin announced drain")?;
        let paths: Vec<PathBuf> = {
            let mut stmt = tx
                .prepare("SELECT path FROM announced ORDER BY id")
                .context("prepare announced select")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .context("read announced files")?;
            let mut paths = Vec::new();
            for row in rows {
                paths.push(PathBuf::from(row.context("announced row")?));
            }
            paths
        };
        tx.execute("DELETE FROM announced", [])
            .context("clear announced files")?;
        tx.commit().context("commit announced drain")?;
        Ok(paths)
    }

    fn next_finished_slot(&self) -> Result<Option<SlotId>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin finished pop")?;
        let row: Option<(i64, SlotId)> = tx
            .query_row(
                "SELECT id, slot FROM finished ORDER BY id LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("select finished slot")?;
        let Some((id, slot)) = row else {
            return Ok(None);
        };
        tx.execute("DELETE FROM finished WHERE id = ?1", params![id])
            .context("delete finished signal")?;
        tx.commit().context("commit finished pop")?;
        Ok(Some(slot))
    }

    fn record_crashed(&self, slot: SlotId) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin crash record")?;
        let path: Option<String> = tx
            .query_row(
                "SELECT path FROM heartbeats WHERE slot = ?1",
                params![slot],
                |row| row.get(0),
            )
            .optional()
            .context("read heartbeat of dead slot")?;
        if let Some(path) = path {
            tx.execute("DELETE FROM heartbeats WHERE slot = ?1", params![slot])
                .context("clear dead heartbeat")?;
            tx.execute("INSERT INTO crashed (path) VALUES (?1)", params![path])
                .context("record crashed file")?;
        }
        tx.commit().context("commit crash record")
    }

    fn take_crashed_files(&self) -> Result<Vec<PathBuf>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin crashed drain")?;
        let mut paths = Vec::new();
        {
            let mut stmt = tx
                .prepare("SELECT path FROM crashed ORDER BY id")
                .context("prepare crashed select")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .context("read crashed files")?;
            for row in rows {
                paths.push(PathBuf::from(row.context("crashed row")?));
            }
            let mut stmt = tx
                .prepare("SELECT path FROM heartbeats")
                .context("prepare heartbeat sweep")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .context("read remaining heartbeats")?;
            for row in rows {
                paths.push(PathBuf::from(row.context("heartbeat row")?));
            }
        }
        tx.execute("DELETE FROM crashed", [])
            .context("clear crashed files")?;
        tx.execute("DELETE FROM heartbeats", [])
            .context("clear remaining heartbeats")?;
        tx.commit().context("commit crashed drain")?;
        Ok(paths)
    }

    fn set_interrupted(&self, interrupted: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO flags (key, value) VALUES ('interrupted', ?1)",
            params![interrupted as i64],
        )
        .context("set interrupt flag")?;
        Ok(())
    }

    fn interrupted(&self) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM flags WHERE key = 'interrupted'",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("read interrupt flag")?;
        Ok(value.unwrap_or(0) != 0)
    }
}

impl Drop for SessionDb {
    fn drop(&mut self) {
        if !self.owner {
            return;
        }
        // Run-scoped scratch; must not accumulate under the user data path.
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parent = self.path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let _ = std::fs::remove_file(&self.path);
        let _ = std::fs::remove_file(parent.join(format!("{file_name}-wal")));
        let _ = std::fs::remove_file(parent.join(format!("{file_name}-shm")));
    }
}
