//! Durable cross-reference store and the merge pipeline around it.
//!
//! A run never writes the live store: it targets a temporary copy that is
//! atomically swapped into place on success (or kept/discarded on the user's
//! decision after an interruption). A crash mid-run therefore cannot corrupt
//! existing data; at worst it leaves an orphaned temp store that the next
//! startup resolves.

pub mod fragment;

use anyhow::{Context, anyhow};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::Result;
use crate::status::{PartialResultDecision, StatusReporter};
use crate::utils::config::{STORE_BOOKMARK_SUFFIX, STORE_SUFFIX, STORE_TEMP_SUFFIX};
use crate::utils::fs::path_to_db_string;
use fragment::{Fingerprint, GraphFragment};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    path TEXT PRIMARY KEY,
    mtime_ns INTEGER NOT NULL,
    size INTEGER NOT NULL,
    content_hash BLOB,
    language TEXT NOT NULL,
    indexed INTEGER NOT NULL,
    complete INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS symbols (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    file TEXT NOT NULL,
    line INTEGER NOT NULL,
    col INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_symbols_file ON symbols(file);
CREATE INDEX IF NOT EXISTS idx_symbols_name ON symbols(name);
CREATE TABLE IF NOT EXISTS refs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    file TEXT NOT NULL,
    line INTEGER NOT NULL,
    col INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_refs_file ON refs(file);
CREATE INDEX IF NOT EXISTS idx_refs_symbol ON refs(symbol);
CREATE TABLE IF NOT EXISTS errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file TEXT NOT NULL,
    message TEXT NOT NULL,
    fatal INTEGER NOT NULL,
    line INTEGER NOT NULL,
    col INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_errors_file ON errors(file);
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// File layout of one project's persisted state: the durable store, its
/// in-flight temporary variant, and the bookmark companion (untouched by
/// indexing).
#[derive(Clone, Debug)]
pub struct StorePaths {
    pub db: PathBuf,
    pub temp: PathBuf,
    pub bookmarks: PathBuf,
}

impl StorePaths {
    /// Paths for a project `name` under `dir`.
    pub fn for_project(dir: &Path, name: &str) -> Self {
        Self {
            db: dir.join(format!("{name}{STORE_SUFFIX}")),
            temp: dir.join(format!("{name}{STORE_TEMP_SUFFIX}")),
            bookmarks: dir.join(format!("{name}{STORE_BOOKMARK_SUFFIX}")),
        }
    }
}

/// One stored file row, as the refresh decision engine sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredFileRecord {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    pub indexed: bool,
    pub complete: bool,
}

/// The durable store. One open connection, one writer: a fragment merge is a
/// single transaction and merges are serialized by the owner.
pub struct GraphStore {
    conn: Connection,
    path: PathBuf,
}

impl GraphStore {
    /// Open or create the store at `path` and apply WAL + schema.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open index store {}", path.display()))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .context("enable WAL")?;
        conn.execute_batch(
            r#"
            PRAGMA synchronous = NORMAL;
            PRAGMA journal_size_limit = 67108864;
            "#,
        )
        .context("set WAL pragmas")?;
        let store = Self {
            conn,
            path: path.to_path_buf(),
        };
        store.setup()?;
        Ok(store)
    }

    /// Apply the schema (idempotent). Lifecycle hook called at run start.
    pub fn setup(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA).context("create schema")
    }

    pub fn index_db_path(&self) -> &Path {
        &self.path
    }

    /// Merge one fragment in a single transaction. Order-independent across
    /// fragments: each source file appears in exactly one fragment per run.
    pub fn insert_fragment(&mut self, fragment: &GraphFragment) -> Result<()> {
        let tx = self.conn.transaction().context("begin merge transaction")?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR REPLACE INTO files \
                     (path, mtime_ns, size, content_hash, language, indexed, complete) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .context("prepare file upsert")?;
            for file in &fragment.files {
                stmt.execute(params![
                    path_to_db_string(&file.path),
                    file.fingerprint.mtime_ns,
                    file.fingerprint.size as i64,
                    file.fingerprint.content_hash.as_ref().map(|h| h.as_slice()),
                    file.language,
                    file.indexed as i64,
                    file.complete as i64,
                ])
                .context("upsert file record")?;
            }

            let mut stmt = tx
                .prepare("INSERT INTO symbols (name, kind, file, line, col) VALUES (?1, ?2, ?3, ?4, ?5)")
                .context("prepare symbol insert")?;
            for symbol in &fragment.symbols {
                stmt.execute(params![
                    symbol.name,
                    symbol.kind.as_str(),
                    path_to_db_string(&symbol.file),
                    symbol.line,
                    symbol.column,
                ])
                .context("insert symbol")?;
            }

            let mut stmt = tx
                .prepare("INSERT INTO refs (symbol, file, line, col) VALUES (?1, ?2, ?3, ?4)")
                .context("prepare reference insert")?;
            for reference in &fragment.references {
                stmt.execute(params![
                    reference.symbol,
                    path_to_db_string(&reference.file),
                    reference.line,
                    reference.column,
                ])
                .context("insert reference")?;
            }

            let mut stmt = tx
                .prepare("INSERT INTO errors (file, message, fatal, line, col) VALUES (?1, ?2, ?3, ?4, ?5)")
                .context("prepare error insert")?;
            for error in &fragment.errors {
                stmt.execute(params![
                    path_to_db_string(&error.file),
                    error.message,
                    error.fatal as i64,
                    error.line,
                    error.column,
                ])
                .context("insert error")?;
            }
        }
        tx.commit().context("commit merge transaction")
    }

    /// Remove the given files and everything recorded for them.
    pub fn clear_files(&mut self, paths: &[PathBuf]) -> Result<usize> {
        let tx = self.conn.transaction().context("begin clear transaction")?;
        let mut cleared = 0;
        {
            let mut file_stmt = tx
                .prepare("DELETE FROM files WHERE path = ?1")
                .context("prepare file delete")?;
            let mut symbol_stmt = tx
                .prepare("DELETE FROM symbols WHERE file = ?1")
                .context("prepare symbol delete")?;
            let mut ref_stmt = tx
                .prepare("DELETE FROM refs WHERE file = ?1")
                .context("prepare reference delete")?;
            let mut error_stmt = tx
                .prepare("DELETE FROM errors WHERE file = ?1")
                .context("prepare error delete")?;
            for path in paths {
                let key = path_to_db_string(path);
                cleared += file_stmt.execute([&key]).context("delete file record")?;
                symbol_stmt.execute([&key]).context("delete symbols")?;
                ref_stmt.execute([&key]).context("delete references")?;
                error_stmt.execute([&key]).context("delete errors")?;
            }
        }
        tx.commit().context("commit clear transaction")?;
        Ok(cleared)
    }

    /// All stored file rows, for the refresh decision engine.
    pub fn file_records(&self) -> Result<Vec<StoredFileRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path, mtime_ns, size, content_hash, indexed, complete FROM files")
            .context("prepare file record select")?;
        let rows = stmt
            .query_map([], |row| {
                let path: String = row.get(0)?;
                let mtime_ns: i64 = row.get(1)?;
                let size: i64 = row.get(2)?;
                let content_hash: Option<Vec<u8>> = row.get(3)?;
                let indexed: i64 = row.get(4)?;
                let complete: i64 = row.get(5)?;
                Ok(StoredFileRecord {
                    path: PathBuf::from(path),
                    fingerprint: Fingerprint {
                        mtime_ns,
                        size: size.max(0) as u64,
                        content_hash: content_hash.and_then(|h| h.try_into().ok()),
                    },
                    indexed: indexed != 0,
                    complete: complete != 0,
                })
            })
            .context("read file records")?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("file record row")?);
        }
        Ok(records)
    }

    /// Embedded project configuration text, used to detect configuration
    /// drift between runs.
    pub fn project_config_text(&self) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'project_config'",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("read project config text")
    }

    pub fn set_project_config_text(&self, text: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES ('project_config', ?1)",
                [text],
            )
            .context("store project config text")?;
        Ok(())
    }

    /// Reclaim WAL space and let SQLite refresh its planner statistics.
    /// Lifecycle hook called once after the last merge.
    pub fn optimize_memory(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA optimize;")
            .context("optimize store")?;
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .context("WAL checkpoint")?;
        Ok(())
    }

    /// Build lookup statistics for the reader side. Lifecycle hook called
    /// before the swapped-in store goes live.
    pub fn build_caches(&self) -> Result<()> {
        self.conn.execute_batch("ANALYZE;").context("analyze store")
    }

    pub fn file_count(&self) -> Result<usize> {
        self.count("files")
    }

    pub fn symbol_count(&self) -> Result<usize> {
        self.count("symbols")
    }

    pub fn reference_count(&self) -> Result<usize> {
        self.count("refs")
    }

    pub fn error_count(&self) -> Result<usize> {
        self.count("errors")
    }

    fn count(&self, table: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })
            .with_context(|| format!("count {table}"))?;
        Ok(count.max(0) as usize)
    }

    /// Digest of the stored graph content in a canonical order, ignoring row
    /// ids and timestamps. Equal digests mean equal index content; used to
    /// check that a repeated full reindex is byte-for-byte reproducible.
    pub fn content_digest(&self) -> Result<String> {
        let mut hasher = blake3::Hasher::new();
        let mut feed = |sql: &str| -> Result<()> {
            let mut stmt = self.conn.prepare(sql).context("prepare digest select")?;
            let mut rows = stmt.query([]).context("query digest rows")?;
            while let Some(row) = rows.next().context("digest row")? {
                let line: String = row.get(0).context("digest column")?;
                hasher.update(line.as_bytes());
                hasher.update(b"\n");
            }
            Ok(())
        };
        feed(
            "SELECT path || '|' || size || '|' || language || '|' || indexed || '|' || complete \
             FROM files ORDER BY path",
        )?;
        feed(
            "SELECT name || '|' || kind || '|' || file || '|' || line || '|' || col \
             FROM symbols ORDER BY file, line, col, name",
        )?;
        feed(
            "SELECT symbol || '|' || file || '|' || line || '|' || col \
             FROM refs ORDER BY file, line, col, symbol",
        )?;
        feed(
            "SELECT file || '|' || message || '|' || fatal || '|' || line || '|' || col \
             FROM errors ORDER BY file, line, col, message",
        )?;
        Ok(hasher.finalize().to_hex().to_string())
    }

    /// Copy this store's content into a new database file. Safe while WAL is
    /// active, unlike a filesystem copy.
    pub fn copy_to(&self, dest: &Path) -> Result<()> {
        let mut dest_conn = Connection::open(dest)
            .with_context(|| format!("open copy destination {}", dest.display()))?;
        let backup = rusqlite::backup::Backup::new(&self.conn, &mut dest_conn)
            .context("create store backup")?;
        backup
            .run_to_completion(100, std::time::Duration::from_millis(0), None)
            .context("run store backup")?;
        Ok(())
    }
}

fn remove_wal_and_shm(db_path: &Path) {
    let file_name = db_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = db_path.parent().unwrap_or(Path::new("."));
    let _ = std::fs::remove_file(parent.join(format!("{file_name}-wal")));
    let _ = std::fs::remove_file(parent.join(format!("{file_name}-shm")));
}

/// Prepare the temp store a run will write into. Removes a stale temp (with
/// its WAL/SHM leftovers); unless `fresh`, seeds it with a copy of the live
/// store so browsing state survives partial refreshes. A full reindex starts
/// empty: everything previously persisted is cleared anyway.
pub fn prepare_temp_store(paths: &StorePaths, fresh: bool) -> Result<()> {
    if paths.temp.exists() {
        remove_wal_and_shm(&paths.temp);
        std::fs::remove_file(&paths.temp)
            .with_context(|| format!("remove stale temp store {}", paths.temp.display()))?;
    }
    if !fresh && paths.db.exists() {
        let live = GraphStore::open(&paths.db)?;
        live.copy_to(&paths.temp).with_context(|| {
            format!(
                "seed temp store ({} -> {})",
                paths.db.display(),
                paths.temp.display()
            )
        })?;
    }
    Ok(())
}

/// Atomically promote the temp store: delete the prior store, rename temp to
/// final, clean up SQLite leftovers. The bookmark companion is untouched.
pub fn swap_temp_store(paths: &StorePaths) -> Result<()> {
    if !paths.temp.exists() {
        return Err(anyhow!(
            "no temp store to swap at {}",
            paths.temp.display()
        ));
    }
    if paths.db.exists() {
        remove_wal_and_shm(&paths.db);
        std::fs::remove_file(&paths.db)
            .with_context(|| format!("remove prior store {}", paths.db.display()))?;
    }
    std::fs::rename(&paths.temp, &paths.db).with_context(|| {
        format!(
            "atomic rename temp store to final path ({} -> {})",
            paths.temp.display(),
            paths.db.display()
        )
    })?;
    remove_wal_and_shm(&paths.temp);
    log::info!("switched to temporary indexing data");
    Ok(())
}

/// Discard the temp store; the prior store stays untouched.
pub fn discard_temp_store(paths: &StorePaths) -> Result<()> {
    if paths.temp.exists() {
        remove_wal_and_shm(&paths.temp);
        std::fs::remove_file(&paths.temp)
            .with_context(|| format!("discard temp store {}", paths.temp.display()))?;
        log::info!("discarded temporary indexing data");
    }
    Ok(())
}

/// Startup handling for a temp store orphaned by a dying coordinator: with no
/// live store it is promoted outright; with one, the reporter's blocking
/// confirmation decides keep or discard before the project loads.
pub fn resolve_orphaned_temp(paths: &StorePaths, reporter: &dyn StatusReporter) -> Result<()> {
    if !paths.temp.exists() {
        return Ok(());
    }
    if !paths.db.exists() {
        log::info!("promoting orphaned temp store: no persistent store found");
        return swap_temp_store(paths);
    }
    match reporter.confirm_keep_partial() {
        PartialResultDecision::Keep => {
            log::info!("keeping orphaned temp store on user's decision");
            swap_temp_store(paths)
        }
        PartialResultDecision::Discard => {
            log::info!("discarding orphaned temp store on user's decision");
            discard_temp_store(paths)
        }
    }
}

/// Pending-fragment queue between the result drain and the merge pipeline.
/// The orchestrator stops draining while `len()` is over the backpressure
/// threshold, bounding peak memory.
#[derive(Default)]
pub struct PendingFragments {
    queue: Mutex<VecDeque<GraphFragment>>,
}

impl PendingFragments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, fragment: GraphFragment) {
        self.queue.lock().unwrap().push_back(fragment);
    }

    pub fn pop(&self) -> Option<GraphFragment> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
