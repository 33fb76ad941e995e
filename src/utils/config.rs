//! Application configuration constants.
//! Tuning and thresholds in one place.

use std::sync::OnceLock;
use std::time::Duration;

// ---- Package / paths (from CARGO_PKG_NAME, cached) ----

/// Package-derived names: built once from `CARGO_PKG_NAME`, then cached.
pub struct PackagePaths {
    pkg_name: &'static str,
    session_dir_name: String,
}

static PACKAGE_PATHS: OnceLock<PackagePaths> = OnceLock::new();

impl PackagePaths {
    /// Build and cache names from `CARGO_PKG_NAME`. Called once on first use.
    pub fn get() -> &'static PackagePaths {
        PACKAGE_PATHS.get_or_init(|| {
            let pkg = env!("CARGO_PKG_NAME");
            PackagePaths {
                pkg_name: pkg,
                session_dir_name: format!(".{pkg}_sessions"),
            }
        })
    }

    pub fn pkg_name(&self) -> &str {
        self.pkg_name
    }

    /// Directory (under the user data path) holding per-run session databases.
    pub fn session_dir_name(&self) -> &str {
        &self.session_dir_name
    }
}

// ---- Durable store file conventions ----

/// Extension of the durable index store.
pub const STORE_SUFFIX: &str = ".db";
/// Extension of the in-flight temporary copy the run writes into.
pub const STORE_TEMP_SUFFIX: &str = ".db_tmp";
/// Extension of the bookmark companion store. Never touched by indexing.
pub const STORE_BOOKMARK_SUFFIX: &str = ".bookmarks";

// ---- Scheduler / task engine ----

/// Sleep between scheduler ticks while a root task is running.
pub const SCHEDULER_TICK: Duration = Duration::from_millis(10);
/// Sleep between iterations of flag-polling repeat loops.
pub const REPEAT_POLL_INTERVAL: Duration = Duration::from_millis(25);
/// Sleep between iterations of the merge-drain repeat loop.
pub const MERGE_POLL_INTERVAL: Duration = Duration::from_millis(250);

// ---- Work distribution ----

/// Time box for draining worker results in one orchestrator tick. Bounds the
/// tick so progress reporting is never starved by a result backlog.
pub const RESULT_DRAIN_SLICE: Duration = Duration::from_millis(500);
/// Pending-fragment queue length above which the orchestrator pauses
/// draining until the merge pipeline catches up.
pub const PENDING_FRAGMENT_THRESHOLD: usize = 10;
/// Pause applied while the pending-fragment queue is over the threshold.
pub const BACKPRESSURE_PAUSE: Duration = Duration::from_millis(100);
/// Delay before a crashed worker slot is respawned.
pub const RESPAWN_DELAY: Duration = Duration::from_millis(200);
/// Respawn budget per worker slot. Exhausting it fails the run instead of
/// retrying forever.
pub const MAX_RESPAWNS_PER_SLOT: u32 = 3;
/// Fallback worker count when none is configured and the parallelism probe
/// fails.
pub const FALLBACK_WORKER_COUNT: usize = 4;

// ---- Database ----

/// SQLite busy timeout for session databases shared across processes.
pub const SESSION_BUSY_TIMEOUT: Duration = Duration::from_millis(10_000);

// ---- Fingerprinting ----

/// Files at or above this size get a blake3 content hash in their
/// fingerprint, so a touched-but-unchanged file is not re-indexed. Smaller
/// files are cheap to re-index and compare by mtime/size only.
pub const CONTENT_HASH_THRESHOLD: u64 = 4 * 1024; // 4 KB
