//! Interprocess work distribution: a shared command queue, per-slot result
//! channels and per-slot status records behind one transport-agnostic trait.
//!
//! The orchestrator and the workers never know which transport they are on:
//! [`memory::MemoryChannel`] backs the in-process thread mode,
//! [`session::SessionDb`] backs the multi-process mode with a per-run SQLite
//! session database whose locking provides the cross-process mutual
//! exclusion.

pub mod memory;
pub mod session;

use std::path::{Path, PathBuf};

use crate::queue::IndexerCommand;
use crate::storage::fragment::GraphFragment;
use crate::{Result, SlotId};

/// Shared state of one indexing run, seen by the coordinator (slot 0) and by
/// every worker slot.
///
/// Command consumption is atomic pop-and-remove: each command is delivered to
/// exactly one consumer. Heartbeats implement crash accounting: starting a
/// new file while the slot still has a heartbeat promotes the stale file to
/// the crashed list (the worker died mid-file and was respawned), and
/// [`WorkChannel::take_crashed_files`] additionally sweeps heartbeats left
/// behind by slots that never came back.
pub trait WorkChannel: Send + Sync {
    // --- command queue ---
    fn load_commands(&self, commands: Vec<IndexerCommand>) -> Result<()>;
    fn pop_command(&self) -> Result<Option<IndexerCommand>>;
    fn queue_len(&self) -> Result<usize>;
    fn clear_queue(&self) -> Result<()>;

    // --- per-slot result channels ---
    fn push_fragment(&self, slot: SlotId, fragment: &GraphFragment) -> Result<()>;
    fn pop_fragment(&self, slot: SlotId) -> Result<Option<GraphFragment>>;

    // --- status records ---
    /// Record "slot is now processing `path`". Announces the file for
    /// progress reporting; a stale heartbeat for the slot is promoted to the
    /// crashed list.
    fn start_indexing_file(&self, slot: SlotId, path: &Path) -> Result<()>;
    /// Clear the slot's heartbeat and signal a finished batch for the slot.
    fn finish_indexing_file(&self, slot: SlotId) -> Result<()>;
    /// Drain the announced-file queue (progress reporting).
    fn take_announced_files(&self) -> Result<Vec<PathBuf>>;
    /// Next slot with results ready, in finish order.
    fn next_finished_slot(&self) -> Result<Option<SlotId>>;
    /// Promote the slot's current heartbeat (if any) to the crashed list.
    /// Called by the supervisor when a worker process died.
    fn record_crashed(&self, slot: SlotId) -> Result<()>;
    /// Crashed files recorded so far plus any heartbeat still standing;
    /// clears both. Called once when the run winds down.
    fn take_crashed_files(&self) -> Result<Vec<PathBuf>>;

    // --- interruption ---
    fn set_interrupted(&self, interrupted: bool) -> Result<()>;
    fn interrupted(&self) -> Result<bool>;
}
