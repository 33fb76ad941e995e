//! Shared execution context for one pipeline run.
//!
//! The run-scoped values are a fixed, known set, so they live in a plain
//! struct behind one mutex instead of a dynamically-typed key/value store:
//! readers and writers cannot disagree about a value's type, and conditional
//! tasks take closures over [`RunState`] instead of string keys.

use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Mutable state shared by every task in one run's tree. Accesses are short
/// get/set operations; the lock is never held across a worker spawn or a
/// merge.
#[derive(Debug, Default)]
pub struct RunState {
    /// Total files selected for indexing in this run.
    pub source_file_count: usize,
    /// Fragments merged into the pending queue so far.
    pub indexed_file_count: usize,
    /// Fatal per-file errors observed so far.
    pub error_count: usize,
    /// Cooperative interruption flag. Set by the caller; workers finish their
    /// in-flight command and observe an empty queue.
    pub interrupted: bool,
    /// Worker slots have been spawned.
    pub indexer_threads_started: bool,
    /// All worker slots have retired.
    pub indexer_threads_stopped: bool,
    /// The shared command queue has been loaded.
    pub command_queue_started: bool,
    /// The shared command queue has drained to empty.
    pub command_queue_stopped: bool,
    /// Set when the run hit a fatal, non-recoverable condition.
    pub fatal: Option<String>,
    /// Start of the indexing phase, for the finished event.
    pub index_start: Option<Instant>,
}

/// Handle to the shared state; cheap to clone into tasks and closures.
#[derive(Clone, Default)]
pub struct RunContext {
    state: Arc<Mutex<RunState>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read<T>(&self, f: impl FnOnce(&RunState) -> T) -> T {
        let state = self.state.lock().unwrap();
        f(&state)
    }

    pub fn update<T>(&self, f: impl FnOnce(&mut RunState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn interrupted(&self) -> bool {
        self.read(|s| s.interrupted)
    }

    pub fn set_interrupted(&self) {
        self.update(|s| s.interrupted = true);
    }

    pub fn set_fatal(&self, message: impl Into<String>) {
        let message = message.into();
        log::error!("{message}");
        self.update(|s| s.fatal = Some(message));
    }
}
