//! Symdex: source-code indexing orchestration engine.
//!
//! Turns a set of source files into a persisted cross-reference index
//! (symbols, references, locations). Parsing is delegated to per-language
//! [`FileIndexer`](crate::indexer::FileIndexer) frontends; this crate owns the
//! hard part: scheduling the work, distributing it across worker processes or
//! threads, surviving worker crashes without losing queued files, deciding
//! what an incremental refresh must redo, and merging results into the store
//! under an atomic temp-swap discipline.

pub mod channel;
pub mod cli;
pub mod indexer;
pub mod orchestrator;
pub mod project;
pub mod queue;
pub mod refresh;
pub mod source_group;
pub mod status;
pub mod storage;
pub mod task;
pub mod utils;
pub mod worker;

pub use queue::{CommandProvider, IndexerCommand};
pub use refresh::{RefreshInfo, RefreshMode};
pub use status::{PartialResultDecision, StatusEvent, StatusReporter};
pub use storage::fragment::{Fingerprint, GraphFragment};

/// Result alias used by the public symdex API
pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Worker slot identity within one run. Slot 0 is reserved for the
/// coordinator; workers are numbered 1..=N.
pub type SlotId = u32;
