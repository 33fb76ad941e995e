//! Worker side of the run: pull commands, index, push fragments.
//!
//! The same loop serves both modes; only the channel implementation and the
//! crash isolation differ. A worker retires when it observes an empty queue,
//! which is also how cooperative interruption ends a run: the coordinator
//! clears the queue, workers finish their in-flight command and leave.

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;

use crate::channel::WorkChannel;
use crate::channel::session::SessionDb;
use crate::indexer::{FileIndexer, TokenIndexer};
use crate::utils::logger::setup_worker_logging;
use crate::{Result, SlotId};

pub struct IndexerWorker {
    slot: SlotId,
    channel: Arc<dyn WorkChannel>,
    indexer: Arc<dyn FileIndexer>,
}

impl IndexerWorker {
    pub fn new(slot: SlotId, channel: Arc<dyn WorkChannel>, indexer: Arc<dyn FileIndexer>) -> Self {
        Self {
            slot,
            channel,
            indexer,
        }
    }

    /// Work until the shared queue is observed empty (or cleared). Every
    /// consumed command is bracketed by a heartbeat, so a crash between
    /// heartbeat and completion is attributable to exactly one file.
    pub fn work(&self) -> Result<()> {
        loop {
            let Some(command) = self.channel.pop_command()? else {
                break;
            };
            self.channel
                .start_indexing_file(self.slot, &command.source_path)?;
            log::debug!(
                "slot {} indexing {}",
                self.slot,
                command.source_path.display()
            );
            let fragment = self.indexer.index_file(&command)?;
            self.channel.push_fragment(self.slot, &fragment)?;
            self.channel.finish_indexing_file(self.slot)?;
        }
        log::debug!("slot {} retiring: queue empty", self.slot);
        Ok(())
    }
}

/// Entry point for a worker process, invoked as
/// `symdex worker <slot> <session> <appPath> <userDataPath> [logFile]`.
/// Attaches to the session database named by the session id under the user
/// data path, works until the queue is empty, exits 0. The app path is
/// reserved for frontend resources and currently only logged.
pub fn run_worker_process(
    slot: SlotId,
    session_id: &str,
    app_path: &Path,
    user_data_path: &Path,
    log_file: Option<&Path>,
) -> Result<()> {
    setup_worker_logging(slot, log_file)?;
    log::debug!(
        "worker {slot} attaching to session {session_id} (app {})",
        app_path.display()
    );

    let channel = SessionDb::attach(user_data_path, session_id)
        .with_context(|| format!("attach worker {slot} to session {session_id}"))?;
    let worker = IndexerWorker::new(
        slot,
        Arc::new(channel),
        Arc::new(TokenIndexer::new()),
    );
    worker.work()
}
