//! In-process transport for the lighter thread mode: plain locked structures
//! plus an unbounded channel for finish signals.

use crossbeam_channel::{Receiver, Sender, unbounded};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use super::WorkChannel;
use crate::queue::IndexerCommand;
use crate::storage::fragment::GraphFragment;
use crate::{Result, SlotId};

pub struct MemoryChannel {
    queue: Mutex<VecDeque<IndexerCommand>>,
    fragments: Vec<Mutex<VecDeque<GraphFragment>>>,
    heartbeats: Mutex<HashMap<SlotId, PathBuf>>,
    announced: Mutex<VecDeque<PathBuf>>,
    crashed: Mutex<Vec<PathBuf>>,
    finished_tx: Sender<SlotId>,
    finished_rx: Receiver<SlotId>,
    interrupted: AtomicBool,
}

impl MemoryChannel {
    /// `slot_count` worker slots; index 0 stays reserved for the coordinator.
    pub fn new(slot_count: usize) -> Self {
        let (finished_tx, finished_rx) = unbounded();
        Self {
            queue: Mutex::new(VecDeque::new()),
            fragments: (0..=slot_count).map(|_| Mutex::new(VecDeque::new())).collect(),
            heartbeats: Mutex::new(HashMap::new()),
            announced: Mutex::new(VecDeque::new()),
            crashed: Mutex::new(Vec::new()),
            finished_tx,
            finished_rx,
            interrupted: AtomicBool::new(false),
        }
    }

    fn slot_fragments(&self, slot: SlotId) -> Result<&Mutex<VecDeque<GraphFragment>>> {
        self.fragments
            .get(slot as usize)
            .ok_or_else(|| anyhow::anyhow!("slot {slot} out of range"))
    }
}

impl WorkChannel for MemoryChannel {
    fn load_commands(&self, commands: Vec<IndexerCommand>) -> Result<()> {
        let mut queue = self.queue.lock().unwrap();
        queue.extend(commands);
        Ok(())
    }

    fn pop_command(&self) -> Result<Option<IndexerCommand>> {
        Ok(self.queue.lock().unwrap().pop_front())
    }

    fn queue_len(&self) -> Result<usize> {
        Ok(self.queue.lock().unwrap().len())
    }

    fn clear_queue(&self) -> Result<()> {
        self.queue.lock().unwrap().clear();
        Ok(())
    }

    fn push_fragment(&self, slot: SlotId, fragment: &GraphFragment) -> Result<()> {
        self.slot_fragments(slot)?
            .lock()
            .unwrap()
            .push_back(fragment.clone());
        Ok(())
    }

    fn pop_fragment(&self, slot: SlotId) -> Result<Option<GraphFragment>> {
        Ok(self.slot_fragments(slot)?.lock().unwrap().pop_front())
    }

    fn start_indexing_file(&self, slot: SlotId, path: &Path) -> Result<()> {
        let mut heartbeats = self.heartbeats.lock().unwrap();
        if let Some(stale) = heartbeats.insert(slot, path.to_path_buf()) {
            // The slot died mid-file and reattached: the stale heartbeat is a
            // crash, never a silent drop.
            self.crashed.lock().unwrap().push(stale);
        }
        self.announced.lock().unwrap().push_back(path.to_path_buf());
        Ok(())
    }

    fn finish_indexing_file(&self, slot: SlotId) -> Result<()> {
        self.heartbeats.lock().unwrap().remove(&slot);
        let _ = self.finished_tx.send(slot);
        Ok(())
    }

    fn take_announced_files(&self) -> Result<Vec<PathBuf>> {
        let mut announced = self.announced.lock().unwrap();
        Ok(announced.drain(..).collect())
    }

    fn next_finished_slot(&self) -> Result<Option<SlotId>> {
        Ok(self.finished_rx.try_recv().ok())
    }

    fn record_crashed(&self, slot: SlotId) -> Result<()> {
        if let Some(path) = self.heartbeats.lock().unwrap().remove(&slot) {
            self.crashed.lock().unwrap().push(path);
        }
        Ok(())
    }

    fn take_crashed_files(&self) -> Result<Vec<PathBuf>> {
        let mut crashed: Vec<PathBuf> = self.crashed.lock().unwrap().drain(..).collect();
        let mut heartbeats = self.heartbeats.lock().unwrap();
        crashed.extend(heartbeats.drain().map(|(_, path)| path));
        Ok(crashed)
    }

    fn set_interrupted(&self, interrupted: bool) -> Result<()> {
        self.interrupted.store(interrupted, Ordering::SeqCst);
        Ok(())
    }

    fn interrupted(&self) -> Result<bool> {
        Ok(self.interrupted.load(Ordering::SeqCst))
    }
}
