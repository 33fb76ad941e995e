//! Build-index orchestration: the leaf tasks that fill the shared queue,
//! supervise worker slots, drain results under backpressure, and merge
//! fragments into the temp store.
//!
//! Error policy: per-file errors and worker crashes are recovered locally and
//! never unwind the task tree. Infrastructure failures (worker executable
//! missing, channel/store broken, respawn budget exhausted) set the run's
//! fatal message and flip the interrupt flag; the run then winds down through
//! its normal terminal path so a finished event is always emitted and nothing
//! gets swapped into place.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::channel::WorkChannel;
use crate::indexer::FileIndexer;
use crate::queue::CommandProvider;
use crate::status::{StatusEvent, StatusReporter};
use crate::storage::fragment::{FileRecord, GraphFragment, IndexError};
use crate::storage::{GraphStore, PendingFragments};
use crate::task::{RunContext, Task, TaskState};
use crate::utils::config::{
    BACKPRESSURE_PAUSE, MAX_RESPAWNS_PER_SLOT, PENDING_FRAGMENT_THRESHOLD, RESPAWN_DELAY,
    RESULT_DRAIN_SLICE,
};
use crate::utils::process::kill_pid;
use crate::SlotId;

/// The store a run writes into, shared between the clean/inject/finish tasks.
/// Taken out (and thereby closed) before the swap renames the file.
pub type SharedStore = Arc<Mutex<Option<GraphStore>>>;

/// How worker slots are realized.
pub enum WorkerMode {
    /// Worker threads in this process. Lighter, no process isolation; a
    /// panicking indexer takes down only its slot thread.
    InProcess { indexer: Arc<dyn FileIndexer> },
    /// One OS process per slot, reattaching to the session database by id.
    /// Crash isolation across process boundaries.
    MultiProcess {
        worker_exe: PathBuf,
        session_id: String,
        app_path: PathBuf,
        user_data_path: PathBuf,
        log_file: Option<PathBuf>,
    },
}

pub struct BuildIndexParams {
    pub worker_count: usize,
    pub mode: WorkerMode,
    /// Respawn budget per slot; exhausting it fails the run instead of
    /// retrying forever.
    pub max_respawns_per_slot: u32,
}

impl BuildIndexParams {
    pub fn in_process(worker_count: usize, indexer: Arc<dyn FileIndexer>) -> Self {
        Self {
            worker_count,
            mode: WorkerMode::InProcess { indexer },
            max_respawns_per_slot: MAX_RESPAWNS_PER_SLOT,
        }
    }
}

/// Loads the command set into the shared queue, then reports the queue's
/// drain state through the run context. Succeeds when the queue has drained
/// (or was cleared by an interruption).
pub struct FillQueueTask {
    provider: Option<Box<dyn CommandProvider>>,
    channel: Arc<dyn WorkChannel>,
}

impl FillQueueTask {
    pub fn new(provider: Box<dyn CommandProvider>, channel: Arc<dyn WorkChannel>) -> Self {
        Self {
            provider: Some(provider),
            channel,
        }
    }
}

impl Task for FillQueueTask {
    fn enter(&mut self, ctx: &RunContext) {
        if let Some(provider) = self.provider.take() {
            let commands = provider.consume_all();
            log::info!("loading {} commands into the shared queue", commands.len());
            if let Err(err) = self.channel.load_commands(commands) {
                ctx.set_fatal(format!("cannot load command queue: {err:#}"));
                ctx.set_interrupted();
            }
        }
        ctx.update(|s| s.command_queue_started = true);
    }

    fn update(&mut self, ctx: &RunContext) -> TaskState {
        if ctx.interrupted() {
            // Workers finish their in-flight command, observe emptiness, and
            // exit.
            if let Err(err) = self.channel.clear_queue() {
                log::error!("cannot clear command queue: {err:#}");
            }
        }
        match self.channel.queue_len() {
            Ok(0) => {
                ctx.update(|s| s.command_queue_stopped = true);
                TaskState::Success
            }
            Ok(_) => TaskState::Running,
            Err(err) => {
                ctx.set_fatal(format!("cannot poll command queue: {err:#}"));
                ctx.set_interrupted();
                ctx.update(|s| s.command_queue_stopped = true);
                TaskState::Success
            }
        }
    }
}

/// Merges one pending fragment into the temp store. Succeeds when it merged
/// something, fails when the pending queue is empty; the enclosing
/// selector/repeat combination turns that into "merge while workers are
/// alive, then drain".
pub struct InjectFragmentTask {
    pending: Arc<PendingFragments>,
    store: SharedStore,
}

impl InjectFragmentTask {
    pub fn new(pending: Arc<PendingFragments>, store: SharedStore) -> Self {
        Self { pending, store }
    }
}

impl Task for InjectFragmentTask {
    fn update(&mut self, ctx: &RunContext) -> TaskState {
        let Some(fragment) = self.pending.pop() else {
            return TaskState::Failure;
        };
        let fatal_errors = fragment.fatal_error_count();
        let mut store = self.store.lock().unwrap();
        let Some(store) = store.as_mut() else {
            ctx.set_fatal("temp store is gone while fragments were pending");
            return TaskState::Failure;
        };
        if let Err(err) = store.insert_fragment(&fragment) {
            ctx.set_fatal(format!("cannot merge fragment into temp store: {err:#}"));
            ctx.set_interrupted();
            return TaskState::Failure;
        }
        if fatal_errors > 0 {
            ctx.update(|s| s.error_count += fatal_errors);
        }
        TaskState::Success
    }
}

/// Clears the files a refresh invalidated from the temp store, before any
/// indexing starts.
pub struct CleanStorageTask {
    store: SharedStore,
    files: Vec<PathBuf>,
    reporter: Arc<dyn StatusReporter>,
}

impl CleanStorageTask {
    pub fn new(store: SharedStore, files: Vec<PathBuf>, reporter: Arc<dyn StatusReporter>) -> Self {
        Self {
            store,
            files,
            reporter,
        }
    }
}

impl Task for CleanStorageTask {
    fn update(&mut self, ctx: &RunContext) -> TaskState {
        if self.files.is_empty() {
            return TaskState::Success;
        }
        self.reporter.report(StatusEvent::ClearingStarted {
            file_count: self.files.len(),
        });
        let mut store = self.store.lock().unwrap();
        let Some(store) = store.as_mut() else {
            ctx.set_fatal("temp store is gone before clearing");
            return TaskState::Failure;
        };
        match store.clear_files(&self.files) {
            Ok(cleared) => {
                log::info!("cleared {cleared} files from temp store");
                TaskState::Success
            }
            Err(err) => {
                ctx.set_fatal(format!("cannot clear files from temp store: {err:#}"));
                ctx.set_interrupted();
                TaskState::Success
            }
        }
    }
}

/// Spawns and supervises the worker slots, polls their status records,
/// drains result channels under backpressure, and accounts for crashes.
pub struct BuildIndexTask {
    params: BuildIndexParams,
    channel: Arc<dyn WorkChannel>,
    pending: Arc<PendingFragments>,
    reporter: Arc<dyn StatusReporter>,
    handles: Vec<JoinHandle<()>>,
    running_slots: Arc<AtomicUsize>,
    terminated: Arc<AtomicBool>,
    child_pids: Arc<Mutex<HashMap<SlotId, u32>>>,
}

impl BuildIndexTask {
    pub fn new(
        params: BuildIndexParams,
        channel: Arc<dyn WorkChannel>,
        pending: Arc<PendingFragments>,
        reporter: Arc<dyn StatusReporter>,
    ) -> Self {
        Self {
            params,
            channel,
            pending,
            reporter,
            handles: Vec::new(),
            running_slots: Arc::new(AtomicUsize::new(0)),
            terminated: Arc::new(AtomicBool::new(false)),
            child_pids: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn spawn_slot(&mut self, slot: SlotId, ctx: &RunContext) {
        self.running_slots.fetch_add(1, Ordering::SeqCst);
        let running_slots = Arc::clone(&self.running_slots);
        let terminated = Arc::clone(&self.terminated);
        let channel = Arc::clone(&self.channel);
        let ctx = ctx.clone();
        let max_respawns = self.params.max_respawns_per_slot;

        let handle = match &self.params.mode {
            WorkerMode::InProcess { indexer } => {
                let indexer = Arc::clone(indexer);
                std::thread::spawn(move || {
                    supervise_thread_slot(slot, channel, indexer, ctx, terminated, max_respawns);
                    running_slots.fetch_sub(1, Ordering::SeqCst);
                })
            }
            WorkerMode::MultiProcess {
                worker_exe,
                session_id,
                app_path,
                user_data_path,
                log_file,
            } => {
                let worker_exe = worker_exe.clone();
                let session_id = session_id.clone();
                let app_path = app_path.clone();
                let user_data_path = user_data_path.clone();
                let log_file = log_file.clone();
                let child_pids = Arc::clone(&self.child_pids);
                std::thread::spawn(move || {
                    supervise_process_slot(ProcessSlot {
                        slot,
                        channel,
                        ctx,
                        terminated,
                        max_respawns,
                        worker_exe,
                        session_id,
                        app_path,
                        user_data_path,
                        log_file,
                        child_pids,
                    });
                    running_slots.fetch_sub(1, Ordering::SeqCst);
                })
            }
        };
        self.handles.push(handle);
    }

    /// Forward announced files to the reporter as per-file progress.
    fn report_progress(&self, ctx: &RunContext) {
        let announced = match self.channel.take_announced_files() {
            Ok(paths) => paths,
            Err(err) => {
                log::warn!("cannot read status records: {err:#}");
                return;
            }
        };
        if announced.is_empty() {
            return;
        }
        let (indexed, total) = ctx.read(|s| (s.indexed_file_count, s.source_file_count));
        for path in announced {
            self.reporter.report(StatusEvent::IndexingFile {
                path,
                indexed,
                total,
            });
        }
    }

    /// Drain result channels into the pending-merge queue, time-boxed so the
    /// tick never starves progress reporting, and paused entirely while the
    /// merge pipeline is backed up.
    fn fetch_fragments(&self, ctx: &RunContext) -> bool {
        if self.pending.len() > PENDING_FRAGMENT_THRESHOLD {
            log::debug!(
                "waiting, too many fragments queued: {}",
                self.pending.len()
            );
            std::thread::sleep(BACKPRESSURE_PAUSE);
            return false;
        }

        let started = Instant::now();
        let mut popped = 0_usize;
        loop {
            let slot = match self.channel.next_finished_slot() {
                Ok(Some(slot)) => slot,
                Ok(None) => break,
                Err(err) => {
                    ctx.set_fatal(format!("cannot poll finished slots: {err:#}"));
                    ctx.set_interrupted();
                    break;
                }
            };
            match self.channel.pop_fragment(slot) {
                Ok(Some(fragment)) => {
                    self.pending.insert(fragment);
                    popped += 1;
                }
                Ok(None) => {}
                Err(err) => {
                    ctx.set_fatal(format!("cannot drain result channel: {err:#}"));
                    ctx.set_interrupted();
                    break;
                }
            }
            // Bounded slice per tick: leave room for status updates.
            if started.elapsed() >= RESULT_DRAIN_SLICE {
                break;
            }
        }

        if popped > 0 {
            ctx.update(|s| s.indexed_file_count += popped);
        }
        popped > 0
    }

    /// Sweep every result channel. Used on exit where finish signals may be
    /// missing for fragments pushed by a worker that crashed right after the
    /// push.
    fn drain_all_fragments(&self, ctx: &RunContext) {
        for slot in 1..=self.params.worker_count as SlotId {
            loop {
                match self.channel.pop_fragment(slot) {
                    Ok(Some(fragment)) => {
                        self.pending.insert(fragment);
                        ctx.update(|s| s.indexed_file_count += 1);
                    }
                    Ok(None) => break,
                    Err(err) => {
                        log::error!("cannot drain slot {slot}: {err:#}");
                        break;
                    }
                }
            }
        }
    }
}

impl Task for BuildIndexTask {
    fn enter(&mut self, ctx: &RunContext) {
        if let Err(err) = self.channel.set_interrupted(false) {
            ctx.set_fatal(format!("cannot reset interrupt flag: {err:#}"));
            ctx.set_interrupted();
            return;
        }

        // Launch failure is fatal for the run: no slots are spawned at all.
        if let WorkerMode::MultiProcess { worker_exe, .. } = &self.params.mode
            && !worker_exe.exists()
        {
            let message = format!(
                "cannot start indexer workers: executable missing at {}",
                worker_exe.display()
            );
            self.reporter.report(StatusEvent::Fatal {
                message: message.clone(),
            });
            ctx.set_fatal(message);
            ctx.set_interrupted();
            ctx.update(|s| s.indexer_threads_started = true);
            return;
        }

        for slot in 1..=self.params.worker_count as SlotId {
            self.spawn_slot(slot, ctx);
        }
        ctx.update(|s| s.indexer_threads_started = true);
        log::info!("started {} worker slots", self.params.worker_count);
    }

    fn update(&mut self, ctx: &RunContext) -> TaskState {
        self.report_progress(ctx);

        let running = self.running_slots.load(Ordering::SeqCst);
        let queue_stopped = ctx.read(|s| s.command_queue_stopped);

        if queue_stopped && running == 0 {
            log::info!("command queue stopped and no running slots. done.");
            return TaskState::Success;
        }
        if ctx.interrupted() {
            log::info!("interrupted indexing.");
            return TaskState::Success;
        }
        if running == 0 && !queue_stopped {
            // Every slot retired with work still queued: respawn budgets are
            // exhausted. Without workers the queue will never drain.
            let message = "all worker slots exhausted their respawn budget with work remaining";
            self.reporter.report(StatusEvent::Fatal {
                message: message.to_string(),
            });
            ctx.set_fatal(message);
            ctx.set_interrupted();
            if let Err(err) = self.channel.clear_queue() {
                log::error!("cannot clear command queue: {err:#}");
            }
            return TaskState::Success;
        }

        self.fetch_fragments(ctx);
        TaskState::Running
    }

    fn exit(&mut self, ctx: &RunContext) {
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }

        if !ctx.interrupted() {
            self.drain_all_fragments(ctx);
        }

        match self.channel.take_crashed_files() {
            Ok(crashed) if !crashed.is_empty() => {
                // Crash conservation: every file a dead worker held is
                // accounted for exactly once, as a fatal per-file error.
                let mut fragment = GraphFragment::new();
                for path in crashed {
                    log::info!("crashed while indexing: {}", path.display());
                    fragment.record_file(FileRecord {
                        path: path.clone(),
                        fingerprint: Default::default(),
                        language: String::new(),
                        indexed: true,
                        complete: false,
                    });
                    fragment.record_error(IndexError {
                        file: path,
                        message: "the indexer worker terminated unexpectedly while processing \
                                  this file"
                            .to_string(),
                        fatal: true,
                        line: 1,
                        column: 1,
                    });
                }
                self.pending.insert(fragment);
            }
            Ok(_) => {}
            Err(err) => log::error!("cannot collect crashed files: {err:#}"),
        }

        ctx.update(|s| s.indexer_threads_stopped = true);
    }

    fn terminate(&mut self) {
        self.terminated.store(true, Ordering::SeqCst);
        let _ = self.channel.set_interrupted(true);
        let _ = self.channel.clear_queue();
        let pids: Vec<u32> = self.child_pids.lock().unwrap().values().copied().collect();
        for pid in pids {
            kill_pid(pid);
        }
    }
}

fn supervise_thread_slot(
    slot: SlotId,
    channel: Arc<dyn WorkChannel>,
    indexer: Arc<dyn FileIndexer>,
    ctx: RunContext,
    terminated: Arc<AtomicBool>,
    max_respawns: u32,
) {
    let mut respawns = 0_u32;
    loop {
        if terminated.load(Ordering::SeqCst) || channel.interrupted().unwrap_or(true) {
            break;
        }
        let worker = crate::worker::IndexerWorker::new(
            slot,
            Arc::clone(&channel),
            Arc::clone(&indexer),
        );
        // One thread per attempt: a panic kills the attempt, the supervisor
        // accounts and respawns.
        let attempt = std::thread::spawn(move || worker.work());
        match attempt.join() {
            Ok(Ok(())) => break, // clean retire: queue observed empty
            Ok(Err(err)) => {
                log::error!("worker slot {slot} failed: {err:#}");
            }
            Err(_) => {
                log::error!("worker slot {slot} panicked");
            }
        }
        if let Err(err) = channel.record_crashed(slot) {
            log::error!("cannot record crash for slot {slot}: {err:#}");
        }
        if channel.queue_len().unwrap_or(0) == 0 || ctx.interrupted() {
            break;
        }
        respawns += 1;
        if respawns > max_respawns {
            log::error!("worker slot {slot} exhausted its respawn budget");
            break;
        }
        log::warn!("respawning worker slot {slot} (attempt {respawns})");
        std::thread::sleep(RESPAWN_DELAY);
    }
}

struct ProcessSlot {
    slot: SlotId,
    channel: Arc<dyn WorkChannel>,
    ctx: RunContext,
    terminated: Arc<AtomicBool>,
    max_respawns: u32,
    worker_exe: PathBuf,
    session_id: String,
    app_path: PathBuf,
    user_data_path: PathBuf,
    log_file: Option<PathBuf>,
    child_pids: Arc<Mutex<HashMap<SlotId, u32>>>,
}

fn supervise_process_slot(slot_cfg: ProcessSlot) {
    let ProcessSlot {
        slot,
        channel,
        ctx,
        terminated,
        max_respawns,
        worker_exe,
        session_id,
        app_path,
        user_data_path,
        log_file,
        child_pids,
    } = slot_cfg;

    let mut respawns = 0_u32;
    loop {
        if terminated.load(Ordering::SeqCst) || channel.interrupted().unwrap_or(true) {
            break;
        }

        let mut command = Command::new(&worker_exe);
        command
            .arg("worker")
            .arg(slot.to_string())
            .arg(&session_id)
            .arg(&app_path)
            .arg(&user_data_path);
        if let Some(log_file) = &log_file {
            command.arg(log_file);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let message = format!("cannot start worker process for slot {slot}: {err}");
                ctx.set_fatal(message);
                ctx.set_interrupted();
                let _ = channel.set_interrupted(true);
                let _ = channel.clear_queue();
                break;
            }
        };
        child_pids.lock().unwrap().insert(slot, child.id());
        let status = child.wait();
        child_pids.lock().unwrap().remove(&slot);

        let clean_exit = matches!(&status, Ok(status) if status.success());
        log::debug!("worker process {slot} returned ({status:?})");

        let queue_empty = channel.queue_len().unwrap_or(0) == 0;
        if clean_exit && queue_empty {
            break;
        }
        if channel.interrupted().unwrap_or(true) || ctx.interrupted() {
            break;
        }
        if !clean_exit {
            // Abnormal exit with work remaining: the in-flight file is
            // reclassified as crashed via its stale heartbeat; the slot
            // reattaches to the same session so no queued work is lost.
            if let Err(err) = channel.record_crashed(slot) {
                log::error!("cannot record crash for slot {slot}: {err:#}");
            }
            respawns += 1;
            if respawns > max_respawns {
                log::error!("worker slot {slot} exhausted its respawn budget");
                break;
            }
            log::warn!("respawning worker process {slot} (attempt {respawns})");
            std::thread::sleep(RESPAWN_DELAY);
        }
        // Clean exit with a non-empty queue: a race with the queue clearing;
        // loop around and let the next attempt observe the final state.
    }
}
