//! Cooperative task engine: state-machine tasks, combinators, and the
//! scheduler that ticks one root task at a time.
//!
//! Tasks never block inside `update`; a long wait is expressed as returning
//! [`TaskState::Running`] and trying again next tick. Real parallelism lives
//! inside leaf tasks (the orchestrator spawns worker threads/processes); the
//! engine itself is single-threaded polling.

pub mod context;
pub mod group;

pub use context::{RunContext, RunState};
pub use group::{Lambda, Parallel, RepeatWhileSuccess, Selector, Sequence, SucceedIf};

use crossbeam_channel::{Receiver, Sender, unbounded};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;

use crate::utils::config::SCHEDULER_TICK;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Success,
    Failure,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Running)
    }
}

/// A node in the run's state machine. The engine guarantees `enter` is called
/// once before the first `update`, and `exit` once after the terminal
/// `update`. `reset` rewinds a finished task so it can run again (repeat
/// loops). `terminate` is a best-effort hard stop used when a task panicked
/// out of the tree.
pub trait Task: Send {
    fn enter(&mut self, _ctx: &RunContext) {}
    fn update(&mut self, ctx: &RunContext) -> TaskState;
    fn exit(&mut self, _ctx: &RunContext) {}
    fn reset(&mut self, _ctx: &RunContext) {}
    fn terminate(&mut self) {}
}

/// Drives one task through its enter/update/exit lifecycle. Combinators hold
/// their children wrapped in runners so the lifecycle contract holds at every
/// level of the tree.
pub struct TaskRunner {
    task: Box<dyn Task>,
    entered: bool,
    finished: Option<TaskState>,
}

impl TaskRunner {
    pub fn new(task: Box<dyn Task>) -> Self {
        Self {
            task,
            entered: false,
            finished: None,
        }
    }

    /// Tick the task once. Idempotent after a terminal state.
    pub fn update(&mut self, ctx: &RunContext) -> TaskState {
        if let Some(state) = self.finished {
            return state;
        }
        if !self.entered {
            self.task.enter(ctx);
            self.entered = true;
        }
        let state = self.task.update(ctx);
        if state.is_terminal() {
            self.task.exit(ctx);
            self.finished = Some(state);
        }
        state
    }

    /// Rewind so the task can run again from `enter`.
    pub fn reset(&mut self, ctx: &RunContext) {
        self.task.reset(ctx);
        self.entered = false;
        self.finished = None;
    }

    pub fn terminate(&mut self) {
        self.task.terminate();
    }

    pub fn finished_state(&self) -> Option<TaskState> {
        self.finished
    }
}

struct QueuedRun {
    task: Box<dyn Task>,
    ctx: RunContext,
}

/// Runs root tasks one at a time on a dedicated thread, polling with a short
/// fixed sleep between ticks. An explicit instance owned by the application;
/// anything that needs to enqueue work gets a handle.
pub struct TaskScheduler {
    tx: Sender<QueuedRun>,
    rx: Receiver<QueuedRun>,
    loop_running: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskScheduler {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            loop_running: Arc::new(AtomicBool::new(false)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
            handle: None,
        }
    }

    /// Enqueue a root task with the context for its run. The task starts when
    /// the loop reaches it; one root runs to completion before the next
    /// starts.
    pub fn push_task(&self, task: Box<dyn Task>, ctx: RunContext) {
        self.active.fetch_add(1, Ordering::SeqCst);
        // Send fails only when the scheduler was dropped mid-push.
        if self.tx.send(QueuedRun { task, ctx }).is_err() {
            self.active.fetch_sub(1, Ordering::SeqCst);
            log::warn!("task dropped: scheduler loop is gone");
        }
    }

    /// True while any root task is queued or mid-run.
    pub fn has_tasks_queued(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }

    pub fn loop_is_running(&self) -> bool {
        self.loop_running.load(Ordering::SeqCst)
    }

    /// Start the scheduler loop on its own thread.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        self.loop_running.store(true, Ordering::SeqCst);

        let rx = self.rx.clone();
        let loop_running = Arc::clone(&self.loop_running);
        let stop_requested = Arc::clone(&self.stop_requested);
        let active = Arc::clone(&self.active);

        self.handle = Some(std::thread::spawn(move || {
            while !stop_requested.load(Ordering::SeqCst) {
                match rx.recv_timeout(SCHEDULER_TICK) {
                    Ok(run) => {
                        Self::run_to_completion(run, &stop_requested);
                        active.fetch_sub(1, Ordering::SeqCst);
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            }
            loop_running.store(false, Ordering::SeqCst);
        }));
    }

    fn run_to_completion(run: QueuedRun, stop_requested: &AtomicBool) {
        let QueuedRun { task, ctx } = run;
        let mut runner = TaskRunner::new(task);
        loop {
            let state = std::panic::catch_unwind(AssertUnwindSafe(|| runner.update(&ctx)));
            match state {
                Ok(state) if state.is_terminal() => break,
                Ok(_) => {}
                Err(_) => {
                    // A task panicked out of the tree: hard-stop whatever it
                    // still owns and drop the run.
                    log::error!("task panicked; terminating run");
                    runner.terminate();
                    break;
                }
            }
            if stop_requested.load(Ordering::SeqCst) {
                runner.terminate();
                break;
            }
            std::thread::sleep(SCHEDULER_TICK);
        }
    }

    /// Stop the loop after the current tick. The in-flight root task is
    /// terminated, queued ones are dropped.
    pub fn stop(&mut self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        // Drain anything still queued so has_tasks_queued settles.
        while self.rx.try_recv().is_ok() {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Block until no root task is queued or running. For CLI use after
    /// pushing a run.
    pub fn wait_idle(&self) {
        while self.has_tasks_queued() {
            std::thread::sleep(SCHEDULER_TICK);
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
