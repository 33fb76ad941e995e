//! Task combinators: sequence, parallel, selector, repeat, and the small
//! leaves the pipeline is assembled from.

use std::time::{Duration, Instant};

use super::{RunContext, RunState, Task, TaskRunner, TaskState};

/// Runs children in order. Stops at the first non-success child and returns
/// its terminal state; succeeds only if every child succeeded.
pub struct Sequence {
    children: Vec<TaskRunner>,
    index: usize,
}

impl Sequence {
    pub fn new() -> Self {
        Self {
            children: Vec::new(),
            index: 0,
        }
    }

    pub fn add_task(mut self, task: Box<dyn Task>) -> Self {
        self.children.push(TaskRunner::new(task));
        self
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new()
    }
}

impl Task for Sequence {
    fn update(&mut self, ctx: &RunContext) -> TaskState {
        while self.index < self.children.len() {
            match self.children[self.index].update(ctx) {
                TaskState::Running => return TaskState::Running,
                TaskState::Success => self.index += 1,
                TaskState::Failure => return TaskState::Failure,
            }
        }
        TaskState::Success
    }

    fn reset(&mut self, ctx: &RunContext) {
        for child in &mut self.children {
            child.reset(ctx);
        }
        self.index = 0;
    }

    fn terminate(&mut self) {
        if self.index < self.children.len() {
            self.children[self.index].terminate();
        }
    }
}

/// Starts all children and polls each every tick. Completes when every
/// counted child reached a terminal state; succeeds only if all counted
/// children succeeded. Background children run "until the others finish":
/// their state is ignored and they are terminated once the counted set is
/// done.
pub struct Parallel {
    counted: Vec<TaskRunner>,
    background: Vec<TaskRunner>,
}

impl Parallel {
    pub fn new() -> Self {
        Self {
            counted: Vec::new(),
            background: Vec::new(),
        }
    }

    pub fn add_task(mut self, task: Box<dyn Task>) -> Self {
        self.counted.push(TaskRunner::new(task));
        self
    }

    pub fn add_background_task(mut self, task: Box<dyn Task>) -> Self {
        self.background.push(TaskRunner::new(task));
        self
    }
}

impl Default for Parallel {
    fn default() -> Self {
        Self::new()
    }
}

impl Task for Parallel {
    fn update(&mut self, ctx: &RunContext) -> TaskState {
        let mut all_terminal = true;
        let mut all_success = true;

        for child in &mut self.counted {
            match child.update(ctx) {
                TaskState::Running => all_terminal = false,
                TaskState::Success => {}
                TaskState::Failure => all_success = false,
            }
        }
        if !all_terminal {
            for child in &mut self.background {
                child.update(ctx);
            }
            return TaskState::Running;
        }

        for child in &mut self.background {
            if child.finished_state().is_none() {
                child.terminate();
            }
        }

        if all_success {
            TaskState::Success
        } else {
            TaskState::Failure
        }
    }

    fn reset(&mut self, ctx: &RunContext) {
        for child in self.counted.iter_mut().chain(self.background.iter_mut()) {
            child.reset(ctx);
        }
    }

    fn terminate(&mut self) {
        for child in self.counted.iter_mut().chain(self.background.iter_mut()) {
            child.terminate();
        }
    }
}

/// Tries children in order; the first success makes the selector succeed.
/// Fails only when every child failed.
pub struct Selector {
    children: Vec<TaskRunner>,
    index: usize,
}

impl Selector {
    pub fn new() -> Self {
        Self {
            children: Vec::new(),
            index: 0,
        }
    }

    pub fn add_task(mut self, task: Box<dyn Task>) -> Self {
        self.children.push(TaskRunner::new(task));
        self
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}

impl Task for Selector {
    fn update(&mut self, ctx: &RunContext) -> TaskState {
        while self.index < self.children.len() {
            match self.children[self.index].update(ctx) {
                TaskState::Running => return TaskState::Running,
                TaskState::Success => return TaskState::Success,
                TaskState::Failure => self.index += 1,
            }
        }
        TaskState::Failure
    }

    fn reset(&mut self, ctx: &RunContext) {
        for child in &mut self.children {
            child.reset(ctx);
        }
        self.index = 0;
    }

    fn terminate(&mut self) {
        if self.index < self.children.len() {
            self.children[self.index].terminate();
        }
    }
}

/// Re-enters its child as long as the child keeps returning success, with a
/// fixed pause between iterations. When the child fails the loop ends and
/// the decorator reports `end_state` (success by default): "keep draining
/// while there is more" loops end successfully when the work runs dry.
pub struct RepeatWhileSuccess {
    child: TaskRunner,
    interval: Duration,
    next_run_at: Option<Instant>,
    end_state: TaskState,
}

impl RepeatWhileSuccess {
    pub fn new(task: Box<dyn Task>, interval: Duration) -> Self {
        Self {
            child: TaskRunner::new(task),
            interval,
            next_run_at: None,
            end_state: TaskState::Success,
        }
    }
}

impl Task for RepeatWhileSuccess {
    fn update(&mut self, ctx: &RunContext) -> TaskState {
        if let Some(at) = self.next_run_at {
            if Instant::now() < at {
                return TaskState::Running;
            }
            self.next_run_at = None;
        }
        match self.child.update(ctx) {
            TaskState::Running => TaskState::Running,
            TaskState::Success => {
                self.child.reset(ctx);
                self.next_run_at = Some(Instant::now() + self.interval);
                TaskState::Running
            }
            TaskState::Failure => self.end_state,
        }
    }

    fn reset(&mut self, ctx: &RunContext) {
        self.child.reset(ctx);
        self.next_run_at = None;
    }

    fn terminate(&mut self) {
        self.child.terminate();
    }
}

/// One-shot closure leaf; always succeeds.
pub struct Lambda {
    f: Option<Box<dyn FnOnce(&RunContext) + Send>>,
}

impl Lambda {
    pub fn new(f: impl FnOnce(&RunContext) + Send + 'static) -> Self {
        Self {
            f: Some(Box::new(f)),
        }
    }
}

impl Task for Lambda {
    fn update(&mut self, ctx: &RunContext) -> TaskState {
        if let Some(f) = self.f.take() {
            f(ctx);
        }
        TaskState::Success
    }
}

/// Conditional leaf: succeeds when the predicate over the shared state holds,
/// fails otherwise. Together with [`RepeatWhileSuccess`] and [`Selector`]
/// this expresses the "still have active workers" and "still have pending
/// merges" loop conditions without ad hoc flags.
pub struct SucceedIf {
    predicate: Box<dyn Fn(&RunState) -> bool + Send>,
}

impl SucceedIf {
    pub fn new(predicate: impl Fn(&RunState) -> bool + Send + 'static) -> Self {
        Self {
            predicate: Box::new(predicate),
        }
    }
}

impl Task for SucceedIf {
    fn update(&mut self, ctx: &RunContext) -> TaskState {
        if ctx.read(|s| (self.predicate)(s)) {
            TaskState::Success
        } else {
            TaskState::Failure
        }
    }
}
