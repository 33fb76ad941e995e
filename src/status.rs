//! Status events and the reporting contract toward the presentation layer.
//!
//! The core emits one-way events; the single blocking call is the
//! keep-or-discard confirmation after an interrupted run (and at startup when
//! an orphaned temp store is found next to a live one).

use kdam::{Bar, BarExt};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// One-way status events emitted throughout a run. Every terminal outcome
/// emits `IndexingFinished`, so callers never hang waiting for completion.
#[derive(Clone, Debug, PartialEq)]
pub enum StatusEvent {
    /// Clearing stale data from the temp store before indexing starts.
    ClearingStarted { file_count: usize },
    /// Workers are being spawned for `source_file_count` files.
    IndexingStarted { source_file_count: usize },
    /// A worker announced it is processing `path` (file `indexed`+1 of
    /// `total` is underway).
    IndexingFile {
        path: PathBuf,
        indexed: usize,
        total: usize,
    },
    /// The run reached a terminal outcome.
    IndexingFinished {
        indexed: usize,
        total: usize,
        seconds: f64,
        errors: usize,
        interrupted: bool,
    },
    /// The run was interrupted and is winding down.
    IndexingInterrupted,
    /// A non-recoverable condition ended the run.
    Fatal { message: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartialResultDecision {
    Keep,
    Discard,
}

/// Presentation-layer contract: event emission plus the one blocking
/// confirmation.
pub trait StatusReporter: Send + Sync {
    fn report(&self, event: StatusEvent);
    /// Keep or discard partially merged results. Asked exactly once, after an
    /// interrupted run, before swap/discard; also used at startup for an
    /// orphaned temp store.
    fn confirm_keep_partial(&self) -> PartialResultDecision;
}

/// Headless reporter: events go to the log; partial results are kept, which
/// is the lossless default when nobody can answer.
#[derive(Default)]
pub struct LogReporter;

impl StatusReporter for LogReporter {
    fn report(&self, event: StatusEvent) {
        match event {
            StatusEvent::ClearingStarted { file_count } => {
                log::info!("clearing {file_count} files");
            }
            StatusEvent::IndexingStarted { source_file_count } => {
                log::info!("indexing {source_file_count} source files");
            }
            StatusEvent::IndexingFile {
                path,
                indexed,
                total,
            } => {
                log::debug!("file {}/{}: {}", indexed + 1, total, path.display());
            }
            StatusEvent::IndexingFinished {
                indexed,
                total,
                seconds,
                errors,
                interrupted,
            } => {
                if interrupted {
                    log::info!(
                        "interrupted: {indexed}/{total} files, {seconds:.1} s, {errors} errors"
                    );
                } else {
                    log::info!(
                        "finished: {indexed}/{total} files, {seconds:.1} s, {errors} errors"
                    );
                }
            }
            StatusEvent::IndexingInterrupted => log::info!("interrupting indexing"),
            StatusEvent::Fatal { message } => log::error!("{message}"),
        }
    }

    fn confirm_keep_partial(&self) -> PartialResultDecision {
        PartialResultDecision::Keep
    }
}

/// Console reporter for the CLI: progress bar plus a terminal prompt for the
/// keep/discard decision.
pub struct ConsoleReporter {
    bar: Mutex<Option<Arc<Mutex<Bar>>>>,
    reported: Mutex<usize>,
    show_progress: bool,
}

impl ConsoleReporter {
    pub fn new(show_progress: bool) -> Self {
        Self {
            bar: Mutex::new(None),
            reported: Mutex::new(0),
            show_progress,
        }
    }

    fn update_bar(&self, indexed: usize, total: usize) {
        let bar = self.bar.lock().unwrap();
        let mut reported = self.reported.lock().unwrap();
        let done = indexed.min(total);
        if done <= *reported {
            return;
        }
        if let Some(bar) = bar.as_ref()
            && let Ok(mut bar) = bar.try_lock()
        {
            bar.total = total;
            let _ = bar.update(done - *reported);
            *reported = done;
        }
    }

    fn finish_bar(&self, done: usize) {
        let mut bar = self.bar.lock().unwrap();
        let mut reported = self.reported.lock().unwrap();
        if let Some(bar) = bar.take()
            && let Ok(mut bar) = bar.lock()
        {
            if done > *reported {
                let _ = bar.update(done - *reported);
                *reported = done;
            }
            eprintln!();
        }
    }
}

impl StatusReporter for ConsoleReporter {
    fn report(&self, event: StatusEvent) {
        match &event {
            StatusEvent::IndexingStarted { source_file_count } => {
                if self.show_progress && *source_file_count > 0 {
                    let bar = Arc::new(Mutex::new(kdam::tqdm!(
                        total = *source_file_count,
                        desc = "Indexing",
                        animation = kdam::Animation::Classic
                    )));
                    *self.bar.lock().unwrap() = Some(bar);
                }
            }
            StatusEvent::IndexingFile { indexed, total, .. } => {
                self.update_bar(*indexed, *total);
            }
            StatusEvent::IndexingFinished { indexed, .. } => {
                // An interrupted bar stays where it stopped.
                self.finish_bar(*indexed);
            }
            _ => {}
        }
        LogReporter.report(event);
    }

    fn confirm_keep_partial(&self) -> PartialResultDecision {
        use std::io::Write;
        eprint!("Keep partially indexed data? [Y/n] ");
        let _ = std::io::stderr().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return PartialResultDecision::Keep;
        }
        match answer.trim().to_ascii_lowercase().as_str() {
            "n" | "no" => PartialResultDecision::Discard,
            _ => PartialResultDecision::Keep,
        }
    }
}
