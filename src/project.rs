//! Project façade: settings, refresh entry points, and assembly of the
//! indexing run's task tree.

use anyhow::{Context, anyhow};
use rayon::prelude::*;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::channel::WorkChannel;
use crate::channel::memory::MemoryChannel;
use crate::channel::session::SessionDb;
use crate::indexer::TokenIndexer;
use crate::orchestrator::{
    BuildIndexParams, BuildIndexTask, CleanStorageTask, FillQueueTask, InjectFragmentTask,
    SharedStore, WorkerMode,
};
use crate::queue::{CombinedCommandProvider, CommandProvider, InternedCommandProvider};
use crate::refresh::{RefreshInfo, RefreshMode, compute_refresh_info};
use crate::source_group::{FileSetSourceGroup, SourceGroup};
use crate::status::{PartialResultDecision, StatusEvent, StatusReporter};
use crate::storage::fragment::Fingerprint;
use crate::storage::{
    GraphStore, PendingFragments, StorePaths, discard_temp_store, prepare_temp_store,
    resolve_orphaned_temp, swap_temp_store,
};
use crate::task::{
    Lambda, Parallel, RepeatWhileSuccess, RunContext, Selector, Sequence, SucceedIf, Task,
    TaskScheduler, TaskState,
};
use crate::utils::config::{FALLBACK_WORKER_COUNT, MERGE_POLL_INTERVAL, REPEAT_POLL_INTERVAL};
use crate::utils::fs::fingerprint_file;
use crate::Result;

/// One source group in the project settings file.
#[derive(Clone, Debug, Deserialize)]
pub struct SourceGroupSettings {
    pub root: PathBuf,
    pub language: String,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Project settings, loaded from a TOML file next to which the store lives.
/// The raw text is embedded into the store so configuration drift between
/// runs is detectable.
#[derive(Clone, Debug, Deserialize)]
pub struct ProjectSettings {
    pub name: String,
    #[serde(default)]
    pub worker_count: Option<usize>,
    #[serde(default)]
    pub multi_process: bool,
    #[serde(default)]
    pub source_groups: Vec<SourceGroupSettings>,
}

impl ProjectSettings {
    /// Parse the settings file; returns the settings and the raw text.
    pub fn load(path: &Path) -> Result<(Self, String)> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read project settings {}", path.display()))?;
        let settings: ProjectSettings = toml::from_str(&text)
            .with_context(|| format!("parse project settings {}", path.display()))?;
        if settings.name.is_empty() {
            return Err(anyhow!("project settings need a non-empty name"));
        }
        Ok((settings, text))
    }
}

struct ActiveRun {
    ctx: RunContext,
    channel: Arc<dyn WorkChannel>,
}

pub struct Project {
    settings: ProjectSettings,
    settings_text: String,
    paths: StorePaths,
    project_dir: PathBuf,
    source_groups: Vec<Box<dyn SourceGroup>>,
    reporter: Arc<dyn StatusReporter>,
    indexing: Arc<AtomicBool>,
    active_run: Arc<Mutex<Option<ActiveRun>>>,
}

impl Project {
    /// Load a project from its settings file. Resolves an orphaned temp
    /// store first: promoted silently when no live store exists, otherwise
    /// the reporter's blocking confirmation decides keep or discard.
    pub fn open(settings_path: &Path, reporter: Arc<dyn StatusReporter>) -> Result<Self> {
        let (settings, settings_text) = ProjectSettings::load(settings_path)?;
        let project_dir = settings_path
            .parent()
            .map(Path::to_path_buf)
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."));
        let paths = StorePaths::for_project(&project_dir, &settings.name);

        resolve_orphaned_temp(&paths, reporter.as_ref())?;

        let source_groups: Vec<Box<dyn SourceGroup>> = settings
            .source_groups
            .iter()
            .map(|group| {
                let root = if group.root.is_absolute() {
                    group.root.clone()
                } else {
                    project_dir.join(&group.root)
                };
                let mut file_set = FileSetSourceGroup::new(
                    root,
                    group.language.clone(),
                    group.extensions.clone(),
                    group.exclude.clone(),
                    group.flags.clone(),
                );
                file_set.set_enabled(group.enabled);
                Box::new(file_set) as Box<dyn SourceGroup>
            })
            .collect();

        Ok(Self {
            settings,
            settings_text,
            paths,
            project_dir,
            source_groups,
            reporter,
            indexing: Arc::new(AtomicBool::new(false)),
            active_run: Arc::new(Mutex::new(None)),
        })
    }

    pub fn store_paths(&self) -> &StorePaths {
        &self.paths
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Open the live store read-side (for status queries and tests).
    pub fn open_store(&self) -> Result<GraphStore> {
        GraphStore::open(&self.paths.db)
    }

    /// Current source set of all enabled groups, with on-disk fingerprints,
    /// computed in parallel.
    fn current_source_state(&self) -> BTreeMap<PathBuf, Fingerprint> {
        let files: Vec<PathBuf> = self
            .source_groups
            .iter()
            .filter(|g| g.enabled())
            .flat_map(|g| g.all_source_file_paths())
            .collect();
        files
            .into_par_iter()
            .filter_map(|path| match fingerprint_file(&path) {
                Ok(fingerprint) => Some((path, fingerprint)),
                Err(err) => {
                    log::warn!("cannot fingerprint {}: {err:#}", path.display());
                    None
                }
            })
            .collect()
    }

    /// Compute the refresh work set for a requested mode.
    ///
    /// A changed project configuration forces a full refresh: per-file
    /// fingerprints cannot tell which outputs a configuration change
    /// invalidated. A missing store behaves the same way.
    pub fn refresh_info(&self, mode: RefreshMode) -> Result<RefreshInfo> {
        let mut mode = mode;
        let stored = if self.paths.db.exists() {
            let store = GraphStore::open(&self.paths.db)?;
            if mode != RefreshMode::None {
                let drifted = match store.project_config_text()? {
                    Some(stored_text) => stored_text != self.settings_text,
                    None => true,
                };
                if drifted && mode != RefreshMode::AllFiles {
                    log::info!("project configuration changed; forcing full refresh");
                    mode = RefreshMode::AllFiles;
                }
            }
            store.file_records()?
        } else {
            if mode != RefreshMode::None {
                mode = RefreshMode::AllFiles;
            }
            Vec::new()
        };

        let current = self.current_source_state();
        Ok(compute_refresh_info(mode, &stored, &current))
    }

    /// Cooperatively interrupt the active run: flag the context, clear the
    /// shared queue. Workers finish their in-flight command, observe
    /// emptiness, and exit; the keep/discard decision follows at the end of
    /// the run.
    pub fn interrupt(&self) {
        let guard = self.active_run.lock().unwrap();
        if let Some(run) = guard.as_ref() {
            self.reporter.report(StatusEvent::IndexingInterrupted);
            run.ctx.set_interrupted();
            if let Err(err) = run.channel.set_interrupted(true) {
                log::error!("cannot flag interruption: {err:#}");
            }
            if let Err(err) = run.channel.clear_queue() {
                log::error!("cannot clear command queue: {err:#}");
            }
        }
    }

    /// Build the index for a computed refresh work set. Fails fast when a
    /// run is already active; returns immediately after handing the run to
    /// the scheduler.
    pub fn build_index(&self, info: RefreshInfo, scheduler: &TaskScheduler) -> Result<()> {
        if self
            .indexing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(anyhow!("cannot refresh project while indexing"));
        }
        match self.assemble_run(info) {
            Ok(Some((task, ctx))) => {
                scheduler.push_task(task, ctx);
                Ok(())
            }
            Ok(None) => {
                self.indexing.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                self.indexing.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn assemble_run(&self, info: RefreshInfo) -> Result<Option<(Box<dyn Task>, RunContext)>> {
        // Nothing-to-refresh early-out. Still emits a finished event so no
        // caller hangs waiting for one.
        if info.mode != RefreshMode::AllFiles && info.is_noop() {
            log::info!("nothing to refresh, all files are up-to-date");
            self.reporter.report(StatusEvent::IndexingFinished {
                indexed: 0,
                total: 0,
                seconds: 0.0,
                errors: 0,
                interrupted: false,
            });
            return Ok(None);
        }

        // The run writes into a temp copy of the store; the live one stays
        // readable (and intact under any crash) until the final swap.
        prepare_temp_store(&self.paths, info.mode == RefreshMode::AllFiles)?;
        let temp_store = GraphStore::open(&self.paths.temp)?;
        temp_store.set_project_config_text(&self.settings_text)?;
        let store: SharedStore = Arc::new(Mutex::new(Some(temp_store)));

        // Expand the work set into commands, one interned provider per
        // source group, combined in group order.
        let mut provider = CombinedCommandProvider::new();
        for group in self.source_groups.iter().filter(|g| g.enabled()) {
            let interned = InternedCommandProvider::new();
            for command in group.indexer_commands(&info.files_to_index) {
                interned.add_command(&command);
            }
            interned.log_stats();
            provider.add_provider(Box::new(interned));
        }
        let source_file_count = provider.size();

        let worker_count = self
            .settings
            .worker_count
            .unwrap_or_else(|| {
                let threads = rayon::current_num_threads();
                if threads > 0 { threads } else { FALLBACK_WORKER_COUNT }
            })
            .min(source_file_count.max(1));

        let session_id = format!("{}-{}", self.settings.name, std::process::id());
        let (channel, mode): (Arc<dyn WorkChannel>, WorkerMode) = if self.settings.multi_process {
            let channel = SessionDb::create(&self.project_dir, &session_id)?;
            let worker_exe = std::env::current_exe().context("locate worker executable")?;
            let app_path = worker_exe
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let mode = WorkerMode::MultiProcess {
                worker_exe,
                session_id: session_id.clone(),
                app_path,
                user_data_path: self.project_dir.clone(),
                log_file: None,
            };
            (Arc::new(channel), mode)
        } else {
            let channel = MemoryChannel::new(worker_count);
            let mode = WorkerMode::InProcess {
                indexer: Arc::new(TokenIndexer::new()),
            };
            (Arc::new(channel), mode)
        };

        let pending = Arc::new(PendingFragments::new());
        let ctx = RunContext::new();
        ctx.update(|s| {
            s.source_file_count = source_file_count;
            s.index_start = Some(Instant::now());
        });

        *self.active_run.lock().unwrap() = Some(ActiveRun {
            ctx: ctx.clone(),
            channel: Arc::clone(&channel),
        });

        self.reporter.report(StatusEvent::IndexingStarted {
            source_file_count,
        });
        log::info!("starting indexing: {source_file_count} source files");

        let params = BuildIndexParams {
            worker_count,
            mode,
            max_respawns_per_slot: crate::utils::config::MAX_RESPAWNS_PER_SLOT,
        };

        let build_index = BuildIndexTask::new(
            params,
            Arc::clone(&channel),
            Arc::clone(&pending),
            Arc::clone(&self.reporter),
        );

        // Parallel phase: (a) feed and watch the shared queue, (b) wait for
        // the queue, then run the workers, (c) wait for the workers, then
        // merge fragments while any worker is alive.
        let parallel = Parallel::new()
            .add_task(Box::new(FillQueueTask::new(
                Box::new(provider),
                Arc::clone(&channel),
            )))
            .add_task(Box::new(
                Sequence::new()
                    .add_task(Box::new(RepeatWhileSuccess::new(
                        Box::new(SucceedIf::new(|s| !s.command_queue_started)),
                        REPEAT_POLL_INTERVAL,
                    )))
                    .add_task(Box::new(build_index)),
            ))
            .add_task(Box::new(
                Sequence::new()
                    .add_task(Box::new(RepeatWhileSuccess::new(
                        Box::new(SucceedIf::new(|s| !s.indexer_threads_started)),
                        REPEAT_POLL_INTERVAL,
                    )))
                    .add_task(Box::new(RepeatWhileSuccess::new(
                        Box::new(
                            Selector::new()
                                .add_task(Box::new(InjectFragmentTask::new(
                                    Arc::clone(&pending),
                                    Arc::clone(&store),
                                )))
                                .add_task(Box::new(SucceedIf::new(|s| {
                                    !s.indexer_threads_stopped && s.fatal.is_none()
                                }))),
                        ),
                        MERGE_POLL_INTERVAL,
                    ))),
            ));

        let finish_store = Arc::clone(&store);
        let finish = Lambda::new(move |ctx| {
            if ctx.read(|s| s.fatal.is_some()) {
                return;
            }
            let store = finish_store.lock().unwrap();
            if let Some(store) = store.as_ref() {
                if let Err(err) = store.optimize_memory() {
                    log::error!("cannot optimize temp store: {err:#}");
                }
                if let Err(err) = store.build_caches() {
                    log::error!("cannot build store caches: {err:#}");
                }
            }
        });

        let decide = DecideSwapTask {
            store: Arc::clone(&store),
            paths: self.paths.clone(),
            reporter: Arc::clone(&self.reporter),
        };

        let reporter = Arc::clone(&self.reporter);
        let indexing = Arc::clone(&self.indexing);
        let active_run = Arc::clone(&self.active_run);
        let finished = Lambda::new(move |ctx| {
            let (indexed, total, errors, interrupted, started) = ctx.read(|s| {
                (
                    s.indexed_file_count,
                    s.source_file_count,
                    s.error_count,
                    s.interrupted,
                    s.index_start,
                )
            });
            let seconds = started.map(|t| t.elapsed().as_secs_f64()).unwrap_or(0.0);
            reporter.report(StatusEvent::IndexingFinished {
                indexed,
                total,
                seconds,
                errors,
                interrupted,
            });
            active_run.lock().unwrap().take();
            indexing.store(false, Ordering::SeqCst);
        });

        // A full refresh starts from an empty temp store; there is nothing
        // to clear in it.
        let files_to_clear: Vec<PathBuf> = if info.mode == RefreshMode::AllFiles {
            Vec::new()
        } else {
            info.files_to_clear.iter().cloned().collect()
        };

        let root = Sequence::new()
            .add_task(Box::new(CleanStorageTask::new(
                Arc::clone(&store),
                files_to_clear,
                Arc::clone(&self.reporter),
            )))
            .add_task(Box::new(parallel))
            // Inject whatever is still pending after the workers stopped.
            .add_task(Box::new(RepeatWhileSuccess::new(
                Box::new(InjectFragmentTask::new(
                    Arc::clone(&pending),
                    Arc::clone(&store),
                )),
                std::time::Duration::ZERO,
            )))
            .add_task(Box::new(finish))
            .add_task(Box::new(decide))
            .add_task(Box::new(finished));

        Ok(Some((Box::new(root), ctx)))
    }
}

/// Terminal decision of a run: swap the temp store into place, or discard it.
/// Success swaps; a fatal run discards; an interrupted run asks the reporter
/// once whether to keep what was merged so far.
struct DecideSwapTask {
    store: SharedStore,
    paths: StorePaths,
    reporter: Arc<dyn StatusReporter>,
}

impl Task for DecideSwapTask {
    fn update(&mut self, ctx: &RunContext) -> TaskState {
        // Close the temp store before touching its file.
        drop(self.store.lock().unwrap().take());

        let fatal = ctx.read(|s| s.fatal.clone());
        let interrupted = ctx.interrupted();

        let keep = if let Some(message) = fatal {
            log::error!("indexing failed: {message}");
            false
        } else if interrupted {
            self.reporter.confirm_keep_partial() == PartialResultDecision::Keep
        } else {
            true
        };

        let result = if keep {
            swap_temp_store(&self.paths)
        } else {
            discard_temp_store(&self.paths)
        };
        if let Err(err) = result {
            let message = format!("cannot finalize index store: {err:#}");
            self.reporter.report(StatusEvent::Fatal {
                message: message.clone(),
            });
            ctx.set_fatal(message);
            return TaskState::Success;
        }

        if keep {
            // The swapped-in store serves readers immediately; warm its
            // lookup caches once.
            match GraphStore::open(&self.paths.db) {
                Ok(live) => {
                    if let Err(err) = live.build_caches() {
                        log::warn!("cannot build caches on live store: {err:#}");
                    }
                }
                Err(err) => log::warn!("cannot reopen live store: {err:#}"),
            }
        }
        TaskState::Success
    }
}
