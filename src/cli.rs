//! Command-line interface: index a project, print store status, and the
//! hidden worker entry point used by multi-process runs.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;

use crate::project::Project;
use crate::refresh::RefreshMode;
use crate::status::ConsoleReporter;
use crate::task::TaskScheduler;
use crate::utils::setup_logging;
use crate::worker::run_worker_process;

/// Source-code indexing engine: schedule, distribute and merge per-file
/// indexing work into a durable cross-reference store.
#[derive(Parser)]
#[command(name = "symdex")]
#[command(about = "Index source files into a queryable cross-reference store.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum RefreshModeArg {
    /// Re-index files whose fingerprint changed.
    Updated,
    /// Updated, plus retry files whose last run ended incomplete.
    Incomplete,
    /// Re-index everything and purge stale data.
    All,
}

impl From<RefreshModeArg> for RefreshMode {
    fn from(mode: RefreshModeArg) -> Self {
        match mode {
            RefreshModeArg::Updated => RefreshMode::UpdatedFiles,
            RefreshModeArg::Incomplete => RefreshMode::UpdatedAndIncompleteFiles,
            RefreshModeArg::All => RefreshMode::AllFiles,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Refresh the project index.
    Index {
        /// Project settings file (TOML).
        #[arg(value_name = "PROJECT")]
        project: PathBuf,

        /// Which files to (re)index.
        #[arg(long, short = 'm', value_enum, default_value = "updated")]
        mode: RefreshModeArg,

        /// Verbose output.
        #[arg(long, short = 'v')]
        verbose: bool,
    },

    /// Print counts from the project's index store.
    Status {
        /// Project settings file (TOML).
        #[arg(value_name = "PROJECT")]
        project: PathBuf,

        /// Verbose output.
        #[arg(long, short = 'v')]
        verbose: bool,
    },

    /// Worker process entry point. Spawned by the coordinator; attaches to
    /// the session named on the command line.
    #[command(hide = true)]
    Worker {
        slot: u32,
        session: String,
        app_path: PathBuf,
        user_data_path: PathBuf,
        log_file: Option<PathBuf>,
    },
}

pub fn handle_run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Index {
            project,
            mode,
            verbose,
        } => {
            setup_logging(*verbose);
            handle_index(project, (*mode).into())
        }
        Commands::Status { project, verbose } => {
            setup_logging(*verbose);
            handle_status(project)
        }
        Commands::Worker {
            slot,
            session,
            app_path,
            user_data_path,
            log_file,
        } => run_worker_process(
            *slot,
            session,
            app_path,
            user_data_path,
            log_file.as_deref(),
        ),
    }
}

fn handle_index(settings_path: &PathBuf, mode: RefreshMode) -> Result<()> {
    let reporter = Arc::new(ConsoleReporter::new(true));
    let project = Arc::new(Project::open(settings_path, reporter)?);

    // The scheduler instance belongs to the application; the project only
    // gets a handle to push its run.
    let mut scheduler = TaskScheduler::new();
    scheduler.start();

    {
        let project = Arc::clone(&project);
        ctrlc::set_handler(move || {
            project.interrupt();
        })
        .context("set Ctrl+C handler")?;
    }

    let info = project.refresh_info(mode)?;
    log::info!(
        "refresh ({:?}): {} files to index, {} files to clear",
        info.mode,
        info.files_to_index.len(),
        info.files_to_clear.len()
    );
    project.build_index(info, &scheduler)?;

    scheduler.wait_idle();
    scheduler.stop();
    Ok(())
}

fn handle_status(settings_path: &PathBuf) -> Result<()> {
    let reporter = Arc::new(ConsoleReporter::new(false));
    let project = Project::open(settings_path, reporter)?;
    if !project.store_paths().db.exists() {
        println!("{}: no index store yet", project.name());
        return Ok(());
    }
    let store = project.open_store()?;
    println!("project: {}", project.name());
    println!("store:   {}", store.index_db_path().display());
    println!("files:   {}", store.file_count()?);
    println!("symbols: {}", store.symbol_count()?);
    println!("refs:    {}", store.reference_count()?);
    println!("errors:  {}", store.error_count()?);
    Ok(())
}
