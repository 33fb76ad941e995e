//! Logging setup for the coordinator CLI and for worker processes.

use anyhow::{Context, Result};
use colored::Colorize;
use env_logger::Builder;
use log::Level;
use std::io::Write;
use std::path::Path;

use crate::SlotId;

/// Console logging for the coordinator. Dependencies stay at warn; this crate
/// logs at info, or debug with `verbose`.
pub fn setup_logging(verbose: bool) {
    use log::LevelFilter;

    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    Builder::from_default_env()
        .filter_level(LevelFilter::Warn)
        .filter_module(env!("CARGO_PKG_NAME"), level)
        .format(|buf, record| {
            let name = env!("CARGO_PKG_NAME");
            let line = match record.level() {
                Level::Error | Level::Warn => {
                    let level_str = match record.level() {
                        Level::Warn => "WARN".yellow(),
                        Level::Error => "ERROR".red(),
                        _ => unreachable!(),
                    };
                    let path = record.target().to_string().white();
                    format!("[{} {} {}] {}", name.cyan(), level_str, path, record.args())
                }
                _ => format!("[{}] {}", name.cyan(), record.args()),
            };
            writeln!(buf, "{}", line)
        })
        .init();
}

/// File logging for a worker process. Appends to the coordinator's log file
/// (when one was handed over on the command line) with the slot id in every
/// line, so interleaved worker output stays attributable.
pub fn setup_worker_logging(slot: SlotId, log_file: Option<&Path>) -> Result<()> {
    let mut builder = Builder::from_default_env();
    builder
        .filter_level(log::LevelFilter::Warn)
        .filter_module(env!("CARGO_PKG_NAME"), log::LevelFilter::Info);

    if let Some(path) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open worker log file {}", path.display()))?;
        builder
            .target(env_logger::Target::Pipe(Box::new(file)))
            .format(move |buf, record| {
                writeln!(
                    buf,
                    "[worker {}] {} {}",
                    slot,
                    record.level(),
                    record.args()
                )
            });
    } else {
        builder.format(move |buf, record| {
            writeln!(
                buf,
                "[worker {}] {} {}",
                slot,
                record.level(),
                record.args()
            )
        });
    }

    builder.init();
    Ok(())
}
