//! Shared utilities: tuning constants, logging, filesystem helpers, process
//! probes.

pub mod config;
pub mod fs;
pub mod logger;
pub mod process;

pub use fs::{fingerprint_file, glob_match, path_to_db_string, should_include_source_file};
pub use logger::setup_logging;
