//! Symdex CLI: index projects into a cross-reference store.

use anyhow::Result;
use clap::Parser;
use std::time::Instant;
use symdex::cli::{Cli, handle_run};

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();
    handle_run(&cli)?;
    log::debug!("Total time: {:?}", start_time.elapsed());
    Ok(())
}
