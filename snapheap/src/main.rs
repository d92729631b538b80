//! SnapHeap Driver
//!
//! Runs a backtracking workload against the versioned heap and prints what is
//! left in it afterwards. Set `SNAPHEAP_LOG` to control log verbosity.

use anyhow::Result;
use clap::Parser;
use snapheap::workload::Workload;
use snapheap::{MemoryConfig, MemoryManager};
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(version, about = "Exercise the SnapHeap versioned heap")]
struct Args {
    /// Number of branches to explore.
    #[arg(long, default_value_t = 8)]
    depth: usize,

    /// Values allocated by each branch.
    #[arg(long, default_value_t = 64)]
    cells_per_branch: usize,

    /// Commit every n-th branch and discard the others (0 discards all).
    #[arg(long, default_value_t = 2)]
    commit_every: usize,

    /// Maximum number of versions alive at once.
    #[arg(long, default_value_t = MemoryConfig::default().max_versions)]
    max_versions: usize,

    /// Keep the children of freed composite values alive.
    #[arg(long)]
    no_cascade: bool,
}

fn main() -> ExitCode {
    let log_level = std::env::var("SNAPHEAP_LOG").unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt().with_env_filter(log_level).init();

    println!("SnapHeap v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Workload failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let config = MemoryConfig {
        max_versions: args.max_versions,
        cascade_release: !args.no_cascade,
    };
    let mut memory = MemoryManager::with_config(config);
    let workload = Workload {
        depth: args.depth,
        cells_per_branch: args.cells_per_branch,
        commit_every: args.commit_every,
    };
    info!(?workload, config = ?memory.config(), "Starting workload");

    let report = workload.run(&mut memory)?;
    let stats = &report.stats;
    println!(
        "branches: {} committed, {} rolled back",
        report.committed, report.rolled_back
    );
    println!("anchor: {} ({})", report.anchor, report.anchor.type_name());
    println!("versions: {} (current {})", stats.versions, stats.current);
    println!(
        "cells: {} live, {} free, {} materialized",
        stats.live_cells, stats.free_cells, stats.cell_count
    );
    println!(
        "pages: {} segments, {} blocks owned, {} blocks shared",
        stats.segments, stats.pages.owned_blocks, stats.pages.shared_blocks
    );
    Ok(())
}
