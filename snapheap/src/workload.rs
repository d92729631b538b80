//! Backtracking workload.
//!
//! Drives a [`MemoryManager`] the way a backtracking interpreter does: each
//! level of the search forks the heap, allocates a batch of values, updates a
//! shared anchor cell and then either commits or discards the branch.

use crate::memory::{MemoryManager, MemoryStats};
use crate::value::{Handle, Value};
use anyhow::{Context, Result};
use smallvec::SmallVec;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    /// Number of branches explored one after the other.
    pub depth: usize,
    pub cells_per_branch: usize,
    /// Commit every n-th branch and discard the rest. Zero discards all.
    pub commit_every: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadReport {
    pub committed: usize,
    pub rolled_back: usize,
    /// Final value of the anchor cell: the level of the last kept branch, or
    /// -1 if none was kept.
    pub anchor: Value,
    pub stats: MemoryStats,
}

impl Workload {
    pub fn run(&self, memory: &mut MemoryManager) -> Result<WorkloadReport> {
        let anchor = memory.allocate(Value::Int(-1))?;
        memory.retain(anchor)?;

        let mut committed = 0;
        let mut rolled_back = 0;
        for level in 0..self.depth {
            let keep = self.commit_every != 0 && level % self.commit_every == 0;
            let kept = memory
                .speculate(|memory| {
                    let mut items = SmallVec::<[Handle; 4]>::new();
                    for index in 0..self.cells_per_branch {
                        let value = Value::Int((level * self.cells_per_branch + index) as i64);
                        let handle = memory.allocate(value)?;
                        memory.retain(handle)?;
                        items.push(handle);
                    }
                    let list = memory.allocate(Value::List(items))?;
                    memory.retain(list)?;
                    memory.write(anchor, Value::Int(level as i64))?;
                    if !keep {
                        // Frees the whole batch before the branch is discarded.
                        memory.release(list)?;
                    }
                    Ok(keep)
                })
                .with_context(|| format!("branch at level {level} failed"))?;
            if kept {
                committed += 1;
            } else {
                rolled_back += 1;
            }
            debug!(level, kept, "branch finished");
        }

        let report = WorkloadReport {
            committed,
            rolled_back,
            anchor: memory.dereference(anchor)?.clone(),
            stats: memory.stats()?,
        };
        info!(
            committed,
            rolled_back,
            live = report.stats.live_cells,
            "workload finished"
        );
        Ok(report)
    }
}
