//! Pool statistics and registry snapshots

use core::fmt;

use crate::handle::PoolRef;

/// Statistics for a single pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolStats {
    /// Allocations served since creation or the last reset
    pub num_allocs: u64,
    /// Times the pool had to grow, either from a forced allocation or to
    /// feed one of its sub-pools
    pub num_overflows: u64,
    /// Peak number of blocks in use
    pub max_blocks_used: usize,
    /// Blocks currently handed out, including blocks lent to sub-pools
    pub num_blocks_in_use: usize,
    /// Blocks not in use
    pub num_free: usize,
}

/// Counters kept inside a pool descriptor
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Counters {
    pub(crate) num_allocs: u64,
    pub(crate) num_overflows: u64,
    pub(crate) max_blocks_used: usize,
}

impl Counters {
    pub(crate) fn record_in_use(&mut self, in_use: usize) {
        if in_use > self.max_blocks_used {
            self.max_blocks_used = in_use;
        }
    }
}

/// Point-in-time description of one registered pool
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PoolInfo {
    #[cfg_attr(feature = "serde", serde(skip))]
    pub pool: PoolRef,
    pub name: String,
    pub object_size: usize,
    pub block_size: usize,
    pub total_blocks: usize,
    pub blocks_in_use: usize,
    /// Length of the free list. Equals `total_blocks - blocks_in_use`
    /// except while the arena is hibernated.
    pub free_blocks: usize,
    pub is_sub_pool: bool,
    pub super_pool: Option<String>,
    pub stats: PoolStats,
}

impl fmt::Display for PoolInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<24} {:>6} {:>6} {:>7} {:>7} {:>7} {:>9} {:>9} {:>8}",
            self.name,
            self.object_size,
            self.block_size,
            self.total_blocks,
            self.blocks_in_use,
            self.free_blocks,
            self.stats.max_blocks_used,
            self.stats.num_overflows,
            self.stats.num_allocs,
        )?;
        if let Some(super_pool) = &self.super_pool {
            write!(f, "  (sub-pool of {super_pool})")?;
        }
        Ok(())
    }
}

/// Render a pool listing as a text table, one row per pool.
pub fn render_table(pools: &[PoolInfo]) -> String {
    let mut out = format!(
        "{:<24} {:>6} {:>6} {:>7} {:>7} {:>7} {:>9} {:>9} {:>8}\n",
        "NAME", "OBJ", "BLOCK", "TOTAL", "USED", "FREE", "MAX USED", "OVERFLOWS", "ALLOCS"
    );
    for info in pools {
        out.push_str(&info.to_string());
        out.push('\n');
    }
    out
}
