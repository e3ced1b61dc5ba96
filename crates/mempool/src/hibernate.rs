//! Arena hibernation.
//!
//! [`MemSystem::hibernate`] squeezes every free block out of the carved part
//! of the static arena: live memory slides towards the start of the arena,
//! and each run of consecutive free blocks belonging to one pool collapses
//! into a compact record written in its place. The tail of the arena is then
//! unused and may be powered down. [`MemSystem::resume`] walks the records
//! backwards and puts everything back where it was, so object handles held
//! across a hibernation stay valid.
//!
//! Free blocks outside the arena stay on their free lists untouched.
//!
//! Neither call coordinates with other threads. Every other thread using the
//! allocator must be stopped for the whole hibernated period.

use core::ops::Range;

use crate::error::{MemoryError, MemoryResult};
use crate::handle::ObjRef;
use crate::layout::{HEADER_SIZE, LINK_SIZE, WORD_SIZE};
use crate::macros::{fatal, fatal_if};
use crate::storage::{read_word, write_word};
use crate::system::{MemSystem, State};

/// Bytes taken by one compact record: pool id, run length, link to the
/// previous record. Never larger than the smallest block.
pub const COMPACT_RECORD_SIZE: usize = HEADER_SIZE + LINK_SIZE;

const RECORD_POOL: usize = 0;
const RECORD_COUNT: usize = WORD_SIZE;
const RECORD_PREV: usize = 2 * WORD_SIZE;
const NO_RECORD: usize = usize::MAX;

/// Where the compacted arena ends and where to start undoing it
#[derive(Debug, Clone, Copy)]
pub(crate) struct Hibernation {
    chunk: u32,
    compacted_end: usize,
    region_end: usize,
    last_record: Option<usize>,
}

/// Cursor state while compacting
struct Compactor {
    end: usize,
    run: Option<(u32, usize)>,
    last_record: Option<usize>,
}

impl Compactor {
    /// Write the pending run, if any, as a compact record at the compaction point.
    fn spill(&mut self, bytes: &mut [u8]) {
        let Some((pool, count)) = self.run.take() else {
            return;
        };
        let at = self.end;
        write_word(bytes, at + RECORD_POOL, pool as usize);
        write_word(bytes, at + RECORD_COUNT, count);
        write_word(bytes, at + RECORD_PREV, self.last_record.unwrap_or(NO_RECORD));
        self.last_record = Some(at);
        self.end += COMPACT_RECORD_SIZE;
    }
}

impl State {
    fn compact(&mut self, chunk: u32) -> Hibernation {
        let region_end = self.storage.arena_carved();

        let mut free: Vec<(usize, u32, usize)> = Vec::new();
        for pool in self.registry.handles() {
            let desc = self.registry.get_mut(pool);
            let block_size = desc.block_size;
            let storage = &self.storage;
            let mut wasted = 0;
            desc.free_list.retain(|&block| {
                if storage.in_arena(block) {
                    free.push((block.offset(), pool.index, block_size));
                    false
                } else {
                    wasted += 1;
                    true
                }
            });
            if wasted > 0 {
                tracing::debug!(
                    "Pool '{}' keeps {} free {}-byte heap blocks while hibernating",
                    desc.name,
                    wasted,
                    block_size
                );
            }
        }
        free.sort_unstable_by_key(|&(offset, ..)| offset);

        let bytes = self.storage.chunk_mut(chunk);
        let mut compactor = Compactor {
            end: 0,
            run: None,
            last_record: None,
        };
        let mut next = 0;
        for &(offset, pool, block_size) in &free {
            fatal_if!(offset < next, "free block at {offset:#x} overlaps the block before it");
            if offset != next {
                compactor.spill(bytes);
                fatal_if!(
                    compactor.end > next,
                    "compaction overran live memory at {next:#x}"
                );
                bytes.copy_within(next..offset, compactor.end);
                compactor.end += offset - next;
                next = offset;
            }
            match compactor.run.as_mut() {
                Some((run_pool, count)) if *run_pool == pool => *count += 1,
                _ => {
                    compactor.spill(bytes);
                    compactor.run = Some((pool, 1));
                }
            }
            next += block_size;
        }
        compactor.spill(bytes);
        fatal_if!(next > region_end, "free blocks run past the arena end");
        bytes.copy_within(next..region_end, compactor.end);
        compactor.end += region_end - next;

        Hibernation {
            chunk,
            compacted_end: compactor.end,
            region_end,
            last_record: compactor.last_record,
        }
    }

    fn decompact(&mut self, hibernation: Hibernation) {
        let chunk = hibernation.chunk;
        let bytes = self.storage.chunk_mut(chunk);
        let mut start = hibernation.region_end;
        let mut end = hibernation.compacted_end;
        let mut cursor = hibernation.last_record;

        while let Some(record) = cursor {
            let owner = read_word(bytes, record + RECORD_POOL);
            let count = read_word(bytes, record + RECORD_COUNT);
            let prev = read_word(bytes, record + RECORD_PREV);

            let used_start = record + COMPACT_RECORD_SIZE;
            if used_start != end {
                let used = end - used_start;
                start -= used;
                bytes.copy_within(used_start..end, start);
            }
            end = record;

            let Some(pool) = self.registry.handle_at(owner) else {
                fatal!("compact record at {record:#x} names a missing pool");
            };
            let desc = self.registry.get_mut(pool);
            for _ in 0..count {
                start -= desc.block_size;
                write_word(bytes, start, owner);
                write_word(bytes, start + WORD_SIZE, 0);
                desc.free_list.push(ObjRef::new(chunk, start));
            }

            cursor = (prev != NO_RECORD).then_some(prev);
        }
        fatal_if!(end != start, "arena decompaction ended at {end:#x}, expected {start:#x}");
    }
}

impl MemSystem {
    /// Compact the static arena and return the byte range, relative to the
    /// arena start, that holds nothing until [`resume`](Self::resume).
    ///
    /// Fatal if the allocator lock is held, which means another thread is
    /// still using the allocator.
    pub fn hibernate(&self) -> MemoryResult<Range<usize>> {
        let Some(mut state) = self.try_lock() else {
            fatal!("hibernate called while the allocator is in use");
        };
        if state.hibernation.is_some() {
            return Err(MemoryError::invalid_state("arena is already hibernated"));
        }
        let Some(chunk) = state.storage.arena_chunk() else {
            return Err(MemoryError::NoArena);
        };

        let hibernation = state.compact(chunk);
        let unused = hibernation.compacted_end..state.storage.arena_len();
        tracing::debug!(
            "Hibernating: {} arena bytes preserved, {} bytes unused",
            unused.start,
            unused.len()
        );
        state.hibernation = Some(hibernation);
        Ok(unused)
    }

    /// Undo [`hibernate`](Self::hibernate). Fatal if the allocator lock is held.
    pub fn resume(&self) -> MemoryResult<()> {
        let Some(mut state) = self.try_lock() else {
            fatal!("resume called while the allocator is in use");
        };
        let Some(hibernation) = state.hibernation.take() else {
            return Err(MemoryError::invalid_state("arena is not hibernated"));
        };
        state.decompact(hibernation);
        tracing::debug!("Resumed from hibernation");
        Ok(())
    }

    /// Whether the arena is compacted and waiting for [`resume`](Self::resume)
    pub fn is_hibernated(&self) -> bool {
        self.lock().hibernation.is_some()
    }
}
