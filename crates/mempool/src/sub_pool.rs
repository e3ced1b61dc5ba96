//! Sub-pools and reduced pools.
//!
//! A sub-pool borrows blocks from a super-pool instead of system memory. A
//! reduced pool is a sub-pool with a smaller object size: every borrowed
//! super-pool block is split into as many smaller blocks as fit. Deleting a
//! sub-pool reassembles the split blocks and hands them back.
//!
//! Sub-pool descriptors come from a table of `max_sub_pools` entries.
//! Exhausting it is fatal.

use crate::handle::PoolRef;
use crate::macros::{fatal, fatal_if};
use crate::system::{MemSystem, State};

impl State {
    /// Register a sub-pool of `super_pool`, taking a descriptor from the table.
    fn register_sub_pool(
        &mut self,
        super_pool: PoolRef,
        name: &str,
        object_size: usize,
    ) -> PoolRef {
        fatal_if!(
            self.sub_pools_in_use >= self.config.max_sub_pools,
            "sub-pool table exhausted ({} descriptors) creating '{name}'",
            self.config.max_sub_pools
        );
        let destructor = self.registry.get(super_pool).destructor.clone();
        let pool = self.register(name, object_size, Some(super_pool));
        let desc = self.registry.get_mut(pool);
        desc.destructor = destructor;
        desc.sub_pool_refs = 1;
        self.sub_pools_in_use += 1;
        pool
    }

    /// Move free blocks from `src` to `dest` until `dest` received at least
    /// `count` blocks, splitting each source block into
    /// `src.block_size / dest.block_size` destination blocks.
    ///
    /// Returns the number of source blocks removed.
    pub(crate) fn move_blocks(&mut self, dest: PoolRef, src: PoolRef, count: usize) -> usize {
        let dest_block = self.registry.get(dest).block_size;
        let src_block = self.registry.get(src).block_size;
        fatal_if!(
            dest_block > src_block,
            "cannot move {src_block}-byte blocks of '{}' into {dest_block}-byte pool '{}'",
            self.registry.get(src).name,
            self.registry.get(dest).name
        );

        let mut moved = 0;
        let mut removed = 0;
        while moved < count {
            let Some(block) = self.registry.get_mut(src).free_list.pop() else {
                fatal!(
                    "pool '{}' ran out of free blocks moving {count} objects to '{}'",
                    self.registry.get(src).name,
                    self.registry.get(dest).name
                );
            };
            removed += 1;

            let mut offset = 0;
            while offset + dest_block <= src_block {
                let piece = block.advance(offset);
                self.storage.write_header(piece, dest.index, 0);
                self.registry.get_mut(dest).free_list.push(piece);
                moved += 1;
                offset += dest_block;
            }
        }

        tracing::debug!(
            "Moved {} blocks from '{}' to {} blocks of '{}'",
            removed,
            self.registry.get(src).name,
            moved,
            self.registry.get(dest).name
        );
        removed
    }

    /// Move every free block of `src` back to `dest`, reassembling split
    /// blocks. Returns the number of `dest` blocks received.
    ///
    /// Pieces that cannot be reassembled into a whole `dest` block are
    /// dropped with an error and stay counted as in use by `dest`.
    pub(crate) fn move_all_blocks(&mut self, dest: PoolRef, src: PoolRef) -> usize {
        let dest_block = self.registry.get(dest).block_size;
        let src_desc = self.registry.get_mut(src);
        let src_block = src_desc.block_size;
        fatal_if!(
            src_desc.in_use != 0,
            "moving blocks out of '{}' with {} blocks in use",
            src_desc.name,
            src_desc.in_use
        );
        fatal_if!(
            dest_block < src_block,
            "cannot return {src_block}-byte blocks of '{}' to a smaller pool",
            src_desc.name
        );

        let mut pieces = std::mem::take(&mut src_desc.free_list);
        src_desc.total_blocks = 0;
        let src_name = src_desc.name.clone();

        if dest_block == src_block {
            let moved = pieces.len();
            for &block in &pieces {
                self.storage.write_header(block, dest.index, 0);
            }
            self.registry.get_mut(dest).free_list.append(&mut pieces);
            return moved;
        }

        let ratio = dest_block / src_block;
        pieces.sort_unstable();

        let mut moved = 0;
        let mut i = 0;
        while i < pieces.len() {
            let start = pieces[i];
            let mut run = 1;
            while run < ratio
                && pieces
                    .get(i + run)
                    .is_some_and(|&next| next == start.advance(run * src_block))
            {
                run += 1;
            }

            if run == ratio {
                self.storage.write_header(start, dest.index, 0);
                self.registry.get_mut(dest).free_list.push(start);
                moved += 1;
            } else {
                tracing::error!(
                    "Could not re-assemble block {} of sub-pool '{}' ({} of {} pieces contiguous); block lost",
                    start,
                    src_name,
                    run,
                    ratio
                );
            }
            i += run;
        }
        moved
    }

    /// Tear down a sub-pool whose last reference was released.
    fn destroy_sub_pool(&mut self, pool: PoolRef) {
        let desc = self.registry.get(pool);
        let name = desc.name.clone();
        let in_use = desc.in_use;
        let Some(super_pool) = desc.super_pool else {
            fatal!("'{name}' is not a sub-pool");
        };
        fatal_if!(
            in_use != 0,
            "Deleting sub-pool '{name}' with {in_use} blocks still in use"
        );

        let returned = self.move_all_blocks(super_pool, pool);
        let super_desc = self.registry.get_mut(super_pool);
        fatal_if!(
            returned > super_desc.in_use,
            "sub-pool '{name}' returned {returned} blocks but '{}' only lent {}",
            super_desc.name,
            super_desc.in_use
        );
        super_desc.in_use -= returned;

        self.registry.remove(pool);
        self.sub_pools_in_use -= 1;
        tracing::debug!("Deleted sub-pool '{}', returned {} blocks", name, returned);
    }
}

impl MemSystem {
    /// Create a sub-pool of `count` objects borrowed from `super_pool`.
    ///
    /// The sub-pool has the super-pool's object size and destructor.
    pub fn create_sub_pool(&self, super_pool: PoolRef, name: &str, count: usize) -> PoolRef {
        let mut state = self.lock();
        let object_size = state.registry.get(super_pool).object_size;
        let pool = state.register_sub_pool(super_pool, name, object_size);
        self.expand_locked(&mut state, pool, count);
        pool
    }

    /// Create a sub-pool whose blocks are `super_pool` blocks split into
    /// smaller ones holding at least `object_size` bytes.
    ///
    /// The actual object size is the largest that still splits a super-pool
    /// block into the same number of pieces, so it may exceed the request.
    /// When no split is possible and `super_pool` is itself a sub-pool, that
    /// sub-pool is returned with one more reference, grown to `count` objects.
    pub fn create_reduced_pool(
        &self,
        super_pool: PoolRef,
        name: &str,
        count: usize,
        object_size: usize,
    ) -> PoolRef {
        let mut state = self.lock();
        let layout = state.layout;
        let super_desc = state.registry.get(super_pool);
        fatal_if!(
            object_size > super_desc.object_size,
            "reduced pool '{name}' wants {object_size}-byte objects, larger than the {} bytes of '{}'",
            super_desc.object_size,
            super_desc.name
        );
        let super_block = super_desc.block_size;
        let divisor = layout.divisor(super_block, object_size);

        if divisor == 1 && super_desc.super_pool.is_some() {
            let total = super_desc.total_blocks;
            state.registry.get_mut(super_pool).sub_pool_refs += 1;
            if count > total {
                self.expand_locked(&mut state, super_pool, count - total);
            }
            return super_pool;
        }

        let real_size = layout.reduced_object_size(super_block, divisor);
        let pool = state.register_sub_pool(super_pool, name, real_size);
        let block_size = state.registry.get(pool).block_size;
        fatal_if!(
            super_block / block_size != divisor,
            "reduced pool '{name}' splits {super_block}-byte blocks into {} pieces, expected {divisor}",
            super_block / block_size
        );
        self.expand_locked(&mut state, pool, count);
        pool
    }

    /// Drop one reference to a sub-pool. The last one returns every block to
    /// the super-pool and removes the sub-pool.
    ///
    /// Fatal if the pool is not a sub-pool or still has blocks in use.
    pub fn delete_sub_pool(&self, pool: PoolRef) {
        let mut state = self.lock();
        let desc = state.registry.get_mut(pool);
        fatal_if!(desc.super_pool.is_none(), "'{}' is not a sub-pool", desc.name);
        desc.sub_pool_refs -= 1;
        if desc.sub_pool_refs == 0 {
            state.destroy_sub_pool(pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemConfig;
    use crate::handle::ObjRef;

    fn run_of(start: ObjRef, block_size: usize, count: usize) -> Vec<ObjRef> {
        (0..count).map(|i| start.advance(i * block_size)).collect()
    }

    fn system() -> MemSystem {
        MemSystem::new(MemConfig::production()).unwrap()
    }

    #[test]
    fn test_move_blocks_splits() {
        let system = system();
        let parent = system.create_pool("parent", 64);
        system.expand_pool(parent, 2);
        let small = system.create_reduced_pool(parent, "small", 1, 16);

        let state = system.lock();
        let parent_desc = state.registry.get(parent);
        let small_desc = state.registry.get(small);
        let ratio = parent_desc.block_size / small_desc.block_size;
        assert!(ratio >= 2);
        assert_eq!(parent_desc.in_use, 1);
        assert_eq!(parent_desc.free_list.len(), 1);
        assert_eq!(small_desc.total_blocks, ratio);

        let mut pieces = small_desc.free_list.clone();
        pieces.sort_unstable();
        assert_eq!(pieces, run_of(pieces[0], small_desc.block_size, ratio));
        for piece in pieces {
            assert_eq!(state.storage.owner(piece), small.index as usize);
            assert_eq!(state.storage.ref_count(piece), 0);
        }
    }

    #[test]
    fn test_lost_piece_is_leaked_not_fatal() {
        let system = system();
        let parent = system.create_pool("parent", 64);
        system.expand_pool(parent, 2);
        let small = system.create_reduced_pool(parent, "small", 1, 16);
        {
            let mut state = system.lock();
            let desc = state.registry.get_mut(small);
            desc.free_list.sort_unstable();
            desc.free_list.remove(0);
            desc.total_blocks -= 1;
        }

        system.delete_sub_pool(small);
        let stats = system.stats(parent);
        assert_eq!(stats.num_blocks_in_use, 1);
        assert_eq!(system.pool_info(parent).free_blocks, 1);
    }

    #[test]
    fn test_move_all_blocks_equal_sizes() {
        let system = system();
        let parent = system.create_pool("parent", 32);
        let sub = system.create_sub_pool(parent, "sub", 3);
        system.delete_sub_pool(sub);

        let state = system.lock();
        let desc = state.registry.get(parent);
        assert_eq!(desc.total_blocks, 3);
        assert_eq!(desc.in_use, 0);
        assert_eq!(desc.free_list.len(), 3);
        for &block in &desc.free_list {
            assert_eq!(state.storage.owner(block), parent.index as usize);
        }
    }
}
