//! Pool core: creation, expansion, allocation, release and reference counting.
//!
//! A pool hands out blocks from a stack of free block handles. When the
//! stack is empty the pool can grow: a top-level pool takes a fresh chunk
//! from system memory, a sub-pool borrows blocks from its super-pool.

use core::fmt;
use core::panic::Location;
use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::destructor::Destructor;
use crate::error::{MemoryError, MemoryResult};
use crate::guard::{check_guard_bands, write_guard_bands};
use crate::handle::{ObjRef, PoolRef};
use crate::macros::{fatal, fatal_if};
use crate::registry::Named;
use crate::stats::{Counters, PoolStats};
use crate::storage::allocate_chunk;
use crate::system::{MemSystem, State};

/// Name reported by every pool when pool names are disabled
pub const OMITTED_NAME: &str = "<omitted>";

/// Longest pool name kept, in bytes
pub const MAX_POOL_NAME_BYTES: usize = 64;

/// Pool descriptor
pub(crate) struct PoolDesc {
    pub(crate) name: String,
    pub(crate) object_size: usize,
    pub(crate) block_size: usize,
    pub(crate) total_blocks: usize,
    pub(crate) in_use: usize,
    pub(crate) free_list: Vec<ObjRef>,
    pub(crate) super_pool: Option<PoolRef>,
    pub(crate) destructor: Option<Arc<dyn Destructor>>,
    pub(crate) force_count: usize,
    pub(crate) counters: Counters,
    pub(crate) trace: bool,
    /// References held on a sub-pool descriptor; zero for top-level pools
    pub(crate) sub_pool_refs: usize,
}

impl PoolDesc {
    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            num_allocs: self.counters.num_allocs,
            num_overflows: self.counters.num_overflows,
            max_blocks_used: self.counters.max_blocks_used,
            num_blocks_in_use: self.in_use,
            num_free: self.total_blocks - self.in_use,
        }
    }
}

impl Named for PoolDesc {
    fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for PoolDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolDesc")
            .field("name", &self.name)
            .field("object_size", &self.object_size)
            .field("block_size", &self.block_size)
            .field("total_blocks", &self.total_blocks)
            .field("in_use", &self.in_use)
            .field("free", &self.free_list.len())
            .field("super_pool", &self.super_pool)
            .field("has_destructor", &self.destructor.is_some())
            .finish_non_exhaustive()
    }
}

/// System memory a top-level pool needs before an expansion can proceed
#[derive(Debug)]
pub(crate) struct HeapRequest {
    pool: PoolRef,
    blocks: usize,
    block_size: usize,
}

fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_POOL_NAME_BYTES {
        return name;
    }
    let mut end = MAX_POOL_NAME_BYTES;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    tracing::debug!("Memory pool name '{}' truncated to '{}'", name, &name[..end]);
    &name[..end]
}

impl State {
    /// Register a new, empty pool.
    pub(crate) fn register(
        &mut self,
        name: &str,
        object_size: usize,
        super_pool: Option<PoolRef>,
    ) -> PoolRef {
        let name = if self.config.pool_names {
            let name = truncate_name(name);
            if self.registry.find(name).is_some() {
                tracing::warn!("Multiple memory pools share the name '{}'", name);
            }
            name.to_string()
        } else {
            OMITTED_NAME.to_string()
        };
        let desc = PoolDesc {
            name,
            object_size,
            block_size: self.layout.block_size(object_size),
            total_blocks: 0,
            in_use: 0,
            free_list: Vec::new(),
            super_pool,
            destructor: None,
            force_count: self.config.default_force_count,
            counters: Counters::default(),
            trace: false,
            sub_pool_refs: 0,
        };
        self.registry.insert(desc)
    }

    /// Stamp `count` consecutive blocks starting at `start` and stack them
    /// onto the pool's free list in address order.
    pub(crate) fn install_blocks(&mut self, pool: PoolRef, start: ObjRef, count: usize) {
        let desc = self.registry.get_mut(pool);
        let (block_size, object_size) = (desc.block_size, desc.object_size);
        desc.total_blocks += count;
        desc.free_list.reserve(count);
        for i in 0..count {
            let block = start.advance(i * block_size);
            desc.free_list.push(block);
            self.storage.write_header(block, pool.index, 0);
            if let Some(bytes) = self.storage.get_mut(block, block_size) {
                write_guard_bands(bytes, &self.layout, object_size);
            }
        }
    }

    /// Grow `pool` by `count` objects without touching system memory.
    ///
    /// Sub-pools borrow from their super-pool, recursively growing it first
    /// when it is short. Any level that needs fresh system memory reports it
    /// as a [`HeapRequest`] and nothing is mutated.
    pub(crate) fn try_expand(&mut self, pool: PoolRef, count: usize) -> Result<(), HeapRequest> {
        let desc = self.registry.get(pool);
        let block_size = desc.block_size;
        let Some(super_ref) = desc.super_pool else {
            return Err(HeapRequest {
                pool,
                blocks: count,
                block_size,
            });
        };

        let super_desc = self.registry.get(super_ref);
        let ratio = super_desc.block_size / block_size;
        let needed = count.div_ceil(ratio);
        let available = super_desc.free_list.len();
        if needed > available {
            let deficit = needed - available;
            self.try_expand(super_ref, deficit)?;
            if self.config.track_stats {
                self.registry.get_mut(super_ref).counters.num_overflows += deficit as u64;
            }
        }

        let removed = self.move_blocks(pool, super_ref, count);
        self.registry.get_mut(pool).total_blocks += removed * ratio;
        let track_stats = self.config.track_stats;
        let super_desc = self.registry.get_mut(super_ref);
        super_desc.in_use += removed;
        if track_stats {
            super_desc.counters.record_in_use(super_desc.in_use);
        }
        Ok(())
    }

    /// Pop a free block and hand it out with a reference count of one.
    pub(crate) fn take_block(&mut self, pool: PoolRef) -> Option<ObjRef> {
        let track_stats = self.config.track_stats;
        let desc = self.registry.get_mut(pool);
        let block = desc.free_list.pop()?;
        desc.in_use += 1;
        if track_stats {
            desc.counters.num_allocs += 1;
            desc.counters.record_in_use(desc.in_use);
        }
        let (block_size, object_size) = (desc.block_size, desc.object_size);

        self.storage.set_ref_count(block, 1);
        let payload = self.layout.payload_offset();
        if let Some(bytes) = self.storage.get_mut(block, block_size) {
            write_guard_bands(bytes, &self.layout, object_size);
            if let Some(pattern) = self.config.alloc_pattern {
                bytes[payload..payload + object_size].fill(pattern);
            }
        }
        Some(block)
    }

    /// Return a block whose reference count already dropped to zero.
    fn recycle(&mut self, pool: PoolRef, block: ObjRef) {
        let desc = self.registry.get_mut(pool);
        let (block_size, object_size) = (desc.block_size, desc.object_size);
        desc.free_list.push(block);
        desc.in_use -= 1;

        if let Some(pattern) = self.config.dealloc_pattern {
            let payload = self.layout.payload_offset();
            if let Some(bytes) = self.storage.get_mut(block, block_size) {
                bytes[payload..payload + object_size].fill(pattern);
            }
        }
    }

    /// Owning pool of `object`, read from its header.
    pub(crate) fn owner_of(&self, object: ObjRef) -> PoolRef {
        if self.storage.get(object, crate::layout::HEADER_SIZE).is_none() {
            fatal!("invalid object reference {object}");
        }
        let Some(pool) = self.registry.handle_at(self.storage.owner(object)) else {
            fatal!("object {object} does not belong to a live pool");
        };
        pool
    }

    /// Owning pool of `object`, after verifying its guard bands.
    pub(crate) fn resolve(&self, object: ObjRef) -> PoolRef {
        let pool = self.owner_of(object);
        let desc = self.registry.get(pool);
        let Some(bytes) = self.storage.get(object, desc.block_size) else {
            fatal!("object {object} overruns its chunk (pool '{}')", desc.name);
        };
        if let Err(violation) = check_guard_bands(bytes, &self.layout, desc.object_size) {
            fatal!(
                "Memory corruption detected {} object {object} at block offset {} (pool '{}')",
                violation.side,
                violation.offset,
                desc.name
            );
        }
        pool
    }

    /// First pool up the super-pool chain whose objects hold `size` bytes.
    fn pool_for_size(&self, pool: PoolRef, size: usize) -> PoolRef {
        let mut current = pool;
        loop {
            let desc = self.registry.get(current);
            if size <= desc.object_size {
                return current;
            }
            match desc.super_pool {
                Some(super_pool) => current = super_pool,
                None => fatal!(
                    "no pool above '{}' holds {size}-byte objects (largest is {})",
                    self.registry.get(pool).name,
                    desc.object_size
                ),
            }
        }
    }

    fn trace(&self, pool: PoolRef, operation: &'static str, object: ObjRef, caller: &Location<'_>) {
        let desc = self.registry.get(pool);
        if desc.trace {
            tracing::trace!(
                target: "nebula_mempool::trace",
                pool = %desc.name,
                operation,
                object = %object,
                file = caller.file(),
                line = caller.line(),
                "pool trace"
            );
        }
    }

    fn log_overflow(&self, pool: PoolRef) {
        let desc = self.registry.get(pool);
        if self.config.warn_on_overflow {
            tracing::warn!(
                "Memory pool '{}' overflowed. Expanded to {} blocks.",
                desc.name,
                desc.total_blocks
            );
        } else {
            tracing::debug!(
                "Memory pool '{}' overflowed. Expanded to {} blocks.",
                desc.name,
                desc.total_blocks
            );
        }
    }
}

impl MemSystem {
    /// Create an empty pool of `object_size`-byte objects.
    ///
    /// A name shared with a live pool only logs a warning.
    pub fn create_pool(&self, name: &str, object_size: usize) -> PoolRef {
        self.lock().register(name, object_size, None)
    }

    /// Create a pool of `num_blocks` blocks carved from the static arena.
    ///
    /// Only static pools take part in hibernation.
    pub fn init_static_pool(
        &self,
        name: &str,
        num_blocks: usize,
        object_size: usize,
    ) -> MemoryResult<PoolRef> {
        let mut state = self.lock();
        if !state.storage.has_arena() {
            return Err(MemoryError::NoArena);
        }
        let block_size = state.layout.block_size(object_size);
        let available = state.storage.arena_len() - state.storage.arena_carved();
        let Some(bytes) = num_blocks.checked_mul(block_size) else {
            return Err(MemoryError::arena_exhausted(name, usize::MAX, available));
        };
        let start = state
            .storage
            .carve(bytes)
            .map_err(|available| MemoryError::arena_exhausted(name, bytes, available))?;
        let pool = state.register(name, object_size, None);
        state.install_blocks(pool, start, num_blocks);
        tracing::debug!(
            "Static memory pool '{}' holds {} blocks of {} bytes",
            name,
            num_blocks,
            block_size
        );
        Ok(pool)
    }

    /// Add `count` objects to the pool and return it.
    ///
    /// Top-level pools take one new chunk of system memory; the allocation
    /// happens with the allocator lock released. Sub-pools borrow blocks from
    /// their super-pool, growing it first if needed. Running out of system
    /// memory is fatal.
    pub fn expand_pool(&self, pool: PoolRef, count: usize) -> PoolRef {
        let mut state = self.lock();
        self.expand_locked(&mut state, pool, count);
        pool
    }

    pub(crate) fn expand_locked(
        &self,
        state: &mut MutexGuard<'_, State>,
        pool: PoolRef,
        count: usize,
    ) {
        if count == 0 {
            return;
        }
        loop {
            let request = match state.try_expand(pool, count) {
                Ok(()) => return,
                Err(request) => request,
            };
            let Some(bytes) = request.blocks.checked_mul(request.block_size) else {
                fatal!(
                    "expansion of pool '{}' by {} blocks overflows",
                    state.registry.get(request.pool).name,
                    request.blocks
                );
            };
            let chunk = MutexGuard::unlocked(state, || allocate_chunk(bytes));
            let Some(chunk) = chunk else {
                fatal!(
                    "system memory exhausted: {bytes} bytes for pool '{}'",
                    state.registry.get(request.pool).name
                );
            };
            let chunk = state.storage.install(chunk);
            state.install_blocks(request.pool, ObjRef::new(chunk, 0), request.blocks);
            tracing::debug!(
                "Memory pool '{}' took {} bytes of system memory",
                state.registry.get(request.pool).name,
                bytes
            );
            if request.pool == pool {
                return;
            }
            // Grown on behalf of a sub-pool further down the chain.
            if state.config.track_stats {
                state.registry.get_mut(request.pool).counters.num_overflows +=
                    request.blocks as u64;
            }
        }
    }

    /// Allocate an object if one is free. Never grows the pool.
    #[track_caller]
    pub fn try_alloc(&self, pool: PoolRef) -> Option<ObjRef> {
        let caller = Location::caller();
        let mut state = self.lock();
        let object = state.take_block(pool)?;
        state.trace(pool, "TryAlloc", object, caller);
        Some(object)
    }

    /// Allocate an object; an empty pool is fatal.
    #[track_caller]
    pub fn assert_alloc(&self, pool: PoolRef) -> ObjRef {
        let caller = Location::caller();
        let mut state = self.lock();
        let Some(object) = state.take_block(pool) else {
            fatal!("Memory pool '{}' is empty", state.registry.get(pool).name);
        };
        state.trace(pool, "AssertAlloc", object, caller);
        object
    }

    /// Allocate an object, growing the pool by its force count as often as needed.
    #[track_caller]
    pub fn force_alloc(&self, pool: PoolRef) -> ObjRef {
        let caller = Location::caller();
        let mut state = self.lock();
        loop {
            if let Some(object) = state.take_block(pool) {
                state.trace(pool, "ForceAlloc", object, caller);
                return object;
            }
            let count = state.registry.get(pool).force_count;
            self.expand_locked(&mut state, pool, count);
            if state.config.track_stats {
                state.registry.get_mut(pool).counters.num_overflows += 1;
            }
            state.log_overflow(pool);
        }
    }

    /// [`try_alloc`](Self::try_alloc) from the first pool up the super-pool
    /// chain whose objects hold `size` bytes. No such pool is fatal.
    #[track_caller]
    pub fn try_var_alloc(&self, pool: PoolRef, size: usize) -> Option<ObjRef> {
        let target = self.lock().pool_for_size(pool, size);
        self.try_alloc(target)
    }

    /// [`assert_alloc`](Self::assert_alloc) counterpart of [`try_var_alloc`](Self::try_var_alloc)
    #[track_caller]
    pub fn assert_var_alloc(&self, pool: PoolRef, size: usize) -> ObjRef {
        let target = self.lock().pool_for_size(pool, size);
        self.assert_alloc(target)
    }

    /// [`force_alloc`](Self::force_alloc) counterpart of [`try_var_alloc`](Self::try_var_alloc)
    #[track_caller]
    pub fn force_var_alloc(&self, pool: PoolRef, size: usize) -> ObjRef {
        let target = self.lock().pool_for_size(pool, size);
        self.force_alloc(target)
    }

    /// Drop one reference. The last one runs the pool's destructor, with the
    /// allocator lock released, and then returns the block to the free list.
    ///
    /// Releasing a free block or a block with damaged guard bands is fatal.
    #[track_caller]
    pub fn release(&self, object: ObjRef) {
        let caller = Location::caller();
        let mut state = self.lock();
        let pool = state.resolve(object);
        state.trace(pool, "Release", object, caller);

        match state.storage.ref_count(object) {
            0 => fatal!(
                "Releasing free block {object} of pool '{}'",
                state.registry.get(pool).name
            ),
            1 => {
                state.storage.set_ref_count(object, 0);
                if let Some(destructor) = state.registry.get(pool).destructor.clone() {
                    MutexGuard::unlocked(&mut state, || destructor.destruct(self, object));
                }
                state.recycle(pool, object);
            }
            count => state.storage.set_ref_count(object, count - 1),
        }
    }

    /// Add a reference. Fatal on a free block or damaged guard bands.
    #[track_caller]
    pub fn add_ref(&self, object: ObjRef) {
        let caller = Location::caller();
        let mut state = self.lock();
        let pool = state.resolve(object);
        state.trace(pool, "AddRef", object, caller);
        let count = state.storage.ref_count(object);
        fatal_if!(
            count == 0,
            "Adding a reference to free block {object} of pool '{}'",
            state.registry.get(pool).name
        );
        state.storage.set_ref_count(object, count + 1);
    }

    /// Current reference count of the object
    pub fn ref_count(&self, object: ObjRef) -> usize {
        let state = self.lock();
        state.owner_of(object);
        state.storage.ref_count(object)
    }

    /// Pool the object belongs to, after a guard band check
    pub fn object_pool(&self, object: ObjRef) -> PoolRef {
        self.lock().resolve(object)
    }

    /// Usable bytes of the object, after a guard band check
    pub fn block_object_size(&self, object: ObjRef) -> usize {
        let state = self.lock();
        let pool = state.resolve(object);
        state.registry.get(pool).object_size
    }

    /// Install the destructor run when an object of this pool is freed.
    ///
    /// Sub-pools created afterwards inherit it.
    pub fn set_destructor(&self, pool: PoolRef, destructor: impl Destructor + 'static) {
        self.lock().registry.get_mut(pool).destructor = Some(Arc::new(destructor));
    }

    /// Remove the pool's destructor.
    pub fn clear_destructor(&self, pool: PoolRef) {
        self.lock().registry.get_mut(pool).destructor = None;
    }

    /// Objects added by each forced expansion; 0 is treated as 1.
    pub fn set_num_objs_to_force(&self, pool: PoolRef, count: usize) {
        self.lock().registry.get_mut(pool).force_count = count.max(1);
    }

    /// Emit TRACE events for every allocation, release and add-ref on the pool.
    pub fn set_trace(&self, pool: PoolRef, enabled: bool) {
        self.lock().registry.get_mut(pool).trace = enabled;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::config::MemConfig;

    fn guarded() -> MemSystem {
        MemSystem::new(MemConfig::debug()).unwrap()
    }

    #[test]
    fn test_truncate_name_respects_char_boundaries() {
        let long = "é".repeat(MAX_POOL_NAME_BYTES);
        let short = truncate_name(&long);
        assert!(short.len() <= MAX_POOL_NAME_BYTES);
        assert!(short.chars().all(|c| c == 'é'));
        assert_eq!(truncate_name("abc"), "abc");
    }

    #[test]
    fn test_names_can_be_omitted() {
        let config = MemConfig {
            pool_names: false,
            ..MemConfig::production()
        };
        let system = MemSystem::new(config).unwrap();
        let pool = system.create_pool("hidden", 8);
        assert_eq!(system.pool_name(pool), OMITTED_NAME);
    }

    #[test]
    #[should_panic(expected = "Memory corruption detected after object")]
    fn test_overrun_detected_on_release() {
        let system = guarded();
        let pool = system.create_pool("overrun", 64);
        let object = system.force_alloc(pool);
        {
            let mut state = system.lock();
            let (payload, len) = state.payload_range(object);
            let bytes = state.storage.get_mut(payload, len + 1).unwrap();
            bytes[len] ^= 0x5A;
        }
        system.release(object);
    }

    #[test]
    #[should_panic(expected = "Memory corruption detected before object")]
    fn test_underrun_detected_on_add_ref() {
        let system = guarded();
        let pool = system.create_pool("underrun", 32);
        let object = system.force_alloc(pool);
        {
            let mut state = system.lock();
            let payload = state.layout.payload_offset();
            let bytes = state.storage.get_mut(object, payload).unwrap();
            bytes[payload - 1] = 0;
        }
        system.add_ref(object);
    }

    #[test]
    fn test_fill_patterns() {
        let system = guarded();
        let pool = system.create_pool("patterns", 16);
        let object = system.force_alloc(pool);
        assert_eq!(system.read_payload(object), vec![0xBB; 16]);
        system.release(object);
        assert_eq!(system.read_payload(object), vec![0xDD; 16]);
    }

    #[test]
    fn test_heap_expansion_installs_one_chunk() {
        let system = MemSystem::new(MemConfig::production()).unwrap();
        let pool = system.create_pool("chunked", 24);
        system.expand_pool(pool, 5);
        let state = system.lock();
        let desc = state.registry.get(pool);
        assert_eq!(desc.total_blocks, 5);
        assert!(desc.free_list.iter().all(|block| block.chunk() == desc.free_list[0].chunk()));
        let mut offsets: Vec<usize> = desc.free_list.iter().map(ObjRef::offset).collect();
        offsets.sort_unstable();
        let expected: Vec<usize> = (0..5).map(|i| i * desc.block_size).collect();
        assert_eq!(offsets, expected);
    }

    /// Run `f` and report, for every chunk allocation it makes, whether the
    /// allocator lock was held at that moment.
    fn lock_state_during_allocation(
        system: &Arc<MemSystem>,
        f: impl FnOnce(&MemSystem),
    ) -> Vec<bool> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let (hook_system, hook_seen) = (Arc::clone(system), Rc::clone(&seen));
        crate::storage::set_allocation_hook(Some(Box::new(move |_| {
            hook_seen.borrow_mut().push(hook_system.is_locked());
        })));
        f(system);
        crate::storage::set_allocation_hook(None);
        seen.take()
    }

    #[test]
    fn test_heap_allocation_runs_unlocked() {
        let system = Arc::new(MemSystem::new(MemConfig::production()).unwrap());
        let pool = system.create_pool("unlocked", 32);
        let seen = lock_state_during_allocation(&system, |system| {
            system.expand_pool(pool, 4);
        });
        assert_eq!(seen, vec![false]);
        assert_eq!(system.object_count(pool), 4);
    }

    #[test]
    fn test_sub_pool_heap_fallthrough_runs_unlocked() {
        let system = Arc::new(MemSystem::new(MemConfig::production()).unwrap());
        let parent = system.create_pool("parent", 32);
        let child = system.create_sub_pool(parent, "child", 0);
        let seen = lock_state_during_allocation(&system, |system| {
            system.expand_pool(child, 3);
        });
        assert_eq!(seen, vec![false]);
        assert_eq!(system.object_count(parent), 3);
        assert_eq!(system.object_count(child), 3);
        assert_eq!(system.stats(parent).num_blocks_in_use, 3);
    }
}
