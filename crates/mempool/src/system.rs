//! The allocator context.
//!
//! [`MemSystem`] owns every pool, every block of backing memory and the one
//! lock that serialises them. Pool operations live in [`crate::pool`] and
//! [`crate::sub_pool`]; this module holds construction, inspection and
//! payload access.

use core::fmt;

use parking_lot::{Mutex, MutexGuard};

use crate::config::MemConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::handle::{ObjRef, PoolRef};
use crate::layout::BlockLayout;
use crate::macros::fatal;
use crate::pool::PoolDesc;
use crate::registry::Registry;
use crate::stats::{PoolInfo, PoolStats};
use crate::storage::{Storage, allocate_chunk};

#[cfg(feature = "hibernate")]
use crate::hibernate::Hibernation;

/// Everything guarded by the allocator lock
pub(crate) struct State {
    pub(crate) config: MemConfig,
    pub(crate) layout: BlockLayout,
    pub(crate) registry: Registry<PoolDesc>,
    pub(crate) storage: Storage,
    /// Descriptors taken from the bounded sub-pool table
    pub(crate) sub_pools_in_use: usize,
    #[cfg(feature = "hibernate")]
    pub(crate) hibernation: Option<Hibernation>,
}

/// A set of fixed-block memory pools sharing one lock and one static arena.
///
/// # Examples
///
/// ```
/// use nebula_mempool::{MemConfig, MemSystem};
///
/// let system = MemSystem::new(MemConfig::default())?;
/// let pool = system.create_pool("app.messages", 64);
/// system.expand_pool(pool, 4);
///
/// let message = system.assert_alloc(pool);
/// system.write_payload(message, 0, b"hello");
/// assert_eq!(&system.read_payload(message)[..5], b"hello");
/// system.release(message);
/// # Ok::<(), nebula_mempool::MemoryError>(())
/// ```
pub struct MemSystem {
    config: MemConfig,
    state: Mutex<State>,
}

impl MemSystem {
    /// Create an allocator, reserving `config.arena_size` bytes of static arena.
    pub fn new(config: MemConfig) -> MemoryResult<Self> {
        config.validate()?;
        let arena = if config.arena_size > 0 {
            Some(allocate_chunk(config.arena_size).ok_or_else(|| {
                MemoryError::invalid_config(&format!(
                    "could not reserve a {}-byte arena",
                    config.arena_size
                ))
            })?)
        } else {
            None
        };
        Ok(Self::build(config, arena))
    }

    /// Create an allocator whose static pools are carved from `arena`.
    /// `config.arena_size` is ignored.
    pub fn with_arena(mut config: MemConfig, arena: Box<[u8]>) -> MemoryResult<Self> {
        config.validate()?;
        config.arena_size = arena.len();
        Ok(Self::build(config, Some(arena)))
    }

    fn build(config: MemConfig, arena: Option<Box<[u8]>>) -> Self {
        let layout = BlockLayout::new(config.guard_band_size());
        tracing::debug!(
            guard_band_size = layout.guard_band_size(),
            arena_size = config.arena_size,
            "memory pool system initialised"
        );
        Self {
            state: Mutex::new(State {
                config: config.clone(),
                layout,
                registry: Registry::default(),
                storage: Storage::new(arena),
                sub_pools_in_use: 0,
                #[cfg(feature = "hibernate")]
                hibernation: None,
            }),
            config,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock()
    }

    #[cfg(feature = "hibernate")]
    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, State>> {
        self.state.try_lock()
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        self.state.is_locked()
    }

    /// The configuration this allocator was built with
    #[must_use]
    pub fn config(&self) -> &MemConfig {
        &self.config
    }

    /// Block geometry in use
    #[must_use]
    pub fn layout(&self) -> BlockLayout {
        BlockLayout::new(self.config.guard_band_size())
    }

    /// Size of the static arena in bytes, 0 when there is none
    pub fn arena_len(&self) -> usize {
        self.lock().storage.arena_len()
    }

    /// Bytes of the static arena handed to static pools so far
    pub fn arena_used(&self) -> usize {
        self.lock().storage.arena_carved()
    }

    // ------------------------------------------------------------------------
    // Pool inspection
    // ------------------------------------------------------------------------

    /// Name the pool was registered with
    pub fn pool_name(&self, pool: PoolRef) -> String {
        self.lock().registry.get(pool).name.clone()
    }

    /// Whether the pool borrows its blocks from a super-pool
    pub fn is_sub_pool(&self, pool: PoolRef) -> bool {
        self.lock().registry.get(pool).super_pool.is_some()
    }

    /// Super-pool a sub-pool borrows its blocks from
    pub fn super_pool(&self, pool: PoolRef) -> Option<PoolRef> {
        self.lock().registry.get(pool).super_pool
    }

    /// Blocks owned by the pool, free or in use
    pub fn object_count(&self, pool: PoolRef) -> usize {
        self.lock().registry.get(pool).total_blocks
    }

    /// Usable bytes per object
    pub fn object_size(&self, pool: PoolRef) -> usize {
        self.lock().registry.get(pool).object_size
    }

    /// Bytes per block including header, guard bands and padding
    pub fn object_full_size(&self, pool: PoolRef) -> usize {
        self.lock().registry.get(pool).block_size
    }

    /// Allocation, overflow and usage counters of the pool
    pub fn stats(&self, pool: PoolRef) -> PoolStats {
        self.lock().registry.get(pool).stats()
    }

    /// Zero the allocation and overflow counters. The peak is kept.
    pub fn reset_stats(&self, pool: PoolRef) {
        let mut state = self.lock();
        let counters = &mut state.registry.get_mut(pool).counters;
        counters.num_allocs = 0;
        counters.num_overflows = 0;
    }

    /// Look up a pool by name; the first match in creation order wins.
    pub fn find_pool(&self, name: &str) -> Option<PoolRef> {
        self.lock().registry.find(name)
    }

    /// Snapshot of one pool
    pub fn pool_info(&self, pool: PoolRef) -> PoolInfo {
        let state = self.lock();
        state.info(pool)
    }

    /// Snapshot of every live pool in creation order
    pub fn pools(&self) -> Vec<PoolInfo> {
        let state = self.lock();
        state
            .registry
            .handles()
            .into_iter()
            .map(|pool| state.info(pool))
            .collect()
    }

    /// Number of live pools
    pub fn pool_count(&self) -> usize {
        self.lock().registry.len()
    }

    /// Bumped whenever a pool is created or a sub-pool deleted
    pub fn pool_list_change_count(&self) -> usize {
        self.lock().registry.change_count()
    }

    // ------------------------------------------------------------------------
    // Payload access
    // ------------------------------------------------------------------------

    /// Run `f` over the object's payload.
    ///
    /// The allocator lock is held while `f` runs; calling back into this
    /// `MemSystem` from `f` deadlocks.
    pub fn with_payload<R>(&self, object: ObjRef, f: impl FnOnce(&[u8]) -> R) -> R {
        let state = self.lock();
        let (start, len) = state.payload_range(object);
        match state.storage.get(start, len) {
            Some(bytes) => f(bytes),
            None => fatal!("object {object} payload lies outside its chunk"),
        }
    }

    /// Run `f` over the object's payload, mutably. Same locking rules as
    /// [`with_payload`](Self::with_payload).
    pub fn with_payload_mut<R>(&self, object: ObjRef, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut state = self.lock();
        let (start, len) = state.payload_range(object);
        match state.storage.get_mut(start, len) {
            Some(bytes) => f(bytes),
            None => fatal!("object {object} payload lies outside its chunk"),
        }
    }

    /// Copy of the object's payload
    pub fn read_payload(&self, object: ObjRef) -> Vec<u8> {
        self.with_payload(object, <[u8]>::to_vec)
    }

    /// Copy `data` into the payload at `offset`. Writing past the object is fatal.
    pub fn write_payload(&self, object: ObjRef, offset: usize, data: &[u8]) {
        self.with_payload_mut(object, |payload| {
            let object_size = payload.len();
            let Some(target) = offset
                .checked_add(data.len())
                .and_then(|end| payload.get_mut(offset..end))
            else {
                fatal!(
                    "write of {} bytes at offset {offset} overruns the {}-byte object {object}",
                    data.len(),
                    object_size
                );
            };
            target.copy_from_slice(data);
        });
    }
}

impl State {
    /// Payload location and length of `object`.
    pub(crate) fn payload_range(&self, object: ObjRef) -> (ObjRef, usize) {
        let pool = self.owner_of(object);
        let object_size = self.registry.get(pool).object_size;
        (object.advance(self.layout.payload_offset()), object_size)
    }

    pub(crate) fn info(&self, pool: PoolRef) -> PoolInfo {
        let desc = self.registry.get(pool);
        PoolInfo {
            pool,
            name: desc.name.clone(),
            object_size: desc.object_size,
            block_size: desc.block_size,
            total_blocks: desc.total_blocks,
            blocks_in_use: desc.in_use,
            free_blocks: desc.free_list.len(),
            is_sub_pool: desc.super_pool.is_some(),
            super_pool: desc
                .super_pool
                .map(|super_pool| self.registry.get(super_pool).name.clone()),
            stats: desc.stats(),
        }
    }
}

impl fmt::Debug for MemSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("MemSystem");
        debug.field("config", &self.config);
        if let Some(state) = self.state.try_lock() {
            debug
                .field("pools", &state.registry.len())
                .field("sub_pools", &state.sub_pools_in_use)
                .field("arena_used", &state.storage.arena_carved());
        }
        debug.finish_non_exhaustive()
    }
}
