//! Allocator configuration

use crate::error::{MemoryError, MemoryResult};

/// Guard band words used when guard bands are enabled and no count is given
pub const DEFAULT_GUARD_BAND_WORDS: usize = 4;

/// Default capacity of the sub-pool descriptor table
pub const DEFAULT_MAX_SUB_POOLS: usize = 8;

/// Upper bound on guard band words per side
pub const MAX_GUARD_BAND_WORDS: usize = 64;

/// Configuration for a [`MemSystem`](crate::MemSystem)
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MemConfig {
    /// Surround each payload with sentinel words checked on release and add-ref
    pub guard_bands: bool,
    /// Number of 32-bit sentinel words on each side of the payload
    pub guard_band_words: usize,

    /// Capacity of the sub-pool descriptor table
    pub max_sub_pools: usize,
    /// Blocks added per `force_alloc` expansion for new pools
    pub default_force_count: usize,
    /// Log pool overflows at WARN instead of DEBUG
    pub warn_on_overflow: bool,

    /// Keep pool names; when false every pool reports `"<omitted>"`
    pub pool_names: bool,
    /// Maintain allocation/overflow/peak counters
    pub track_stats: bool,

    /// Fill pattern byte for newly allocated payloads (for debugging)
    pub alloc_pattern: Option<u8>,
    /// Fill pattern byte for released payloads (for debugging)
    pub dealloc_pattern: Option<u8>,

    /// Bytes reserved for static pools by [`MemSystem::new`](crate::MemSystem::new)
    pub arena_size: usize,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            guard_bands: cfg!(debug_assertions),
            guard_band_words: DEFAULT_GUARD_BAND_WORDS,
            max_sub_pools: DEFAULT_MAX_SUB_POOLS,
            default_force_count: 1,
            warn_on_overflow: false,
            pool_names: true,
            track_stats: true,
            alloc_pattern: if cfg!(debug_assertions) {
                Some(0xBB)
            } else {
                None
            },
            dealloc_pattern: if cfg!(debug_assertions) {
                Some(0xDD)
            } else {
                None
            },
            arena_size: 0,
        }
    }
}

impl MemConfig {
    /// Production configuration - no guard bands or fill patterns
    #[must_use]
    pub fn production() -> Self {
        Self {
            guard_bands: false,
            track_stats: true,
            alloc_pattern: None,
            dealloc_pattern: None,
            ..Self::default()
        }
    }

    /// Debug configuration - guard bands, fill patterns and loud overflows
    #[must_use]
    pub fn debug() -> Self {
        Self {
            guard_bands: true,
            guard_band_words: DEFAULT_GUARD_BAND_WORDS,
            warn_on_overflow: true,
            track_stats: true,
            alloc_pattern: Some(0xBB),
            dealloc_pattern: Some(0xDD),
            ..Self::default()
        }
    }

    /// Constrained-target configuration backed by a static arena of `arena_size` bytes
    #[must_use]
    pub fn embedded(arena_size: usize) -> Self {
        Self {
            guard_bands: false,
            warn_on_overflow: true,
            pool_names: false,
            alloc_pattern: None,
            dealloc_pattern: None,
            arena_size,
            ..Self::default()
        }
    }

    /// Set the static arena size
    #[must_use]
    pub fn with_arena_size(mut self, arena_size: usize) -> Self {
        self.arena_size = arena_size;
        self
    }

    /// Enable guard bands with `words` sentinel words per side, or disable them with 0
    #[must_use]
    pub fn with_guard_bands(mut self, words: usize) -> Self {
        self.guard_bands = words > 0;
        self.guard_band_words = words;
        self
    }

    /// Bytes of one guard band, 0 when guard bands are disabled
    #[must_use]
    pub fn guard_band_size(&self) -> usize {
        if self.guard_bands {
            self.guard_band_words * size_of::<u32>()
        } else {
            0
        }
    }

    /// Check the configuration for values the allocator cannot work with
    pub fn validate(&self) -> MemoryResult<()> {
        if self.guard_bands && self.guard_band_words == 0 {
            return Err(MemoryError::invalid_config(
                "guard bands enabled with zero guard band words",
            ));
        }
        if self.guard_band_words > MAX_GUARD_BAND_WORDS {
            return Err(MemoryError::invalid_config(&format!(
                "guard_band_words {} exceeds the maximum of {MAX_GUARD_BAND_WORDS}",
                self.guard_band_words
            )));
        }
        if self.default_force_count == 0 {
            return Err(MemoryError::invalid_config(
                "default_force_count must be at least 1",
            ));
        }
        Ok(())
    }
}
