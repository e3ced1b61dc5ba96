//! Block layout arithmetic.
//!
//! Every block is laid out as
//!
//! ```text
//! +-----------+-----------+--------------+---------------------------+---------------+---------+
//! | owner id  | ref count | leading band | payload: max(obj, link)   | trailing band | padding |
//! +-----------+-----------+--------------+---------------------------+---------------+---------+
//!   one word    one word    guard bytes                               guard bytes     to word
//! ```
//!
//! The payload reserves at least one link word so that a block is never
//! smaller than a hibernation compact record.

/// Size of a machine word
pub const WORD_SIZE: usize = size_of::<usize>();

/// Block header: owning pool id and reference count
pub const HEADER_SIZE: usize = 2 * WORD_SIZE;

/// Minimum payload reservation
pub const LINK_SIZE: usize = WORD_SIZE;

/// Offset of the owner pool id inside a block
pub const OWNER_OFFSET: usize = 0;

/// Offset of the reference count inside a block
pub const REF_COUNT_OFFSET: usize = WORD_SIZE;

/// Round `value` up to the next multiple of the word size.
#[inline]
#[must_use]
pub const fn round_up_to_word(value: usize) -> usize {
    value.div_ceil(WORD_SIZE) * WORD_SIZE
}

/// Block geometry for a given guard band size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    guard: usize,
}

impl BlockLayout {
    /// Layout with `guard_band_size` bytes of sentinel on each side of the payload.
    #[must_use]
    pub const fn new(guard_band_size: usize) -> Self {
        Self {
            guard: guard_band_size,
        }
    }

    /// Bytes of a single guard band
    #[must_use]
    pub const fn guard_band_size(&self) -> usize {
        self.guard
    }

    /// Full block size for objects of `object_size` bytes.
    #[must_use]
    pub const fn block_size(&self, object_size: usize) -> usize {
        let payload = if object_size > LINK_SIZE {
            object_size
        } else {
            LINK_SIZE
        };
        round_up_to_word(HEADER_SIZE + payload + 2 * self.guard)
    }

    /// Offset of the leading guard band
    #[must_use]
    pub const fn leading_guard_offset(&self) -> usize {
        HEADER_SIZE
    }

    /// Offset of the payload
    #[must_use]
    pub const fn payload_offset(&self) -> usize {
        HEADER_SIZE + self.guard
    }

    /// Offset of the trailing guard band, which directly follows the payload reservation
    #[must_use]
    pub const fn trailing_guard_offset(&self, object_size: usize) -> usize {
        let payload = if object_size > LINK_SIZE {
            object_size
        } else {
            LINK_SIZE
        };
        self.payload_offset() + payload
    }

    /// How many blocks for `object_size` fit in one block of `super_block_size`.
    #[must_use]
    pub const fn divisor(&self, super_block_size: usize, object_size: usize) -> usize {
        super_block_size / self.block_size(object_size)
    }

    /// Largest word-aligned object size whose block fits `divisor` times in
    /// a block of `super_block_size`.
    #[must_use]
    pub const fn reduced_object_size(&self, super_block_size: usize, divisor: usize) -> usize {
        let size = (super_block_size / divisor).saturating_sub(HEADER_SIZE + 2 * self.guard);
        size - size % WORD_SIZE
    }
}
