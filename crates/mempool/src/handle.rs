//! Handles to pools and pool objects.

use core::fmt;

/// Handle to a pool.
///
/// Cheap to copy. Handles of deleted sub-pools are detected through the
/// generation and rejected with a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl PoolRef {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Display for PoolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool#{}.{}", self.index, self.generation)
    }
}

/// Handle to an allocated object: the chunk holding its block and the
/// block's byte offset inside that chunk.
///
/// Ordering follows memory order, chunk first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjRef {
    pub(crate) chunk: u32,
    pub(crate) offset: usize,
}

impl ObjRef {
    pub(crate) const fn new(chunk: u32, offset: usize) -> Self {
        Self { chunk, offset }
    }

    /// Chunk the block lives in. Chunk 0 is the static arena when one is configured.
    #[must_use]
    pub const fn chunk(&self) -> u32 {
        self.chunk
    }

    /// Byte offset of the block inside its chunk
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Handle of the block `bytes` further on in the same chunk
    pub(crate) const fn advance(self, bytes: usize) -> Self {
        Self::new(self.chunk, self.offset + bytes)
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.chunk, self.offset)
    }
}
