//! Backing memory: the static arena and heap chunks.
//!
//! Chunks are only ever added. Heap chunks are carved into blocks once, at
//! expansion time, and are never returned to the system.

use crate::handle::ObjRef;
use crate::layout::{OWNER_OFFSET, REF_COUNT_OFFSET, WORD_SIZE};

#[cfg(test)]
thread_local! {
    static ALLOCATION_HOOK: std::cell::RefCell<Option<Box<dyn Fn(usize)>>> =
        const { std::cell::RefCell::new(None) };
}

/// Run `hook` before every chunk allocation on this thread, or stop with `None`.
#[cfg(test)]
pub(crate) fn set_allocation_hook(hook: Option<Box<dyn Fn(usize)>>) {
    ALLOCATION_HOOK.with(|slot| *slot.borrow_mut() = hook);
}

/// Reserve `len` zeroed bytes from system memory. `None` if the reservation fails.
pub(crate) fn allocate_chunk(len: usize) -> Option<Box<[u8]>> {
    #[cfg(test)]
    ALLOCATION_HOOK.with(|slot| {
        if let Some(hook) = slot.borrow().as_ref() {
            hook(len);
        }
    });
    let mut bytes = Vec::new();
    bytes.try_reserve_exact(len).ok()?;
    bytes.resize(len, 0);
    Some(bytes.into_boxed_slice())
}

/// Read a native-endian word at `at`.
#[inline]
pub(crate) fn read_word(bytes: &[u8], at: usize) -> usize {
    let mut word = [0u8; WORD_SIZE];
    word.copy_from_slice(&bytes[at..at + WORD_SIZE]);
    usize::from_ne_bytes(word)
}

/// Write a native-endian word at `at`.
#[inline]
pub(crate) fn write_word(bytes: &mut [u8], at: usize, value: usize) {
    bytes[at..at + WORD_SIZE].copy_from_slice(&value.to_ne_bytes());
}

#[derive(Debug)]
struct ArenaBounds {
    chunk: u32,
    carved: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Storage {
    chunks: Vec<Box<[u8]>>,
    arena: Option<ArenaBounds>,
}

impl Storage {
    /// Storage whose first chunk is `arena`, when given.
    pub(crate) fn new(arena: Option<Box<[u8]>>) -> Self {
        let mut storage = Self::default();
        if let Some(bytes) = arena {
            let chunk = storage.install(bytes);
            storage.arena = Some(ArenaBounds { chunk, carved: 0 });
        }
        storage
    }

    /// Add a chunk and return its index.
    pub(crate) fn install(&mut self, bytes: Box<[u8]>) -> u32 {
        let index = self.chunks.len();
        self.chunks.push(bytes);
        // Chunk indices are u32 so that object handles stay two words wide.
        u32::try_from(index).unwrap_or_else(|_| {
            crate::macros::fatal!("chunk table overflow ({index} chunks)")
        })
    }

    pub(crate) fn has_arena(&self) -> bool {
        self.arena.is_some()
    }

    /// Chunk index of the arena
    pub(crate) fn arena_chunk(&self) -> Option<u32> {
        self.arena.as_ref().map(|arena| arena.chunk)
    }

    /// Total arena size in bytes
    pub(crate) fn arena_len(&self) -> usize {
        self.arena
            .as_ref()
            .map_or(0, |arena| self.chunks[arena.chunk as usize].len())
    }

    /// Bytes of the arena already handed to static pools
    pub(crate) fn arena_carved(&self) -> usize {
        self.arena.as_ref().map_or(0, |arena| arena.carved)
    }

    /// Take `len` bytes from the arena, returning their start offset, or the
    /// number of bytes still available.
    pub(crate) fn carve(&mut self, len: usize) -> Result<ObjRef, usize> {
        let Some(arena) = self.arena.as_mut() else {
            return Err(0);
        };
        let available = self.chunks[arena.chunk as usize].len() - arena.carved;
        if len > available {
            return Err(available);
        }
        let start = ObjRef::new(arena.chunk, arena.carved);
        arena.carved += len;
        Ok(start)
    }

    /// Whether `block` lies in the carved part of the arena.
    pub(crate) fn in_arena(&self, block: ObjRef) -> bool {
        self.arena
            .as_ref()
            .is_some_and(|arena| block.chunk == arena.chunk && block.offset < arena.carved)
    }

    /// Bytes of `len` starting at `block`, if the range lies inside a chunk.
    pub(crate) fn get(&self, block: ObjRef, len: usize) -> Option<&[u8]> {
        let chunk = self.chunks.get(block.chunk as usize)?;
        chunk.get(block.offset..block.offset.checked_add(len)?)
    }

    pub(crate) fn get_mut(&mut self, block: ObjRef, len: usize) -> Option<&mut [u8]> {
        let chunk = self.chunks.get_mut(block.chunk as usize)?;
        chunk.get_mut(block.offset..block.offset.checked_add(len)?)
    }

    /// Whole chunk, for compaction.
    pub(crate) fn chunk_mut(&mut self, chunk: u32) -> &mut [u8] {
        &mut self.chunks[chunk as usize]
    }

    /// Stamp a block header.
    pub(crate) fn write_header(&mut self, block: ObjRef, owner: u32, ref_count: usize) {
        let chunk = &mut self.chunks[block.chunk as usize];
        write_word(chunk, block.offset + OWNER_OFFSET, owner as usize);
        write_word(chunk, block.offset + REF_COUNT_OFFSET, ref_count);
    }

    pub(crate) fn owner(&self, block: ObjRef) -> usize {
        read_word(&self.chunks[block.chunk as usize], block.offset + OWNER_OFFSET)
    }

    pub(crate) fn ref_count(&self, block: ObjRef) -> usize {
        read_word(
            &self.chunks[block.chunk as usize],
            block.offset + REF_COUNT_OFFSET,
        )
    }

    pub(crate) fn set_ref_count(&mut self, block: ObjRef, ref_count: usize) {
        write_word(
            &mut self.chunks[block.chunk as usize],
            block.offset + REF_COUNT_OFFSET,
            ref_count,
        );
    }
}
