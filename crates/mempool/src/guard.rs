//! Guard band writing and verification.
//!
//! Guard bands are runs of [`GUARD_WORD`] placed directly before and after a
//! block's payload. They are written when a block is handed out and verified
//! whenever the block passes back through the allocator.

use core::fmt;

use crate::layout::BlockLayout;

/// Sentinel value repeated through every guard band
pub const GUARD_WORD: u32 = 0xDEAD_BEEF;

const GUARD_BYTES: [u8; 4] = GUARD_WORD.to_ne_bytes();

/// Which side of the payload a corrupted guard band sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardSide {
    Leading,
    Trailing,
}

impl fmt::Display for GuardSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leading => f.write_str("before"),
            Self::Trailing => f.write_str("after"),
        }
    }
}

/// First corrupted guard word found in a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardViolation {
    pub side: GuardSide,
    /// Offset of the corrupted word from the start of the block
    pub offset: usize,
}

/// Fill both guard bands of `block`.
pub(crate) fn write_guard_bands(block: &mut [u8], layout: &BlockLayout, object_size: usize) {
    let size = layout.guard_band_size();
    if size == 0 {
        return;
    }
    for start in [
        layout.leading_guard_offset(),
        layout.trailing_guard_offset(object_size),
    ] {
        for word in block[start..start + size].chunks_exact_mut(GUARD_BYTES.len()) {
            word.copy_from_slice(&GUARD_BYTES);
        }
    }
}

/// Verify both guard bands of `block`, leading band first.
pub(crate) fn check_guard_bands(
    block: &[u8],
    layout: &BlockLayout,
    object_size: usize,
) -> Result<(), GuardViolation> {
    let size = layout.guard_band_size();
    if size == 0 {
        return Ok(());
    }
    for (side, start) in [
        (GuardSide::Leading, layout.leading_guard_offset()),
        (GuardSide::Trailing, layout.trailing_guard_offset(object_size)),
    ] {
        let band = &block[start..start + size];
        if let Some(index) = band
            .chunks_exact(GUARD_BYTES.len())
            .position(|word| word != GUARD_BYTES)
        {
            return Err(GuardViolation {
                side,
                offset: start + index * GUARD_BYTES.len(),
            });
        }
    }
    Ok(())
}
