//! Process-wide allocator instance.
//!
//! Code that cannot thread a [`MemSystem`] through its call graph can install
//! one here at startup. Initialisation and shutdown are explicit.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::MemConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::system::MemSystem;

static GLOBAL: RwLock<Option<Arc<MemSystem>>> = parking_lot::const_rwlock(None);

/// Build and install the global allocator. Fails if one is already installed.
pub fn init(config: MemConfig) -> MemoryResult<Arc<MemSystem>> {
    let mut slot = GLOBAL.write();
    if slot.is_some() {
        return Err(MemoryError::invalid_state(
            "global memory pool system already initialised",
        ));
    }
    let system = Arc::new(MemSystem::new(config)?);
    *slot = Some(Arc::clone(&system));
    Ok(system)
}

/// The installed global allocator, if any
pub fn get() -> Option<Arc<MemSystem>> {
    GLOBAL.read().clone()
}

/// Uninstall the global allocator and return it. Handles already cloned
/// from [`get`] keep it alive.
pub fn shutdown() -> Option<Arc<MemSystem>> {
    GLOBAL.write().take()
}
