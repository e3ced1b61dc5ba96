//! Pool destructors.

use crate::handle::ObjRef;
use crate::system::MemSystem;

/// Called when the last reference to an object is released.
///
/// Runs with the allocator lock released, so it may allocate, release and
/// add references to objects of any pool, including its own. The object's
/// reference count is already zero; its payload stays readable until the
/// destructor returns, after which the block goes back on the free list.
pub trait Destructor: Send + Sync {
    fn destruct(&self, system: &MemSystem, object: ObjRef);
}

impl<F> Destructor for F
where
    F: Fn(&MemSystem, ObjRef) + Send + Sync,
{
    fn destruct(&self, system: &MemSystem, object: ObjRef) {
        self(system, object);
    }
}
