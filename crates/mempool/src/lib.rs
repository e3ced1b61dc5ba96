//! # nebula-mempool
//!
//! Fixed-block memory pools for targets that cannot afford a general-purpose
//! heap on their hot paths.
//!
//! - Pools of fixed-size blocks with O(1) allocation and release
//! - Per-object reference counts with per-pool destructors
//! - Sub-pools that borrow capacity from a super-pool, and reduced pools that
//!   split one super-pool block into several smaller ones
//! - Optional guard bands around every object to catch overruns
//! - Static pools carved from a pre-reserved arena, which can be compacted
//!   before a low-power sleep and restored afterwards
//!
//! ## Quick Start
//!
//! ```rust
//! use nebula_mempool::prelude::*;
//!
//! let system = MemSystem::new(MemConfig::default())?;
//!
//! // A pool of 128-byte buffers, grown on demand
//! let buffers = system.create_pool("net.buffers", 128);
//! let buffer = system.force_alloc(buffers);
//! system.add_ref(buffer);
//! assert_eq!(system.ref_count(buffer), 2);
//! system.release(buffer);
//! system.release(buffer);
//!
//! // A sub-pool of smaller objects living inside the buffers' blocks
//! let headers = system.create_reduced_pool(buffers, "net.headers", 4, 24);
//! let header = system.assert_alloc(headers);
//! system.release(header);
//! system.delete_sub_pool(headers);
//! # Ok::<(), MemoryError>(())
//! ```
//!
//! ## Errors
//!
//! Misuse the allocator cannot recover from is fatal: it is logged at ERROR
//! level and panics. This covers releasing a free object, corrupted guard
//! bands, deleting a sub-pool that still has objects in use and running out
//! of system memory. Conditions a caller can handle are returned as
//! [`MemoryError`].
//!
//! ## Features
//!
//! - `hibernate` (default): arena compaction via [`MemSystem::hibernate`]
//! - `serde`: serde support for [`MemConfig`], [`PoolStats`] and [`PoolInfo`]

#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

mod macros;

pub mod config;
pub mod destructor;
pub mod error;
pub mod global;
pub mod guard;
pub mod handle;
#[cfg(feature = "hibernate")]
#[cfg_attr(docsrs, doc(cfg(feature = "hibernate")))]
pub mod hibernate;
pub mod layout;
pub mod pool;
mod registry;
pub mod stats;
mod storage;
pub mod sub_pool;
pub mod system;

pub use crate::config::MemConfig;
pub use crate::destructor::Destructor;
pub use crate::error::{MemoryError, MemoryResult};
pub use crate::handle::{ObjRef, PoolRef};
pub use crate::stats::{PoolInfo, PoolStats};
pub use crate::system::MemSystem;

pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::config::MemConfig;
    pub use crate::destructor::Destructor;
    pub use crate::error::{MemoryError, MemoryResult};
    pub use crate::handle::{ObjRef, PoolRef};
    pub use crate::stats::{PoolInfo, PoolStats, render_table};
    pub use crate::system::MemSystem;
}
