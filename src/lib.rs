//! Per-thread buddy allocator.
//!
//! Every thread that uses a [`Registry`] gets its own arena: a set of
//! power-of-two pages carved into power-of-two blocks. Allocation splits a
//! free block down to the requested size class and freeing merges a block
//! with its buddy back up the classes, so neither touches a lock. Pages that
//! end up wholly free are returned to the system under a keep-factor /
//! keep-minimum policy, and requests larger than a page bypass the buddy
//! system entirely.
//!
//! A block freed by a thread that does not own it is queued on the owner's
//! deferred-free list and merged the next time the owner allocates. When an
//! owner shuts its arena down while other threads still hold blocks, the
//! thread that returns the last one completes the teardown.
//!
//! ```
//! use buddy_arena::{Config, Registry};
//!
//! let registry = Registry::new();
//! registry.initialize(Config::default()).unwrap();
//!
//! let ptr = registry.allocate(100).unwrap().unwrap();
//! unsafe {
//!   ptr.as_ptr().write_bytes(0xAB, 100);
//!   registry.free(ptr.as_ptr());
//! }
//! registry.shutdown().unwrap();
//! ```

#![allow(clippy::missing_safety_doc)]

mod arena;
mod block;
mod config;
mod deferred;
mod error;
mod free_list;
#[cfg(feature = "leak-tracking")]
mod labels;
mod os;
mod registry;
mod stats;

pub use arena::{ArenaId, FreeBlock};
pub use block::{ALIGNMENT, HEADER_SIZE, MIN_PAYLOAD};
pub use config::{Config, DEFAULT_KEEP_FACTOR, DEFAULT_KEEP_MINIMUM, DEFAULT_PAGE_SIZE};
pub use error::{Error, Result};
#[cfg(feature = "leak-tracking")]
pub use labels::{LeakRecord, Site};
pub use registry::Registry;
pub use stats::Stats;
