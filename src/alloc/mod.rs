//! Pluggable node storage: something that can hand out, load, and reclaim
//! fixed-size byte ranges addressed by [`NodeId`].
//!
//! [`RamAllocator`] backs a tree entirely in memory. [`FileAllocator`]
//! (see the `file` submodule) backs one with a memory-mapped file and tracks
//! its own free space through an inner instance of the tree engine.

pub mod file;
mod ram;

pub use file::{ErrorCallback, FileAllocator};
pub use ram::RamAllocator;

use crate::error::Result;
use crate::types::NodeId;
use std::ops::{Deref, DerefMut};

/// Storage backend for tree nodes. A tree is generic over this trait so the
/// same search/insert/remove logic runs whether nodes live in memory or on
/// disk.
pub trait NodeAllocator {
    type Guard<'a>: Deref<Target = [u8]>
    where
        Self: 'a;
    type GuardMut<'a>: DerefMut<Target = [u8]>
    where
        Self: 'a;

    /// Fixed byte size of every node this allocator hands out.
    fn node_size(&self) -> usize;

    /// Reserve a fresh node id. Never returns [`NodeId::INVALID`].
    fn allocate(&self) -> Result<NodeId>;

    /// Release a node back to the allocator. The id must not be used again
    /// until a later `allocate()` reissues it.
    fn free(&self, id: NodeId) -> Result<()>;

    /// Borrow a node's bytes for reading.
    fn load(&self, id: NodeId) -> Result<Self::Guard<'_>>;

    /// Borrow a node's bytes for reading and writing. Changes take effect
    /// when the guard is dropped (or earlier, for allocators backed by a
    /// shared mapping).
    fn load_mut(&self, id: NodeId) -> Result<Self::GuardMut<'_>>;
}
