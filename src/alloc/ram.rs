//! In-memory node allocator: a growable slab of fixed-size byte buffers.
//!
//! Grounded on the reference RAM allocator, which backs every node with a
//! plain heap allocation and treats load/unload as no-ops. Here the buffers
//! live behind a lock so the allocator can be shared across a tree's whole
//! call stack (a parent node and a child node both need to be loaded at
//! once during a split or merge).

use super::NodeAllocator;
use crate::error::{Result, StorageError};
use crate::types::NodeId;
use parking_lot::RwLock;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

type Slot = Arc<RwLock<Vec<u8>>>;

type ErrorCallback = Box<dyn Fn(&StorageError) + Send + Sync>;

/// Allocates nodes out of plain heap buffers. Freed ids are recycled.
pub struct RamAllocator {
    node_size: usize,
    slots: RwLock<Vec<Option<Slot>>>,
    free_ids: RwLock<Vec<NodeId>>,
    on_error: Option<ErrorCallback>,
}

impl RamAllocator {
    pub fn new(node_size: usize) -> Self {
        RamAllocator {
            node_size,
            // index 0 is never used: NodeId 0 is reserved as invalid.
            slots: RwLock::new(vec![None]),
            free_ids: RwLock::new(Vec::new()),
            on_error: None,
        }
    }

    /// Registers a callback invoked (not in place of) whenever an
    /// allocator method is about to return an error. The error itself is
    /// still returned to the caller; this only mirrors the diagnostic hook
    /// the reference allocator offered, without its exit-on-error behavior.
    pub fn on_error(mut self, cb: impl Fn(&StorageError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(cb));
        self
    }

    fn report(&self, err: StorageError) -> StorageError {
        if let Some(cb) = &self.on_error {
            cb(&err);
        }
        err
    }

    fn slot(&self, id: NodeId) -> Result<Slot> {
        let slots = self.slots.read();
        match slots.get(id.value() as usize).and_then(|s| s.clone()) {
            Some(slot) => Ok(slot),
            None => Err(self.report(StorageError::NodeNotFound(id))),
        }
    }
}

pub struct RamGuard {
    data: Vec<u8>,
}

impl Deref for RamGuard {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.data
    }
}

/// Mutable access into a [`RamAllocator`] node. Changes are written back to
/// the shared slot when the guard is dropped.
pub struct RamGuardMut {
    data: Vec<u8>,
    slot: Slot,
}

impl Deref for RamGuardMut {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for RamGuardMut {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for RamGuardMut {
    fn drop(&mut self) {
        *self.slot.write() = std::mem::take(&mut self.data);
    }
}

impl NodeAllocator for RamAllocator {
    type Guard<'a> = RamGuard;
    type GuardMut<'a> = RamGuardMut;

    fn node_size(&self) -> usize {
        self.node_size
    }

    fn allocate(&self) -> Result<NodeId> {
        if let Some(id) = self.free_ids.write().pop() {
            *self.slot(id)?.write() = vec![0u8; self.node_size];
            return Ok(id);
        }
        let mut slots = self.slots.write();
        let id = NodeId::new(slots.len() as u64);
        slots.push(Some(Arc::new(RwLock::new(vec![0u8; self.node_size]))));
        Ok(id)
    }

    fn free(&self, id: NodeId) -> Result<()> {
        self.slot(id)?;
        self.free_ids.write().push(id);
        Ok(())
    }

    fn load(&self, id: NodeId) -> Result<Self::Guard<'_>> {
        let slot = self.slot(id)?;
        let data = slot.read().clone();
        Ok(RamGuard { data })
    }

    fn load_mut(&self, id: NodeId) -> Result<Self::GuardMut<'_>> {
        let slot = self.slot(id)?;
        let data = slot.read().clone();
        Ok(RamGuardMut { data, slot })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_returns_distinct_nonzero_ids() {
        let alloc = RamAllocator::new(64);
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert!(a.is_valid());
        assert!(b.is_valid());
        assert_ne!(a, b);
    }

    #[test]
    fn writes_are_visible_after_guard_drops() {
        let alloc = RamAllocator::new(8);
        let id = alloc.allocate().unwrap();
        {
            let mut guard = alloc.load_mut(id).unwrap();
            guard[0] = 42;
        }
        let guard = alloc.load(id).unwrap();
        assert_eq!(guard[0], 42);
    }

    #[test]
    fn freed_id_is_recycled() {
        let alloc = RamAllocator::new(8);
        let id = alloc.allocate().unwrap();
        alloc.free(id).unwrap();
        let id2 = alloc.allocate().unwrap();
        assert_eq!(id, id2);
    }

    #[test]
    fn loading_unknown_id_errors() {
        let alloc = RamAllocator::new(8);
        assert!(alloc.load(NodeId::new(999)).is_err());
    }
}
