//! File-backed node allocator: nodes are fixed-size, memory-mapped slices
//! of one file, and free space is tracked with an inner instance of the
//! tree engine rather than a flat free list.
//!
//! Node id 1 is the first id `allocate()` ever hands to a caller. Node id 0
//! is reserved for the allocator's own bookkeeping: it's the permanent root
//! of an inner free-page tree (keys are freed node ids, values are empty),
//! whose userdata slot holds the high-water mark of ids ever handed out
//! plus a checksum over it.
//!
//! Handing the free tree its own pages is a chicken-and-egg problem: the
//! free tree might need to allocate or free nodes while it is itself being
//! mutated by `allocate()`/`free()`. Two small staging buffers break the
//! cycle: `free()` first stashes a released id into `available_nodes`
//! rather than inserting it into the free tree immediately; only once that
//! buffer is full (so the free tree's own splits are guaranteed pages to
//! draw on) does a freed id actually get inserted as a record. Symmetrically,
//! when the free tree itself is mutated and sheds a page via a merge, that
//! page is queued in `freed_nodes` instead of recursing back into `free()`,
//! and drained into the free tree once the mutation completes.

use super::NodeAllocator;
use crate::error::{Result, StorageError};
use crate::tree::Tree;
use crate::types::{LexicographicComparator, NodeId};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;

/// How many levels deep the free tree's own splits/merges can cascade
/// before we give up pre-stocking pages for it. Mirrors the reference file
/// allocator's staging depth.
const MAX_FREE_DEPTH: usize = 26;

/// File growth increment, in nodes, once the high-water mark catches up to
/// the file's current length.
const ALLOC_NODES_STEP: u64 = 32;

const FREE_TREE_ROOT: NodeId = NodeId::INVALID; // id 0, used only internally here

struct Staging {
    freed_nodes: Vec<NodeId>,
    available_nodes: Vec<NodeId>,
}

pub type ErrorCallback = Box<dyn Fn(&StorageError) + Send + Sync>;

struct Shared {
    file: File,
    node_size: usize,
    max_allocated: RwLock<u64>,
    staging: RwLock<Staging>,
    on_error: Option<ErrorCallback>,
}

impl Shared {
    fn report(&self, err: StorageError) -> StorageError {
        if let Some(cb) = &self.on_error {
            cb(&err);
        }
        err
    }

    fn map(&self, id: NodeId) -> Result<MmapMut> {
        let offset = id.value() * self.node_size as u64;
        unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(self.node_size)
                .map_mut(&self.file)
                .map_err(|e| self.report(StorageError::Io(e)))
        }
    }

    fn ensure_capacity(&self, pages_needed: u64) -> Result<()> {
        let node_size = self.node_size as u64;
        let current_len = self.file.metadata()?.len();
        let needed_len = pages_needed * node_size;
        if needed_len > current_len {
            let rounded_pages = pages_needed.div_ceil(ALLOC_NODES_STEP) * ALLOC_NODES_STEP;
            self.file.set_len((rounded_pages * node_size).max(needed_len))?;
        }
        Ok(())
    }
}

/// Read-only view of a memory-mapped node.
pub struct FileGuard {
    map: MmapMut,
}

impl Deref for FileGuard {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.map
    }
}

/// Read/write view of a memory-mapped node. Changes are visible to other
/// mappings of the same file range immediately; `flush` on drop pushes them
/// to the underlying file.
pub struct FileGuardMut {
    map: MmapMut,
}

impl Deref for FileGuardMut {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.map
    }
}

impl DerefMut for FileGuardMut {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }
}

impl Drop for FileGuardMut {
    fn drop(&mut self) {
        let _ = self.map.flush();
    }
}

/// The allocator the free tree itself runs on: draws ids only from the
/// pre-stocked `available_nodes` buffer, queues frees rather than recycling
/// them immediately.
struct FreeTreeAllocator {
    shared: Arc<Shared>,
}

impl NodeAllocator for FreeTreeAllocator {
    type Guard<'a> = FileGuard;
    type GuardMut<'a> = FileGuardMut;

    fn node_size(&self) -> usize {
        self.shared.node_size
    }

    fn allocate(&self) -> Result<NodeId> {
        self.shared
            .staging
            .write()
            .available_nodes
            .pop()
            .ok_or_else(|| self.shared.report(StorageError::AllocatorExhausted))
    }

    fn free(&self, id: NodeId) -> Result<()> {
        self.shared.staging.write().freed_nodes.push(id);
        Ok(())
    }

    fn load(&self, id: NodeId) -> Result<Self::Guard<'_>> {
        Ok(FileGuard { map: self.shared.map(id)? })
    }

    fn load_mut(&self, id: NodeId) -> Result<Self::GuardMut<'_>> {
        Ok(FileGuardMut { map: self.shared.map(id)? })
    }
}

/// Checksummed bookkeeping the allocator keeps in the free tree's userdata
/// slot: just the high-water mark, for now.
const BOOKKEEPING_SIZE: usize = 8 + 4;

fn encode_bookkeeping(max_allocated: u64) -> [u8; BOOKKEEPING_SIZE] {
    let mut buf = [0u8; BOOKKEEPING_SIZE];
    buf[0..8].copy_from_slice(&max_allocated.to_le_bytes());
    let crc = crc32fast::hash(&buf[0..8]);
    buf[8..12].copy_from_slice(&crc.to_le_bytes());
    buf
}

fn decode_bookkeeping(buf: &[u8]) -> Result<u64> {
    if buf.len() != BOOKKEEPING_SIZE {
        return Err(StorageError::corruption("allocator bookkeeping has the wrong size"));
    }
    let stored_crc = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    if crc32fast::hash(&buf[0..8]) != stored_crc {
        return Err(StorageError::corruption("allocator high-water mark failed its checksum"));
    }
    Ok(u64::from_le_bytes(buf[0..8].try_into().unwrap()))
}

/// Allocates fixed-size nodes inside a single memory-mapped file.
pub struct FileAllocator {
    shared: Arc<Shared>,
    free_tree: RwLock<Tree<FreeTreeAllocator>>,
}

impl FileAllocator {
    /// Node size used when the caller doesn't pick one explicitly: the
    /// host's native page size, so nodes align with OS page boundaries.
    pub fn default_node_size() -> usize {
        page_size::get()
    }

    pub fn create(path: impl AsRef<Path>, node_size: usize) -> Result<Self> {
        Self::create_with_callback(path, node_size, None)
    }

    /// Like [`FileAllocator::create`], with a diagnostic hook invoked
    /// (never in place of) whenever an allocator method is about to
    /// return an error. Mirrors the reference allocator's error callback,
    /// minus its exit-on-error behavior.
    pub fn create_with_callback(
        path: impl AsRef<Path>,
        node_size: usize,
        on_error: Option<ErrorCallback>,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len((ALLOC_NODES_STEP * node_size as u64).max(node_size as u64))?;
        let shared = Arc::new(Shared {
            file,
            node_size,
            max_allocated: RwLock::new(1), // id 0 is the free tree's own root
            staging: RwLock::new(Staging {
                freed_nodes: Vec::new(),
                available_nodes: Vec::new(),
            }),
            on_error,
        });
        let free_alloc = FreeTreeAllocator { shared: shared.clone() };
        let bookkeeping = encode_bookkeeping(1);
        let free_tree = Tree::create_at(
            free_alloc,
            FREE_TREE_ROOT,
            8,
            0,
            Box::new(LexicographicComparator),
            &bookkeeping,
        )?;
        Ok(FileAllocator {
            shared,
            free_tree: RwLock::new(free_tree),
        })
    }

    pub fn open(path: impl AsRef<Path>, node_size: usize) -> Result<Self> {
        Self::open_with_callback(path, node_size, None)
    }

    pub fn open_with_callback(
        path: impl AsRef<Path>,
        node_size: usize,
        on_error: Option<ErrorCallback>,
    ) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let shared = Arc::new(Shared {
            file,
            node_size,
            max_allocated: RwLock::new(0),
            staging: RwLock::new(Staging {
                freed_nodes: Vec::new(),
                available_nodes: Vec::new(),
            }),
            on_error,
        });
        let free_alloc = FreeTreeAllocator { shared: shared.clone() };
        let free_tree = Tree::load(free_alloc, FREE_TREE_ROOT, Box::new(LexicographicComparator))?;
        let max_allocated = decode_bookkeeping(&free_tree.userdata()?)?;
        *shared.max_allocated.write() = max_allocated;
        Ok(FileAllocator {
            shared,
            free_tree: RwLock::new(free_tree),
        })
    }

    fn persist_high_water_mark(&self) -> Result<()> {
        let encoded = encode_bookkeeping(*self.shared.max_allocated.read());
        self.free_tree.write().set_userdata(&encoded)
    }

    fn grow_high_water_mark(&self) -> Result<NodeId> {
        let id = {
            let mut max_allocated = self.shared.max_allocated.write();
            let id = *max_allocated;
            *max_allocated += 1;
            self.shared.ensure_capacity(*max_allocated)?;
            id
        };
        self.persist_high_water_mark()?;
        Ok(NodeId::new(id))
    }

    fn drain_freed_into_free_tree(&self) -> Result<()> {
        loop {
            let next = self.shared.staging.write().freed_nodes.pop();
            match next {
                None => return Ok(()),
                Some(id) => {
                    self.free_tree.write().insert(&id.value().to_le_bytes(), &[])?;
                }
            }
        }
    }

    fn smallest_free_id(&self) -> Result<Option<NodeId>> {
        let free_tree = self.free_tree.read();
        let mut found = None;
        free_tree.traverse(false, |k, _| {
            found = Some(NodeId::new(u64::from_le_bytes(k.try_into().unwrap())));
            false
        })?;
        Ok(found)
    }
}

impl NodeAllocator for FileAllocator {
    type Guard<'a> = FileGuard;
    type GuardMut<'a> = FileGuardMut;

    fn node_size(&self) -> usize {
        self.shared.node_size
    }

    fn allocate(&self) -> Result<NodeId> {
        if self.free_tree.read().is_empty() {
            return self.grow_high_water_mark();
        }
        let id = match self.smallest_free_id().map_err(|e| self.shared.report(e))? {
            Some(id) => id,
            None => return self.grow_high_water_mark(),
        };
        self.free_tree.write().remove(&id.value().to_le_bytes())?;
        self.drain_freed_into_free_tree()?;
        Ok(id)
    }

    fn free(&self, id: NodeId) -> Result<()> {
        let mut staging = self.shared.staging.write();
        if staging.available_nodes.len() < MAX_FREE_DEPTH {
            staging.available_nodes.push(id);
            Ok(())
        } else {
            drop(staging);
            self.free_tree.write().insert(&id.value().to_le_bytes(), &[])
        }
    }

    fn load(&self, id: NodeId) -> Result<Self::Guard<'_>> {
        Ok(FileGuard { map: self.shared.map(id)? })
    }

    fn load_mut(&self, id: NodeId) -> Result<Self::GuardMut<'_>> {
        Ok(FileGuardMut { map: self.shared.map(id)? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Tree;
    use crate::types::LexicographicComparator;
    use tempfile::tempdir;

    #[test]
    fn allocate_skips_reserved_zero_id() {
        let dir = tempdir().unwrap();
        let alloc = FileAllocator::create(dir.path().join("db"), 512).unwrap();
        let id = alloc.allocate().unwrap();
        assert_eq!(id, NodeId::new(1));
    }

    #[test]
    fn freed_pages_are_recycled() {
        let dir = tempdir().unwrap();
        let alloc = FileAllocator::create(dir.path().join("db"), 512).unwrap();
        let ids: Vec<_> = (0..40).map(|_| alloc.allocate().unwrap()).collect();
        for id in &ids {
            alloc.free(*id).unwrap();
        }
        // enough frees to overflow the staging buffer and land in the free tree
        let recycled = alloc.allocate().unwrap();
        assert!(ids.contains(&recycled));
    }

    #[test]
    fn tree_survives_close_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let alloc = FileAllocator::create(&path, 512).unwrap();
            let mut tree = Tree::create(alloc, 4, 4, Box::new(LexicographicComparator), &[]).unwrap();
            for n in 0..20u32 {
                tree.insert(&n.to_be_bytes(), &(n * 2).to_be_bytes()).unwrap();
            }
        }
        let alloc = FileAllocator::open(&path, 512).unwrap();
        let tree = Tree::load(alloc, NodeId::new(1), Box::new(LexicographicComparator)).unwrap();
        for n in 0..20u32 {
            assert_eq!(tree.get(&n.to_be_bytes()).unwrap(), Some((n * 2).to_be_bytes().to_vec()));
        }
    }

    #[test]
    fn large_population_survives_close_reopen_and_full_removal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let alloc = FileAllocator::create(&path, 512).unwrap();
            let mut tree = Tree::create(alloc, 4, 4, Box::new(LexicographicComparator), &[]).unwrap();
            for n in 1..=3500u32 {
                tree.insert(&n.to_be_bytes(), &n.to_be_bytes()).unwrap();
            }
        }
        let alloc = FileAllocator::open(&path, 512).unwrap();
        let mut tree = Tree::load(alloc, NodeId::new(1), Box::new(LexicographicComparator)).unwrap();
        for n in 1..=3500u32 {
            assert_eq!(tree.get(&n.to_be_bytes()).unwrap(), Some(n.to_be_bytes().to_vec()));
        }
        for n in 1..=3500u32 {
            assert!(tree.remove(&n.to_be_bytes()).unwrap());
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn repeated_insert_remove_cycles_do_not_grow_the_high_water_mark() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let alloc = FileAllocator::create(&path, 512).unwrap();
        let shared = alloc.shared.clone();
        let mut tree = Tree::create(alloc, 4, 4, Box::new(LexicographicComparator), &[]).unwrap();

        for n in 0..50u32 {
            tree.insert(&n.to_be_bytes(), &n.to_be_bytes()).unwrap();
        }
        for n in 0..50u32 {
            tree.remove(&n.to_be_bytes()).unwrap();
        }
        let high_water_after_first_cycle = *shared.max_allocated.read();

        for cycle in 0..5 {
            for n in 0..50u32 {
                tree.insert(&n.to_be_bytes(), &n.to_be_bytes()).unwrap();
            }
            for n in 0..50u32 {
                tree.remove(&n.to_be_bytes()).unwrap();
            }
            let high_water_now = *shared.max_allocated.read();
            assert_eq!(high_water_now, high_water_after_first_cycle, "cycle {cycle} grew the file instead of recycling freed pages");
        }
    }
}
