//! # BTree Storage Engine
//!
//! A B-tree key-value store over a pluggable node allocator: keep
//! everything in memory with [`RamAllocator`], or back it with a single
//! memory-mapped file via [`FileAllocator`]. Keys and values are fixed-size
//! per tree.
//!
//! ## Architecture
//!
//! - **Node layer** (`node`): the fixed packed byte layout every node uses,
//!   independent of where its bytes live.
//! - **Allocator layer** (`alloc`): hands out, loads, and frees node-sized
//!   byte ranges. `RamAllocator` backs a tree purely in memory;
//!   `FileAllocator` backs one with a single mmap'd file and tracks its own
//!   free space with an inner tree instance.
//! - **Tree layer** (`tree`): search, insert, remove, and traversal, generic
//!   over the allocator.
//! - **Debug layer** (`debug`): a non-contractual tree renderer and JSON
//!   export, for eyeballing a tree while developing against it.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use btree_storage::{Db, Config};
//!
//! let config = Config::new(8, 8);
//! let db = Db::open("my_database.db", config)?;
//!
//! db.put(b"12345678", b"world!!!")?;
//! let value = db.get(b"12345678")?;
//! db.delete(b"12345678")?;
//!
//! for (key, value) in db.iter()? {
//!     println!("{:?} -> {:?}", key, value);
//! }
//! ```

pub mod alloc;
pub mod debug;
pub mod error;
pub mod node;
pub mod tree;
pub mod types;

pub use alloc::{ErrorCallback, FileAllocator, NodeAllocator, RamAllocator};
pub use debug::{export_tree, export_tree_json, write_tree, TreeNode};
pub use error::{Result, StorageError};
pub use tree::Tree;
pub use types::{Comparator, LexicographicComparator, NodeId, NodeKind};

use std::ops::Bound;
use std::path::{Path, PathBuf};

/// Configuration for opening or creating a [`Db`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Fixed key size, in bytes, for every entry in this tree.
    pub key_size: usize,
    /// Fixed value size, in bytes, for every entry in this tree.
    pub value_size: usize,
    /// Byte size of every node. Defaults to the host's native page size.
    pub node_size: usize,
}

impl Config {
    pub fn new(key_size: usize, value_size: usize) -> Self {
        Self {
            key_size,
            value_size,
            node_size: FileAllocator::default_node_size(),
        }
    }

    /// Override the node size (default: the host's native page size).
    pub fn node_size(mut self, node_size: usize) -> Self {
        self.node_size = node_size;
        self
    }
}

/// Database handle: a single fixed-size-key/value B-tree backed by one
/// memory-mapped file.
///
/// This is the primary public interface for the storage engine; other
/// layers of a database built on top of it should talk to a `Db` rather
/// than to [`Tree`] and [`FileAllocator`] directly.
pub struct Db {
    tree: Tree<FileAllocator>,
    path: PathBuf,
    config: Config,
}

/// The outer tree's root always lands here: `FileAllocator` reserves node
/// id 0 for its own bookkeeping, so the first id a fresh file ever hands
/// out is 1.
const DATA_ROOT: NodeId = NodeId(1);

impl Db {
    /// Opens a database at `path`, creating it if it doesn't exist yet.
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tree = if path.exists() {
            let alloc = FileAllocator::open(&path, config.node_size)?;
            Tree::load(alloc, DATA_ROOT, Box::new(LexicographicComparator))?
        } else {
            let alloc = FileAllocator::create(&path, config.node_size)?;
            Tree::create(
                alloc,
                config.key_size,
                config.value_size,
                Box::new(LexicographicComparator),
                &[],
            )?
        };
        Ok(Self { tree, path, config })
    }

    pub fn config(&self) -> Config {
        self.config.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get a value by key. Returns `None` if the key does not exist.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tree.get(key)
    }

    /// Insert or update a key-value pair.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree.insert(key, value)
    }

    /// Delete a key-value pair. Returns `true` if the key existed.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        self.tree.remove(key)
    }

    /// Check if a key exists.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        self.tree.contains(key)
    }

    /// Iterate over all key-value pairs in sorted order.
    pub fn iter(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.range(Bound::Unbounded, Bound::Unbounded)
    }

    /// Iterate over key-value pairs within `[start, end)`. Either bound can
    /// be `Bound::Unbounded`.
    pub fn range(&self, start: Bound<&[u8]>, end: Bound<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cmp = LexicographicComparator;
        let mut out = Vec::new();
        self.tree.traverse(false, |k, v| {
            let after_start = match start {
                Bound::Unbounded => true,
                Bound::Included(s) => cmp.compare(k, s) != std::cmp::Ordering::Less,
                Bound::Excluded(s) => cmp.compare(k, s) == std::cmp::Ordering::Greater,
            };
            let before_end = match end {
                Bound::Unbounded => true,
                Bound::Included(e) => cmp.compare(k, e) != std::cmp::Ordering::Greater,
                Bound::Excluded(e) => cmp.compare(k, e) == std::cmp::Ordering::Less,
            };
            if after_start && before_end {
                out.push((k.to_vec(), v.to_vec()));
            }
            before_end
        })?;
        Ok(out)
    }

    /// Height of the underlying tree: `-1` empty, `0` a single leaf root.
    pub fn height(&self) -> i32 {
        self.tree.height()
    }

    /// Export the tree structure for visualization.
    pub fn export_tree(&self) -> Result<Option<TreeNode>> {
        export_tree(&self.tree)
    }

    /// Render an indented debug listing of the tree's keys.
    pub fn debug_print(&self) -> Result<String> {
        write_tree(&self.tree)
    }

    /// Export the tree structure as pretty-printed JSON.
    pub fn export_tree_json(&self) -> Result<String> {
        export_tree_json(&self.tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn kv(n: u32) -> ([u8; 4], [u8; 4]) {
        (n.to_be_bytes(), (n * 2).to_be_bytes())
    }

    #[test]
    fn basic_operations() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut db = Db::open(&path, Config::new(4, 4))?;

        db.put(b"key1", b"val1")?;
        assert_eq!(db.get(b"key1")?, Some(b"val1".to_vec()));

        db.put(b"key1", b"val2")?;
        assert_eq!(db.get(b"key1")?, Some(b"val2".to_vec()));

        assert!(db.delete(b"key1")?);
        assert_eq!(db.get(b"key1")?, None);

        assert_eq!(db.get(b"nope")?, None);
        assert!(!db.delete(b"nope")?);
        Ok(())
    }

    #[test]
    fn range_scan() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut db = Db::open(&path, Config::new(4, 4))?;

        for n in 0..20u32 {
            let (k, v) = kv(n);
            db.put(&k, &v)?;
        }

        let all = db.iter()?;
        assert_eq!(all.len(), 20);

        let lo = 5u32.to_be_bytes();
        let hi = 10u32.to_be_bytes();
        let mid = db.range(Bound::Included(&lo), Bound::Excluded(&hi))?;
        assert_eq!(mid.len(), 5);
        assert_eq!(mid[0].0, 5u32.to_be_bytes().to_vec());
        assert_eq!(mid.last().unwrap().0, 9u32.to_be_bytes().to_vec());
        Ok(())
    }

    #[test]
    fn reopening_preserves_data() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let mut db = Db::open(&path, Config::new(4, 4))?;
            for n in 0..15u32 {
                let (k, v) = kv(n);
                db.put(&k, &v)?;
            }
        }
        let db = Db::open(&path, Config::new(4, 4))?;
        for n in 0..15u32 {
            let (k, v) = kv(n);
            assert_eq!(db.get(&k)?, Some(v.to_vec()));
        }
        Ok(())
    }

    #[test]
    fn export_tree_reflects_contents() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut db = Db::open(&path, Config::new(4, 4))?;
        assert!(db.export_tree()?.is_none());
        db.put(b"abcd", b"1234")?;
        assert!(db.export_tree()?.is_some());
        Ok(())
    }
}
