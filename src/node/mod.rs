//! Fixed-size packed node layout shared by every node an allocator hands
//! back, whether it's leaf-shaped, interior-shaped, or the tree's root.
//!
//! Layout, relative to the start of the node's byte range:
//!
//! ```text
//! [0..2)   max_keys: u16 LE   -- fixed for this node's whole lifetime
//! [2..4)   num_keys: u16 LE   -- live key count, 0..=max_keys
//! [4..)    num_keys * (key_size + value_size) packed pairs
//! [..)     if interior: (max_keys + 1) NodeId (u64 LE) children, right after
//!          the pair array (at offset 4 + max_keys * pair_size)
//! ```
//!
//! Whether a node is a leaf or interior is never stored in the node itself;
//! it follows from the node's depth relative to the tree's height, which the
//! caller always knows while descending. This mirrors how a height-tracking
//! walk never has to ask a page what kind it is.

use crate::types::NodeId;

pub const HEADER_SIZE: usize = 4;
pub const ID_SIZE: usize = 8;

/// Byte sizes and derived capacities for one tree instance. Computed once
/// when a tree is created or loaded and reused for every node it touches.
#[derive(Debug, Clone, Copy)]
pub struct NodeLayout {
    pub key_size: usize,
    pub value_size: usize,
    pub max_leaf_keys: usize,
    pub max_interior_keys: usize,
    pub max_root_keys: usize,
}

impl NodeLayout {
    pub fn pair_size(&self) -> usize {
        self.key_size + self.value_size
    }

    /// Largest `max_keys` that fits in `available` bytes of node body
    /// (everything after the 4-byte max_keys/num_keys header), given whether
    /// the node also needs a trailing children array.
    fn max_keys_for(available: usize, pair_size: usize, with_children: bool) -> usize {
        let per_key = if with_children {
            pair_size + ID_SIZE
        } else {
            pair_size
        };
        if per_key == 0 {
            return 0;
        }
        // -1 leaves room for the interior case's trailing "+1"th child slot.
        (available / per_key).saturating_sub(1)
    }

    pub fn leaf_capacity(node_size: usize, key_size: usize, value_size: usize) -> usize {
        Self::max_keys_for(node_size.saturating_sub(HEADER_SIZE), key_size + value_size, false)
    }

    pub fn interior_capacity(node_size: usize, key_size: usize, value_size: usize) -> usize {
        Self::max_keys_for(
            node_size.saturating_sub(HEADER_SIZE),
            key_size + value_size,
            true,
        )
    }

    /// Capacity of the root node, which shares its page with the tree header
    /// and caller userdata and so has less body available. The root is
    /// always sized for interior use since it must support becoming an
    /// interior node as the tree grows past a single leaf.
    pub fn root_capacity(available_after_header: usize, key_size: usize, value_size: usize) -> usize {
        Self::max_keys_for(available_after_header, key_size + value_size, true)
    }

    pub fn new(node_size: usize, key_size: usize, value_size: usize, root_offset: usize) -> Self {
        let max_leaf_keys = Self::leaf_capacity(node_size, key_size, value_size);
        let max_interior_keys = Self::interior_capacity(node_size, key_size, value_size);
        let available_for_root = node_size.saturating_sub(root_offset);
        let max_root_keys =
            Self::root_capacity(available_for_root.saturating_sub(HEADER_SIZE), key_size, value_size);
        NodeLayout {
            key_size,
            value_size,
            max_leaf_keys,
            max_interior_keys,
            max_root_keys,
        }
    }

    pub fn children_offset(&self, max_keys: usize) -> usize {
        HEADER_SIZE + max_keys * self.pair_size()
    }

    pub fn byte_size(&self, max_keys: usize, is_leaf: bool) -> usize {
        if is_leaf {
            HEADER_SIZE + max_keys * self.pair_size()
        } else {
            self.children_offset(max_keys) + (max_keys + 1) * ID_SIZE
        }
    }
}

/// Read-only accessor over a node's byte range.
pub struct NodeView<'a> {
    buf: &'a [u8],
    layout: NodeLayout,
}

/// Read/write accessor over a node's byte range.
pub struct NodeViewMut<'a> {
    buf: &'a mut [u8],
    layout: NodeLayout,
}

macro_rules! common_accessors {
    () => {
        pub fn max_keys(&self) -> usize {
            u16::from_le_bytes([self.buf[0], self.buf[1]]) as usize
        }

        pub fn num_keys(&self) -> usize {
            u16::from_le_bytes([self.buf[2], self.buf[3]]) as usize
        }

        pub fn key(&self, i: usize) -> &[u8] {
            let off = HEADER_SIZE + i * self.layout.pair_size();
            &self.buf[off..off + self.layout.key_size]
        }

        pub fn value(&self, i: usize) -> &[u8] {
            let off = HEADER_SIZE + i * self.layout.pair_size() + self.layout.key_size;
            &self.buf[off..off + self.layout.value_size]
        }

        pub fn child(&self, i: usize) -> NodeId {
            let off = self.layout.children_offset(self.max_keys()) + i * ID_SIZE;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&self.buf[off..off + ID_SIZE]);
            NodeId::new(u64::from_le_bytes(raw))
        }
    };
}

impl<'a> NodeView<'a> {
    pub fn new(buf: &'a [u8], layout: NodeLayout) -> Self {
        NodeView { buf, layout }
    }

    common_accessors!();
}

impl<'a> NodeViewMut<'a> {
    pub fn new(buf: &'a mut [u8], layout: NodeLayout) -> Self {
        NodeViewMut { buf, layout }
    }

    common_accessors!();

    pub fn init(&mut self, max_keys: usize) {
        self.buf[0..2].copy_from_slice(&(max_keys as u16).to_le_bytes());
        self.set_num_keys(0);
    }

    pub fn set_num_keys(&mut self, n: usize) {
        self.buf[2..4].copy_from_slice(&(n as u16).to_le_bytes());
    }

    pub fn set_key(&mut self, i: usize, key: &[u8]) {
        let off = HEADER_SIZE + i * self.layout.pair_size();
        self.buf[off..off + self.layout.key_size].copy_from_slice(key);
    }

    pub fn set_value(&mut self, i: usize, value: &[u8]) {
        let off = HEADER_SIZE + i * self.layout.pair_size() + self.layout.key_size;
        self.buf[off..off + self.layout.value_size].copy_from_slice(value);
    }

    pub fn set_pair(&mut self, i: usize, key: &[u8], value: &[u8]) {
        self.set_key(i, key);
        self.set_value(i, value);
    }

    pub fn set_child(&mut self, i: usize, id: NodeId) {
        let off = self.layout.children_offset(self.max_keys()) + i * ID_SIZE;
        self.buf[off..off + ID_SIZE].copy_from_slice(&id.value().to_le_bytes());
    }

    /// Copies `pair(src)` from `other` into `self` at `dst`.
    pub fn copy_pair_from(&mut self, dst: usize, other: &NodeView, src: usize) {
        let key = other.key(src).to_vec();
        let value = other.value(src).to_vec();
        self.set_pair(dst, &key, &value);
    }

    pub fn copy_child_from(&mut self, dst: usize, other: &NodeView, src: usize) {
        self.set_child(dst, other.child(src));
    }

    /// Shift pairs `[from, num_keys)` right by one slot to open a gap at `from`.
    pub fn shift_pairs_right(&mut self, from: usize, num_keys: usize) {
        let pair_size = self.layout.pair_size();
        for i in (from..num_keys).rev() {
            let (src, dst) = (HEADER_SIZE + i * pair_size, HEADER_SIZE + (i + 1) * pair_size);
            let tmp: Vec<u8> = self.buf[src..src + pair_size].to_vec();
            self.buf[dst..dst + pair_size].copy_from_slice(&tmp);
        }
    }

    /// Shift pairs `[from+1, num_keys)` left by one slot to close the gap at `from`.
    pub fn shift_pairs_left(&mut self, from: usize, num_keys: usize) {
        let pair_size = self.layout.pair_size();
        for i in from..num_keys.saturating_sub(1) {
            let (src, dst) = (HEADER_SIZE + (i + 1) * pair_size, HEADER_SIZE + i * pair_size);
            let tmp: Vec<u8> = self.buf[src..src + pair_size].to_vec();
            self.buf[dst..dst + pair_size].copy_from_slice(&tmp);
        }
    }

    pub fn shift_children_right(&mut self, from: usize, num_children: usize) {
        let children_off = self.layout.children_offset(self.max_keys());
        for i in (from..num_children).rev() {
            let (src, dst) = (children_off + i * ID_SIZE, children_off + (i + 1) * ID_SIZE);
            let tmp: [u8; ID_SIZE] = self.buf[src..src + ID_SIZE].try_into().unwrap();
            self.buf[dst..dst + ID_SIZE].copy_from_slice(&tmp);
        }
    }

    pub fn shift_children_left(&mut self, from: usize, num_children: usize) {
        let children_off = self.layout.children_offset(self.max_keys());
        for i in from..num_children.saturating_sub(1) {
            let (src, dst) = (children_off + (i + 1) * ID_SIZE, children_off + i * ID_SIZE);
            let tmp: [u8; ID_SIZE] = self.buf[src..src + ID_SIZE].try_into().unwrap();
            self.buf[dst..dst + ID_SIZE].copy_from_slice(&tmp);
        }
    }

    pub fn as_view(&self) -> NodeView<'_> {
        NodeView::new(self.buf, self.layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_capacity_matches_hand_count() {
        // node_size=64, key=4 value=4 -> pair_size=8, body=60 -> 60/8-1=6
        assert_eq!(NodeLayout::leaf_capacity(64, 4, 4), 6);
    }

    #[test]
    fn pair_round_trips_through_view() {
        let layout = NodeLayout::new(128, 4, 4, 16);
        let mut buf = vec![0u8; 128];
        let mut node = NodeViewMut::new(&mut buf, layout);
        node.init(layout.max_leaf_keys);
        node.set_num_keys(1);
        node.set_pair(0, &[1, 2, 3, 4], &[5, 6, 7, 8]);
        assert_eq!(node.key(0), &[1, 2, 3, 4]);
        assert_eq!(node.value(0), &[5, 6, 7, 8]);
        assert_eq!(node.num_keys(), 1);
    }

    #[test]
    fn child_round_trips() {
        let layout = NodeLayout::new(256, 4, 0, 16);
        let mut buf = vec![0u8; 256];
        let mut node = NodeViewMut::new(&mut buf, layout);
        node.init(layout.max_interior_keys);
        node.set_child(0, NodeId::new(42));
        assert_eq!(node.child(0), NodeId::new(42));
    }

    #[test]
    fn shifting_pairs_preserves_order() {
        let layout = NodeLayout::new(256, 4, 0, 16);
        let mut buf = vec![0u8; 256];
        let mut node = NodeViewMut::new(&mut buf, layout);
        node.init(layout.max_interior_keys);
        node.set_pair(0, &[1, 0, 0, 0], &[]);
        node.set_pair(1, &[2, 0, 0, 0], &[]);
        node.set_num_keys(2);
        node.shift_pairs_right(1, 2);
        node.set_pair(1, &[9, 0, 0, 0], &[]);
        node.set_num_keys(3);
        assert_eq!(node.key(0), &[1, 0, 0, 0]);
        assert_eq!(node.key(1), &[9, 0, 0, 0]);
        assert_eq!(node.key(2), &[2, 0, 0, 0]);
    }
}
