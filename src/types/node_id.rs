use std::fmt;

/// Opaque handle to a node, as produced by a [`crate::alloc::NodeAllocator`].
///
/// `NodeId(0)` is reserved and never returned by `allocate()`; it is used as
/// the "no child"/"empty tree" sentinel, mirroring how the original page
/// allocator reserved its own id-zero page for bookkeeping rather than data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const INVALID: NodeId = NodeId(0);

    pub fn new(value: u64) -> Self {
        NodeId(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        NodeId(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_is_zero() {
        assert_eq!(NodeId::INVALID, NodeId(0));
        assert!(!NodeId::INVALID.is_valid());
        assert!(NodeId::new(1).is_valid());
    }

    #[test]
    fn ordering_is_numeric() {
        assert!(NodeId::new(1) < NodeId::new(2));
    }
}
