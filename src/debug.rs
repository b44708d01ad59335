//! Diagnostic tree rendering. Not a contract: the exact text and JSON
//! shape here may change without it counting as a breaking change to the
//! storage engine itself.

use crate::alloc::NodeAllocator;
use crate::tree::Tree;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// A JSON-serializable snapshot of one node and its subtree, keyed and
/// valued as lossy UTF-8 for display purposes only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub node_id: u64,
    pub is_leaf: bool,
    pub keys: Vec<String>,
    pub values: Vec<String>,
    pub children: Vec<TreeNode>,
}

/// Walks the whole tree and builds a [`TreeNode`] snapshot rooted at the
/// tree's root, or `None` if the tree is empty.
pub fn export_tree<A: NodeAllocator>(tree: &Tree<A>) -> Result<Option<TreeNode>> {
    if tree.is_empty() {
        return Ok(None);
    }
    export_node(tree, tree.root_id(), tree.height())
}

/// Renders [`export_tree`]'s snapshot as pretty-printed JSON, for handing
/// off to an external visualizer.
pub fn export_tree_json<A: NodeAllocator>(tree: &Tree<A>) -> Result<String> {
    let snapshot = export_tree(tree)?;
    serde_json::to_string_pretty(&snapshot)
        .map_err(|e| crate::error::StorageError::invalid_operation(format!("failed to render tree as JSON: {e}")))
}

fn export_node<A: NodeAllocator>(tree: &Tree<A>, id: crate::types::NodeId, height: i32) -> Result<Option<TreeNode>> {
    let (keys, values, child_ids) = tree.debug_node_contents(id, height)?;
    let is_leaf = height == 0;
    let mut children = Vec::new();
    for child_id in child_ids {
        if let Some(child) = export_node(tree, child_id, height - 1)? {
            children.push(child);
        }
    }
    Ok(Some(TreeNode {
        node_id: id.value(),
        is_leaf,
        keys: keys.iter().map(|k| String::from_utf8_lossy(k).to_string()).collect(),
        values: values.iter().map(|v| String::from_utf8_lossy(v).to_string()).collect(),
        children,
    }))
}

/// Renders an indented listing of every key in the tree, in order, one
/// line per node, nested under its parent. Purely for eyeballing a tree
/// while debugging; the glyphs and indentation are not contractual.
pub fn write_tree<A: NodeAllocator>(tree: &Tree<A>) -> Result<String> {
    let mut out = String::new();
    if tree.is_empty() {
        out.push_str("(empty)\n");
        return Ok(out);
    }
    write_node(tree, tree.root_id(), tree.height(), 0, &mut out)?;
    Ok(out)
}

fn write_node<A: NodeAllocator>(
    tree: &Tree<A>,
    id: crate::types::NodeId,
    height: i32,
    depth: usize,
    out: &mut String,
) -> Result<()> {
    let (keys, _values, child_ids) = tree.debug_node_contents(id, height)?;
    let indent = "  ".repeat(depth);
    let key_list: Vec<String> = keys.iter().map(|k| format!("{:02x?}", k)).collect();
    let _ = writeln!(out, "{indent}node {} ({}): [{}]", id, if height == 0 { "leaf" } else { "interior" }, key_list.join(", "));
    for child_id in child_ids {
        write_node(tree, child_id, height - 1, depth + 1, out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::RamAllocator;
    use crate::types::LexicographicComparator;
    use crate::tree::Tree;

    #[test]
    fn export_tree_is_none_for_empty_tree() {
        let alloc = RamAllocator::new(96);
        let tree = Tree::create(alloc, 4, 4, Box::new(LexicographicComparator), &[]).unwrap();
        assert!(export_tree(&tree).unwrap().is_none());
    }

    #[test]
    fn export_tree_carries_every_key() {
        let alloc = RamAllocator::new(96);
        let mut tree = Tree::create(alloc, 4, 4, Box::new(LexicographicComparator), &[]).unwrap();
        for n in 0..30u32 {
            tree.insert(&n.to_be_bytes(), &n.to_be_bytes()).unwrap();
        }
        let root = export_tree(&tree).unwrap().unwrap();
        let mut seen = Vec::new();
        collect_keys(&root, &mut seen);
        seen.sort();
        let expected: Vec<String> = (0..30u32)
            .map(|n| String::from_utf8_lossy(&n.to_be_bytes()).to_string())
            .collect();
        let mut expected_sorted = expected.clone();
        expected_sorted.sort();
        assert_eq!(seen, expected_sorted);
    }

    fn collect_keys(node: &TreeNode, out: &mut Vec<String>) {
        out.extend(node.keys.iter().cloned());
        for child in &node.children {
            collect_keys(child, out);
        }
    }

    #[test]
    fn write_tree_renders_something_for_nonempty_tree() {
        let alloc = RamAllocator::new(96);
        let mut tree = Tree::create(alloc, 4, 4, Box::new(LexicographicComparator), &[]).unwrap();
        tree.insert(&1u32.to_be_bytes(), &1u32.to_be_bytes()).unwrap();
        let rendered = write_tree(&tree).unwrap();
        assert!(rendered.contains("leaf"));
    }
}
