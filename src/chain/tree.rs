//! The block tree: every known header across all forks, linked by
//! parent/child relationships and indexed by hash.
//!
//! Nodes live in an arena keyed by hash; parent and child links are hashes,
//! not pointers, so recursive deletion is just index removal. The tree knows
//! how to navigate between two of its nodes; choosing *where* to move the
//! tip is the caller's policy.

use crate::error::TreeFault;
use crate::hash::Hash256;
use std::collections::HashMap;

pub const HEADER_LEN: usize = 80;

#[derive(Debug, Clone)]
pub struct TreeNode {
    pub hash: Hash256,
    pub height: u32,
    /// `None` only for the root.
    pub parent: Option<Hash256>,
    pub children: Vec<Hash256>,
    pub header: [u8; HEADER_LEN],
    /// Encoded size and transaction count, filled in when the full block is
    /// first seen (headers arrive before bodies). Zero until then.
    pub block_size: u32,
    pub tx_count: u32,
}

impl TreeNode {
    pub fn timestamp(&self) -> u32 {
        u32::from_le_bytes(self.header[68..72].try_into().expect("fixed slice"))
    }

    pub fn bits(&self) -> u32 {
        u32::from_le_bytes(self.header[72..76].try_into().expect("fixed slice"))
    }
}

pub struct BlockTree {
    root: Hash256,
    index: HashMap<Hash256, TreeNode>,
}

impl BlockTree {
    pub fn new(root_hash: Hash256, root_header: [u8; HEADER_LEN]) -> Self {
        let mut index = HashMap::new();
        index.insert(
            root_hash,
            TreeNode {
                hash: root_hash,
                height: 0,
                parent: None,
                children: Vec::new(),
                header: root_header,
                block_size: 0,
                tx_count: 0,
            },
        );
        BlockTree {
            root: root_hash,
            index,
        }
    }

    pub fn root(&self) -> Hash256 {
        self.root
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        false // the root is always present
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.index.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash256) -> Option<&TreeNode> {
        self.index.get(hash)
    }

    pub fn height_of(&self, hash: &Hash256) -> Option<u32> {
        self.index.get(hash).map(|n| n.height)
    }

    /// Attach a header under its parent (bytes 4..36 of the header).
    ///
    /// Returns `false` when the parent is unknown (orphan header) or the
    /// hash is already present; the tree is unchanged in both cases.
    pub fn insert(&mut self, hash: Hash256, header: [u8; HEADER_LEN]) -> bool {
        if self.index.contains_key(&hash) {
            return false;
        }
        let parent_hash = Hash256::from_slice(&header[4..36]);
        let Some(parent) = self.index.get_mut(&parent_hash) else {
            return false;
        };
        let height = parent.height + 1;
        parent.children.push(hash);
        self.index.insert(
            hash,
            TreeNode {
                hash,
                height,
                parent: Some(parent_hash),
                children: Vec::new(),
                header,
                block_size: 0,
                tx_count: 0,
            },
        );
        true
    }

    /// Record the encoded size and transaction count once the full block has
    /// been seen. The first call wins; headers themselves never change.
    pub fn note_block_stats(&mut self, hash: &Hash256, size: u32, tx_count: u32) {
        if let Some(n) = self.index.get_mut(hash) {
            if n.block_size == 0 {
                n.block_size = size;
                n.tx_count = tx_count;
            }
        }
    }

    /// The next node on the path from `from` towards `to`.
    ///
    /// `Ok(None)` signals arrival (`from == to`). The target must be strictly
    /// higher than `from`; callers on the reorg path pre-check this, so a
    /// `TargetNotAbove` there is a consistency fault. With a single child the
    /// answer is immediate; with several the walk runs backward from `to`,
    /// which always prefers the branch that actually leads to the target.
    pub fn find_path_to(&self, from: &Hash256, to: &Hash256) -> Result<Option<Hash256>, TreeFault> {
        if from == to {
            return Ok(None);
        }
        let f = self.index.get(from).ok_or(TreeFault::UnknownNode(*from))?;
        let t = self.index.get(to).ok_or(TreeFault::UnknownNode(*to))?;
        if t.height <= f.height {
            return Err(TreeFault::TargetNotAbove {
                target: *to,
                target_height: t.height,
                from_height: f.height,
            });
        }
        match f.children.len() {
            0 => Err(TreeFault::NoPath(*to)),
            1 => Ok(Some(f.children[0])),
            _ => {
                let mut cur = t;
                loop {
                    let Some(parent) = cur.parent else {
                        return Err(TreeFault::NoPath(*to));
                    };
                    if parent == *from {
                        return Ok(Some(cur.hash));
                    }
                    cur = self
                        .index
                        .get(&parent)
                        .ok_or(TreeFault::NoPath(*to))?;
                }
            }
        }
    }

    /// Deepest descendant of `from` and its depth in edges. Depth-first,
    /// first-encountered child wins ties.
    pub fn find_farthest(&self, from: &Hash256) -> (Hash256, u32) {
        let node = self.index.get(from).expect("find_farthest: unknown node");
        let mut best = (node.hash, 0);
        for child in &node.children {
            let (hash, depth) = self.find_farthest(child);
            if depth + 1 > best.1 {
                best = (hash, depth + 1);
            }
        }
        best
    }

    /// Common ancestor of `a` and `b` with the greatest height.
    pub fn first_common_parent(&self, a: &Hash256, b: &Hash256) -> Option<Hash256> {
        let mut a = self.index.get(a)?;
        let mut b = self.index.get(b)?;
        while a.height > b.height {
            a = self.index.get(&a.parent?)?;
        }
        while b.height > a.height {
            b = self.index.get(&b.parent?)?;
        }
        while a.hash != b.hash {
            a = self.index.get(&a.parent?)?;
            b = self.index.get(&b.parent?)?;
        }
        Some(a.hash)
    }

    /// Detach `hash` from its parent and drop it with all descendants from
    /// the index. Descendants are unreachable once the ancestor is gone, so
    /// they are not individually re-validated. Returns the number of nodes
    /// removed.
    pub fn delete_branch(&mut self, hash: &Hash256) -> usize {
        let Some(node) = self.index.get(hash) else {
            return 0;
        };
        let parent_hash = node
            .parent
            .expect("delete_branch: cannot detach the root");
        let parent = self
            .index
            .get_mut(&parent_hash)
            .expect("delete_branch: parent not in index");
        let at = parent
            .children
            .iter()
            .position(|c| c == hash)
            .expect("delete_branch: child not found in parent");
        parent.children.remove(at);

        let mut removed = 0;
        let mut stack = vec![*hash];
        while let Some(h) = stack.pop() {
            if let Some(n) = self.index.remove(&h) {
                removed += 1;
                stack.extend(n.children);
            }
        }
        removed
    }
}
