//! A size-ordered B+-tree of free blocks.
//!
//! Unlike the other two indexes, the tree does not live inside the free
//! blocks: nodes are kept in a pool owned by the index, and leaves refer to
//! free blocks by offset. Keys are `(size, offset)` packed into a `u64`, so
//! every entry is unique and a block is removed by exact key.
//!
//! Inner nodes hold up to `order - 1` keys and `order` children; child `i`
//! covers keys in `[keys[i-1], keys[i])`. Leaves hold up to `order - 1`
//! entries and are chained left to right, so a fit query descends once and
//! then sweeps forward. Every node but the root keeps at least
//! `(order - 1) / 2` keys.
//!
//! Nodes vacated by merges go back on the pool's vacant list and are reused by
//! later splits; they are never handed to the heap.

use alloc::vec::Vec;

use crate::check::Corruption;
use crate::index::{FreeIndex, Reserved};
use crate::layout::{Block, Heap, DOUBLE_WORD, OVERHEAD};

/// The largest supported branching factor.
pub const MAX_ORDER: usize = 32;
pub const DEFAULT_ORDER: usize = 5;

/// With a minimum branching factor of 2, this is deeper than any tree over
/// 2^32 entries.
const MAX_PATH: usize = 40;

type Key = u64;

fn key_of(size: usize, block: Block) -> Key {
    ((size as u64) << 32) | block.offset() as u64
}

/// Index of a node in the pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone)]
struct Node {
    leaf: bool,
    /// Number of keys.
    len: usize,
    parent: Option<NodeId>,
    /// Next leaf to the right. Unused in inner nodes.
    sibling: Option<NodeId>,
    // One spare key and slot so a node can overflow by one before it splits.
    keys: [Key; MAX_ORDER],
    /// Leaves: one block offset per key. Inner nodes: `len + 1` children.
    slots: [u32; MAX_ORDER + 1],
}

impl Node {
    fn new(leaf: bool) -> Node {
        Node {
            leaf,
            len: 0,
            parent: None,
            sibling: None,
            keys: [0; MAX_ORDER],
            slots: [0; MAX_ORDER + 1],
        }
    }

    fn keys(&self) -> &[Key] {
        &self.keys[..self.len]
    }

    fn child(&self, i: usize) -> NodeId {
        debug_assert!(!self.leaf && i <= self.len);
        NodeId(self.slots[i])
    }

    fn block(&self, i: usize) -> Block {
        debug_assert!(self.leaf && i < self.len);
        Block::decode(self.slots[i]).expect("leaf entries name blocks")
    }
}

#[derive(Clone)]
pub struct BPlusTree {
    order: usize,
    nodes: Vec<Node>,
    vacant: Vec<NodeId>,
    root: Option<NodeId>,
    len: usize,
}

impl Default for BPlusTree {
    fn default() -> Self {
        BPlusTree::new()
    }
}

impl BPlusTree {
    pub const fn new() -> Self {
        BPlusTree::with_order(DEFAULT_ORDER)
    }

    /// A tree whose inner nodes have at most `order` children.
    ///
    /// Panics unless `3 <= order <= MAX_ORDER`.
    pub const fn with_order(order: usize) -> Self {
        assert!(order >= 3 && order <= MAX_ORDER, "B+-tree order must be in 3..=32");
        BPlusTree {
            order,
            nodes: Vec::new(),
            vacant: Vec::new(),
            root: None,
            len: 0,
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Minimum keys in any node but the root.
    pub fn min_keys(&self) -> usize {
        (self.order - 1) / 2
    }

    /// Nodes ever taken from the pool, live or vacant.
    pub fn pool_size(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes currently part of the tree.
    pub fn live_nodes(&self) -> usize {
        self.nodes.len() - self.vacant.len()
    }

    /// Levels from the root to the leaves; 0 for a tree that was never used.
    pub fn height(&self) -> usize {
        let mut id = match self.root {
            None => return 0,
            Some(r) => r,
        };
        let mut height = 1;
        while !self.node(id).leaf {
            id = self.node(id).child(0);
            height += 1;
        }
        height
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    fn take_node(&mut self, leaf: bool) -> NodeId {
        if let Some(id) = self.vacant.pop() {
            *self.node_mut(id) = Node::new(leaf);
            return id;
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node::new(leaf));
        id
    }

    fn vacate(&mut self, id: NodeId) {
        self.vacant.push(id);
    }

    fn find_leaf(&self, key: Key) -> Option<NodeId> {
        let mut id = self.root?;
        loop {
            let node = self.node(id);
            if node.leaf {
                return Some(id);
            }
            let i = node.keys().partition_point(|&k| k <= key);
            id = node.child(i);
        }
    }

    fn child_index(&self, parent: NodeId, child: NodeId) -> usize {
        let node = self.node(parent);
        node.slots[..=node.len]
            .iter()
            .position(|&s| s == child.0)
            .expect("child is linked from its parent")
    }

    fn split_leaf(&mut self, leaf: NodeId) {
        let right = self.take_node(true);
        let old = self.node(leaf).clone();
        let keep = old.len / 2;
        let moved = old.len - keep;

        let r = self.node_mut(right);
        r.keys[..moved].copy_from_slice(&old.keys[keep..old.len]);
        r.slots[..moved].copy_from_slice(&old.slots[keep..old.len]);
        r.len = moved;
        r.parent = old.parent;
        r.sibling = old.sibling;

        let l = self.node_mut(leaf);
        l.len = keep;
        l.sibling = Some(right);

        self.insert_into_parent(leaf, old.keys[keep], right);
    }

    /// Hang `right` next to `left` under their parent with `key` between them,
    /// splitting upwards as far as needed.
    fn insert_into_parent(&mut self, mut left: NodeId, mut key: Key, mut right: NodeId) {
        loop {
            let parent = match self.node(left).parent {
                Some(p) => p,
                None => {
                    let root = self.take_node(false);
                    let r = self.node_mut(root);
                    r.len = 1;
                    r.keys[0] = key;
                    r.slots[0] = left.0;
                    r.slots[1] = right.0;
                    self.node_mut(left).parent = Some(root);
                    self.node_mut(right).parent = Some(root);
                    self.root = Some(root);
                    return;
                }
            };

            let at = self.child_index(parent, left);
            let p = self.node_mut(parent);
            let len = p.len;
            p.keys.copy_within(at..len, at + 1);
            p.slots.copy_within(at + 1..len + 1, at + 2);
            p.keys[at] = key;
            p.slots[at + 1] = right.0;
            p.len += 1;
            self.node_mut(right).parent = Some(parent);

            if self.node(parent).len < self.order {
                return;
            }

            // Split the inner node, pushing its middle key up.
            let new = self.take_node(false);
            let old = self.node(parent).clone();
            let split = (self.order - 1) / 2;
            let moved = old.len - split - 1;

            let n = self.node_mut(new);
            n.keys[..moved].copy_from_slice(&old.keys[split + 1..old.len]);
            n.slots[..=moved].copy_from_slice(&old.slots[split + 1..=old.len]);
            n.len = moved;
            n.parent = old.parent;
            self.node_mut(parent).len = split;
            for i in 0..=moved {
                let child = NodeId(old.slots[split + 1 + i]);
                self.node_mut(child).parent = Some(new);
            }

            left = parent;
            key = old.keys[split];
            right = new;
        }
    }

    /// Remove key `i` (and, in inner nodes, the child to its right) from
    /// `node`, then repair underflow upwards.
    fn delete_entry(&mut self, mut node: NodeId, mut i: usize) {
        loop {
            let n = self.node_mut(node);
            let len = n.len;
            n.keys.copy_within(i + 1..len, i);
            if n.leaf {
                n.slots.copy_within(i + 1..len, i);
            } else {
                n.slots.copy_within(i + 2..len + 1, i + 1);
            }
            n.len -= 1;

            if Some(node) == self.root {
                self.adjust_root();
                return;
            }
            let min = self.min_keys();
            if self.node(node).len >= min {
                return;
            }

            let parent = self.node(node).parent.expect("non-root node has a parent");
            let at = self.child_index(parent, node);
            let (neighbor, separator, node_is_left) = if at > 0 {
                (self.node(parent).child(at - 1), at - 1, false)
            } else {
                (self.node(parent).child(1), 0, true)
            };

            if self.node(neighbor).len > min {
                self.redistribute(node, neighbor, parent, separator, node_is_left);
                return;
            }

            let (left, right) = if node_is_left {
                (node, neighbor)
            } else {
                (neighbor, node)
            };
            self.merge(left, right, parent, separator);
            node = parent;
            i = separator;
        }
    }

    /// Collapse a root inner node that has lost its last key.
    fn adjust_root(&mut self) {
        let root = match self.root {
            Some(r) => r,
            None => return,
        };
        let node = self.node(root);
        if node.leaf || node.len > 0 {
            return;
        }
        let child = node.child(0);
        self.node_mut(child).parent = None;
        self.root = Some(child);
        self.vacate(root);
    }

    /// Move one entry from `neighbor` into the underfull `node` and fix the
    /// separator between them.
    fn redistribute(
        &mut self,
        node: NodeId,
        neighbor: NodeId,
        parent: NodeId,
        separator: usize,
        node_is_left: bool,
    ) {
        let sep_key = self.node(parent).keys[separator];
        let nb = self.node(neighbor).clone();

        if !node_is_left {
            // Borrow the neighbor's last entry.
            let last = nb.len - 1;
            let n = self.node_mut(node);
            let len = n.len;
            n.keys.copy_within(0..len, 1);
            if n.leaf {
                n.slots.copy_within(0..len, 1);
                n.keys[0] = nb.keys[last];
                n.slots[0] = nb.slots[last];
            } else {
                n.slots.copy_within(0..len + 1, 1);
                n.keys[0] = sep_key;
                n.slots[0] = nb.slots[nb.len];
            }
            n.len += 1;

            if !n.leaf {
                let moved = NodeId(nb.slots[nb.len]);
                self.node_mut(moved).parent = Some(node);
            }
            self.node_mut(parent).keys[separator] = nb.keys[last];
            self.node_mut(neighbor).len -= 1;
        } else {
            // Borrow the neighbor's first entry.
            let n = self.node_mut(node);
            let len = n.len;
            let leaf = n.leaf;
            if leaf {
                n.keys[len] = nb.keys[0];
                n.slots[len] = nb.slots[0];
            } else {
                n.keys[len] = sep_key;
                n.slots[len + 1] = nb.slots[0];
            }
            n.len += 1;

            if !leaf {
                let moved = NodeId(nb.slots[0]);
                self.node_mut(moved).parent = Some(node);
            }
            let new_sep = if leaf { nb.keys[1] } else { nb.keys[0] };
            self.node_mut(parent).keys[separator] = new_sep;

            let m = self.node_mut(neighbor);
            m.keys.copy_within(1..nb.len, 0);
            if leaf {
                m.slots.copy_within(1..nb.len, 0);
            } else {
                m.slots.copy_within(1..nb.len + 1, 0);
            }
            m.len -= 1;
        }
    }

    /// Fold `right` into its left neighbor `left`. The caller removes the
    /// separator from the parent.
    fn merge(&mut self, left: NodeId, right: NodeId, parent: NodeId, separator: usize) {
        let sep_key = self.node(parent).keys[separator];
        let r = self.node(right).clone();

        let l = self.node_mut(left);
        let start = l.len;
        if l.leaf {
            l.keys[start..start + r.len].copy_from_slice(r.keys());
            l.slots[start..start + r.len].copy_from_slice(&r.slots[..r.len]);
            l.len += r.len;
            l.sibling = r.sibling;
        } else {
            l.keys[start] = sep_key;
            l.keys[start + 1..start + 1 + r.len].copy_from_slice(r.keys());
            l.slots[start + 1..start + 2 + r.len].copy_from_slice(&r.slots[..=r.len]);
            l.len += r.len + 1;
            for &child in &r.slots[..=r.len] {
                self.node_mut(NodeId(child)).parent = Some(left);
            }
        }

        self.vacate(right);
    }

    fn leftmost_leaf(&self, mut id: NodeId) -> NodeId {
        while !self.node(id).leaf {
            id = self.node(id).child(0);
        }
        id
    }
}

impl FreeIndex for BPlusTree {
    // No overlay: header, footer and the smallest aligned payload.
    const MIN_BLOCK_SIZE: usize = OVERHEAD + DOUBLE_WORD;

    fn insert(&mut self, heap: &mut Heap, block: Block) {
        let size = heap.size_of(block);
        let key = key_of(size, block);
        if self.root.is_none() {
            let root = self.take_node(true);
            self.root = Some(root);
        }
        let leaf = self.find_leaf(key).expect("tree has a root");

        let n = self.node_mut(leaf);
        let len = n.len;
        let at = n.keys().partition_point(|&k| k < key);
        debug_assert!(at == len || n.keys[at] != key, "{:?} inserted twice", block);
        n.keys.copy_within(at..len, at + 1);
        n.slots.copy_within(at..len, at + 1);
        n.keys[at] = key;
        n.slots[at] = Block::encode(Some(block));
        n.len += 1;

        if self.node(leaf).len >= self.order {
            self.split_leaf(leaf);
        }
        self.len += 1;
        heap_log!(heap, trace, "B+-tree insert {:?} size {}", block, size);
    }

    fn remove(&mut self, heap: &mut Heap, block: Block) {
        let key = key_of(heap.size_of(block), block);
        let leaf = self.find_leaf(key).expect("removing from an empty tree");
        let at = self
            .node(leaf)
            .keys()
            .binary_search(&key)
            .expect("removed block is in the tree");
        self.delete_entry(leaf, at);
        self.len -= 1;
        heap_log!(heap, trace, "B+-tree remove {:?}", block);
    }

    fn find_at_least(&self, heap: &Heap, size: usize, reserved: Reserved) -> Option<Block> {
        if size > u32::MAX as usize {
            return None;
        }
        let target = (size as u64) << 32;
        let mut leaf = self.find_leaf(target)?;
        let mut i = self.node(leaf).keys().partition_point(|&k| k < target);
        loop {
            let node = self.node(leaf);
            while i < node.len {
                let block = node.block(i);
                if reserved.admits(heap, block) {
                    return Some(block);
                }
                i += 1;
            }
            leaf = node.sibling?;
            i = 0;
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.vacant.clear();
        self.root = None;
        self.len = 0;
    }

    fn contains(&self, heap: &Heap, block: Block) -> bool {
        let key = key_of(heap.size_of(block), block);
        self.find_leaf(key)
            .map_or(false, |leaf| self.node(leaf).keys().binary_search(&key).is_ok())
    }

    fn check(
        &self,
        heap: &Heap,
        visit: &mut dyn FnMut(Block) -> Result<(), Corruption>,
    ) -> Result<usize, Corruption> {
        let root = match self.root {
            None if self.len == 0 => return Ok(0),
            None => return Err(Corruption::index(None, "entries but no root")),
            Some(r) => r,
        };

        let live = |id: NodeId| id.index() < self.nodes.len() && !self.vacant.contains(&id);
        let mut count = 0;
        let mut leaf_depth = None;
        // (node, expected parent, lower bound, upper bound, depth)
        let mut stack: Vec<(NodeId, Option<NodeId>, Key, Option<Key>, usize)> =
            Vec::with_capacity(MAX_PATH * self.order);
        stack.push((root, None, 0, None, 0));

        while let Some((id, parent, lo, hi, depth)) = stack.pop() {
            if !live(id) || depth > MAX_PATH {
                return Err(Corruption::index(None, "link to a vacant node"));
            }
            let node = self.node(id);
            if node.parent != parent {
                return Err(Corruption::index(None, "parent link disagrees with child link"));
            }
            if node.len >= self.order {
                return Err(Corruption::index(None, "node is overfull"));
            }
            if Some(id) != self.root && node.len < self.min_keys() {
                return Err(Corruption::index(None, "node is underfull"));
            }
            let keys = node.keys();
            if keys.windows(2).any(|w| w[0] >= w[1]) {
                return Err(Corruption::index(None, "keys out of order"));
            }
            if keys.iter().any(|&k| k < lo || hi.map_or(false, |hi| k >= hi)) {
                return Err(Corruption::index(None, "key outside its separators"));
            }

            if node.leaf {
                if *leaf_depth.get_or_insert(depth) != depth {
                    return Err(Corruption::index(None, "leaves at different depths"));
                }
                for (i, &key) in keys.iter().enumerate() {
                    let block = Block::decode(node.slots[i])
                        .and_then(|b| heap.block_at(b.offset()))
                        .ok_or(Corruption::index(None, "leaf entry outside the heap"))?;
                    visit(block)?;
                    if key != key_of(heap.size_of(block), block) {
                        return Err(Corruption::index(Some(block), "stale key for block"));
                    }
                }
                count += node.len;
            } else {
                if node.len == 0 {
                    return Err(Corruption::index(None, "inner node without keys"));
                }
                for i in 0..=node.len {
                    let child_lo = if i == 0 { lo } else { keys[i - 1] };
                    let child_hi = if i == node.len { hi } else { Some(keys[i]) };
                    stack.push((node.child(i), Some(id), child_lo, child_hi, depth + 1));
                }
            }
        }

        // The leaf chain must visit the same entries in ascending order.
        let mut chained = 0;
        let mut last: Option<Key> = None;
        let mut leaf = self.leftmost_leaf(root);
        for _ in 0..self.nodes.len() {
            let node = self.node(leaf);
            for &key in node.keys() {
                if last.map_or(false, |l| l >= key) {
                    return Err(Corruption::index(None, "leaf chain out of order"));
                }
                last = Some(key);
            }
            chained += node.len;
            match node.sibling {
                Some(next) if live(next) => leaf = next,
                Some(_) => return Err(Corruption::index(None, "leaf chain reaches a vacant node")),
                None => break,
            }
        }

        if chained != count || count != self.len {
            return Err(Corruption::index(None, "entry count disagrees with length"));
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::scratch::heap_with;
    use crate::layout::AUX_RESERVED;

    use std::vec::Vec;
    use test_log::test;

    fn check(tree: &BPlusTree, heap: &Heap) -> usize {
        match tree.check(heap, &mut |_| Ok(())) {
            Ok(n) => n,
            Err(e) => panic!("{}", e),
        }
    }

    fn sizes(n: usize) -> Vec<usize> {
        (0..n).map(|i| 16 + 8 * ((i * 7) % 23)).collect()
    }

    #[test]
    fn test_splits_and_merges_keep_invariants() {
        for &order in &[3usize, 4, 5, 8] {
            let mut scratch = heap_with(&sizes(60));
            let heap = &mut scratch.heap;
            let blocks = scratch.blocks.clone();
            let mut tree = BPlusTree::with_order(order);

            for &b in &blocks {
                tree.insert(heap, b);
                check(&tree, heap);
            }
            assert_eq!(tree.len(), 60);
            assert!(tree.height() > 1);

            for k in 0..blocks.len() {
                let b = blocks[(k * 17) % blocks.len()];
                assert!(tree.contains(heap, b));
                tree.remove(heap, b);
                assert!(!tree.contains(heap, b));
                assert_eq!(check(&tree, heap), tree.len());
            }
            assert!(tree.is_empty());
            assert_eq!(tree.height(), 1);
            assert_eq!(tree.live_nodes(), 1);
        }
    }

    #[test]
    fn test_best_fit_sweeps_leaves() {
        let mut scratch = heap_with(&sizes(40));
        let heap = &mut scratch.heap;
        let blocks = scratch.blocks.clone();
        let mut tree = BPlusTree::with_order(3);
        for &b in &blocks {
            tree.insert(heap, b);
        }

        for &want in &[1usize, 16, 17, 100, 192] {
            let found = tree.find_at_least(heap, want, Reserved::Skip).unwrap();
            let best = blocks
                .iter()
                .copied()
                .filter(|&b| heap.size_of(b) >= want)
                .min_by_key(|&b| (heap.size_of(b), b))
                .unwrap();
            assert_eq!(found, best, "best fit for {}", want);
        }
        assert_eq!(tree.find_at_least(heap, 193, Reserved::Skip), None);

        // Reserving the best candidate moves the answer along the chain.
        let first = tree.find_at_least(heap, 100, Reserved::Skip).unwrap();
        let aux = heap.aux_bits(first);
        heap.set_aux(first, aux | AUX_RESERVED);
        let second = tree.find_at_least(heap, 100, Reserved::Skip).unwrap();
        assert_ne!(first, second);
        assert!(heap.size_of(second) >= heap.size_of(first));
        assert_eq!(tree.find_at_least(heap, 100, Reserved::Allow), Some(first));
    }

    #[test]
    fn test_vacated_nodes_are_reused() {
        let mut scratch = heap_with(&sizes(50));
        let heap = &mut scratch.heap;
        let blocks = scratch.blocks.clone();
        let mut tree = BPlusTree::with_order(4);

        for &b in &blocks {
            tree.insert(heap, b);
        }
        let pool = tree.pool_size();
        for &b in &blocks {
            tree.remove(heap, b);
        }
        assert_eq!(tree.live_nodes(), 1);
        for &b in &blocks {
            tree.insert(heap, b);
        }
        check(&tree, heap);
        assert_eq!(tree.pool_size(), pool);
    }

    #[test]
    fn test_repeated_same_size() {
        let mut scratch = heap_with(&[16; 20]);
        let heap = &mut scratch.heap;
        let blocks = scratch.blocks.clone();
        let mut tree = BPlusTree::new();
        for _ in 0..3 {
            for &b in &blocks {
                tree.insert(heap, b);
            }
            check(&tree, heap);
            for &b in blocks.iter().rev() {
                tree.remove(heap, b);
                check(&tree, heap);
            }
        }
        assert!(tree.is_empty());
    }

    #[test]
    #[should_panic]
    fn test_order_too_small() {
        let _ = BPlusTree::with_order(2);
    }

    #[test]
    fn test_check_reports_broken_structure() {
        let mut scratch = heap_with(&sizes(30));
        let heap = &mut scratch.heap;
        let mut tree = BPlusTree::with_order(3);
        for &b in &scratch.blocks {
            tree.insert(heap, b);
        }
        assert!(tree.height() > 1);
        let root = tree.root.unwrap();
        let leaf = tree.leftmost_leaf(root);
        assert!(tree.node(leaf).len >= 2);

        let mut unordered = tree.clone();
        unordered.nodes[leaf.index()].keys.swap(0, 1);
        assert!(matches!(
            unordered.check(heap, &mut |_| Ok(())),
            Err(Corruption::IndexStructure {
                problem: "keys out of order",
                ..
            })
        ));

        let mut orphaned = tree.clone();
        orphaned.nodes[leaf.index()].parent = None;
        assert!(matches!(
            orphaned.check(heap, &mut |_| Ok(())),
            Err(Corruption::IndexStructure {
                problem: "parent link disagrees with child link",
                ..
            })
        ));

        // A separator that no longer bounds its right subtree.
        let mut misplaced = tree.clone();
        misplaced.nodes[root.index()].keys[0] = 0;
        assert!(misplaced.check(heap, &mut |_| Ok(())).is_err());

        check(&tree, heap);
    }
}
