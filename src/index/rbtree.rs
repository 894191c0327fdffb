//! A size-ordered red/black tree threaded through the free blocks.
//!
//! Each free block's payload holds three links (left, right, parent), and its
//! color lives in the tag's auxiliary bits, so the tree needs no storage of
//! its own beyond the root. Equal sizes are distinct nodes: an insert goes
//! right of any node of the same size.
//!
//! The insert and delete fixups are the iterative ones from CLRS, with the
//! nil sentinel replaced by `None` and the parent of a removed position
//! carried explicitly.

use crate::check::Corruption;
use crate::index::{FreeIndex, Reserved};
use crate::layout::{Block, Heap, ALIGNMENT, AUX_RED, OVERHEAD, WORD_SIZE};

const LEFT: usize = 0;
const RIGHT: usize = 1;
const PARENT: usize = 2;

/// Red/black trees over 2^32 bytes of 24-byte blocks are far shallower than
/// this; anything deeper is a cycle.
const MAX_DEPTH: usize = 128;

#[derive(Default)]
pub struct RedBlackTree {
    root: Option<Block>,
    len: usize,
}

fn left(heap: &Heap, node: Block) -> Option<Block> {
    heap.free(node).link(LEFT)
}

fn right(heap: &Heap, node: Block) -> Option<Block> {
    heap.free(node).link(RIGHT)
}

fn parent(heap: &Heap, node: Block) -> Option<Block> {
    heap.free(node).link(PARENT)
}

fn set_left(heap: &mut Heap, node: Block, child: Option<Block>) {
    heap.free_mut(node).set_link(LEFT, child)
}

fn set_right(heap: &mut Heap, node: Block, child: Option<Block>) {
    heap.free_mut(node).set_link(RIGHT, child)
}

fn set_parent(heap: &mut Heap, node: Block, parent: Option<Block>) {
    heap.free_mut(node).set_link(PARENT, parent)
}

/// Null positions are black.
fn is_red(heap: &Heap, node: Option<Block>) -> bool {
    node.map_or(false, |n| is_red_block(heap, n))
}

fn is_red_block(heap: &Heap, node: Block) -> bool {
    heap.aux_bits(node) & AUX_RED != 0
}

fn set_red(heap: &mut Heap, node: Block, red: bool) {
    let aux = heap.aux_bits(node) & !AUX_RED;
    heap.set_aux(node, if red { aux | AUX_RED } else { aux });
}

fn minimum(heap: &Heap, mut node: Block) -> Block {
    while let Some(l) = left(heap, node) {
        node = l;
    }
    node
}

/// In-order successor.
fn successor(heap: &Heap, node: Block) -> Option<Block> {
    if let Some(r) = right(heap, node) {
        return Some(minimum(heap, r));
    }
    let mut child = node;
    let mut up = parent(heap, node);
    while let Some(p) = up {
        if left(heap, p) == Some(child) {
            return Some(p);
        }
        child = p;
        up = parent(heap, p);
    }
    None
}

impl RedBlackTree {
    pub const fn new() -> Self {
        RedBlackTree { root: None, len: 0 }
    }

    pub fn root(&self) -> Option<Block> {
        self.root
    }

    /// Point whatever referenced `old` (its parent, or the root) at `new`.
    fn replace_child(&mut self, heap: &mut Heap, old: Block, new: Option<Block>) {
        match parent(heap, old) {
            None => self.root = new,
            Some(p) => {
                if left(heap, p) == Some(old) {
                    set_left(heap, p, new)
                } else {
                    set_right(heap, p, new)
                }
            }
        }
    }

    fn rotate_left(&mut self, heap: &mut Heap, x: Block) {
        let y = right(heap, x).expect("rotate_left needs a right child");
        let inner = left(heap, y);
        set_right(heap, x, inner);
        if let Some(inner) = inner {
            set_parent(heap, inner, Some(x));
        }
        let up = parent(heap, x);
        set_parent(heap, y, up);
        self.replace_child(heap, x, Some(y));
        set_left(heap, y, Some(x));
        set_parent(heap, x, Some(y));
    }

    fn rotate_right(&mut self, heap: &mut Heap, x: Block) {
        let y = left(heap, x).expect("rotate_right needs a left child");
        let inner = right(heap, y);
        set_left(heap, x, inner);
        if let Some(inner) = inner {
            set_parent(heap, inner, Some(x));
        }
        let up = parent(heap, x);
        set_parent(heap, y, up);
        self.replace_child(heap, x, Some(y));
        set_right(heap, y, Some(x));
        set_parent(heap, x, Some(y));
    }

    fn insert_fixup(&mut self, heap: &mut Heap, mut z: Block) {
        loop {
            let p = match parent(heap, z) {
                Some(p) if is_red(heap, Some(p)) => p,
                _ => break,
            };
            // A red node is never the root, so p has a parent.
            let g = parent(heap, p).expect("red node without a parent");
            if left(heap, g) == Some(p) {
                let uncle = right(heap, g);
                if is_red(heap, uncle) {
                    let u = uncle.expect("red uncle exists");
                    set_red(heap, p, false);
                    set_red(heap, u, false);
                    set_red(heap, g, true);
                    z = g;
                    continue;
                }
                if right(heap, p) == Some(z) {
                    z = p;
                    self.rotate_left(heap, z);
                }
                let p = parent(heap, z).expect("rotated node has a parent");
                let g = parent(heap, p).expect("rotated parent has a parent");
                set_red(heap, p, false);
                set_red(heap, g, true);
                self.rotate_right(heap, g);
            } else {
                let uncle = left(heap, g);
                if is_red(heap, uncle) {
                    let u = uncle.expect("red uncle exists");
                    set_red(heap, p, false);
                    set_red(heap, u, false);
                    set_red(heap, g, true);
                    z = g;
                    continue;
                }
                if left(heap, p) == Some(z) {
                    z = p;
                    self.rotate_right(heap, z);
                }
                let p = parent(heap, z).expect("rotated node has a parent");
                let g = parent(heap, p).expect("rotated parent has a parent");
                set_red(heap, p, false);
                set_red(heap, g, true);
                self.rotate_left(heap, g);
            }
        }

        if let Some(root) = self.root {
            set_red(heap, root, false);
        }
    }

    /// Restore black-height after a black node left position `x` (possibly a
    /// null leaf) under `x_parent`.
    fn delete_fixup(&mut self, heap: &mut Heap, mut x: Option<Block>, mut x_parent: Option<Block>) {
        while x != self.root && !is_red(heap, x) {
            let p = match x_parent {
                Some(p) => p,
                None => break,
            };

            if left(heap, p) == x {
                let mut w = right(heap, p).expect("doubly black node has a sibling");
                if is_red(heap, Some(w)) {
                    set_red(heap, w, false);
                    set_red(heap, p, true);
                    self.rotate_left(heap, p);
                    w = right(heap, p).expect("doubly black node has a sibling");
                }
                if !is_red(heap, left(heap, w)) && !is_red(heap, right(heap, w)) {
                    set_red(heap, w, true);
                    x = Some(p);
                    x_parent = parent(heap, p);
                } else {
                    if !is_red(heap, right(heap, w)) {
                        let wl = left(heap, w).expect("red nephew exists");
                        set_red(heap, wl, false);
                        set_red(heap, w, true);
                        self.rotate_right(heap, w);
                        w = right(heap, p).expect("doubly black node has a sibling");
                    }
                    let p_red = is_red_block(heap, p);
                    set_red(heap, w, p_red);
                    set_red(heap, p, false);
                    if let Some(wr) = right(heap, w) {
                        set_red(heap, wr, false);
                    }
                    self.rotate_left(heap, p);
                    x = self.root;
                    x_parent = None;
                }
            } else {
                let mut w = left(heap, p).expect("doubly black node has a sibling");
                if is_red(heap, Some(w)) {
                    set_red(heap, w, false);
                    set_red(heap, p, true);
                    self.rotate_right(heap, p);
                    w = left(heap, p).expect("doubly black node has a sibling");
                }
                if !is_red(heap, left(heap, w)) && !is_red(heap, right(heap, w)) {
                    set_red(heap, w, true);
                    x = Some(p);
                    x_parent = parent(heap, p);
                } else {
                    if !is_red(heap, left(heap, w)) {
                        let wr = right(heap, w).expect("red nephew exists");
                        set_red(heap, wr, false);
                        set_red(heap, w, true);
                        self.rotate_left(heap, w);
                        w = left(heap, p).expect("doubly black node has a sibling");
                    }
                    let p_red = is_red_block(heap, p);
                    set_red(heap, w, p_red);
                    set_red(heap, p, false);
                    if let Some(wl) = left(heap, w) {
                        set_red(heap, wl, false);
                    }
                    self.rotate_right(heap, p);
                    x = self.root;
                    x_parent = None;
                }
            }
        }

        if let Some(x) = x {
            set_red(heap, x, false);
        }
    }

    /// Check the subtree at `node`, whose sizes must lie in `lo..=hi`.
    /// Returns its black-height.
    fn check_subtree(
        &self,
        heap: &Heap,
        node: Option<Block>,
        expected_parent: Option<Block>,
        (lo, hi): (usize, usize),
        depth: usize,
        count: &mut usize,
        visit: &mut dyn FnMut(Block) -> Result<(), Corruption>,
    ) -> Result<usize, Corruption> {
        let node = match node {
            None => return Ok(1),
            Some(n) => n,
        };
        if depth > MAX_DEPTH || *count >= self.len {
            return Err(Corruption::index(Some(node), "tree is deeper than its length allows"));
        }
        if heap.block_at(node.offset()).is_none() {
            return Err(Corruption::index(Some(node), "link points outside the heap"));
        }
        visit(node)?;
        *count += 1;

        if parent(heap, node) != expected_parent {
            return Err(Corruption::index(Some(node), "parent link disagrees with child link"));
        }
        let size = heap.size_of(node);
        if size < lo || size > hi {
            return Err(Corruption::index(Some(node), "sizes out of search order"));
        }
        let red = is_red(heap, Some(node));
        let (l, r) = (left(heap, node), right(heap, node));
        if red && (is_red(heap, l) || is_red(heap, r)) {
            return Err(Corruption::index(Some(node), "red node has a red child"));
        }

        let left_height =
            self.check_subtree(heap, l, Some(node), (lo, size), depth + 1, count, visit)?;
        let right_height =
            self.check_subtree(heap, r, Some(node), (size, hi), depth + 1, count, visit)?;
        if left_height != right_height {
            return Err(Corruption::index(Some(node), "unequal black-height"));
        }

        Ok(left_height + if red { 0 } else { 1 })
    }
}

impl FreeIndex for RedBlackTree {
    // Header, three links, footer; rounded up to the alignment unit.
    const MIN_BLOCK_SIZE: usize = (OVERHEAD + 3 * WORD_SIZE + ALIGNMENT - 1) & !(ALIGNMENT - 1);

    fn insert(&mut self, heap: &mut Heap, block: Block) {
        let size = heap.size_of(block);

        let mut up = None;
        let mut cursor = self.root;
        while let Some(node) = cursor {
            up = Some(node);
            cursor = if size < heap.size_of(node) {
                left(heap, node)
            } else {
                right(heap, node)
            };
        }

        set_parent(heap, block, up);
        set_left(heap, block, None);
        set_right(heap, block, None);
        match up {
            None => self.root = Some(block),
            Some(p) if size < heap.size_of(p) => set_left(heap, p, Some(block)),
            Some(p) => set_right(heap, p, Some(block)),
        }
        set_red(heap, block, true);
        self.insert_fixup(heap, block);
        self.len += 1;
        heap_log!(heap, trace, "tree insert {:?} size {}", block, size);
    }

    fn remove(&mut self, heap: &mut Heap, block: Block) {
        heap_log!(heap, trace, "tree remove {:?} size {}", block, heap.size_of(block));
        let mut removed_red = is_red(heap, Some(block));
        let x;
        let x_parent;

        match (left(heap, block), right(heap, block)) {
            (None, r) => {
                x = r;
                x_parent = parent(heap, block);
                self.replace_child(heap, block, r);
                if let Some(r) = r {
                    set_parent(heap, r, x_parent);
                }
            }
            (l @ Some(_), None) => {
                x = l;
                x_parent = parent(heap, block);
                self.replace_child(heap, block, l);
                if let Some(l) = l {
                    set_parent(heap, l, x_parent);
                }
            }
            (Some(l), Some(r)) => {
                // Splice in the in-order successor.
                let y = minimum(heap, r);
                removed_red = is_red(heap, Some(y));
                x = right(heap, y);
                if y == r {
                    x_parent = Some(y);
                } else {
                    x_parent = parent(heap, y);
                    self.replace_child(heap, y, x);
                    if let Some(x) = x {
                        set_parent(heap, x, x_parent);
                    }
                    set_right(heap, y, Some(r));
                    set_parent(heap, r, Some(y));
                }
                let block_parent = parent(heap, block);
                self.replace_child(heap, block, Some(y));
                set_parent(heap, y, block_parent);
                set_left(heap, y, Some(l));
                set_parent(heap, l, Some(y));
                let block_red = is_red_block(heap, block);
                set_red(heap, y, block_red);
            }
        }

        if !removed_red {
            self.delete_fixup(heap, x, x_parent);
        }
        self.len -= 1;
    }

    fn find_at_least(&self, heap: &Heap, size: usize, reserved: Reserved) -> Option<Block> {
        let mut best = None;
        let mut cursor = self.root;
        while let Some(node) = cursor {
            if heap.size_of(node) >= size {
                best = Some(node);
                cursor = left(heap, node);
            } else {
                cursor = right(heap, node);
            }
        }

        // Everything after the tightest fit in order also fits.
        let mut candidate = best;
        while let Some(node) = candidate {
            if reserved.admits(heap, node) {
                return Some(node);
            }
            candidate = successor(heap, node);
        }
        None
    }

    fn len(&self) -> usize {
        self.len
    }

    fn clear(&mut self) {
        self.root = None;
        self.len = 0;
    }

    fn contains(&self, heap: &Heap, block: Block) -> bool {
        // Climb to the root; a block outside the tree has stale links that
        // will not agree with the nodes they name.
        let mut node = block;
        for _ in 0..=MAX_DEPTH {
            let up = heap.free(node).raw_link(PARENT);
            if up == 0 {
                return self.root == Some(node);
            }
            let p = match heap.block_at(up as usize) {
                Some(p) if !heap.is_allocated(p) => p,
                _ => return false,
            };
            let (l, r) = (heap.free(p).raw_link(LEFT), heap.free(p).raw_link(RIGHT));
            let word = Block::encode(Some(node));
            if l != word && r != word {
                return false;
            }
            node = p;
        }
        false
    }

    fn check(
        &self,
        heap: &Heap,
        visit: &mut dyn FnMut(Block) -> Result<(), Corruption>,
    ) -> Result<usize, Corruption> {
        if is_red(heap, self.root) {
            return Err(Corruption::index(self.root, "root is red"));
        }
        let mut count = 0;
        self.check_subtree(heap, self.root, None, (0, usize::MAX), 0, &mut count, visit)?;
        if count != self.len {
            return Err(Corruption::index(None, "node count disagrees with length"));
        }
        Ok(count)
    }
}
