//! Free-block indexes.
//!
//! A [`FreeIndex`] tracks every currently free block, keyed by size, and
//! answers "find a free block of at least N bytes". Three implementations are
//! provided:
//!
//! - [`RedBlackTree`]: a size-ordered red/black tree threaded through the free
//!   blocks themselves. Best fit.
//! - [`SegregatedList`]: power-of-two size classes, each a doubly linked list
//!   threaded through the free blocks. First fit.
//! - [`BPlusTree`]: a size-ordered B+-tree whose nodes live out of line, in a
//!   pool owned by the index. Best fit, balanced regardless of insertion
//!   order.

use crate::check::Corruption;
use crate::layout::{Block, Heap};

mod bplus;
mod rbtree;
mod seglist;

pub use self::bplus::{BPlusTree, DEFAULT_ORDER, MAX_ORDER};
pub use self::rbtree::RedBlackTree;
pub use self::seglist::{ListOrder, SegregatedList, BUCKET_COUNT};

/// Whether a fit query may return a block carrying the reservation tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reserved {
    Skip,
    Allow,
}

impl Reserved {
    pub(crate) fn admits(self, heap: &Heap, block: Block) -> bool {
        self == Reserved::Allow || !heap.is_reserved(block)
    }
}

/// The set of free blocks.
///
/// The index never decides whether a block is free; the allocator marks a
/// block free before inserting it, and removes it before marking it
/// allocated or merging it away. A block is in the index exactly when it is
/// free.
pub trait FreeIndex {
    /// Smallest block that can carry this index's free-block metadata.
    const MIN_BLOCK_SIZE: usize;

    /// Add a free block. Its tags must already be written.
    fn insert(&mut self, heap: &mut Heap, block: Block);

    /// Remove a block previously inserted and not yet removed.
    fn remove(&mut self, heap: &mut Heap, block: Block);

    /// Find a tracked block of at least `size` bytes, leaving it tracked.
    fn find_at_least(&self, heap: &Heap, size: usize, reserved: Reserved) -> Option<Block>;

    /// Number of tracked blocks.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every tracked block.
    fn clear(&mut self);

    /// Whether `block`, which must be a real block of the heap, is tracked.
    fn contains(&self, heap: &Heap, block: Block) -> bool;

    /// Verify the structure's own invariants, calling `visit` once for every
    /// tracked block. Returns the number of blocks visited.
    fn check(
        &self,
        heap: &Heap,
        visit: &mut dyn FnMut(Block) -> Result<(), Corruption>,
    ) -> Result<usize, Corruption>;
}
