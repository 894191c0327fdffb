//! Heap consistency checking.
//!
//! [`RawAlloc::check`] walks the physical block chain from the prologue to the
//! epilogue and then asks the index to verify itself, reporting the first
//! problem found. It is meant for tests and debugging; the allocation path
//! never calls it.

use core::fmt;

use crate::allocators::RawAlloc;
use crate::grower::HeapGrower;
use crate::index::FreeIndex;
use crate::layout::{Block, Tag, ALIGNMENT, DOUBLE_WORD, WORD_SIZE};

/// The first structural problem found in a heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Corruption {
    /// The prologue block does not have its fixed allocated tags.
    BadPrologue,
    /// The chain did not end with a zero-size allocated epilogue at the end of
    /// the heap.
    BadEpilogue { offset: usize },
    /// A block boundary is not on the alignment unit.
    Misaligned { offset: usize },
    /// A block's size runs past the end of the heap.
    OutOfBounds { block: Block },
    /// A block's header and footer disagree.
    TagMismatch { block: Block },
    /// A free block directly follows another free block.
    Uncoalesced { block: Block },
    /// A free block is not tracked by the index.
    MissingFromIndex { block: Block },
    /// The index tracks a block that is allocated.
    AllocatedInIndex { block: Block },
    /// The index tracks a different number of blocks than the heap has free.
    IndexCount { indexed: usize, free: usize },
    /// The index's own invariants are broken.
    IndexStructure {
        block: Option<Block>,
        problem: &'static str,
    },
}

impl Corruption {
    pub(crate) fn index(block: Option<Block>, problem: &'static str) -> Corruption {
        Corruption::IndexStructure { block, problem }
    }
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Corruption::BadPrologue => write!(f, "prologue block is damaged"),
            Corruption::BadEpilogue { offset } => {
                write!(f, "no epilogue where the heap ends (chain stopped at +{})", offset)
            }
            Corruption::Misaligned { offset } => write!(f, "block at +{} is misaligned", offset),
            Corruption::OutOfBounds { block } => write!(f, "block {} runs past the heap", block),
            Corruption::TagMismatch { block } => {
                write!(f, "block {} has mismatched header and footer", block)
            }
            Corruption::Uncoalesced { block } => {
                write!(f, "free block {} follows another free block", block)
            }
            Corruption::MissingFromIndex { block } => {
                write!(f, "free block {} is missing from the index", block)
            }
            Corruption::AllocatedInIndex { block } => {
                write!(f, "allocated block {} is in the index", block)
            }
            Corruption::IndexCount { indexed, free } => write!(
                f,
                "index holds {} blocks but the heap has {} free",
                indexed, free
            ),
            Corruption::IndexStructure {
                block: Some(block),
                problem,
            } => write!(f, "index broken at {}: {}", block, problem),
            Corruption::IndexStructure {
                block: None,
                problem,
            } => write!(f, "index broken: {}", problem),
        }
    }
}

/// Totals gathered while walking a consistent heap.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct Stats {
    /// Bytes granted by the backing store, sentinels included.
    pub heap_size: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    /// Allocated blocks, not counting the prologue and epilogue.
    pub allocated_blocks: usize,
    pub allocated_bytes: usize,
}

impl<G: HeapGrower, I: FreeIndex> RawAlloc<G, I> {
    /// Walk the whole heap and the index, and report the first inconsistency.
    pub fn check(&self) -> Result<Stats, Corruption> {
        let heap = &self.heap;
        let mut stats = Stats {
            heap_size: heap.len(),
            ..Stats::default()
        };
        if heap.is_empty() {
            return Ok(stats);
        }

        let prologue = Block::new(DOUBLE_WORD).ok_or(Corruption::BadPrologue)?;
        let prologue_tag = Tag::pack(DOUBLE_WORD, 0, true);
        if heap.header(prologue) != prologue_tag || heap.footer(prologue) != prologue_tag {
            return Err(Corruption::BadPrologue);
        }

        let mut previous_free = false;
        let mut offset = 2 * DOUBLE_WORD;
        loop {
            if offset % ALIGNMENT != 0 || offset > heap.len() {
                return Err(Corruption::Misaligned { offset });
            }
            let tag = Tag::from_bits(heap.read_word(offset - WORD_SIZE));
            if tag.size() == 0 {
                if !tag.is_allocated() || offset != heap.len() {
                    return Err(Corruption::BadEpilogue { offset });
                }
                break;
            }
            let block = Block::new(offset).ok_or(Corruption::Misaligned { offset })?;
            if offset + tag.size() > heap.len() {
                return Err(Corruption::OutOfBounds { block });
            }
            if heap.footer(block) != tag {
                return Err(Corruption::TagMismatch { block });
            }

            if tag.is_allocated() {
                stats.allocated_blocks += 1;
                stats.allocated_bytes += tag.size();
                previous_free = false;
            } else {
                if previous_free {
                    return Err(Corruption::Uncoalesced { block });
                }
                if !self.index.contains(heap, block) {
                    return Err(Corruption::MissingFromIndex { block });
                }
                stats.free_blocks += 1;
                stats.free_bytes += tag.size();
                previous_free = true;
            }

            offset += tag.size();
        }

        let indexed = self.index.check(heap, &mut |block| {
            if heap.is_allocated(block) {
                Err(Corruption::AllocatedInIndex { block })
            } else {
                Ok(())
            }
        })?;
        if indexed != stats.free_blocks {
            return Err(Corruption::IndexCount {
                indexed,
                free: stats.free_blocks,
            });
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grower::ToyHeap;
    use crate::index::{BPlusTree, ListOrder, RedBlackTree, SegregatedList};
    use crate::layout::AUX_RED;

    use std::boxed::Box;
    use test_log::test;

    fn toy<I: FreeIndex>(index: I) -> Box<RawAlloc<ToyHeap, I>> {
        Box::new(RawAlloc::new(ToyHeap::default(), index))
    }

    fn block_of<I: FreeIndex>(a: &RawAlloc<ToyHeap, I>, ptr: *mut u8) -> Block {
        a.heap.block_of(ptr).unwrap()
    }

    #[test]
    fn test_empty_and_clean_heaps_pass() {
        let mut a = toy(RedBlackTree::new());
        assert_eq!(a.check(), Ok(Stats::default()));

        let p = a.allocate(40);
        let _q = a.allocate(100);
        unsafe { a.release(p) };
        let stats = a.check().unwrap();
        assert_eq!(stats.allocated_blocks, 1);
        assert_eq!(stats.allocated_bytes, 112);
        assert_eq!(stats.free_blocks, 2);
        assert_eq!(stats.free_bytes, stats.heap_size - 16 - 112);
    }

    #[test]
    fn test_damaged_prologue() {
        let mut a = toy(RedBlackTree::new());
        a.allocate(8);
        let header = DOUBLE_WORD - WORD_SIZE;
        a.heap.write_word(header, Tag::pack(DOUBLE_WORD, 0, false).bits());
        assert_eq!(a.check(), Err(Corruption::BadPrologue));
    }

    #[test]
    fn test_header_and_footer_disagree() {
        let mut a = toy(SegregatedList::new(ListOrder::Unordered));
        let p = a.allocate(40);
        let block = block_of(&a, p);
        let size = a.heap.size_of(block);
        let footer = block.offset() + size - DOUBLE_WORD;
        a.heap.write_word(footer, Tag::pack(size, 0, false).bits());
        assert_eq!(a.check(), Err(Corruption::TagMismatch { block }));
    }

    #[test]
    fn test_block_runs_past_the_heap() {
        let mut a = toy(RedBlackTree::new());
        let p = a.allocate(40);
        let block = block_of(&a, p);
        let len = a.heap.len();
        a.heap
            .write_word(block.offset() - WORD_SIZE, Tag::pack(len, 0, true).bits());
        assert_eq!(a.check(), Err(Corruption::OutOfBounds { block }));
    }

    #[test]
    fn test_adjacent_free_blocks() {
        let mut a = toy(SegregatedList::default());
        let p = a.allocate(40);
        let q = a.allocate(40);
        let _guard = a.allocate(8);
        unsafe { a.release(p) };

        // Free q behind the allocator's back, skipping the merge with p.
        let raw = &mut *a;
        let q = raw.heap.block_of(q).unwrap();
        let size = raw.heap.size_of(q);
        raw.heap.mark(q, size, 0, false);
        raw.index.insert(&mut raw.heap, q);
        assert_eq!(raw.check(), Err(Corruption::Uncoalesced { block: q }));
    }

    #[test]
    fn test_free_block_missing_from_index() {
        let mut a = toy(RedBlackTree::new());
        let p = a.allocate(40);
        let _guard = a.allocate(8);
        let block = block_of(&a, p);
        let size = a.heap.size_of(block);
        a.heap.mark(block, size, 0, false);
        assert_eq!(a.check(), Err(Corruption::MissingFromIndex { block }));
    }

    #[test]
    fn test_allocated_block_in_index() {
        let mut a = toy(BPlusTree::new());
        let p = a.allocate(40);
        let _q = a.allocate(40);
        unsafe { a.release(p) };

        // Claim p without taking it out of the index.
        let block = block_of(&a, p);
        let size = a.heap.size_of(block);
        a.heap.mark(block, size, 0, true);
        assert_eq!(a.check(), Err(Corruption::AllocatedInIndex { block }));
    }

    #[test]
    fn test_missing_epilogue() {
        let mut a = toy(SegregatedList::default());
        a.allocate(100);
        let len = a.heap.len();
        a.heap.write_word(len - WORD_SIZE, Tag::pack(0, 0, false).bits());
        assert_eq!(a.check(), Err(Corruption::BadEpilogue { offset: len }));
    }

    #[test]
    fn test_index_tracks_a_block_the_heap_does_not_have() {
        let mut a = toy(BPlusTree::new());
        let p = a.allocate(100);
        let tail = a.heap.next_block(block_of(&a, p));

        // A position inside the free tail, whose zeroed header reads as a
        // free block of size zero.
        let raw = &mut *a;
        let phantom = Block::new(tail.offset() + 64).unwrap();
        assert_eq!(raw.heap.header(phantom), Tag::from_bits(0));
        raw.index.insert(&mut raw.heap, phantom);
        assert_eq!(
            raw.check(),
            Err(Corruption::IndexCount {
                indexed: 2,
                free: 1
            })
        );
    }

    #[test]
    fn test_index_structure_is_reported() {
        let mut a = toy(RedBlackTree::new());
        a.allocate(100);
        let root = a.index.root().unwrap();
        let aux = a.heap.aux_bits(root);
        a.heap.set_aux(root, aux | AUX_RED);
        assert_eq!(
            a.check(),
            Err(Corruption::IndexStructure {
                block: Some(root),
                problem: "root is red"
            })
        );
    }
}
