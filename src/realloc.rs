//! Resizing live allocations.
//!
//! A block that shrinks gives its tail back to the free set. A block that
//! grows first tries to take over free space from its physical neighbors,
//! and only falls back to allocate, copy and release when they are too small.
//!
//! Two heuristics keep a block that grows in small steps from being copied
//! every time. After growing, the free block right behind it is tagged as
//! reserved, so ordinary allocations leave it alone and the next resize can
//! absorb it. And a configurable slack is added to the new size, when the
//! space is there, so small follow-up growth needs no work at all.

use core::ptr::{self, null_mut};

use crate::allocators::RawAlloc;
use crate::grower::HeapGrower;
use crate::index::FreeIndex;
use crate::layout::{Block, AUX_RESERVED, OVERHEAD};

impl<G: HeapGrower, I: FreeIndex> RawAlloc<G, I> {
    /// Resize the allocation at `ptr` to hold `size` bytes, moving it if
    /// necessary. The first `min(old, new)` payload bytes are preserved.
    ///
    /// A null `ptr` allocates, and a zero `size` releases and returns null.
    /// If the allocation has to move and no memory is available, null is
    /// returned and the original allocation is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this allocator. If the
    /// result is not null, `ptr` must not be used again.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(size);
        }
        if size == 0 {
            self.release(ptr);
            return null_mut();
        }
        let block = match self.owned_block(ptr) {
            Some(block) => block,
            None => {
                heap_log!(
                    self.heap,
                    error,
                    "reallocate of {:?}, which is not an allocated block",
                    ptr
                );
                return null_mut();
            }
        };
        let needed = match Self::block_size(size) {
            Some(needed) => needed,
            None => return null_mut(),
        };

        let wanted = Self::block_size(size.saturating_add(self.config.realloc_slack()))
            .unwrap_or(needed);

        let current = self.heap.size_of(block);
        if needed <= current {
            // A shrinking block keeps up to the slack as headroom.
            self.shrink(block, wanted.min(current));
            self.counters.in_place_resizes += 1;
            return ptr;
        }

        let grown = match self.grow_into_neighbors(block, needed, wanted) {
            Some(grown) => grown,
            None => match self.move_block(block, needed, wanted) {
                Some(moved) => moved,
                None => return null_mut(),
            },
        };

        self.reserve_after(grown);
        self.heap.payload(grown)
    }

    /// Give the tail of `block` beyond `size` back to the free set, if it is
    /// big enough to be a block of its own.
    fn shrink(&mut self, block: Block, size: usize) {
        let current = self.heap.size_of(block);
        let rest = current - size;
        if rest < I::MIN_BLOCK_SIZE {
            return;
        }
        self.heap.mark(block, size, 0, true);
        let tail = self.heap.next_block(block);
        self.heap.mark(tail, rest, 0, false);
        let tail = self.coalesce(tail);
        self.index.insert(&mut self.heap, tail);
        heap_log!(self.heap, trace, "shrank {:?} from {} to {}", block, current, size);
    }

    /// How much of `total` bytes to keep: `wanted` if it fits, else `needed`,
    /// and all of it when the leftover could not stand alone.
    fn keep_size(total: usize, needed: usize, wanted: usize) -> usize {
        let keep = if total >= wanted { wanted } else { needed };
        if total - keep < I::MIN_BLOCK_SIZE {
            total
        } else {
            keep
        }
    }

    /// Grow `block` over its free physical neighbors: the next block alone,
    /// then the previous block alone, then both. Returns the grown block,
    /// which starts lower than `block` when the previous neighbor was taken.
    fn grow_into_neighbors(&mut self, block: Block, needed: usize, wanted: usize) -> Option<Block> {
        let current = self.heap.size_of(block);
        let next = self.heap.next_block(block);
        let next_size = if self.heap.is_allocated(next) {
            0
        } else {
            self.heap.size_of(next)
        };
        let prev_tag = self.heap.prev_footer(block);
        let prev_size = if prev_tag.is_allocated() {
            0
        } else {
            prev_tag.size()
        };

        if next_size > 0 && current + next_size >= needed {
            self.index.remove(&mut self.heap, next);
            self.settle(block, current + next_size, needed, wanted);
            self.counters.in_place_resizes += 1;
            heap_log!(self.heap, trace, "grew {:?} forward over {:?}", block, next);
            return Some(block);
        }

        let (take_next, total) = if prev_size > 0 && prev_size + current >= needed {
            (false, prev_size + current)
        } else if prev_size > 0 && next_size > 0 && prev_size + current + next_size >= needed {
            (true, prev_size + current + next_size)
        } else {
            return None;
        };

        let prev = self.heap.prev_block(block);
        self.index.remove(&mut self.heap, prev);
        if take_next {
            self.index.remove(&mut self.heap, next);
        }
        // The payload moves down before any tag is rewritten: the new footer
        // may land inside the old payload.
        unsafe {
            ptr::copy(
                self.heap.payload(block),
                self.heap.payload(prev),
                current - OVERHEAD,
            );
        }
        self.settle(prev, total, needed, wanted);
        self.counters.payload_moves += 1;
        heap_log!(
            self.heap,
            debug,
            "grew {:?} backward to {:?}{}",
            block,
            prev,
            if take_next { " and forward" } else { "" }
        );
        Some(prev)
    }

    /// Mark `block` allocated across `total` bytes of space it now owns,
    /// returning whatever it does not keep to the free set.
    fn settle(&mut self, block: Block, total: usize, needed: usize, wanted: usize) {
        let keep = Self::keep_size(total, needed, wanted);
        self.heap.mark(block, keep, 0, true);
        if keep < total {
            let rest = self.heap.next_block(block);
            self.heap.mark(rest, total - keep, 0, false);
            let rest = self.coalesce(rest);
            self.index.insert(&mut self.heap, rest);
        }
    }

    /// Copy `block` into a fresh block and release it.
    fn move_block(&mut self, block: Block, needed: usize, wanted: usize) -> Option<Block> {
        let fresh = match self.allocate_block(wanted) {
            Some(fresh) => fresh,
            None if wanted > needed => self.allocate_block(needed)?,
            None => return None,
        };
        let current = self.heap.size_of(block);
        let old = self.heap.payload(block);
        unsafe {
            ptr::copy_nonoverlapping(old, self.heap.payload(fresh), current - OVERHEAD);
            self.release(old);
        }
        self.counters.payload_moves += 1;
        heap_log!(self.heap, debug, "moved {:?} to {:?}", block, fresh);
        Some(fresh)
    }

    /// Tag the free block after `block`, if any, so ordinary allocation skips
    /// it while `block` may still want to grow into it.
    fn reserve_after(&mut self, block: Block) {
        if !self.config.reserve_after_realloc() {
            return;
        }
        let next = self.heap.next_block(block);
        if self.heap.is_allocated(next) || self.heap.is_reserved(next) {
            return;
        }
        let aux = self.heap.aux_bits(next);
        self.heap.set_aux(next, aux | AUX_RESERVED);
        self.counters.reservations += 1;
        heap_log!(self.heap, trace, "reserved {:?} behind {:?}", next, block);
    }
}

#[cfg(test)]
mod tests {
    use crate::allocators::RawAlloc;
    use crate::config::Config;
    use crate::grower::ToyHeap;
    use crate::index::{BPlusTree, FreeIndex, RedBlackTree, SegregatedList};

    use core::ptr::null_mut;
    use std::boxed::Box;
    use test_log::test;

    fn toy<I: FreeIndex>(index: I, config: Config) -> Box<RawAlloc<ToyHeap, I>> {
        Box::new(RawAlloc::with_config(ToyHeap::default(), index, config))
    }

    fn fill(ptr: *mut u8, len: usize, seed: u8) {
        for i in 0..len {
            unsafe { ptr.add(i).write(seed.wrapping_add(i as u8)) };
        }
    }

    fn holds(ptr: *const u8, len: usize, seed: u8) -> bool {
        (0..len).all(|i| unsafe { ptr.add(i).read() } == seed.wrapping_add(i as u8))
    }

    fn offset<I: FreeIndex>(a: &RawAlloc<ToyHeap, I>, ptr: *mut u8) -> usize {
        a.heap().block_of(ptr).unwrap().offset()
    }

    #[test]
    fn test_null_and_zero() {
        let mut a = toy(RedBlackTree::new(), Config::new());
        let p = unsafe { a.reallocate(null_mut(), 40) };
        assert_eq!(offset(&a, p), 16);
        let before = a.check().unwrap();
        let q = a.allocate(40);
        unsafe {
            assert!(a.reallocate(q, 0).is_null());
        }
        assert_eq!(a.check().unwrap(), before);
    }

    #[test]
    fn test_shrink_in_place() {
        let mut a = toy(SegregatedList::default(), Config::new());
        let p = a.allocate(200);
        let _guard = a.allocate(16);
        fill(p, 200, 1);

        let q = unsafe { a.reallocate(p, 100) };
        assert_eq!(p, q);
        assert!(holds(q, 100, 1));
        assert_eq!(a.heap().size_of(a.heap().block_of(q).unwrap()), 112);
        let stats = a.check().unwrap();
        // The cut-off tail cannot merge: the guard sits behind it.
        assert_eq!(stats.free_blocks, 2);

        // Too little to split off: the block stays as it is.
        let r = unsafe { a.reallocate(q, 96) };
        assert_eq!(r, q);
        assert_eq!(a.heap().size_of(a.heap().block_of(r).unwrap()), 112);
        assert_eq!(a.counters().in_place_resizes, 2);
        assert_eq!(a.counters().payload_moves, 0);
    }

    #[test]
    fn test_grow_forward() {
        let mut a = toy(RedBlackTree::new(), Config::new());
        let p = a.allocate(64);
        fill(p, 64, 7);
        let q = unsafe { a.reallocate(p, 1000) };
        assert_eq!(p, q);
        assert!(holds(q, 64, 7));
        assert_eq!(a.counters().in_place_resizes, 1);
        assert_eq!(a.counters().payload_moves, 0);
        a.check().unwrap();
    }

    #[test]
    fn test_grow_backward_shifts_payload() {
        let mut a = toy(BPlusTree::new(), Config::new());
        let before = a.allocate(200);
        let p = a.allocate(64);
        let _guard = a.allocate(16);
        fill(p, 64, 3);
        unsafe { a.release(before) };

        let q = unsafe { a.reallocate(p, 150) };
        assert_eq!(q, before);
        assert!(holds(q, 64, 3));
        assert_eq!(a.counters().payload_moves, 1);
        a.check().unwrap();
    }

    #[test]
    fn test_grow_into_both_neighbors() {
        let mut a = toy(RedBlackTree::new(), Config::new());
        let left = a.allocate(48);
        let p = a.allocate(48);
        let right = a.allocate(48);
        let _guard = a.allocate(16);
        fill(p, 48, 9);
        unsafe {
            a.release(left);
            a.release(right);
        }

        // 56 + 56 + 56 bytes of blocks around and including p.
        let q = unsafe { a.reallocate(p, 150) };
        assert_eq!(q, left);
        assert!(holds(q, 48, 9));
        assert_eq!(a.heap().size_of(a.heap().block_of(q).unwrap()), 168);
        a.check().unwrap();
    }

    #[test]
    fn test_move_when_boxed_in() {
        let mut a = toy(SegregatedList::default(), Config::new());
        let p = a.allocate(32);
        let _guard = a.allocate(16);
        fill(p, 32, 11);

        let q = unsafe { a.reallocate(p, 500) };
        assert_ne!(p, q);
        assert!(holds(q, 32, 11));
        assert_eq!(a.counters().payload_moves, 1);
        let stats = a.check().unwrap();
        assert_eq!(stats.allocated_blocks, 2);
    }

    #[test]
    fn test_failed_move_keeps_original() {
        let mut a = Box::new(RawAlloc::new(ToyHeap::with_limit(4160), RedBlackTree::new()));
        let p = a.allocate(32);
        let _guard = a.allocate(16);
        fill(p, 32, 5);
        let before = a.check().unwrap();

        let q = unsafe { a.reallocate(p, 8000) };
        assert!(q.is_null());
        assert!(holds(p, 32, 5));
        assert_eq!(a.check().unwrap(), before);
    }

    #[test]
    fn test_slack_absorbs_small_growth() {
        let mut a = toy(RedBlackTree::new(), Config::new().with_realloc_slack(64));
        let p = a.allocate(24);
        let next = a.allocate(16);
        unsafe { a.release(next) };

        let q = unsafe { a.reallocate(p, 32) };
        assert_eq!(p, q);
        let size = a.heap().size_of(a.heap().block_of(q).unwrap());
        assert_eq!(size, 104);
        // Covered by the slack: no neighbor is touched.
        for extra in 1..=8 {
            unsafe { a.reallocate(q, 32 + 8 * extra) };
        }
        assert_eq!(a.heap().size_of(a.heap().block_of(q).unwrap()), 104);
        assert_eq!(a.counters().in_place_resizes, 9);
        a.check().unwrap();
    }

    #[test]
    fn test_reservation_steers_allocations_away() {
        let mut a = toy(RedBlackTree::new(), Config::new());
        let p = a.allocate(24);
        let f = a.allocate(512);
        let _g = a.allocate(16);
        unsafe { a.release(f) };

        let p = unsafe { a.reallocate(p, 32) };
        let behind = a.heap().next_block(a.heap().block_of(p).unwrap());
        assert!(a.heap().is_reserved(behind));
        assert_eq!(a.counters().reservations, 1);

        // The best fit would be the reserved block; the tail is taken instead.
        let small = a.allocate(16);
        assert!(offset(&a, small) > offset(&a, f) + 512);
        a.check().unwrap();
    }
}
