//! The allocator instance and its thread-safe wrapper.
//!
//! ## Basic Types
//!
//! ### [`RawAlloc`]
//!
//! A `RawAlloc` owns one heap: the backing store it grows from, the boundary
//! tags laid out in it, and the free-block index that tracks its free space.
//! It is single-threaded; every operation takes `&mut self`.
//!
//! ### [`LockedHeap`]
//!
//! A `LockedHeap` wraps `RawAlloc` with a spin lock, which is enough to
//! implement [`GlobalAlloc`] and serve as the global allocator.
//!
//! ### `UnixAllocator`
//!
//! With the `use_libc` feature, `UnixAllocator` is a `LockedHeap` growing with
//! `sbrk` and indexed by a red/black tree.

use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::ptr::{self, null_mut};

use spin::{Mutex, MutexGuard};

use crate::config::Config;
#[cfg(feature = "use_libc")]
use crate::grower::SbrkHeapGrower;
use crate::grower::{round_up, HeapGrower};
#[cfg(feature = "use_libc")]
use crate::index::RedBlackTree;
use crate::index::{FreeIndex, Reserved};
use crate::layout::{Block, Heap, Tag, ALIGNMENT, DOUBLE_WORD, OVERHEAD, WORD_SIZE};

/// Largest heap whose offsets fit a tag word.
pub const MAX_HEAP_SIZE: usize = (u32::MAX as usize) & !(ALIGNMENT - 1);

/// Offset of the first block after the padding word and the prologue.
const FIRST_BLOCK: usize = 2 * DOUBLE_WORD;

/// Why the heap could not grow.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeapError {
    /// The backing store refused to grow.
    Exhausted,
    /// The backing store returned memory that does not continue the heap.
    Discontiguous,
    /// The backing store returned memory off the alignment unit.
    Misaligned,
    /// The heap would outgrow the offsets a tag word can hold.
    TooLarge,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::Exhausted => write!(f, "backing store is exhausted"),
            HeapError::Discontiguous => {
                write!(f, "backing store returned a region that does not continue the heap")
            }
            HeapError::Misaligned => write!(f, "backing store returned a misaligned region"),
            HeapError::TooLarge => write!(f, "heap would exceed {} bytes", MAX_HEAP_SIZE),
        }
    }
}

/// Running totals of what the allocator has done.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct Counters {
    /// Successful requests to the backing store.
    pub heap_growths: usize,
    /// Reallocations satisfied without moving the payload.
    pub in_place_resizes: usize,
    /// Reallocations that copied the payload to a new address.
    pub payload_moves: usize,
    /// Free blocks set aside for a block that just grew.
    pub reservations: usize,
}

impl Counters {
    const fn new() -> Self {
        Counters {
            heap_growths: 0,
            in_place_resizes: 0,
            payload_moves: 0,
            reservations: 0,
        }
    }
}

/// A raw allocator, capable of growing the heap, returning pointers to new
/// allocations, and tracking and reusing freed memory.
///
/// Note: It never returns memory to the backing store.
pub struct RawAlloc<G, I> {
    pub grower: G,
    pub(crate) index: I,
    pub(crate) heap: Heap,
    pub(crate) config: Config,
    pub(crate) counters: Counters,
}

impl<G: HeapGrower + Default, I: FreeIndex + Default> Default for RawAlloc<G, I> {
    fn default() -> Self {
        RawAlloc::new(G::default(), I::default())
    }
}

impl<G, I> RawAlloc<G, I> {
    pub const fn new(grower: G, index: I) -> Self {
        RawAlloc::with_config(grower, index, Config::new())
    }

    pub const fn with_config(grower: G, index: I, config: Config) -> Self {
        RawAlloc {
            grower,
            index,
            heap: Heap::new(),
            config,
            counters: Counters::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn index(&self) -> &I {
        &self.index
    }
}

impl<G: HeapGrower, I: FreeIndex> RawAlloc<G, I> {
    /// The block size needed to hold `size` payload bytes, or `None` if no
    /// block that large can exist.
    pub fn block_size(size: usize) -> Option<usize> {
        let padded = round_up(size.checked_add(OVERHEAD)?, ALIGNMENT)?;
        let size = padded.max(I::MIN_BLOCK_SIZE);
        if size > MAX_HEAP_SIZE {
            return None;
        }
        Some(size)
    }

    pub fn is_initialized(&self) -> bool {
        !self.heap.is_empty()
    }

    /// Lay out the heap, or reset it if it already exists.
    ///
    /// The first call takes one chunk from the backing store and writes the
    /// padding word, the prologue, one free block and the epilogue. Later
    /// calls forget every allocation: the index is cleared and everything
    /// between the prologue and the epilogue becomes one free block.
    pub fn init(&mut self) -> Result<(), HeapError> {
        if self.heap.is_empty() {
            let chunk = self.config.chunk_size().max(I::MIN_BLOCK_SIZE);
            self.grow(FIRST_BLOCK + chunk)?;
            self.heap.write_word(0, 0);
            self.heap.mark(Block::at(DOUBLE_WORD), DOUBLE_WORD, 0, true);
        }

        self.index.clear();
        let first = Block::at(FIRST_BLOCK);
        self.heap.mark(first, self.heap.len() - FIRST_BLOCK, 0, false);
        self.write_epilogue();
        self.index.insert(&mut self.heap, first);
        heap_log!(self.heap, debug, "heap of {} bytes initialised", self.heap.len());
        Ok(())
    }

    fn write_epilogue(&mut self) {
        let end = self.heap.len() - WORD_SIZE;
        self.heap.write_word(end, Tag::pack(0, 0, true).bits());
    }

    /// Take at least `size` more bytes from the backing store and record them.
    ///
    /// Nothing about the allocator changes unless the whole region is usable.
    fn grow(&mut self, size: usize) -> Result<usize, HeapError> {
        let size = round_up(size, ALIGNMENT).ok_or(HeapError::TooLarge)?;
        if size > MAX_HEAP_SIZE - self.heap.len() {
            return Err(HeapError::TooLarge);
        }

        let (ptr, granted) = match unsafe { self.grower.grow_heap(size) } {
            Ok(region) => region,
            Err(e) => {
                heap_log!(
                    self.heap,
                    debug,
                    "backing store refused {} bytes: {:?}",
                    size,
                    e
                );
                return Err(HeapError::Exhausted);
            }
        };
        if ptr.is_null() || granted < size {
            return Err(HeapError::Exhausted);
        }
        if granted % ALIGNMENT != 0 || (ptr as usize) % ALIGNMENT != 0 {
            return Err(HeapError::Misaligned);
        }
        if !self.heap.is_empty() && ptr != self.heap.end() {
            return Err(HeapError::Discontiguous);
        }
        if granted > MAX_HEAP_SIZE - self.heap.len() {
            return Err(HeapError::TooLarge);
        }

        self.heap.extend(ptr, granted);
        self.counters.heap_growths += 1;
        heap_log!(
            self.heap,
            debug,
            "heap grew by {} bytes to {} (asked for {})",
            granted,
            self.heap.len(),
            size
        );
        Ok(granted)
    }

    /// Grow the heap by at least `size` bytes and fold the new space into the
    /// free set. The returned block is free, indexed, and at least `size`
    /// bytes.
    pub(crate) fn extend(&mut self, size: usize) -> Result<Block, HeapError> {
        // The old epilogue header becomes the new block's header.
        let block = Block::at(self.heap.len());
        let granted = self.grow(size.max(self.config.chunk_size()))?;

        self.heap.mark(block, granted, 0, false);
        self.write_epilogue();
        let block = self.coalesce(block);
        self.index.insert(&mut self.heap, block);
        Ok(block)
    }

    /// Merge the free `block` with any free physical neighbors. Neighbors are
    /// taken out of the index; `block` itself must not be in it. Returns the
    /// merged block.
    pub(crate) fn coalesce(&mut self, block: Block) -> Block {
        let next = self.heap.next_block(block);
        let prev_free = !self.heap.prev_footer(block).is_allocated();
        let next_free = !self.heap.is_allocated(next);
        if !prev_free && !next_free {
            return block;
        }

        let mut merged = block;
        let mut size = self.heap.size_of(block);
        if next_free {
            size += self.heap.size_of(next);
            self.index.remove(&mut self.heap, next);
        }
        if prev_free {
            let prev = self.heap.prev_block(block);
            size += self.heap.size_of(prev);
            self.index.remove(&mut self.heap, prev);
            merged = prev;
        }

        self.heap.mark(merged, size, 0, false);
        heap_log!(
            self.heap,
            trace,
            "coalesced {:?} into {:?} of {} bytes",
            block,
            merged,
            size
        );
        merged
    }

    /// Find a free block of at least `size` bytes, growing the heap if none
    /// is indexed. The block is left in the index.
    pub(crate) fn find_fit(&mut self, size: usize) -> Option<Block> {
        if let Some(block) = self.index.find_at_least(&self.heap, size, Reserved::Skip) {
            return Some(block);
        }
        match self.extend(size) {
            Ok(block) => Some(block),
            Err(e) => {
                let reserved = self.index.find_at_least(&self.heap, size, Reserved::Allow);
                match reserved {
                    Some(block) => {
                        heap_log!(self.heap, warn, "{}; taking reserved block {:?}", e, block)
                    }
                    None => heap_log!(self.heap, warn, "{}; cannot allocate {} bytes", e, size),
                }
                reserved
            }
        }
    }

    /// Allocate the free, indexed `block` to hold `size` bytes, splitting off
    /// the rest as a new free block if it is big enough to stand alone.
    pub(crate) fn place(&mut self, block: Block, size: usize) {
        let available = self.heap.size_of(block);
        debug_assert!(available >= size);
        self.index.remove(&mut self.heap, block);

        let rest = available - size;
        if rest < I::MIN_BLOCK_SIZE {
            self.heap.mark(block, available, 0, true);
            return;
        }
        self.heap.mark(block, size, 0, true);
        let remainder = self.heap.next_block(block);
        self.heap.mark(remainder, rest, 0, false);
        // The block after the remainder was the original block's neighbor,
        // which cannot be free.
        self.index.insert(&mut self.heap, remainder);
        heap_log!(
            self.heap,
            trace,
            "split {:?}: kept {}, freed {}",
            block,
            size,
            rest
        );
    }

    /// [`find_fit`](Self::find_fit), laying out the heap first if needed.
    fn find_initialized(&mut self, size: usize) -> Option<Block> {
        if self.heap.is_empty() {
            if let Err(e) = self.init() {
                heap_log!(self.heap, warn, "cannot initialise heap: {}", e);
                return None;
            }
        }
        self.find_fit(size)
    }

    /// Find and place a block of exactly `size` bytes (or a little more).
    pub(crate) fn allocate_block(&mut self, size: usize) -> Option<Block> {
        let block = self.find_initialized(size)?;
        self.place(block, size);
        Some(block)
    }

    /// Allocate `size` payload bytes, aligned to 8. Returns null for size zero
    /// and when the backing store is exhausted.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return null_mut();
        }
        let needed = match Self::block_size(size) {
            Some(needed) => needed,
            None => {
                heap_log!(
                    self.heap,
                    warn,
                    "cannot allocate {} bytes: larger than any heap",
                    size
                );
                return null_mut();
            }
        };
        match self.allocate_block(needed) {
            Some(block) => {
                heap_log!(self.heap, trace, "allocate({}) -> {:?}", size, block);
                self.heap.payload(block)
            }
            None => null_mut(),
        }
    }

    /// Allocate `size` payload bytes at an address that is a multiple of
    /// `align`, which must be a power of two. Alignments up to 8 are the same
    /// as [`allocate`](Self::allocate).
    ///
    /// A fit with room for the alignment gap is found first, and the gap in
    /// front of the aligned payload is split off as a free block of its own.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> *mut u8 {
        debug_assert!(align.is_power_of_two());
        if align <= ALIGNMENT {
            return self.allocate(size);
        }
        if size == 0 {
            return null_mut();
        }
        let needed = match Self::block_size(size) {
            Some(needed) => needed,
            None => return null_mut(),
        };
        let search = match needed
            .checked_add(align)
            .and_then(|s| s.checked_add(I::MIN_BLOCK_SIZE))
        {
            Some(search) if search <= MAX_HEAP_SIZE => search,
            _ => {
                heap_log!(self.heap, warn, "cannot allocate {} bytes at {}", size, align);
                return null_mut();
            }
        };

        let block = match self.find_initialized(search) {
            Some(block) => block,
            None => return null_mut(),
        };

        let addr = self.heap.payload(block) as usize;
        let block = if addr % align == 0 {
            block
        } else {
            // The gap must be able to stand alone as a free block.
            let mut gap = align - addr % align;
            while gap < I::MIN_BLOCK_SIZE {
                gap += align;
            }
            let total = self.heap.size_of(block);
            self.index.remove(&mut self.heap, block);
            self.heap.mark(block, gap, 0, false);
            let aligned = self.heap.next_block(block);
            self.heap.mark(aligned, total - gap, 0, false);
            // The block in front of the gap was in front of a free block, so
            // it is allocated.
            self.index.insert(&mut self.heap, block);
            self.index.insert(&mut self.heap, aligned);
            heap_log!(self.heap, trace, "aligned {:?} to {:?}", block, aligned);
            aligned
        };
        self.place(block, needed);
        self.heap.payload(block)
    }

    /// The allocated block whose payload starts at `ptr`, if there is one.
    pub(crate) fn owned_block(&self, ptr: *const u8) -> Option<Block> {
        let block = self.heap.block_of(ptr)?;
        if block.offset() < FIRST_BLOCK || !self.heap.is_allocated(block) {
            return None;
        }
        Some(block)
    }

    /// Release the allocation at `ptr`. Null is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this allocator and must not be used again.
    /// Pointers that do not name an allocated block are logged and ignored,
    /// but a pointer that happens to land on another live block frees it.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let block = match self.owned_block(ptr) {
            Some(block) => block,
            None => {
                heap_log!(
                    self.heap,
                    error,
                    "release of {:?}, which is not an allocated block",
                    ptr
                );
                return;
            }
        };

        let size = self.heap.size_of(block);
        self.heap.mark(block, size, 0, false);
        let block = self.coalesce(block);
        self.index.insert(&mut self.heap, block);
        heap_log!(self.heap, trace, "release({:?}) -> free {:?}", ptr, block);
    }
}

/// A thread-safe allocator, using a spin lock around a [`RawAlloc`].
///
/// Operations on the wrapped allocator do not log. A logger that allocates
/// would otherwise call back into this allocator while it holds its own lock.
///
/// The [`BPlusTree`](crate::BPlusTree) index allocates its nodes from the
/// global allocator, so a `LockedHeap` using it must not itself be installed
/// as the global allocator.
pub struct LockedHeap<G, I> {
    raw: Mutex<RawAlloc<G, I>>,
}

impl<G: HeapGrower + Default, I: FreeIndex + Default> Default for LockedHeap<G, I> {
    fn default() -> Self {
        LockedHeap::new(RawAlloc::default())
    }
}

impl<G, I> LockedHeap<G, I> {
    pub const fn new(raw: RawAlloc<G, I>) -> Self {
        let mut raw = raw;
        raw.heap = raw.heap.silenced();
        LockedHeap {
            raw: Mutex::new(raw),
        }
    }

    /// Lock the underlying allocator.
    ///
    /// Allocation through this `LockedHeap` spins until the guard is dropped.
    pub fn lock(&self) -> MutexGuard<'_, RawAlloc<G, I>> {
        self.raw.lock()
    }
}

unsafe impl<G: HeapGrower, I: FreeIndex> GlobalAlloc for LockedHeap<G, I> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.raw.lock().allocate_aligned(layout.size(), layout.align())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.raw.lock().release(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let mut raw = self.raw.lock();
        if layout.align() <= ALIGNMENT {
            return raw.reallocate(ptr, new_size);
        }
        // Resizing in place could land the payload off its alignment.
        let fresh = raw.allocate_aligned(new_size, layout.align());
        if !fresh.is_null() {
            ptr::copy_nonoverlapping(ptr, fresh, layout.size().min(new_size));
            raw.release(ptr);
        }
        fresh
    }
}

#[cfg(feature = "use_libc")]
pub type UnixAllocator = LockedHeap<SbrkHeapGrower, RedBlackTree>;

#[cfg(feature = "use_libc")]
impl LockedHeap<SbrkHeapGrower, RedBlackTree> {
    /// An allocator on the program break, for use as `#[global_allocator]`.
    pub const fn sbrk() -> Self {
        LockedHeap::new(RawAlloc::new(SbrkHeapGrower::new(), RedBlackTree::new()))
    }
}
