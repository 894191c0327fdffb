//! Boundary-tag block layout.
//!
//! Every block in the heap is bracketed by two 4-byte tag words:
//!
//! ```text
//!   offset - 4        offset                          offset + size - 8
//!   ┌──────────┬──────────────────────────────────────┬──────────┐
//!   │  header  │  payload (or free-block links)       │  footer  │
//!   └──────────┴──────────────────────────────────────┴──────────┘
//! ```
//!
//! Blocks are named by the offset of their payload from the heap base, so
//! "next" and "previous" physical blocks are plain size arithmetic, and every
//! access is checked against the heap's recorded extent.

use core::fmt;
use core::num::NonZeroU32;
use core::ptr::null_mut;

use static_assertions::const_assert;

/// Size of a tag word.
pub const WORD_SIZE: usize = 4;
/// Size of a double word.
pub const DOUBLE_WORD: usize = 8;
/// Every block size, and every payload address, is a multiple of this.
pub const ALIGNMENT: usize = 8;
/// Bytes of every block taken by its header and footer.
pub const OVERHEAD: usize = 2 * WORD_SIZE;

/// Red/black color bit, used by the tree index. Set means red.
pub const AUX_RED: u32 = 0b010;
/// Reservation tag, set on a free block kept aside for a growing neighbor.
pub const AUX_RESERVED: u32 = 0b100;

const ALLOCATED: u32 = 0b001;
const AUX_MASK: u32 = AUX_RED | AUX_RESERVED;
const FLAG_MASK: u32 = ALLOCATED | AUX_MASK;

// The flag bits live below the alignment unit.
const_assert!((FLAG_MASK as usize) < ALIGNMENT);
const_assert!(OVERHEAD == DOUBLE_WORD);

/// A packed tag word: block size, allocated bit, and auxiliary bits.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Tag(u32);

impl Tag {
    pub const fn pack(size: usize, aux: u32, allocated: bool) -> Tag {
        let alloc_bit = if allocated { ALLOCATED } else { 0 };
        Tag(size as u32 | (aux & AUX_MASK) | alloc_bit)
    }

    pub const fn from_bits(bits: u32) -> Tag {
        Tag(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn size(self) -> usize {
        (self.0 & !FLAG_MASK) as usize
    }

    pub const fn is_allocated(self) -> bool {
        self.0 & ALLOCATED != 0
    }

    pub const fn aux(self) -> u32 {
        self.0 & AUX_MASK
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tag({}, {}",
            self.size(),
            if self.is_allocated() { "allocated" } else { "free" }
        )?;
        if self.0 & AUX_RED != 0 {
            write!(f, ", red")?;
        }
        if self.0 & AUX_RESERVED != 0 {
            write!(f, ", reserved")?;
        }
        write!(f, ")")
    }
}

/// A block, named by the offset of its payload from the heap base.
///
/// Offset 0 is never a payload (the padding word lives there), so
/// `Option<Block>` is the same size as `Block` and doubles as a nullable link
/// when stored inside a free block.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block(NonZeroU32);

impl Block {
    /// Construct a block reference from a payload offset. Returns `None` for
    /// zero or for offsets that do not fit a link word.
    pub fn new(offset: usize) -> Option<Block> {
        if offset > u32::MAX as usize {
            return None;
        }
        NonZeroU32::new(offset as u32).map(Block)
    }

    pub(crate) fn at(offset: usize) -> Block {
        Block::new(offset).expect("block offsets are non-zero and inside the heap")
    }

    pub fn offset(self) -> usize {
        self.0.get() as usize
    }

    /// Encode an optional block as a link word (0 means none).
    pub(crate) fn encode(link: Option<Block>) -> u32 {
        link.map_or(0, |b| b.0.get())
    }

    pub(crate) fn decode(word: u32) -> Option<Block> {
        NonZeroU32::new(word).map(Block)
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block(+{})", self.0)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{}", self.0)
    }
}

/// The contiguous heap region, as granted by a backing store.
///
/// `Heap` only knows the base pointer and the number of bytes granted so far.
/// All reads and writes go through word offsets that are bounds-checked
/// against that extent.
pub struct Heap {
    base: *mut u8,
    len: usize,
    logging: bool,
}

// A Heap is sendable - it is a view of memory owned by whoever owns the
// allocator, and is only ever touched through `&mut` access.
unsafe impl Send for Heap {}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

impl Heap {
    pub(crate) const fn new() -> Heap {
        Heap {
            base: null_mut(),
            len: 0,
            logging: true,
        }
    }

    /// The same heap, with logging from operations on it turned off.
    pub(crate) const fn silenced(self) -> Heap {
        Heap {
            logging: false,
            ..self
        }
    }

    /// Whether operations on this heap emit `log` records.
    pub fn logging(&self) -> bool {
        self.logging
    }

    /// Construct a heap view over `len` bytes starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be aligned to `ALIGNMENT` and point to `len` bytes that are
    /// valid for reads and writes for as long as the view is used.
    #[cfg(test)]
    pub(crate) unsafe fn from_raw_parts(base: *mut u8, len: usize) -> Heap {
        Heap {
            base,
            len,
            logging: true,
        }
    }

    /// Number of bytes granted by the backing store so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The address immediately past the last granted byte.
    pub(crate) fn end(&self) -> *mut u8 {
        self.base.wrapping_add(self.len)
    }

    /// Record `granted` more bytes, starting at `start`. The first call sets
    /// the base; later calls must continue exactly where the last one ended.
    pub(crate) fn extend(&mut self, start: *mut u8, granted: usize) {
        if self.base.is_null() {
            self.base = start;
        }
        debug_assert_eq!(start, self.end());
        self.len += granted;
    }

    fn word(&self, offset: usize) -> *mut u32 {
        assert!(
            offset % WORD_SIZE == 0 && offset + WORD_SIZE <= self.len,
            "word at {} is outside the heap of {} bytes",
            offset,
            self.len,
        );
        // The assertion above keeps this inside the granted region.
        unsafe { self.base.add(offset).cast() }
    }

    pub(crate) fn read_word(&self, offset: usize) -> u32 {
        unsafe { self.word(offset).read() }
    }

    pub(crate) fn write_word(&mut self, offset: usize, value: u32) {
        unsafe { self.word(offset).write(value) }
    }

    pub fn header(&self, block: Block) -> Tag {
        Tag(self.read_word(block.offset() - WORD_SIZE))
    }

    pub fn footer(&self, block: Block) -> Tag {
        let size = self.size_of(block);
        Tag(self.read_word(block.offset() + size - DOUBLE_WORD))
    }

    pub fn size_of(&self, block: Block) -> usize {
        self.header(block).size()
    }

    pub fn is_allocated(&self, block: Block) -> bool {
        self.header(block).is_allocated()
    }

    pub fn aux_bits(&self, block: Block) -> u32 {
        self.header(block).aux()
    }

    pub fn is_reserved(&self, block: Block) -> bool {
        self.aux_bits(block) & AUX_RESERVED != 0
    }

    /// Write the header and footer of `block` with the same tag.
    ///
    /// The footer position follows from the new `size`, so this is also how
    /// blocks are split and merged.
    pub fn mark(&mut self, block: Block, size: usize, aux: u32, allocated: bool) {
        debug_assert!(size % ALIGNMENT == 0, "unaligned block size {}", size);
        debug_assert!(size >= OVERHEAD, "block size {} too small for tags", size);
        let tag = Tag::pack(size, aux, allocated);
        self.write_word(block.offset() - WORD_SIZE, tag.0);
        self.write_word(block.offset() + size - DOUBLE_WORD, tag.0);
    }

    /// Replace the auxiliary bits of `block`, keeping size and state.
    pub(crate) fn set_aux(&mut self, block: Block, aux: u32) {
        let tag = self.header(block);
        self.mark(block, tag.size(), aux, tag.is_allocated());
    }

    /// The block physically following `block`.
    pub fn next_block(&self, block: Block) -> Block {
        Block::at(block.offset() + self.size_of(block))
    }

    /// The tag ending immediately before `block`: the previous block's footer.
    pub(crate) fn prev_footer(&self, block: Block) -> Tag {
        Tag(self.read_word(block.offset() - DOUBLE_WORD))
    }

    /// The block physically preceding `block`, found through its footer.
    pub fn prev_block(&self, block: Block) -> Block {
        Block::at(block.offset() - self.prev_footer(block).size())
    }

    /// The payload address of `block`.
    pub fn payload(&self, block: Block) -> *mut u8 {
        self.base.wrapping_add(block.offset())
    }

    /// Map a payload pointer back to its block, if it lies on a plausible
    /// payload boundary inside the heap.
    pub fn block_of(&self, ptr: *const u8) -> Option<Block> {
        let addr = ptr as usize;
        let base = self.base as usize;
        if self.base.is_null() || addr < base {
            return None;
        }
        self.block_at(addr - base)
    }

    /// Validate a raw offset as a block position: aligned, past the padding
    /// word, and with room for a header plus three link words.
    pub(crate) fn block_at(&self, offset: usize) -> Option<Block> {
        if offset < DOUBLE_WORD
            || offset % ALIGNMENT != 0
            || offset + 3 * WORD_SIZE > self.len
        {
            return None;
        }
        Block::new(offset)
    }

    /// View a free block's payload as link words.
    pub(crate) fn free(&self, block: Block) -> FreeRef<'_> {
        debug_assert!(!self.is_allocated(block), "{:?} is not free", block);
        FreeRef { heap: self, block }
    }

    /// Mutable view of a free block's payload as link words.
    pub(crate) fn free_mut(&mut self, block: Block) -> FreeMut<'_> {
        debug_assert!(!self.is_allocated(block), "{:?} is not free", block);
        FreeMut { heap: self, block }
    }
}

/// Read access to the link words overlaid on a free block's payload.
///
/// Only valid while the block is free; an allocated block's payload belongs to
/// the caller.
pub(crate) struct FreeRef<'h> {
    heap: &'h Heap,
    block: Block,
}

impl FreeRef<'_> {
    pub fn link(&self, slot: usize) -> Option<Block> {
        Block::decode(self.raw_link(slot))
    }

    /// The link word without interpretation, for checks that must not trust
    /// it.
    pub fn raw_link(&self, slot: usize) -> u32 {
        self.heap.read_word(self.block.offset() + slot * WORD_SIZE)
    }
}

pub(crate) struct FreeMut<'h> {
    heap: &'h mut Heap,
    block: Block,
}

impl FreeMut<'_> {
    pub fn set_link(&mut self, slot: usize, link: Option<Block>) {
        debug_assert!(
            (slot + 1) * WORD_SIZE + OVERHEAD <= self.heap.size_of(self.block),
            "link slot {} does not fit in {:?}",
            slot,
            self.block,
        );
        self.heap
            .write_word(self.block.offset() + slot * WORD_SIZE, Block::encode(link));
    }
}

/// A scratch heap of hand-marked blocks, for exercising indexes directly.
#[cfg(test)]
pub(crate) mod scratch {
    use super::*;
    use std::boxed::Box;
    use std::vec::Vec;

    #[repr(C, align(16))]
    struct Arena([u8; 64 * 1024]);

    pub struct Scratch {
        _arena: Box<Arena>,
        pub heap: Heap,
        pub blocks: Vec<Block>,
    }

    /// Lay out free blocks of the given sizes back to back. They are marked
    /// free but not linked into anything.
    pub fn heap_with(sizes: &[usize]) -> Scratch {
        let mut arena = Box::new(Arena([0; 64 * 1024]));
        let len = arena.0.len();
        let mut heap = unsafe { Heap::from_raw_parts(arena.0.as_mut_ptr(), len) };
        let mut blocks = Vec::new();
        let mut offset = 2 * DOUBLE_WORD;
        for &size in sizes {
            let block = Block::at(offset);
            heap.mark(block, size, 0, false);
            blocks.push(block);
            offset += size;
        }
        assert!(offset <= len, "scratch arena too small");

        Scratch {
            _arena: arena,
            heap,
            blocks,
        }
    }
}
