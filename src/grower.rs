//! Backing stores that hand the allocator contiguous memory.
//!
//! ### [`HeapGrower`]
//!
//! `HeapGrower` abstracts over the call that extends the heap. Every region it
//! returns must start exactly where the previous one ended, since the
//! allocator treats the whole heap as one span of blocks.
//!
//! ### [`ToyHeap`]
//!
//! `ToyHeap` is a fixed array that pretends to be a heap. It is mainly useful
//! for testing.
//!
//! ### `SbrkHeapGrower`
//!
//! With the `use_libc` feature, `SbrkHeapGrower` moves the program break with
//! `sbrk`, which grows contiguously by construction.

use core::fmt;

#[cfg(feature = "use_libc")]
use errno::Errno;

#[cfg(feature = "use_libc")]
use crate::layout::ALIGNMENT;

// Round value up to the nearest multiple of increment, or None on overflow.
pub(crate) fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    ((value - 1) / increment + 1).checked_mul(increment)
}

pub trait HeapGrower {
    type Err: fmt::Debug;

    /// Grow the heap by at least `size` bytes. Returns a pointer to the new
    /// memory and the number of bytes available there.
    ///
    /// # Safety
    ///
    /// For this to work with [`RawAlloc`](crate::RawAlloc):
    ///
    /// - On success the returned region must be at least `size` bytes, valid
    ///   for reads and writes, and untracked by any other Rust code, including
    ///   the allocator itself.
    /// - After the first call, every region must begin at the end of the
    ///   previous one. The allocator rejects regions that do not.
    unsafe fn grow_heap(&mut self, size: usize) -> Result<(*mut u8, usize), Self::Err>;
}

pub const TOY_HEAP_SIZE: usize = 256 * 1024;

/// A heap carved out of an inline array.
///
/// The allocator keeps pointers into the array once the heap is initialised,
/// so a `ToyHeap` must not be moved after its first growth. Keep the owning
/// allocator boxed or in a static.
#[repr(C, align(16))]
pub struct ToyHeap {
    heap: [u8; TOY_HEAP_SIZE],
    pub page_size: usize,
    /// Bytes handed out so far.
    pub size: usize,
    limit: usize,
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap::new()
    }
}

impl ToyHeap {
    /// An empty toy heap. Being `const`, it can be built directly in a
    /// `static` rather than on the stack.
    pub const fn new() -> Self {
        ToyHeap {
            heap: [0; TOY_HEAP_SIZE],
            page_size: 64,
            size: 0,
            limit: TOY_HEAP_SIZE,
        }
    }

    /// A toy heap that refuses to grow past `limit` bytes.
    pub const fn with_limit(limit: usize) -> Self {
        let mut toy = ToyHeap::new();
        toy.limit = if limit < TOY_HEAP_SIZE {
            limit
        } else {
            TOY_HEAP_SIZE
        };
        toy
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ToyHeapOverflowError {
    pub requested: usize,
    pub available: usize,
}

impl HeapGrower for ToyHeap {
    type Err = ToyHeapOverflowError;

    unsafe fn grow_heap(&mut self, size: usize) -> Result<(*mut u8, usize), Self::Err> {
        let overflow = ToyHeapOverflowError {
            requested: size,
            available: self.limit - self.size,
        };
        let allocating = round_up(size, self.page_size).ok_or(overflow)?;
        if allocating > self.limit - self.size {
            return Err(overflow);
        }

        let ptr = self.heap.as_mut_ptr().add(self.size);
        self.size += allocating;
        Ok((ptr, allocating))
    }
}

/// Grows the heap by moving the program break.
///
/// Nothing else in the process may move the break while this grower is in
/// use, or the next region will not be contiguous with the heap.
#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct SbrkHeapGrower {
    // Just for tracking
    growths: usize,
    bytes: usize,
}

#[cfg(feature = "use_libc")]
impl SbrkHeapGrower {
    pub const fn new() -> Self {
        SbrkHeapGrower {
            growths: 0,
            bytes: 0,
        }
    }

    pub fn growths(&self) -> usize {
        self.growths
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

#[cfg(feature = "use_libc")]
fn sbrk(increment: usize) -> Result<*mut u8, Errno> {
    if increment > isize::MAX as usize {
        return Err(Errno(libc::ENOMEM));
    }
    let ptr = unsafe { libc::sbrk(increment as _) };
    // sbrk signals failure with (void *) -1.
    if ptr as isize == -1 {
        return Err(errno::errno());
    }
    Ok(ptr as *mut u8)
}

#[cfg(feature = "use_libc")]
impl HeapGrower for SbrkHeapGrower {
    type Err = Errno;

    unsafe fn grow_heap(&mut self, size: usize) -> Result<(*mut u8, usize), Self::Err> {
        if self.growths == 0 {
            // Move the break onto the alignment unit before the heap starts.
            let start = sbrk(0)? as usize;
            let pad = (ALIGNMENT - start % ALIGNMENT) % ALIGNMENT;
            if pad > 0 {
                sbrk(pad)?;
            }
        }

        let ptr = sbrk(size)?;
        self.growths += 1;
        self.bytes += size;
        Ok((ptr, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::boxed::Box;
    use test_log::test;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 8), Some(0));
        assert_eq!(round_up(1, 8), Some(8));
        assert_eq!(round_up(8, 8), Some(8));
        assert_eq!(round_up(4112, 64), Some(4160));
        assert_eq!(round_up(usize::MAX, 8), None);
    }

    #[test]
    fn test_toy_heap_grows_contiguously() {
        let mut toy = Box::new(ToyHeap::default());
        let (a, a_len) = unsafe { toy.grow_heap(100).unwrap() };
        let (b, b_len) = unsafe { toy.grow_heap(64).unwrap() };
        assert_eq!(a as usize % 16, 0);
        assert_eq!(a_len, 128);
        assert_eq!(b_len, 64);
        assert_eq!(b, a.wrapping_add(a_len));
        assert_eq!(toy.size, 192);
    }

    #[test]
    fn test_toy_heap_limit() {
        let mut toy = Box::new(ToyHeap::with_limit(256));
        assert_eq!(toy.limit(), 256);
        unsafe { toy.grow_heap(200).unwrap() };
        let err = unsafe { toy.grow_heap(64).unwrap_err() };
        assert_eq!(
            err,
            ToyHeapOverflowError {
                requested: 64,
                available: 0
            }
        );
        assert_eq!(toy.size, 256);
    }
}
