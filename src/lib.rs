#![no_std]

//! A boundary-tag heap allocator with pluggable free-block indexes.
//!
//! Every block in the heap carries its size and state in a header and a
//! footer, so physical neighbors are found by arithmetic and freed blocks are
//! merged with free neighbors immediately. Free blocks are tracked by a
//! [`FreeIndex`], chosen by type when the allocator is built:
//!
//! - [`RedBlackTree`]: best fit, links threaded through the free blocks.
//! - [`SegregatedList`]: first fit over power-of-two size classes.
//! - [`BPlusTree`]: best fit, with nodes kept out of line.
//!
//! ```
//! use boundary_alloc::{RawAlloc, RedBlackTree, ToyHeap};
//!
//! let mut heap = Box::new(RawAlloc::new(ToyHeap::default(), RedBlackTree::new()));
//! let p = heap.allocate(100);
//! assert!(!p.is_null());
//! let p = unsafe { heap.reallocate(p, 400) };
//! unsafe { heap.release(p) };
//! assert_eq!(heap.check().unwrap().allocated_blocks, 0);
//! ```

extern crate alloc;
#[cfg(test)]
extern crate std;

// Log through `log` unless the heap has been silenced. A heap behind a
// `LockedHeap` is silenced: a logger that allocates would wait on the lock
// that is logging.
macro_rules! heap_log {
    ($heap:expr, $level:ident, $($arg:tt)+) => {
        if $heap.logging() {
            log::$level!($($arg)+)
        }
    };
}

pub mod allocators;
pub mod check;
pub mod config;
pub mod grower;
pub mod index;
pub mod layout;
mod realloc;

#[cfg(feature = "use_libc")]
pub use crate::allocators::UnixAllocator;
pub use crate::allocators::{Counters, HeapError, LockedHeap, RawAlloc, MAX_HEAP_SIZE};
pub use crate::check::{Corruption, Stats};
pub use crate::config::Config;
#[cfg(feature = "use_libc")]
pub use crate::grower::SbrkHeapGrower;
pub use crate::grower::{HeapGrower, ToyHeap, ToyHeapOverflowError};
pub use crate::index::{BPlusTree, FreeIndex, ListOrder, RedBlackTree, Reserved, SegregatedList};
