//! Segregated free lists.
//!
//! Bucket `i` holds free blocks with sizes in `[2^i, 2^(i+1))`, and the last
//! bucket catches everything larger. Each bucket is a doubly linked list
//! threaded through the free blocks' payloads, kept either in ascending
//! address order or in insertion order.

use crate::check::Corruption;
use crate::index::{FreeIndex, Reserved};
use crate::layout::{Block, Heap, ALIGNMENT, OVERHEAD, WORD_SIZE};

/// Number of size classes. The last one starts at 2^19 bytes.
pub const BUCKET_COUNT: usize = 20;

const PREV: usize = 0;
const NEXT: usize = 1;

/// How blocks are ordered within a bucket.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ListOrder {
    /// Ascending heap address: first fit then prefers low addresses, which
    /// keeps reuse near the start of the heap.
    Address,
    /// Most recently freed first. Inserting is constant time.
    Unordered,
}

pub struct SegregatedList {
    order: ListOrder,
    buckets: [Option<Block>; BUCKET_COUNT],
    len: usize,
}

impl Default for SegregatedList {
    fn default() -> Self {
        SegregatedList::new(ListOrder::Address)
    }
}

/// The size class for `size`, found by shifting until it fits.
pub fn bucket_of(size: usize) -> usize {
    let mut bucket = 0;
    let mut rest = size;
    while rest > 1 && bucket < BUCKET_COUNT - 1 {
        rest >>= 1;
        bucket += 1;
    }
    bucket
}

fn prev(heap: &Heap, block: Block) -> Option<Block> {
    heap.free(block).link(PREV)
}

fn next(heap: &Heap, block: Block) -> Option<Block> {
    heap.free(block).link(NEXT)
}

fn set_prev(heap: &mut Heap, block: Block, link: Option<Block>) {
    heap.free_mut(block).set_link(PREV, link)
}

fn set_next(heap: &mut Heap, block: Block, link: Option<Block>) {
    heap.free_mut(block).set_link(NEXT, link)
}

impl SegregatedList {
    pub const fn new(order: ListOrder) -> Self {
        SegregatedList {
            order,
            buckets: [None; BUCKET_COUNT],
            len: 0,
        }
    }

    pub fn order(&self) -> ListOrder {
        self.order
    }

    /// Iterate over one bucket's blocks in list order.
    pub fn bucket<'a>(&self, heap: &'a Heap, bucket: usize) -> BucketIter<'a> {
        BucketIter {
            heap,
            next: self.buckets[bucket],
        }
    }

    /// Link `block` between `predecessor` and `successor`; either may be
    /// `None` at the ends of the bucket.
    fn link_before(
        &mut self,
        heap: &mut Heap,
        bucket: usize,
        block: Block,
        predecessor: Option<Block>,
        successor: Option<Block>,
    ) {
        set_prev(heap, block, predecessor);
        set_next(heap, block, successor);
        match predecessor {
            None => self.buckets[bucket] = Some(block),
            Some(p) => set_next(heap, p, Some(block)),
        }
        if let Some(s) = successor {
            set_prev(heap, s, Some(block));
        }
    }
}

pub struct BucketIter<'a> {
    heap: &'a Heap,
    next: Option<Block>,
}

impl Iterator for BucketIter<'_> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let block = self.next.take()?;
        self.next = next(self.heap, block);
        Some(block)
    }
}

impl FreeIndex for SegregatedList {
    // Header, two links, footer.
    const MIN_BLOCK_SIZE: usize = (OVERHEAD + 2 * WORD_SIZE + ALIGNMENT - 1) & !(ALIGNMENT - 1);

    fn insert(&mut self, heap: &mut Heap, block: Block) {
        let bucket = bucket_of(heap.size_of(block));

        let (predecessor, successor) = match self.order {
            ListOrder::Unordered => (None, self.buckets[bucket]),
            ListOrder::Address => {
                let mut predecessor = None;
                let mut cursor = self.buckets[bucket];
                while let Some(node) = cursor {
                    if node > block {
                        break;
                    }
                    predecessor = Some(node);
                    cursor = next(heap, node);
                }
                (predecessor, cursor)
            }
        };

        self.link_before(heap, bucket, block, predecessor, successor);
        self.len += 1;
        heap_log!(heap, trace, "list insert {:?} into bucket {}", block, bucket);
    }

    fn remove(&mut self, heap: &mut Heap, block: Block) {
        let (p, n) = (prev(heap, block), next(heap, block));
        if let Some(n) = n {
            set_prev(heap, n, p);
        }
        match p {
            Some(p) => set_next(heap, p, n),
            None => {
                let bucket = bucket_of(heap.size_of(block));
                debug_assert_eq!(self.buckets[bucket], Some(block));
                self.buckets[bucket] = n;
            }
        }
        self.len -= 1;
        heap_log!(heap, trace, "list remove {:?}", block);
    }

    fn find_at_least(&self, heap: &Heap, size: usize, reserved: Reserved) -> Option<Block> {
        (bucket_of(size)..BUCKET_COUNT).find_map(|bucket| {
            self.bucket(heap, bucket)
                .find(|&b| heap.size_of(b) >= size && reserved.admits(heap, b))
        })
    }

    fn len(&self) -> usize {
        self.len
    }

    fn clear(&mut self) {
        self.buckets = [None; BUCKET_COUNT];
        self.len = 0;
    }

    fn contains(&self, heap: &Heap, block: Block) -> bool {
        let bucket = bucket_of(heap.size_of(block));
        self.bucket(heap, bucket).take(self.len).any(|b| b == block)
    }

    fn check(
        &self,
        heap: &Heap,
        visit: &mut dyn FnMut(Block) -> Result<(), Corruption>,
    ) -> Result<usize, Corruption> {
        let mut count = 0;
        for (bucket, &head) in self.buckets.iter().enumerate() {
            let mut previous: Option<Block> = None;
            let mut cursor = head;
            while let Some(block) = cursor {
                if count >= self.len {
                    return Err(Corruption::index(Some(block), "list is longer than its length"));
                }
                if heap.block_at(block.offset()).is_none() {
                    return Err(Corruption::index(Some(block), "link points outside the heap"));
                }
                visit(block)?;
                count += 1;

                if prev(heap, block) != previous {
                    return Err(Corruption::index(Some(block), "back link disagrees"));
                }
                if bucket_of(heap.size_of(block)) != bucket {
                    return Err(Corruption::index(Some(block), "block in the wrong size class"));
                }
                if self.order == ListOrder::Address && previous.map_or(false, |p| p >= block) {
                    return Err(Corruption::index(Some(block), "list out of address order"));
                }

                previous = Some(block);
                cursor = next(heap, block);
            }
        }

        if count != self.len {
            return Err(Corruption::index(None, "block count disagrees with length"));
        }
        Ok(count)
    }
}
