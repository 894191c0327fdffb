//! Allocator tuning knobs.

use crate::layout::ALIGNMENT;

pub const DEFAULT_CHUNK_SIZE: usize = 4096;

const fn align_up(value: usize) -> usize {
    value.saturating_add(ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Settings fixed when an allocator is constructed.
///
/// ```
/// use boundary_alloc::Config;
///
/// let config = Config::new().with_chunk_size(1 << 16).with_realloc_slack(64);
/// assert_eq!(config.chunk_size(), 65536);
/// assert!(config.reserve_after_realloc());
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    chunk_size: usize,
    realloc_slack: usize,
    reserve_after_realloc: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

impl Config {
    pub const fn new() -> Self {
        Config {
            chunk_size: DEFAULT_CHUNK_SIZE,
            realloc_slack: 0,
            reserve_after_realloc: true,
        }
    }

    /// Smallest number of bytes requested from the backing store at a time.
    /// Rounded up to the alignment unit.
    pub const fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = align_up(bytes);
        self
    }

    /// Extra bytes added to a block that grows through reallocation, so that
    /// small follow-up growth fits without another resize. Rounded up to the
    /// alignment unit.
    pub const fn with_realloc_slack(mut self, bytes: usize) -> Self {
        self.realloc_slack = align_up(bytes);
        self
    }

    /// Whether a block that grows through reallocation reserves the free
    /// block after it against ordinary allocation.
    pub const fn with_reserve_after_realloc(mut self, reserve: bool) -> Self {
        self.reserve_after_realloc = reserve;
        self
    }

    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub const fn realloc_slack(&self) -> usize {
        self.realloc_slack
    }

    pub const fn reserve_after_realloc(&self) -> bool {
        self.reserve_after_realloc
    }
}
