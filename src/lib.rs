#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]

extern crate alloc;

use cfg_if::cfg_if;

mod bitmap;
mod cached;
mod chain;
mod config;
mod error;
mod heap;
mod inspect;
mod pagemap;
mod span;

pub use config::Config;
pub use error::Error;
pub use heap::{Heap, HeapState, HeapSummary, InuseBlocks};
pub use inspect::{ArrayBounds, Inspector, Memory, SegmentRegistry, Symbols};
pub use span::{Span, SpanLocation};

cfg_if! {
    if #[cfg(feature = "snapshot")] {
        pub mod snapshot;
    }
}

/// An address in the inspected process.
pub type Address = u64;

/// The maximum number of nodes followed in a single central-cache transfer
/// slot before the heap is declared corrupt.
pub const MAX_CHAIN_NODES: usize = 1024;

/// The maximum number of nodes followed in a single thread-cache free list,
/// however long its recorded length claims it is. Reaching it is fatal.
pub const MAX_THREAD_LIST_NODES: usize = 8192;

/// The initial capacity of the span table and the cached-block index. Both
/// double when full.
pub const INITIAL_TABLE_CAPACITY: usize = 1024;

/// A heap block: either an object handed out by the allocator, or a free
/// chunk of memory it still owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeapBlock {
    /// The block's start address.
    pub addr: Address,
    /// The block's size in bytes.
    pub size: u64,
    /// Whether the block is currently allocated.
    pub inuse: bool,
}

/// An allocated heap block, as enumerated by [`Heap::walk_inuse_blocks`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct InuseBlock {
    /// The block's start address.
    pub addr: Address,
    /// The block's size in bytes.
    pub size: u64,
}

impl From<InuseBlock> for HeapBlock {
    #[inline]
    fn from(block: InuseBlock) -> Self {
        HeapBlock {
            addr: block.addr,
            size: block.size,
            inuse: true,
        }
    }
}
