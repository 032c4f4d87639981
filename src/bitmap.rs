//! Per-span free bitmaps.

use alloc::vec::Vec;

use crate::cached::CachedBlocks;
use crate::chain::{Chain, Stop};
use crate::span::Span;
use crate::{Config, Memory};

/// One bit per block of a span; a set bit means the block is free.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct FreeBitmap {
    words: Vec<u64>,
    len: usize,
    block_size: u64,
}

impl FreeBitmap {
    /// A bitmap of `len` blocks of `block_size` bytes, all in use, or `None`
    /// if it cannot be allocated.
    fn new(len: usize, block_size: u64) -> Option<Self> {
        let mut words = Vec::new();
        words.try_reserve_exact(len.div_ceil(64)).ok()?;
        words.resize(len.div_ceil(64), 0);
        Some(FreeBitmap {
            words,
            len,
            block_size,
        })
    }

    /// Compute the bitmap of `span`, which must be in use and carved into
    /// blocks of `block_size` bytes.
    ///
    /// A block is free when it is on the span's free-object list or in one of
    /// the caches. Problems with the object list are logged and end its walk
    /// early; whatever was found up to that point still counts.
    ///
    /// Returns `None` when the bitmap is too big to allocate, which only a
    /// corrupt span length can cause; the span is then treated as one block.
    pub(crate) fn populate<M>(
        span: &Span,
        block_size: u64,
        config: &Config,
        cached: &CachedBlocks,
        memory: &M,
    ) -> Option<Self>
    where
        M: Memory + ?Sized,
    {
        debug_assert!(span.is_in_use());
        debug_assert_ne!(block_size, 0);

        let range = span.byte_range(config);
        let count = range.end.saturating_sub(range.start) / block_size;
        let len = usize::try_from(count).unwrap_or(usize::MAX);
        let Some(mut bitmap) = FreeBitmap::new(len, block_size) else {
            log::warn!(
                "Heap corruption: cannot allocate a bitmap of {count} blocks for span at page {:#x}",
                span.start_page()
            );
            return None;
        };
        let base = range.start;
        let end = base + count * block_size;

        // A healthy list has at most one node per block, so the limit turns a
        // cycle into a diagnostic.
        let mut objects = Chain::new(memory, span.objects(), bitmap.len);
        for node in objects.by_ref() {
            if node < base || node >= end {
                log::warn!("Heap corruption: objects list node {node:#x} is out of span's range");
                break;
            }
            let offset = node - base;
            if offset % block_size != 0 {
                log::warn!("Heap corruption: invalid free {node:#x}");
                break;
            }
            bitmap.set_free((offset / block_size) as usize);
        }
        match objects.stop() {
            Some(Stop::Limit) => log::warn!(
                "Heap corruption: objects list of span at page {:#x} has more than {} nodes",
                span.start_page(),
                bitmap.len
            ),
            Some(Stop::Unreadable(node)) => {
                log::warn!("Heap corruption: cannot read the objects list link of {node:#x}")
            }
            _ => {}
        }

        for addr in cached.in_range(base..end) {
            bitmap.set_free(((addr - base) / block_size) as usize);
        }

        Some(bitmap)
    }

    /// The number of blocks.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// The size of each block.
    #[inline]
    pub(crate) fn block_size(&self) -> u64 {
        self.block_size
    }

    #[inline]
    fn set_free(&mut self, index: usize) {
        debug_assert!(index < self.len);
        self.words[index / 64] |= 1 << (index % 64);
    }

    /// Whether block `index` is free. Blocks past the end are never free.
    #[inline]
    pub(crate) fn is_free(&self, index: usize) -> bool {
        index < self.len && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    /// The number of free blocks.
    pub(crate) fn free_count(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }
}
