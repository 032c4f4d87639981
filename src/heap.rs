//! The reconstructed heap and the queries it answers.

use alloc::collections::BinaryHeap;
use alloc::vec::Vec;
use core::cmp::Reverse;

use crate::bitmap::FreeBitmap;
use crate::cached::CachedBlocks;
use crate::inspect::{Inspector, Memory, SegmentRegistry, Symbols};
use crate::span::{Span, SpanLocation, SpanTable};
use crate::{pagemap, Address, Config, Error, HeapBlock, InuseBlock};

/// The tables rebuilt from a tcmalloc heap image.
///
/// Free bitmaps are computed per span on first use, which needs read access
/// to the inspected memory; that is why most queries take a `memory`
/// argument. Passing different memory than the state was built from gives
/// meaningless answers.
///
/// Bitmaps are cached in a `OnceCell`, so this type is `!Sync`.
#[derive(Debug)]
pub struct HeapState {
    config: Config,
    spans: SpanTable,
    cached: CachedBlocks,
}

impl HeapState {
    /// Walk the allocator's structures and build every table.
    ///
    /// Every discovered span's memory is reported to `segments`. Any error
    /// aborts the build; nothing partial is returned.
    pub fn build<I, S>(inspector: &I, symbols: &Symbols, segments: &mut S) -> Result<Self, Error>
    where
        I: Inspector + ?Sized,
        S: SegmentRegistry + ?Sized,
    {
        let config = Config::parse(inspector, symbols)?;
        let spans = pagemap::parse_spans(inspector, symbols, &config, segments)?;
        let cached = CachedBlocks::parse(inspector, symbols, &config)?;

        cached.verify()?;
        spans.verify(&config)?;

        log::debug!("tcmalloc heap is initialized successfully");
        Ok(HeapState {
            config,
            spans,
            cached,
        })
    }

    /// The allocator configuration.
    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Every span, sorted by start page.
    #[inline]
    pub fn spans(&self) -> &[Span] {
        self.spans.spans()
    }

    /// The span whose pages contain `addr`.
    #[inline]
    pub fn span_at(&self, addr: Address) -> Option<&Span> {
        self.spans.span_at(&self.config, addr)
    }

    /// The number of blocks sitting in thread caches and central transfer
    /// slots.
    #[inline]
    pub fn cached_block_count(&self) -> usize {
        self.cached.len()
    }

    /// Whether `addr` is exactly the start of a cached free block.
    #[inline]
    pub fn is_cached(&self, addr: Address) -> bool {
        self.cached.contains(addr)
    }

    pub(crate) fn free_bitmap<'a, M>(
        &'a self,
        memory: &M,
        span: &'a Span,
    ) -> Option<&'a FreeBitmap>
    where
        M: Memory + ?Sized,
    {
        span.free_bitmap(&self.config, &self.cached, memory)
    }

    /// The block at position `index` within `span`.
    ///
    /// A span that is not carved into blocks is one block, at index 0.
    fn block<M>(&self, memory: &M, span: &Span, index: usize) -> Option<HeapBlock>
    where
        M: Memory + ?Sized,
    {
        let range = span.byte_range(&self.config);
        match self.free_bitmap(memory, span) {
            Some(bitmap) => (index < bitmap.len()).then(|| HeapBlock {
                addr: range.start + index as u64 * bitmap.block_size(),
                size: bitmap.block_size(),
                inuse: !bitmap.is_free(index),
            }),
            None => (index == 0).then(|| HeapBlock {
                addr: range.start,
                size: range.end.saturating_sub(range.start),
                inuse: span.is_in_use(),
            }),
        }
    }

    /// The index of the block containing `addr` within `span`, or `None` for
    /// tail slack past the last whole block.
    fn block_index<M>(&self, memory: &M, span: &Span, addr: Address) -> Option<usize>
    where
        M: Memory + ?Sized,
    {
        let Some(bitmap) = self.free_bitmap(memory, span) else {
            return Some(0);
        };
        let offset = addr - self.config.page_addr(span.start_page());
        let index = usize::try_from(offset / bitmap.block_size()).ok()?;
        (index < bitmap.len()).then_some(index)
    }

    /// The block containing `addr`, whether allocated or free.
    ///
    /// Returns `None` if no span covers `addr`, or if `addr` falls in the
    /// unused tail of a span carved into blocks.
    pub fn heap_block_info<M>(&self, memory: &M, addr: Address) -> Option<HeapBlock>
    where
        M: Memory + ?Sized,
    {
        let span = self.span_at(addr)?;
        let index = self.block_index(memory, span, addr)?;
        self.block(memory, span, index)
    }

    /// The block following the one containing `addr`, or the very first
    /// block of the heap when `addr` is 0.
    ///
    /// Spans carved into zero blocks have nothing to return and are passed
    /// over.
    pub fn next_heap_block<M>(&self, memory: &M, addr: Address) -> Option<HeapBlock>
    where
        M: Memory + ?Sized,
    {
        let mut next = if addr == 0 {
            if self.spans().is_empty() {
                log::debug!("There is no heap block");
                return None;
            }
            Some(0)
        } else {
            let Some(position) = self.spans.position(self.config.page_of(addr)) else {
                log::debug!("The input address {addr:#x} doesn't belong to the heap");
                return None;
            };
            let span = &self.spans()[position];
            if let Some(index) = self.block_index(memory, span, addr) {
                if let Some(block) = self.block(memory, span, index + 1) {
                    return Some(block);
                }
            }
            self.spans.successor(position)
        };

        while let Some(position) = next {
            if let Some(block) = self.block(memory, &self.spans()[position], 0) {
                return Some(block);
            }
            next = self.spans.successor(position);
        }
        None
    }

    /// Whether some span covers `addr`.
    #[inline]
    pub fn is_heap_block(&self, addr: Address) -> bool {
        self.span_at(addr).is_some()
    }

    /// Iterate over every allocated block in ascending address order.
    pub fn inuse_blocks<'a, M>(&'a self, memory: &'a M) -> InuseBlocks<'a, M>
    where
        M: Memory + ?Sized,
    {
        InuseBlocks {
            state: self,
            memory,
            span: 0,
            block: 0,
        }
    }

    /// Count the allocated blocks, and copy as many of them as fit into
    /// `out`.
    ///
    /// The return value is always the total count, so a caller can first
    /// pass `None` to size a buffer and then pass the buffer.
    pub fn walk_inuse_blocks<M>(&self, memory: &M, out: Option<&mut [InuseBlock]>) -> usize
    where
        M: Memory + ?Sized,
    {
        let mut out = out.unwrap_or_default().iter_mut();
        let mut count = 0;
        for block in self.inuse_blocks(memory) {
            if let Some(slot) = out.next() {
                *slot = block;
            }
            count += 1;
        }
        count
    }

    /// The `n` largest allocated blocks, largest first. Blocks of equal size
    /// are ordered by address.
    pub fn biggest_inuse_blocks<M>(&self, memory: &M, n: usize) -> Vec<InuseBlock>
    where
        M: Memory + ?Sized,
    {
        if n == 0 {
            return Vec::new();
        }

        // Min-heap of the best `n` so far; the root is the first to go.
        let mut best = BinaryHeap::with_capacity(n + 1);
        for block in self.inuse_blocks(memory) {
            best.push(Reverse((block.size, Reverse(block.addr))));
            if best.len() > n {
                best.pop();
            }
        }

        best.into_sorted_vec()
            .into_iter()
            .map(|Reverse((size, Reverse(addr)))| InuseBlock { addr, size })
            .collect()
    }

    /// Tally spans and blocks across the whole heap.
    pub fn summary<M>(&self, memory: &M) -> HeapSummary
    where
        M: Memory + ?Sized,
    {
        let mut summary = HeapSummary {
            cached_blocks: self.cached.len(),
            ..HeapSummary::default()
        };

        for span in self.spans() {
            summary.spans += 1;
            match span.location() {
                SpanLocation::InUse => summary.inuse_spans += 1,
                SpanLocation::NormalFreelist => summary.free_spans += 1,
                SpanLocation::ReturnedFreelist => summary.returned_spans += 1,
                SpanLocation::Unknown(raw) => {
                    log::warn!(
                        "Heap corruption: span at page {:#x} has unknown location {raw}",
                        span.start_page()
                    );
                    summary.unknown_spans += 1;
                }
            }

            match self.free_bitmap(memory, span) {
                Some(bitmap) => {
                    let free = bitmap.free_count();
                    let inuse = bitmap.len() - free;
                    summary.inuse_blocks += inuse;
                    summary.inuse_bytes += inuse as u64 * bitmap.block_size();
                    summary.free_blocks += free;
                    summary.free_bytes += free as u64 * bitmap.block_size();
                }
                None => {
                    let bytes = self.config.pages_to_bytes(span.num_pages());
                    if span.is_in_use() {
                        summary.inuse_blocks += 1;
                        summary.inuse_bytes += bytes;
                    } else {
                        summary.free_blocks += 1;
                        summary.free_bytes += bytes;
                    }
                }
            }
        }
        summary
    }
}

/// An iterator over allocated blocks, created by
/// [`HeapState::inuse_blocks`] and [`Heap::inuse_blocks`].
pub struct InuseBlocks<'a, M>
where
    M: Memory + ?Sized,
{
    state: &'a HeapState,
    memory: &'a M,
    span: usize,
    block: usize,
}

impl<M> InuseBlocks<'_, M>
where
    M: Memory + ?Sized,
{
    fn next_span(&mut self) {
        self.span += 1;
        self.block = 0;
    }
}

impl<M> Iterator for InuseBlocks<'_, M>
where
    M: Memory + ?Sized,
{
    type Item = InuseBlock;

    fn next(&mut self) -> Option<InuseBlock> {
        loop {
            let state = self.state;
            let span = state.spans().get(self.span)?;
            if !span.is_in_use() {
                self.next_span();
                continue;
            }

            let Some(bitmap) = state.free_bitmap(self.memory, span) else {
                let range = span.byte_range(&state.config);
                self.next_span();
                return Some(InuseBlock {
                    addr: range.start,
                    size: range.end.saturating_sub(range.start),
                });
            };

            while self.block < bitmap.len() {
                let index = self.block;
                self.block += 1;
                if !bitmap.is_free(index) {
                    return Some(InuseBlock {
                        addr: state.config.page_addr(span.start_page())
                            + index as u64 * bitmap.block_size(),
                        size: bitmap.block_size(),
                    });
                }
            }
            self.next_span();
        }
    }
}

/// Totals over the whole heap, as computed by [`HeapState::summary`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapSummary {
    /// Number of spans.
    pub spans: usize,
    /// Spans handed out by the page heap.
    pub inuse_spans: usize,
    /// Spans on the page heap's normal free lists.
    pub free_spans: usize,
    /// Spans on the page heap's returned free lists.
    pub returned_spans: usize,
    /// Spans with a corrupt location.
    pub unknown_spans: usize,
    /// Allocated blocks.
    pub inuse_blocks: usize,
    /// Bytes in allocated blocks.
    pub inuse_bytes: u64,
    /// Free blocks, counting each free span as one block.
    pub free_blocks: usize,
    /// Bytes in free blocks.
    pub free_bytes: u64,
    /// Free blocks parked in thread caches and central transfer slots.
    pub cached_blocks: usize,
}

/// A tcmalloc heap inspected through `I`.
///
/// A `Heap` starts out uninitialized; every query fails with
/// [`Error::NotInitialized`] until [`Heap::init`] succeeds.
///
/// ```
/// use tcmalloc_inspect::{snapshot::TcmallocImage, Error, Heap};
///
/// let mut heap = Heap::new(TcmallocImage::new(12, [0, 16]).build());
/// assert_eq!(heap.is_heap_block(0x1000), Err(Error::NotInitialized));
///
/// heap.init(&mut ()).unwrap();
/// assert_eq!(heap.is_heap_block(0x1000), Ok(false));
/// ```
#[derive(Debug)]
pub struct Heap<I>
where
    I: Inspector,
{
    inspector: I,
    symbols: Symbols,
    state: Option<HeapState>,
}

impl<I> Heap<I>
where
    I: Inspector,
{
    /// Inspect a heap built with the gperftools symbol names.
    #[inline]
    pub fn new(inspector: I) -> Self {
        Self::with_symbols(inspector, Symbols::default())
    }

    /// Inspect a heap whose allocator globals and types go by `symbols`.
    #[inline]
    pub fn with_symbols(inspector: I, symbols: Symbols) -> Self {
        Heap {
            inspector,
            symbols,
            state: None,
        }
    }

    /// (Re)build every table from the inspected process.
    ///
    /// On failure the heap is left uninitialized, even if a previous `init`
    /// had succeeded.
    pub fn init<S>(&mut self, segments: &mut S) -> Result<(), Error>
    where
        S: SegmentRegistry + ?Sized,
    {
        self.state = None;
        self.state = Some(HeapState::build(&self.inspector, &self.symbols, segments)?);
        Ok(())
    }

    /// Whether the last `init` succeeded.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state.is_some()
    }

    /// The rebuilt tables.
    #[inline]
    pub fn state(&self) -> Result<&HeapState, Error> {
        self.state.as_ref().ok_or(Error::NotInitialized)
    }

    /// The inspector this heap reads through.
    #[inline]
    pub fn inspector(&self) -> &I {
        &self.inspector
    }

    /// Give back the inspector, dropping every table.
    #[inline]
    pub fn into_inspector(self) -> I {
        self.inspector
    }

    /// See [`HeapState::heap_block_info`].
    pub fn heap_block_info(&self, addr: Address) -> Result<Option<HeapBlock>, Error> {
        Ok(self.state()?.heap_block_info(&self.inspector, addr))
    }

    /// See [`HeapState::next_heap_block`].
    pub fn next_heap_block(&self, addr: Address) -> Result<Option<HeapBlock>, Error> {
        Ok(self.state()?.next_heap_block(&self.inspector, addr))
    }

    /// See [`HeapState::is_heap_block`].
    pub fn is_heap_block(&self, addr: Address) -> Result<bool, Error> {
        Ok(self.state()?.is_heap_block(addr))
    }

    /// See [`HeapState::inuse_blocks`].
    pub fn inuse_blocks(&self) -> Result<InuseBlocks<'_, I>, Error> {
        Ok(self.state()?.inuse_blocks(&self.inspector))
    }

    /// See [`HeapState::walk_inuse_blocks`].
    pub fn walk_inuse_blocks(&self, out: Option<&mut [InuseBlock]>) -> Result<usize, Error> {
        Ok(self.state()?.walk_inuse_blocks(&self.inspector, out))
    }

    /// See [`HeapState::biggest_inuse_blocks`].
    pub fn biggest_inuse_blocks(&self, n: usize) -> Result<Vec<InuseBlock>, Error> {
        Ok(self.state()?.biggest_inuse_blocks(&self.inspector, n))
    }

    /// See [`HeapState::summary`].
    pub fn summary(&self) -> Result<HeapSummary, Error> {
        Ok(self.state()?.summary(&self.inspector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{ImageSpan, TcmallocImage};
    use alloc::vec;

    fn ready(image: &TcmallocImage) -> Heap<crate::snapshot::Snapshot> {
        let _ = env_logger::try_init();
        let mut heap = Heap::new(image.build());
        heap.init(&mut ()).unwrap();
        heap
    }

    fn block(addr: Address, size: u64, inuse: bool) -> HeapBlock {
        HeapBlock { addr, size, inuse }
    }

    /// A large in-use span, a span of 32-byte blocks with one block on its
    /// object list and one in a thread cache, and a free span.
    fn mixed() -> TcmallocImage {
        let mut image = TcmallocImage::new(12, [0, 32, 1024]);
        image.span(ImageSpan::large(0xA, 1));
        image.span(ImageSpan::small(0xB, 1, 1).free_objects([0xB020]));
        image.span(ImageSpan::free(0xC, 2));
        image.thread_list(0, 1, [0xB040]);
        image
    }

    #[test]
    fn queries_fail_before_init() {
        let heap = Heap::new(mixed().build());
        assert!(!heap.is_ready());
        assert_eq!(heap.heap_block_info(0xA000), Err(Error::NotInitialized));
        assert_eq!(heap.next_heap_block(0), Err(Error::NotInitialized));
        assert_eq!(heap.walk_inuse_blocks(None), Err(Error::NotInitialized));
        assert!(heap.inuse_blocks().is_err());
    }

    #[test]
    fn init_is_all_or_nothing() {
        let mut heap = ready(&mixed());
        assert!(heap.is_ready());

        let mut broken = Heap::with_symbols(
            heap.inspector().clone(),
            Symbols {
                page_shift: "no_such_symbol",
                ..Symbols::GPERFTOOLS
            },
        );
        assert_eq!(
            broken.init(&mut ()),
            Err(Error::Symbol("no_such_symbol".into()))
        );
        assert!(!broken.is_ready());

        heap.init(&mut ()).unwrap();
        assert!(heap.is_ready());
    }

    #[test]
    fn init_reports_heap_segments() {
        let mut heap = Heap::new(mixed().build());
        let mut segments = Vec::new();
        heap.init(&mut segments).unwrap();
        assert_eq!(segments, [0xA000..0xB000, 0xB000..0xC000, 0xC000..0xE000]);
    }

    #[test]
    fn undivided_span_is_one_block() {
        let mut image = TcmallocImage::new(12, [0, 32]);
        image.span(ImageSpan::large(10, 2));
        let heap = ready(&image);
        assert_eq!(
            heap.heap_block_info(0xA400).unwrap(),
            Some(block(0xA000, 0x2000, true))
        );
        assert_eq!(
            heap.heap_block_info(0xBFFF).unwrap(),
            Some(block(0xA000, 0x2000, true))
        );
    }

    #[test]
    fn cached_block_is_free() {
        let heap = ready(&mixed());
        assert_eq!(
            heap.heap_block_info(0xB041).unwrap(),
            Some(block(0xB040, 32, false))
        );
        assert_eq!(
            heap.heap_block_info(0xB020).unwrap(),
            Some(block(0xB020, 32, false))
        );
        assert_eq!(
            heap.heap_block_info(0xB000).unwrap(),
            Some(block(0xB000, 32, true))
        );
        assert!(heap.state().unwrap().is_cached(0xB040));
        assert!(!heap.state().unwrap().is_cached(0xB041));
    }

    #[test]
    fn free_span_is_one_free_block() {
        let heap = ready(&mixed());
        assert_eq!(
            heap.heap_block_info(0xD123).unwrap(),
            Some(block(0xC000, 0x2000, false))
        );
    }

    #[test]
    fn addresses_outside_spans() {
        let heap = ready(&mixed());
        assert_eq!(heap.heap_block_info(0x9FFF).unwrap(), None);
        assert_eq!(heap.heap_block_info(0xE000).unwrap(), None);
        assert!(!heap.is_heap_block(0xE000).unwrap());
        assert!(heap.is_heap_block(0xE000 - 1).unwrap());
        assert_eq!(heap.next_heap_block(0xE000).unwrap(), None);
    }

    #[test]
    fn tail_slack_has_no_block() {
        let mut image = TcmallocImage::new(12, [0, 48]);
        image.span(ImageSpan::small(0xB, 1, 1));
        let heap = ready(&image);

        // 4096 / 48 = 85 blocks, ending at 0xBFF0.
        assert_eq!(
            heap.heap_block_info(0xBFEF).unwrap(),
            Some(block(0xBFC0, 48, true))
        );
        assert_eq!(heap.heap_block_info(0xBFF0).unwrap(), None);
        assert!(heap.is_heap_block(0xBFF0).unwrap());
    }

    #[test]
    fn empty_heap() {
        let heap = ready(&TcmallocImage::new(12, [0, 32]));
        assert_eq!(heap.next_heap_block(0).unwrap(), None);
        assert_eq!(heap.walk_inuse_blocks(None).unwrap(), 0);
        assert!(heap.biggest_inuse_blocks(3).unwrap().is_empty());
        assert_eq!(heap.summary().unwrap(), HeapSummary::default());
    }

    #[test]
    fn next_block_walks_every_block_in_order() {
        let heap = ready(&mixed());

        let mut blocks = Vec::new();
        let mut addr = 0;
        while let Some(next) = heap.next_heap_block(addr).unwrap() {
            assert!(next.addr > addr || addr == 0);
            assert_eq!(heap.heap_block_info(next.addr).unwrap(), Some(next));
            blocks.push(next);
            addr = next.addr;
        }

        // One large block, 128 small blocks and one free span.
        assert_eq!(blocks.len(), 130);
        assert_eq!(blocks[0], block(0xA000, 0x1000, true));
        assert_eq!(blocks[1], block(0xB000, 32, true));
        assert_eq!(blocks[2], block(0xB020, 32, false));
        assert_eq!(blocks[3], block(0xB040, 32, false));
        assert_eq!(blocks[128], block(0xBFE0, 32, true));
        assert_eq!(blocks[129], block(0xC000, 0x2000, false));
    }

    #[test]
    fn next_block_from_the_middle_of_a_block() {
        let heap = ready(&mixed());
        assert_eq!(
            heap.next_heap_block(0xB031).unwrap(),
            Some(block(0xB040, 32, false))
        );
        assert_eq!(
            heap.next_heap_block(0xA123).unwrap(),
            Some(block(0xB000, 32, true))
        );
    }

    #[test]
    fn next_block_skips_gaps_between_spans() {
        let mut image = TcmallocImage::new(12, [0, 32]);
        image.span(ImageSpan::large(0x10, 1));
        image.span(ImageSpan::large(0x400, 3));
        let heap = ready(&image);
        assert_eq!(
            heap.next_heap_block(0x10000).unwrap(),
            Some(block(0x400000, 0x3000, true))
        );
    }

    #[test]
    fn walk_counts_then_fills() {
        let heap = ready(&mixed());

        let count = heap.walk_inuse_blocks(None).unwrap();
        assert_eq!(count, 1 + 126);

        let mut blocks = vec![InuseBlock::default(); count];
        assert_eq!(heap.walk_inuse_blocks(Some(&mut blocks)).unwrap(), count);
        assert_eq!(blocks[0], InuseBlock { addr: 0xA000, size: 0x1000 });
        assert_eq!(blocks[1], InuseBlock { addr: 0xB000, size: 32 });
        assert_eq!(blocks[2], InuseBlock { addr: 0xB060, size: 32 });
        assert!(blocks.windows(2).all(|pair| pair[0].addr < pair[1].addr));

        let mut short = [InuseBlock::default(); 2];
        assert_eq!(heap.walk_inuse_blocks(Some(&mut short)).unwrap(), count);
        assert_eq!(short, blocks[..2]);
    }

    #[test]
    fn walk_agrees_with_block_info() {
        let heap = ready(&mixed());
        for inuse in heap.inuse_blocks().unwrap() {
            assert_eq!(
                heap.heap_block_info(inuse.addr).unwrap(),
                Some(HeapBlock::from(inuse))
            );
        }
    }

    #[test]
    fn biggest_blocks_largest_first() {
        let mut image = TcmallocImage::new(12, [0, 32]);
        image.span(ImageSpan::large(0x10, 1));
        image.span(ImageSpan::large(0x20, 3));
        image.span(ImageSpan::large(0x30, 1));
        image.span(ImageSpan::small(0x40, 1, 1));
        let heap = ready(&image);

        assert_eq!(
            heap.biggest_inuse_blocks(3).unwrap(),
            [
                InuseBlock { addr: 0x20000, size: 0x3000 },
                InuseBlock { addr: 0x10000, size: 0x1000 },
                InuseBlock { addr: 0x30000, size: 0x1000 },
            ]
        );
        assert!(heap.biggest_inuse_blocks(0).unwrap().is_empty());
        assert_eq!(heap.biggest_inuse_blocks(1000).unwrap().len(), 3 + 128);
    }

    #[test]
    fn summary_tallies_the_heap() {
        let mut image = mixed();
        image.span(ImageSpan::returned(0x20, 1));
        let heap = ready(&image);
        assert_eq!(
            heap.summary().unwrap(),
            HeapSummary {
                spans: 4,
                inuse_spans: 2,
                free_spans: 1,
                returned_spans: 1,
                unknown_spans: 0,
                inuse_blocks: 1 + 126,
                inuse_bytes: 0x1000 + 126 * 32,
                free_blocks: 2 + 2,
                free_bytes: 2 * 32 + 0x2000 + 0x1000,
                cached_blocks: 1,
            }
        );
    }

    #[test]
    fn span_with_unknown_location_is_one_free_block() {
        let mut image = mixed();
        image.span(ImageSpan::large(0xE, 1).location(SpanLocation::Unknown(7)));
        let heap = ready(&image);

        assert_eq!(heap.heap_block_info(0xE800), Ok(Some(block(0xE000, 0x1000, false))));
        assert_eq!(heap.walk_inuse_blocks(None).unwrap(), 1 + 126);

        let summary = heap.summary().unwrap();
        assert_eq!(summary.spans, 4);
        assert_eq!(summary.unknown_spans, 1);
        assert_eq!(summary.inuse_spans, 2);
        assert_eq!(summary.free_blocks, 2 + 1 + 1);
        assert_eq!(summary.free_bytes, 2 * 32 + 0x2000 + 0x1000);
    }

    #[test]
    fn state_can_be_owned_directly() {
        let snapshot = mixed().build();
        let state = HeapState::build(&snapshot, &Symbols::GPERFTOOLS, &mut ()).unwrap();
        assert_eq!(state.spans().len(), 3);
        assert_eq!(state.config().page_size(), 4096);
        assert_eq!(state.cached_block_count(), 1);
        assert_eq!(
            state.next_heap_block(&snapshot, 0),
            Some(block(0xA000, 0x1000, true))
        );
    }
}
