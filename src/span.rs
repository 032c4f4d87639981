//! Spans and the sorted span table.

use alloc::vec::Vec;
use core::cell::OnceCell;
use core::ops::Range;

use crate::bitmap::FreeBitmap;
use crate::cached::CachedBlocks;
use crate::inspect::{self, Inspector};
use crate::{Address, Config, Error, Memory};

/// Where a span currently lives, as recorded by the allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpanLocation {
    /// Handed out: either one large object or carved into size-class blocks.
    InUse,
    /// On the page heap's normal free lists.
    NormalFreelist,
    /// On the page heap's returned free lists; its pages were given back to
    /// the operating system.
    ReturnedFreelist,
    /// A value the allocator never writes, meaning the span is corrupt.
    Unknown(u64),
}

impl SpanLocation {
    /// Decode the allocator's `location` bit field.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        match raw {
            0 => SpanLocation::InUse,
            1 => SpanLocation::NormalFreelist,
            2 => SpanLocation::ReturnedFreelist,
            other => SpanLocation::Unknown(other),
        }
    }

    /// Encode back into the allocator's `location` bit field.
    #[inline]
    pub fn to_raw(self) -> u64 {
        match self {
            SpanLocation::InUse => 0,
            SpanLocation::NormalFreelist => 1,
            SpanLocation::ReturnedFreelist => 2,
            SpanLocation::Unknown(raw) => raw,
        }
    }
}

/// A contiguous run of pages handed out by a single allocation decision.
///
/// Everything but the free bitmap is copied verbatim from the allocator's own
/// `Span` when the page map is parsed.
#[derive(Debug)]
pub struct Span {
    pub(crate) start_page: u64,
    pub(crate) num_pages: u64,
    pub(crate) next: Address,
    pub(crate) prev: Address,
    pub(crate) objects: Address,
    pub(crate) refcount: u64,
    pub(crate) size_class: u32,
    pub(crate) location: SpanLocation,
    pub(crate) sample: bool,
    /// One bit per block, set when the block is free. Built on first use and
    /// never rebuilt; `None` if it could not be allocated.
    pub(crate) bitmap: OnceCell<Option<FreeBitmap>>,
}

impl Span {
    // Member names of the allocator's `Span`.
    const START: &'static str = "start";
    const LENGTH: &'static str = "length";
    const NEXT: &'static str = "next";
    const PREV: &'static str = "prev";
    const OBJECTS: &'static str = "objects";
    const REFCOUNT: &'static str = "refcount";
    const SIZECLASS: &'static str = "sizeclass";
    const LOCATION: &'static str = "location";
    const SAMPLE: &'static str = "sample";

    /// Copy the metadata of the allocator span `span`.
    pub(crate) fn parse<I>(inspector: &I, span: &I::Value) -> Result<Self, Error>
    where
        I: Inspector + ?Sized,
    {
        let field = |name| inspect::field_u64(inspector, span, name);
        let size_class = field(Self::SIZECLASS)?;
        Ok(Span {
            start_page: field(Self::START)?,
            num_pages: field(Self::LENGTH)?,
            next: field(Self::NEXT)?,
            prev: field(Self::PREV)?,
            objects: field(Self::OBJECTS)?,
            refcount: field(Self::REFCOUNT)?,
            size_class: u32::try_from(size_class).unwrap_or(u32::MAX),
            location: SpanLocation::from_raw(field(Self::LOCATION)?),
            sample: field(Self::SAMPLE)? != 0,
            bitmap: OnceCell::new(),
        })
    }

    /// The first page of this span.
    #[inline]
    pub fn start_page(&self) -> u64 {
        self.start_page
    }

    /// The number of pages in this span.
    #[inline]
    pub fn num_pages(&self) -> u64 {
        self.num_pages
    }

    /// One past the last page of this span.
    #[inline]
    pub fn end_page(&self) -> u64 {
        self.start_page.saturating_add(self.num_pages)
    }

    /// Whether `page` is one of this span's pages.
    #[inline]
    pub fn contains_page(&self, page: u64) -> bool {
        self.start_page <= page && page < self.end_page()
    }

    /// The byte range this span covers.
    #[inline]
    pub fn byte_range(&self, config: &Config) -> Range<Address> {
        config.page_addr(self.start_page)..config.page_addr(self.end_page())
    }

    /// The next span on the allocator's own span list.
    #[inline]
    pub fn next(&self) -> Address {
        self.next
    }

    /// The previous span on the allocator's own span list.
    #[inline]
    pub fn prev(&self) -> Address {
        self.prev
    }

    /// The head of this span's list of free objects.
    #[inline]
    pub fn objects(&self) -> Address {
        self.objects
    }

    /// The allocator's count of objects handed out from this span.
    #[inline]
    pub fn refcount(&self) -> u64 {
        self.refcount
    }

    /// The span's size class. Zero means the span is one undivided block.
    #[inline]
    pub fn size_class(&self) -> u32 {
        self.size_class
    }

    /// Where the allocator keeps this span.
    #[inline]
    pub fn location(&self) -> SpanLocation {
        self.location
    }

    /// Whether the span holds a sampled allocation.
    #[inline]
    pub fn sample(&self) -> bool {
        self.sample
    }

    /// Whether the allocator has handed this span out.
    #[inline]
    pub fn is_in_use(&self) -> bool {
        self.location == SpanLocation::InUse
    }

    /// The block size of this span if it is in use and carved into
    /// size-class blocks, or `None` if it is treated as a single block.
    #[inline]
    pub fn block_size(&self, config: &Config) -> Option<u64> {
        if !self.is_in_use() {
            return None;
        }
        config.class_to_size(self.size_class)
    }

    /// The number of blocks the span is carved into, once its free bitmap has
    /// been built.
    #[inline]
    pub fn block_count(&self) -> Option<usize> {
        self.bitmap.get()?.as_ref().map(FreeBitmap::len)
    }

    /// Get this span's free bitmap, building it first if necessary.
    ///
    /// Returns `None` for spans that are not carved into blocks, and for spans
    /// whose bitmap could not be allocated.
    pub(crate) fn free_bitmap<M>(
        &self,
        config: &Config,
        cached: &CachedBlocks,
        memory: &M,
    ) -> Option<&FreeBitmap>
    where
        M: Memory + ?Sized,
    {
        let block_size = self.block_size(config)?;
        self.bitmap
            .get_or_init(|| FreeBitmap::populate(self, block_size, config, cached, memory))
            .as_ref()
    }
}

/// Every span of the heap, sorted by start page.
#[derive(Debug, Default)]
pub(crate) struct SpanTable {
    spans: Vec<Span>,
}

impl SpanTable {
    /// Append a span, growing the table by doubling.
    pub(crate) fn push(&mut self, span: Span) -> Result<(), Error> {
        if self.spans.len() == self.spans.capacity() {
            let goal = if self.spans.capacity() == 0 {
                crate::INITIAL_TABLE_CAPACITY
            } else {
                self.spans.capacity() * 2
            };
            self.spans
                .try_reserve_exact(goal - self.spans.len())
                .map_err(|_| Error::OutOfMemory)?;
        }
        self.spans.push(span);
        Ok(())
    }

    pub(crate) fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub(crate) fn len(&self) -> usize {
        self.spans.len()
    }

    /// The index of the span covering `page`.
    pub(crate) fn position(&self, page: u64) -> Option<usize> {
        // Spans are sorted and disjoint, so at most one can contain `page`:
        // the last one starting at or before it.
        let after = self.spans.partition_point(|span| span.start_page <= page);
        let index = after.checked_sub(1)?;
        self.spans[index].contains_page(page).then_some(index)
    }

    /// The span covering `addr`.
    pub(crate) fn span_at(&self, config: &Config, addr: Address) -> Option<&Span> {
        let index = self.position(config.page_of(addr))?;
        Some(&self.spans[index])
    }

    /// The first span starting at or after the end of the span at `index`.
    pub(crate) fn successor(&self, index: usize) -> Option<usize> {
        let end = self.spans.get(index)?.end_page();
        let next = self.spans.partition_point(|span| span.start_page < end);
        (next < self.spans.len()).then_some(next)
    }

    /// Check that the table is sorted and disjoint, and that a lookup of any
    /// page of any span finds that span.
    pub(crate) fn verify(&self, config: &Config) -> Result<(), Error> {
        for (index, pair) in self.spans.windows(2).enumerate() {
            if pair[0].end_page() > pair[1].start_page {
                return Err(Error::UnsortedSpans { index });
            }
        }

        for (index, span) in self.spans.iter().enumerate() {
            for page in span.start_page..span.end_page() {
                let addr = config.page_addr(page) + 1;
                if self.position(config.page_of(addr)) != Some(index) {
                    return Err(Error::SpanLookup(addr));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(start_page: u64, num_pages: u64) -> Span {
        Span {
            start_page,
            num_pages,
            next: 0,
            prev: 0,
            objects: 0,
            refcount: 0,
            size_class: 0,
            location: SpanLocation::InUse,
            sample: false,
            bitmap: OnceCell::new(),
        }
    }

    fn table(spans: impl IntoIterator<Item = (u64, u64)>) -> SpanTable {
        let mut table = SpanTable::default();
        for (start, len) in spans {
            table.push(span(start, len)).unwrap();
        }
        table
    }

    #[test]
    fn lookup_by_page_containment() {
        let config = Config::new(12, [0]);
        let table = table([(10, 2), (12, 1), (20, 4)]);

        assert_eq!(table.span_at(&config, 0xA400).unwrap().start_page(), 10);
        assert_eq!(table.span_at(&config, 0xBFFF).unwrap().start_page(), 10);
        assert_eq!(table.span_at(&config, 0xC000).unwrap().start_page(), 12);
        assert!(table.span_at(&config, 0xD000).is_none());
        assert!(table.span_at(&config, 0x9FFF).is_none());
        assert_eq!(table.span_at(&config, 0x17FFF).unwrap().start_page(), 20);
        assert!(table.span_at(&config, 0x18000).is_none());
    }

    #[test]
    fn successor_skips_gaps() {
        let table = table([(10, 2), (12, 1), (20, 4)]);
        assert_eq!(table.successor(0), Some(1));
        assert_eq!(table.successor(1), Some(2));
        assert_eq!(table.successor(2), None);
    }

    #[test]
    fn verify_accepts_sorted_disjoint_spans() {
        let config = Config::new(12, [0]);
        assert_eq!(table([(10, 2), (12, 1), (20, 4)]).verify(&config), Ok(()));
        assert_eq!(table([]).verify(&config), Ok(()));
    }

    #[test]
    fn verify_rejects_overlap() {
        let config = Config::new(12, [0]);
        assert_eq!(
            table([(10, 3), (12, 1)]).verify(&config),
            Err(Error::UnsortedSpans { index: 0 })
        );
        assert_eq!(
            table([(10, 1), (20, 1), (15, 1)]).verify(&config),
            Err(Error::UnsortedSpans { index: 1 })
        );
    }

    #[test]
    fn table_grows_from_initial_capacity() {
        let mut table = SpanTable::default();
        table.push(span(0, 1)).unwrap();
        assert_eq!(table.spans.capacity(), crate::INITIAL_TABLE_CAPACITY);
        for page in 1..=crate::INITIAL_TABLE_CAPACITY as u64 {
            table.push(span(page, 1)).unwrap();
        }
        assert_eq!(table.spans.capacity(), 2 * crate::INITIAL_TABLE_CAPACITY);
    }

    #[test]
    fn location_round_trips_raw_values() {
        assert_eq!(SpanLocation::from_raw(0), SpanLocation::InUse);
        assert_eq!(SpanLocation::from_raw(2), SpanLocation::ReturnedFreelist);
        assert_eq!(SpanLocation::from_raw(3), SpanLocation::Unknown(3));
        assert_eq!(SpanLocation::Unknown(3).to_raw(), 3);
    }
}
