//! Rebuilding the span table from the allocator's page map.
//!
//! The page map is a radix tree with exactly two levels below its root:
//!
//! ```text
//! pageheap_->pagemap_.root_->ptrs[i]->ptrs[j]->values[k] : Span*
//! ```
//!
//! where the page id of slot `(i, j, k)` is its position in a row-major walk
//! of the tree. A span of `N` pages appears at each of its `N` page ids; it is
//! recorded at the first one and the other `N - 1` slots are skipped.

use crate::inspect::{self, ArrayBounds, Inspector, SegmentRegistry, Symbols};
use crate::span::{Span, SpanTable};
use crate::{Config, Error};

// Member names along the path from the page heap down to the leaves.
const PAGEMAP: &str = "pagemap_";
const ROOT: &str = "root_";
const PTRS: &str = "ptrs";
const VALUES: &str = "values";

/// Walk the page map, recording every span in page order and reporting each
/// one's memory to `segments`.
pub(crate) fn parse_spans<I, S>(
    inspector: &I,
    symbols: &Symbols,
    config: &Config,
    segments: &mut S,
) -> Result<SpanTable, Error>
where
    I: Inspector + ?Sized,
    S: SegmentRegistry + ?Sized,
{
    let pageheap = inspector.global(symbols.pageheap)?;
    let pageheap = inspector.deref(&pageheap)?;
    let pagemap = inspector.field(&pageheap, PAGEMAP)?;
    let root = inspector.field(&pagemap, ROOT)?;
    let root = inspector.deref(&root)?;
    let interior = inspector.field(&root, PTRS)?;
    let interior_bounds = inspect::array_bounds(inspector, &interior, PTRS)?;
    log::trace!("page map root has {} slots", interior_bounds.len());

    let mut walk = Walk {
        inspector,
        symbols,
        config,
        segments,
        table: SpanTable::default(),
        covered_until: 0,
    };

    for i in interior_bounds.indices() {
        let node = inspector.element(&interior, i)?;
        if inspector.as_u64(&node)? == 0 {
            continue;
        }
        let node = inspector.deref(&node)?;
        let leaves = inspector.field(&node, PTRS)?;
        let leaf_bounds = inspect::array_bounds(inspector, &leaves, PTRS)?;

        for j in leaf_bounds.indices() {
            let leaf = inspector.element(&leaves, j)?;
            if inspector.as_u64(&leaf)? == 0 {
                continue;
            }
            let leaf = inspector.cast(&leaf, symbols.leaf_type)?;
            let leaf = inspector.deref(&leaf)?;

            let leaf_index = offset(interior_bounds, i)
                .saturating_mul(leaf_bounds.len() as u64)
                .saturating_add(offset(leaf_bounds, j));
            walk.leaf(&leaf, leaf_index)?;
        }
    }

    log::debug!("{} spans are found", walk.table.len());
    Ok(walk.table)
}

/// The zero-based position of `index` within `bounds`.
fn offset(bounds: ArrayBounds, index: i64) -> u64 {
    (index - bounds.low) as u64
}

struct Walk<'a, I, S>
where
    I: Inspector + ?Sized,
    S: SegmentRegistry + ?Sized,
{
    inspector: &'a I,
    symbols: &'a Symbols,
    config: &'a Config,
    segments: &'a mut S,
    table: SpanTable,
    /// Page ids below this are covered by a span that is already recorded.
    covered_until: u64,
}

impl<I, S> Walk<'_, I, S>
where
    I: Inspector + ?Sized,
    S: SegmentRegistry + ?Sized,
{
    /// Record the spans of a leaf whose row of pages starts at
    /// `leaf_index * leaf_len`.
    fn leaf(&mut self, leaf: &I::Value, leaf_index: u64) -> Result<(), Error> {
        let inspector = self.inspector;
        let values = inspector.field(leaf, VALUES)?;
        let bounds = inspect::array_bounds(inspector, &values, VALUES)?;
        let first_page = leaf_index.saturating_mul(bounds.len() as u64);

        for k in bounds.indices() {
            let page = first_page.saturating_add(offset(bounds, k));
            if page < self.covered_until {
                continue;
            }

            let value = inspector.element(&values, k)?;
            if inspector.as_u64(&value)? == 0 {
                continue;
            }
            let span = inspector.cast(&value, self.symbols.span_type)?;
            let span = inspector.deref(&span)?;
            let span = Span::parse(inspector, &span)?;
            self.record(span, page)?;
        }
        Ok(())
    }

    fn record(&mut self, span: Span, page: u64) -> Result<(), Error> {
        if span.start_page() != page {
            log::warn!(
                "Heap corruption: page map slot for page {page:#x} holds span starting at {:#x}",
                span.start_page()
            );
        }
        if span.num_pages() == 0 {
            log::warn!(
                "Heap corruption: span at page {:#x} has zero length",
                span.start_page()
            );
        }
        log::trace!(
            "span {{ start: {:#x}, length: {}, next: {:#x}, prev: {:#x}, objects: {:#x}, \
             refcount: {}, sizeclass: {}, location: {:?}, sample: {} }}",
            span.start_page(),
            span.num_pages(),
            span.next(),
            span.prev(),
            span.objects(),
            span.refcount(),
            span.size_class(),
            span.location(),
            span.sample(),
        );

        self.covered_until = span.end_page().max(page + 1);
        self.segments.heap_segment(span.byte_range(self.config));
        self.table.push(span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{ImageSpan, Snapshot, TcmallocImage, Value};
    use alloc::vec::Vec;

    fn parse(snapshot: &Snapshot, segments: &mut Vec<core::ops::Range<u64>>) -> SpanTable {
        let _ = env_logger::try_init();
        let config = Config::new(12, [0, 32]);
        parse_spans(snapshot, &Symbols::GPERFTOOLS, &config, segments).unwrap()
    }

    #[test]
    fn spans_come_out_in_page_order() {
        let mut image = TcmallocImage::new(12, [0, 32]);
        image
            .span(ImageSpan::free(1 << 23, 1))
            .span(ImageSpan::small(0x900, 3, 1))
            .span(ImageSpan::large(0x10, 2))
            .span(ImageSpan::returned(0x7FF, 2));

        let mut segments = Vec::new();
        let table = parse(&image.build(), &mut segments);
        let starts: Vec<_> = table.spans().iter().map(Span::start_page).collect();
        assert_eq!(starts, [0x10, 0x7FF, 0x900, 1 << 23]);
        assert_eq!(
            segments,
            [
                0x10000..0x12000,
                0x7FF000..0x801000,
                0x900000..0x903000,
                (1 << 35)..(1 << 35) + 0x1000,
            ]
        );
    }

    #[test]
    fn span_crossing_a_leaf_is_recorded_once() {
        let mut image = TcmallocImage::new(12, [0, 32]);
        image.span(ImageSpan::large(0x7FE, 4));
        let table = parse(&image.build(), &mut Vec::new());
        assert_eq!(table.len(), 1);
        assert_eq!(table.spans()[0].num_pages(), 4);
    }

    #[test]
    fn span_fields_are_copied() {
        let mut image = TcmallocImage::new(12, [0, 32]);
        image.span(
            ImageSpan::small(0x20, 1, 1)
                .free_objects([0x20000, 0x20040])
                .sampled(),
        );
        let table = parse(&image.build(), &mut Vec::new());
        let span = &table.spans()[0];
        assert_eq!(span.size_class(), 1);
        assert_eq!(span.objects(), 0x20000);
        assert_eq!(span.refcount(), 128 - 2);
        assert!(span.sample());
        assert!(span.is_in_use());
    }

    #[test]
    fn missing_page_heap_is_fatal() {
        let snapshot =
            Snapshot::new().with_global(Symbols::GPERFTOOLS.pageheap, Value::Ptr(0));
        let config = Config::new(12, [0]);
        assert_eq!(
            parse_spans(&snapshot, &Symbols::GPERFTOOLS, &config, &mut ()).unwrap_err(),
            Error::NullPointer
        );
    }
}
