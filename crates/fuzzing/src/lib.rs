//! Shared fuzzing and testing infrastructure for `tcmalloc-inspect`.
//!
//! A [`HeapModel`] describes a heap as a list of spans, with a bit pattern
//! saying which blocks of each small-object span are allocated and where the
//! free ones are kept. From it we lay out a synthetic tcmalloc image, rebuild
//! the heap state from that image, and check every query against what the
//! model says the answer should be.

use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use std::collections::BTreeMap;
use std::ops::Range;
use tcmalloc_inspect::{
    snapshot::{ImageSpan, TcmallocImage},
    Heap, HeapBlock, HeapSummary, InuseBlock,
};

/// The page shift of every model heap.
pub const PAGE_SHIFT: u32 = 12;

/// The size-class table of every model heap.
///
/// The last class does not fit in a single page, so one-page spans of it hold
/// no blocks at all.
pub const CLASS_TO_SIZE: [u64; 8] = [0, 8, 16, 48, 128, 256, 1024, 6144];

/// The page at which the first span is placed, after its gap. Just below a
/// page-map leaf boundary, so that larger models straddle it.
const FIRST_PAGE: u64 = 0x7F0;

/// Spans past this many are ignored, to keep checks fast.
const MAX_SPANS: usize = 32;

/// Only the first this-many blocks of a small-object span take their state
/// from the span's pattern; the rest are allocated.
const PATTERN_BLOCKS: u64 = 32;

/// What a span is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Mutate, bincode::Encode, bincode::Decode)]
pub enum SpanKind {
    /// One large allocation.
    Large,
    /// Carved into size-class blocks.
    Small,
    /// On the page heap's normal free lists.
    Free,
    /// On the page heap's returned free lists.
    Returned,
}

impl Generate<SpanKind> for SpanKindMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<SpanKind> {
        // Small-object spans are where the interesting structure is.
        let choices = [
            SpanKind::Large,
            SpanKind::Small,
            SpanKind::Small,
            SpanKind::Small,
            SpanKind::Free,
            SpanKind::Returned,
        ];
        Ok(ctx.rng().choose(choices).unwrap_or(SpanKind::Small))
    }
}

/// One span of a [`HeapModel`].
///
/// Every field is taken modulo its meaningful range when the model is laid
/// out, so any value is valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Mutate, bincode::Encode, bincode::Decode)]
pub struct SpanModel {
    /// Unmapped pages before this span, modulo 4.
    pub gap_pages: u8,
    /// The number of pages, minus one, modulo 8.
    pub num_pages: u8,
    /// What the span is used for.
    pub kind: SpanKind,
    /// For small-object spans: the size class, minus one, modulo the number of
    /// classes.
    pub size_class: u8,
    /// For small-object spans: two bits per block for the first blocks. `0`
    /// and `1` mean allocated, `2` means on the span's free-object list and
    /// `3` means cached, alternately in a thread cache and a central
    /// transfer slot.
    pub pattern: u64,
}

impl Generate<SpanModel> for SpanModelMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<SpanModel> {
        Ok(SpanModel {
            gap_pages: m::range(0..=3).generate(ctx)?,
            num_pages: m::range(0..=7).generate(ctx)?,
            kind: m::default::<SpanKind>().generate(ctx)?,
            size_class: m::range(0..=u8::MAX).generate(ctx)?,
            pattern: m::range(0..=u64::MAX).generate(ctx)?,
        })
    }
}

/// A heap, described as a sequence of spans in ascending address order.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct HeapModel {
    spans: Vec<SpanModel>,
}

impl DefaultMutate for HeapModel {
    type DefaultMutate = HeapModelMutator;
}

#[derive(Default)]
pub struct HeapModelMutator;

impl Mutate<HeapModel> for HeapModelMutator {
    fn mutate(
        &mut self,
        c: &mut mutatis::Candidates<'_>,
        model: &mut HeapModel,
    ) -> mutatis::Result<()> {
        // Completely random mutations on a single-span basis.
        m::default::<Vec<SpanModel>>().mutate(c, &mut model.spans)?;

        // Make every patterned block of a span allocated, or every one free.
        c.mutation(|ctx| {
            if let Some(index) = ctx.rng().gen_index(model.spans.len()) {
                let span = &mut model.spans[index];
                span.kind = SpanKind::Small;
                span.pattern = if ctx.rng().gen_bool() { 0 } else { u64::MAX };
            }
            Ok(())
        })?;

        // Pack spans back to back.
        c.mutation(|_ctx| {
            for span in &mut model.spans {
                span.gap_pages = 0;
            }
            Ok(())
        })?;

        // Duplicate a span somewhere else.
        if !c.shrink() {
            c.mutation(|ctx| {
                if let Some(index) = ctx.rng().gen_index(model.spans.len()) {
                    let span = model.spans[index];
                    let at = ctx.rng().gen_index(model.spans.len() + 1).unwrap_or(0);
                    model.spans.insert(at, span);
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

/// A model heap laid out as an image, along with every answer the engine
/// should give about it.
struct Expected {
    image: TcmallocImage,
    segments: Vec<Range<u64>>,
    blocks: Vec<HeapBlock>,
    /// Unused bytes at the end of small-object spans.
    slack: Vec<Range<u64>>,
    summary: HeapSummary,
}

impl HeapModel {
    /// Create a new `HeapModel` from the given spans.
    pub fn new(spans: impl IntoIterator<Item = SpanModel>) -> Self {
        let spans = spans.into_iter().collect();
        HeapModel { spans }
    }

    /// Remove the last span, returning whether there was one.
    pub fn pop(&mut self) -> bool {
        self.spans.pop().is_some()
    }

    fn layout(&self) -> Expected {
        let mut expected = Expected {
            image: TcmallocImage::new(PAGE_SHIFT, CLASS_TO_SIZE),
            segments: Vec::new(),
            blocks: Vec::new(),
            slack: Vec::new(),
            summary: HeapSummary::default(),
        };
        let summary = &mut expected.summary;
        let mut thread_lists: BTreeMap<usize, Vec<u64>> = BTreeMap::new();

        let mut page = FIRST_PAGE;
        for span in self.spans.iter().take(MAX_SPANS) {
            page += u64::from(span.gap_pages % 4);
            let num_pages = 1 + u64::from(span.num_pages % 8);
            let start = page << PAGE_SHIFT;
            let end = (page + num_pages) << PAGE_SHIFT;
            expected.segments.push(start..end);
            summary.spans += 1;

            let mut whole = |inuse| {
                expected.blocks.push(HeapBlock {
                    addr: start,
                    size: end - start,
                    inuse,
                });
            };
            match span.kind {
                SpanKind::Large => {
                    expected.image.span(ImageSpan::large(page, num_pages));
                    whole(true);
                    summary.inuse_spans += 1;
                    summary.inuse_blocks += 1;
                    summary.inuse_bytes += end - start;
                }
                SpanKind::Free | SpanKind::Returned => {
                    if span.kind == SpanKind::Free {
                        expected.image.span(ImageSpan::free(page, num_pages));
                        summary.free_spans += 1;
                    } else {
                        expected.image.span(ImageSpan::returned(page, num_pages));
                        summary.returned_spans += 1;
                    }
                    whole(false);
                    summary.free_blocks += 1;
                    summary.free_bytes += end - start;
                }
                SpanKind::Small => {
                    let class = 1 + usize::from(span.size_class) % (CLASS_TO_SIZE.len() - 1);
                    let size = CLASS_TO_SIZE[class];
                    let count = (end - start) / size;
                    let mut objects = Vec::new();
                    let mut central = Vec::new();

                    for index in 0..count {
                        let addr = start + index * size;
                        let state = if index < PATTERN_BLOCKS {
                            (span.pattern >> (2 * index)) & 0b11
                        } else {
                            0
                        };
                        match state {
                            2 => objects.push(addr),
                            3 if index % 2 == 0 => {
                                thread_lists.entry(class).or_default().push(addr)
                            }
                            3 => central.push(addr),
                            _ => {}
                        }

                        let inuse = state < 2;
                        expected.blocks.push(HeapBlock { addr, size, inuse });
                        if inuse {
                            summary.inuse_blocks += 1;
                            summary.inuse_bytes += size;
                        } else {
                            summary.free_blocks += 1;
                            summary.free_bytes += size;
                        }
                    }

                    summary.inuse_spans += 1;
                    summary.cached_blocks += central.len();
                    expected.image.span(
                        ImageSpan::small(page, num_pages, class as u32).free_objects(objects),
                    );
                    if !central.is_empty() {
                        expected.image.central_slot(class, central);
                    }
                    if start + count * size < end {
                        expected.slack.push(start + count * size..end);
                    }
                }
            }

            page += num_pages;
        }

        for (class, nodes) in thread_lists {
            summary.cached_blocks += nodes.len();
            expected.image.thread_list(0, class, nodes);
        }

        expected
    }

    /// Lay this model out as a tcmalloc image and check that every query on
    /// the rebuilt heap agrees with the model.
    pub fn check(&self) -> Result<(), String> {
        log::debug!("========== Checking heap model ==========");

        let expected = self.layout();
        let mut heap = Heap::new(expected.image.build());
        let mut segments = Vec::new();
        heap.init(&mut segments)
            .map_err(|e| format!("init failed: {e}"))?;
        ensure!(
            segments == expected.segments,
            "reported heap segments {segments:x?}, expected {:x?}",
            expected.segments,
        );

        let state = heap.state().map_err(|e| e.to_string())?;
        let memory = heap.inspector();

        // Every block, in order, by chasing `next_heap_block` from zero.
        let mut walked = Vec::new();
        let mut addr = 0;
        while let Some(block) = state.next_heap_block(memory, addr) {
            log::trace!("next block after {addr:#x}: {block:x?}");
            ensure!(
                walked.len() < expected.blocks.len(),
                "walked more blocks than the {} expected",
                expected.blocks.len(),
            );
            walked.push(block);
            addr = block.addr;
        }
        ensure!(
            walked == expected.blocks,
            "walked blocks differ from the model",
        );

        for (index, block) in expected.blocks.iter().enumerate() {
            for probe in [block.addr, block.addr + block.size / 2, block.addr + block.size - 1] {
                let info = state.heap_block_info(memory, probe);
                ensure!(
                    info == Some(*block),
                    "heap_block_info({probe:#x}) = {info:x?}, expected {block:x?}",
                );
                ensure!(
                    state.is_heap_block(probe),
                    "is_heap_block({probe:#x}) is false",
                );
            }

            let next = state.next_heap_block(memory, block.addr + block.size - 1);
            let expected_next = expected.blocks.get(index + 1).copied();
            ensure!(
                next == expected_next,
                "next_heap_block({:#x}) = {next:x?}, expected {expected_next:x?}",
                block.addr + block.size - 1,
            );
        }

        for slack in &expected.slack {
            for probe in [slack.start, slack.end - 1] {
                let info = state.heap_block_info(memory, probe);
                ensure!(info.is_none(), "slack at {probe:#x} is in block {info:x?}");
                ensure!(
                    state.is_heap_block(probe),
                    "slack at {probe:#x} is outside the heap",
                );
            }
        }

        for pair in expected.segments.windows(2) {
            if pair[0].end < pair[1].start {
                ensure!(
                    !state.is_heap_block(pair[0].end),
                    "gap at {:#x} is in the heap",
                    pair[0].end,
                );
                ensure!(
                    state.heap_block_info(memory, pair[0].end).is_none(),
                    "gap at {:#x} has a block",
                    pair[0].end,
                );
            }
        }

        let inuse: Vec<InuseBlock> = expected
            .blocks
            .iter()
            .filter(|block| block.inuse)
            .map(|block| InuseBlock {
                addr: block.addr,
                size: block.size,
            })
            .collect();
        let count = state.walk_inuse_blocks(memory, None);
        ensure!(
            count == inuse.len(),
            "counted {count} in-use blocks, expected {}",
            inuse.len(),
        );
        let mut filled = vec![InuseBlock::default(); count];
        let filled_count = state.walk_inuse_blocks(memory, Some(&mut filled));
        ensure!(filled_count == count, "fill mode counted {filled_count}, count mode {count}");
        ensure!(filled == inuse, "walked in-use blocks differ from the model");

        let mut biggest = inuse.clone();
        biggest.sort_by(|a, b| b.size.cmp(&a.size).then(a.addr.cmp(&b.addr)));
        biggest.truncate(3);
        let actual = state.biggest_inuse_blocks(memory, 3);
        ensure!(
            actual == biggest,
            "biggest blocks {actual:x?}, expected {biggest:x?}",
        );

        let summary = state.summary(memory);
        ensure!(
            summary == expected.summary,
            "summary {summary:#?}, expected {:#?}",
            expected.summary,
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutatis::check::{Check, CheckError, CheckFailure};

    fn span(kind: SpanKind, num_pages: u8, size_class: u8, pattern: u64) -> SpanModel {
        SpanModel {
            gap_pages: 1,
            num_pages,
            kind,
            size_class,
            pattern,
        }
    }

    #[test]
    fn check_heap_models() {
        let _ = env_logger::try_init();

        let seed_corpus = [
            // Empty.
            HeapModel::default(),
            // One of each kind of span.
            HeapModel::new([
                span(SpanKind::Large, 1, 0, 0),
                span(SpanKind::Small, 0, 0, 0),
                span(SpanKind::Free, 2, 0, 0),
                span(SpanKind::Returned, 0, 0, 0),
            ]),
            // Every block state, in a span with tail slack.
            HeapModel::new([span(SpanKind::Small, 0, 2, 0b11_10_01_00_11_10_01_00)]),
            // Everything free, both on the object list and cached.
            HeapModel::new([span(SpanKind::Small, 3, 4, 0xAAAA_AAAA_FFFF_FFFF)]),
            // A span too small to hold a single block.
            HeapModel::new([
                span(SpanKind::Small, 0, 6, 0),
                span(SpanKind::Large, 0, 0, 0),
            ]),
            // Back to back, across a page-map leaf boundary.
            HeapModel::new(
                (0..8).map(|i| SpanModel {
                    gap_pages: 0,
                    num_pages: 7,
                    kind: SpanKind::Small,
                    size_class: i,
                    pattern: 0x5A5A_5A5A_5A5A_5A5A,
                }),
            ),
        ];

        match Check::new().iters(2_000).shrink_iters(1).run_with(
            m::default::<HeapModel>(),
            seed_corpus,
            |model| model.check(),
        ) {
            Ok(()) => {}
            Err(CheckError::Failed(CheckFailure { value, message, .. })) => {
                panic!("test failure: {message}: {value:#?}")
            }
            Err(e) => panic!("check error: {e}"),
        }
    }
}
