//! Synthetic tcmalloc heap images.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use super::{Snapshot, Value};
use crate::{Address, SpanLocation, Symbols};

/// `TCMalloc_PageMap3<35>`: 12 bits of root index, 12 bits of interior
/// index, and 11 bits of leaf index.
const INTERIOR_BITS: u32 = 12;
const LEAF_BITS: u32 = 11;
const MAP_BITS: u32 = 2 * INTERIOR_BITS + LEAF_BITS;

/// Transfer slots per central free list.
const TC_SLOTS: usize = 16;

/// Where allocator metadata is placed. Heap pages must stay below this.
const METADATA_BASE: Address = 0x7f00_0000_0000;
const METADATA_STRIDE: Address = 0x100;

/// A span to lay out in a [`TcmallocImage`].
#[derive(Clone, Debug)]
pub struct ImageSpan {
    start_page: u64,
    num_pages: u64,
    size_class: u32,
    location: SpanLocation,
    objects: Vec<Address>,
    sample: bool,
}

impl ImageSpan {
    fn new(start_page: u64, num_pages: u64, size_class: u32, location: SpanLocation) -> Self {
        ImageSpan {
            start_page,
            num_pages,
            size_class,
            location,
            objects: Vec::new(),
            sample: false,
        }
    }

    /// An in-use span carved into blocks of `size_class`.
    pub fn small(start_page: u64, num_pages: u64, size_class: u32) -> Self {
        Self::new(start_page, num_pages, size_class, SpanLocation::InUse)
    }

    /// An in-use span holding one large object.
    pub fn large(start_page: u64, num_pages: u64) -> Self {
        Self::new(start_page, num_pages, 0, SpanLocation::InUse)
    }

    /// A span on the page heap's normal free lists.
    pub fn free(start_page: u64, num_pages: u64) -> Self {
        Self::new(start_page, num_pages, 0, SpanLocation::NormalFreelist)
    }

    /// A span on the page heap's returned free lists.
    pub fn returned(start_page: u64, num_pages: u64) -> Self {
        Self::new(start_page, num_pages, 0, SpanLocation::ReturnedFreelist)
    }

    /// Thread `nodes`, in order, onto the span's free-object list.
    pub fn free_objects(mut self, nodes: impl IntoIterator<Item = Address>) -> Self {
        self.objects = nodes.into_iter().collect();
        self
    }

    /// Override the span's location.
    pub fn location(mut self, location: SpanLocation) -> Self {
        self.location = location;
        self
    }

    /// Mark the span as holding a sampled allocation.
    pub fn sampled(mut self) -> Self {
        self.sample = true;
        self
    }
}

#[derive(Clone, Debug, Default)]
struct FreeList {
    nodes: Vec<Address>,
    length: Option<u64>,
}

#[derive(Clone, Debug, Default)]
struct CentralList {
    slots: Vec<Vec<Address>>,
    used_slots: Option<u64>,
}

/// A description of a tcmalloc heap, from which a [`Snapshot`] with all of
/// the allocator's globals can be built.
///
/// The image follows the shape of gperftools' 64-bit tcmalloc, under the
/// names in [`Symbols::GPERFTOOLS`].
///
/// Nothing here checks that the description is consistent: overlapping
/// spans, stray free-list nodes and mismatched counts are all representable,
/// which is the point.
#[derive(Clone, Debug)]
pub struct TcmallocImage {
    page_shift: u32,
    class_to_size: Vec<u64>,
    spans: Vec<ImageSpan>,
    threads: Vec<Vec<FreeList>>,
    central: Vec<CentralList>,
}

impl TcmallocImage {
    /// An image with no spans and empty caches.
    ///
    /// `class_to_size[0]` stands for the reserved class 0.
    pub fn new(page_shift: u32, class_to_size: impl IntoIterator<Item = u64>) -> Self {
        let class_to_size: Vec<u64> = class_to_size.into_iter().collect();
        TcmallocImage {
            page_shift,
            central: vec![CentralList::default(); class_to_size.len()],
            class_to_size,
            spans: Vec::new(),
            threads: Vec::new(),
        }
    }

    /// Add a span.
    pub fn span(&mut self, span: ImageSpan) -> &mut Self {
        self.spans.push(span);
        self
    }

    fn thread(&mut self, thread: usize, class: usize) -> &mut FreeList {
        if self.threads.len() <= thread {
            let classes = self.class_to_size.len();
            self.threads
                .resize_with(thread + 1, || vec![FreeList::default(); classes]);
        }
        let lists = &mut self.threads[thread];
        let len = self.class_to_size.len().max(class + 1).max(lists.len());
        lists.resize_with(len, FreeList::default);
        &mut lists[class]
    }

    /// Put `nodes` on thread `thread`'s free list for `class`, creating the
    /// thread cache if needed.
    ///
    /// A `class` beyond the size-class table grows that thread's list array,
    /// making the image inconsistent.
    pub fn thread_list(
        &mut self,
        thread: usize,
        class: usize,
        nodes: impl IntoIterator<Item = Address>,
    ) -> &mut Self {
        self.thread(thread, class).nodes = nodes.into_iter().collect();
        self
    }

    /// Record `length` as the length of a thread free list, instead of its
    /// actual length.
    pub fn thread_list_length(&mut self, thread: usize, class: usize, length: u64) -> &mut Self {
        self.thread(thread, class).length = Some(length);
        self
    }

    /// Put a batch of `nodes` in the next unused transfer slot of `class`'s
    /// central free list.
    pub fn central_slot(
        &mut self,
        class: usize,
        nodes: impl IntoIterator<Item = Address>,
    ) -> &mut Self {
        if let Some(list) = self.central.get_mut(class) {
            list.slots.push(nodes.into_iter().collect());
        }
        self
    }

    /// Record `used` as `class`'s number of used transfer slots, instead of
    /// the actual number.
    pub fn central_used_slots(&mut self, class: usize, used: u64) -> &mut Self {
        if let Some(list) = self.central.get_mut(class) {
            list.used_slots = Some(used);
        }
        self
    }

    /// Lay the image out in memory.
    ///
    /// Pages outside the 35-bit page map are left unmapped.
    pub fn build(&self) -> Snapshot {
        let names = Symbols::GPERFTOOLS;
        let mut builder = Builder {
            snapshot: Snapshot::new(),
            next_object: METADATA_BASE,
        };

        builder.snapshot.set_global(names.page_shift, Value::Int(self.page_shift.into()));
        builder.snapshot.set_global(
            names.sizemap,
            Value::structure([(
                "class_to_size_",
                Value::array(self.class_to_size.iter().copied().map(Value::Int)),
            )]),
        );

        let pageheap = builder.page_heap(self);
        builder.snapshot.set_global(names.pageheap, Value::Ptr(pageheap));

        let threads = builder.thread_caches(&self.threads);
        builder.snapshot.set_global(names.thread_heaps, Value::Ptr(threads));

        let central = Value::array(self.central.iter().map(|list| builder.central_list(list)));
        builder.snapshot.set_global(names.central_cache, central);

        builder.snapshot
    }

    fn block_count(&self, span: &ImageSpan) -> u64 {
        let size = self
            .class_to_size
            .get(span.size_class as usize)
            .copied()
            .unwrap_or(0);
        if span.size_class == 0 || size == 0 {
            return 1;
        }
        (span.num_pages << self.page_shift) / size
    }
}

struct Builder {
    snapshot: Snapshot,
    next_object: Address,
}

impl Builder {
    fn alloc(&mut self, value: Value) -> Address {
        let addr = self.next_object;
        self.next_object += METADATA_STRIDE;
        self.snapshot.set_object(addr, value);
        addr
    }

    /// Thread `nodes` into a null-terminated list, returning its head.
    fn link(&mut self, nodes: &[Address]) -> Address {
        for pair in nodes.windows(2) {
            self.snapshot.write_pointer(pair[0], pair[1]);
        }
        if let Some(last) = nodes.last() {
            self.snapshot.write_pointer(*last, 0);
        }
        nodes.first().copied().unwrap_or(0)
    }

    fn span(&mut self, image: &TcmallocImage, span: &ImageSpan) -> Address {
        let objects = self.link(&span.objects);
        let refcount = image
            .block_count(span)
            .saturating_sub(span.objects.len() as u64);
        self.alloc(Value::structure([
            ("start", Value::Int(span.start_page)),
            ("length", Value::Int(span.num_pages)),
            ("next", Value::Ptr(0)),
            ("prev", Value::Ptr(0)),
            ("objects", Value::Ptr(objects)),
            ("refcount", Value::Int(refcount)),
            ("sizeclass", Value::Int(span.size_class.into())),
            ("location", Value::Int(span.location.to_raw())),
            ("sample", Value::Int(span.sample.into())),
        ]))
    }

    fn page_heap(&mut self, image: &TcmallocImage) -> Address {
        let leaf_len = 1usize << LEAF_BITS;
        let interior_len = 1usize << INTERIOR_BITS;

        // (root index, interior index) -> leaf values
        let mut leaves: BTreeMap<(usize, usize), Vec<Value>> = BTreeMap::new();
        for span in &image.spans {
            let addr = self.span(image, span);
            for page in span.start_page..span.start_page.saturating_add(span.num_pages.max(1)) {
                if page >> MAP_BITS != 0 {
                    continue;
                }
                let page = page as usize;
                let key = (
                    page >> (INTERIOR_BITS + LEAF_BITS),
                    (page >> LEAF_BITS) & (interior_len - 1),
                );
                let values = leaves
                    .entry(key)
                    .or_insert_with(|| vec![Value::Ptr(0); leaf_len]);
                values[page & (leaf_len - 1)] = Value::Ptr(addr);
            }
        }

        let mut nodes: BTreeMap<usize, Vec<Value>> = BTreeMap::new();
        for ((i, j), values) in leaves {
            let leaf = self.alloc(Value::structure([("values", Value::Array(values))]));
            nodes
                .entry(i)
                .or_insert_with(|| vec![Value::Ptr(0); interior_len])[j] = Value::Ptr(leaf);
        }

        let mut root = vec![Value::Ptr(0); interior_len];
        for (i, ptrs) in nodes {
            root[i] = Value::Ptr(self.alloc(Value::structure([("ptrs", Value::Array(ptrs))])));
        }
        let root = self.alloc(Value::structure([("ptrs", Value::Array(root))]));

        self.alloc(Value::structure([(
            "pagemap_",
            Value::structure([("root_", Value::Ptr(root))]),
        )]))
    }

    /// Lay out the thread caches back to front, returning the first one.
    fn thread_caches(&mut self, threads: &[Vec<FreeList>]) -> Address {
        let mut next = 0;
        for lists in threads.iter().rev() {
            let lists = lists
                .iter()
                .map(|list| {
                    let head = self.link(&list.nodes);
                    Value::structure([
                        (
                            "length_",
                            Value::Int(list.length.unwrap_or(list.nodes.len() as u64)),
                        ),
                        ("list_", Value::Ptr(head)),
                    ])
                })
                .collect::<Vec<_>>();
            next = self.alloc(Value::structure([
                ("list_", Value::Array(lists)),
                ("next_", Value::Ptr(next)),
            ]));
        }
        next
    }

    fn central_list(&mut self, list: &CentralList) -> Value {
        let len = TC_SLOTS.max(list.slots.len());
        let mut slots = Vec::with_capacity(len);
        for nodes in &list.slots {
            let head = self.link(nodes);
            let tail = nodes.last().copied().unwrap_or(0);
            slots.push(Value::structure([
                ("head", Value::Ptr(head)),
                ("tail", Value::Ptr(tail)),
            ]));
        }
        slots.resize(
            len,
            Value::structure([("head", Value::Ptr(0)), ("tail", Value::Ptr(0))]),
        );

        let used = list
            .used_slots
            .unwrap_or_else(|| list.slots.iter().filter(|nodes| !nodes.is_empty()).count() as u64);
        Value::structure([
            ("used_slots_", Value::Int(used)),
            ("tc_slots_", Value::Array(slots)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::{Inspector, Memory};

    #[test]
    fn page_map_places_spans_by_page_id() {
        let mut image = TcmallocImage::new(13, [0, 8]);
        image.span(ImageSpan::large((3 << 23) | (5 << 11) | 7, 2));
        let snapshot = image.build();

        let pageheap = snapshot.global("tcmalloc::Static::pageheap_").unwrap();
        let pageheap = snapshot.deref(&pageheap).unwrap();
        let root = snapshot.field(&pageheap, "pagemap_").unwrap();
        let root = snapshot.deref(&snapshot.field(&root, "root_").unwrap()).unwrap();
        let node = snapshot.element(&snapshot.field(&root, "ptrs").unwrap(), 3).unwrap();
        let node = snapshot.deref(&node).unwrap();
        let leaf = snapshot.element(&snapshot.field(&node, "ptrs").unwrap(), 5).unwrap();
        let leaf = snapshot.deref(&leaf).unwrap();
        let values = snapshot.field(&leaf, "values").unwrap();

        let first = snapshot.element(&values, 7).unwrap();
        assert_ne!(first, Value::Ptr(0));
        assert_eq!(snapshot.element(&values, 8).unwrap(), first);
        assert_eq!(snapshot.element(&values, 9).unwrap(), Value::Ptr(0));
    }

    #[test]
    fn thread_caches_are_chained() {
        let mut image = TcmallocImage::new(12, [0, 16]);
        image.thread_list(1, 1, [0x1000, 0x1010]);
        let snapshot = image.build();

        let head = snapshot.global("tcmalloc::ThreadCache::thread_heaps_").unwrap();
        let first = snapshot.deref(&head).unwrap();
        let second = snapshot.deref(&snapshot.field(&first, "next_").unwrap()).unwrap();
        assert_eq!(snapshot.as_u64(&snapshot.field(&second, "next_").unwrap()), Ok(0));

        let list = snapshot.element(&snapshot.field(&second, "list_").unwrap(), 1).unwrap();
        assert_eq!(snapshot.field(&list, "length_"), Ok(Value::Int(2)));
        assert_eq!(snapshot.field(&list, "list_"), Ok(Value::Ptr(0x1000)));
        assert_eq!(snapshot.read_pointer(0x1000), Ok(0x1010));
        assert_eq!(snapshot.read_pointer(0x1010), Ok(0));
    }
}
