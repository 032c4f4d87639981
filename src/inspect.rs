//! The capabilities this crate needs from whatever is doing the inspecting: a
//! debugger, a core-dump reader, or an in-memory [`Snapshot`].
//!
//! [`Snapshot`]: crate::snapshot::Snapshot

use alloc::{string::ToString, vec::Vec};
use core::ops::{Range, RangeInclusive};

use crate::{Address, Error};

/// Raw access to the inspected process's memory.
pub trait Memory {
    /// Read `buf.len()` bytes starting at `addr`.
    ///
    /// Implementations must fill all of `buf` or return an error; partial
    /// reads are not a thing.
    fn read(&self, addr: Address, buf: &mut [u8]) -> Result<(), Error>;

    /// Read a pointer-sized link stored at `addr`.
    ///
    /// The default implementation reads a 64-bit little-endian word.
    #[inline]
    fn read_pointer(&self, addr: Address) -> Result<Address, Error> {
        let mut bytes = [0; 8];
        self.read(addr, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }
}

/// Typed access to the inspected process: resolving globals, reading struct
/// fields and array elements, and following pointers.
///
/// This is modeled after the way a debugger exposes values described by debug
/// info. `Value`s are opaque handles; the engine never looks inside them other
/// than through these methods.
///
/// Errors returned from these methods abort [`Heap::init`]. Implementations
/// should prefer the specific [`Error`] variants (for example
/// [`Error::Symbol`] for an unknown global and [`Error::Field`] for an unknown
/// member) so that the reason surfaces intact.
///
/// [`Heap::init`]: crate::Heap::init
pub trait Inspector: Memory {
    /// A typed value in the inspected process.
    type Value: Clone;

    /// Resolve the global variable `name`.
    fn global(&self, name: &str) -> Result<Self::Value, Error>;

    /// Get the member called `name` of the struct `value`.
    fn field(&self, value: &Self::Value, name: &str) -> Result<Self::Value, Error>;

    /// Is `value` an array?
    fn is_array(&self, value: &Self::Value) -> bool;

    /// The declared bounds of the array `value`, if they can be determined.
    fn array_bounds(&self, value: &Self::Value) -> Option<ArrayBounds>;

    /// Get the element at `index` of the array `value`.
    fn element(&self, value: &Self::Value, index: i64) -> Result<Self::Value, Error>;

    /// Reinterpret `value` as the named type, for example a `void*` as a
    /// pointer to a struct, or a derived class as one of its bases.
    fn cast(&self, value: &Self::Value, type_name: &str) -> Result<Self::Value, Error>;

    /// Follow the pointer `value` to the value it points to.
    fn deref(&self, value: &Self::Value) -> Result<Self::Value, Error>;

    /// Get `value` as an integer, or as an address if it is a pointer.
    fn as_u64(&self, value: &Self::Value) -> Result<u64, Error>;
}

/// The inclusive bounds of an array, as declared in debug info.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArrayBounds {
    /// The lowest valid index.
    pub low: i64,
    /// The highest valid index.
    pub high: i64,
}

impl ArrayBounds {
    /// Bounds of a zero-based array of `len` elements.
    #[inline]
    pub fn with_len(len: usize) -> Self {
        ArrayBounds {
            low: 0,
            high: len as i64 - 1,
        }
    }

    /// The number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        if self.high < self.low {
            0
        } else {
            (self.high - self.low + 1) as usize
        }
    }

    /// Whether there are no elements at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every valid index, in ascending order.
    #[inline]
    pub fn indices(&self) -> RangeInclusive<i64> {
        self.low..=self.high
    }
}

/// A sink for the memory regions that the engine discovers to be owned by the
/// heap.
///
/// Wider tooling uses this to classify the segments of the inspected process.
pub trait SegmentRegistry {
    /// Record that `range` holds tcmalloc heap memory.
    fn heap_segment(&mut self, range: Range<Address>);
}

/// Discards every segment.
impl SegmentRegistry for () {
    #[inline]
    fn heap_segment(&mut self, _range: Range<Address>) {}
}

/// Collects every segment, in discovery order.
impl SegmentRegistry for Vec<Range<Address>> {
    #[inline]
    fn heap_segment(&mut self, range: Range<Address>) {
        self.push(range);
    }
}

/// The names of the allocator globals and types that the engine looks up.
///
/// Member names are fixed by the supported allocator version; globals and the
/// types that pointers get cast to vary with how the allocator was built (most
/// notably the page map's bit width), so they are configurable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbols {
    /// `static const size_t kPageShift`.
    pub page_shift: &'static str,
    /// The size map holding `class_to_size_`.
    pub sizemap: &'static str,
    /// `PageHeap*` owning the page map.
    pub pageheap: &'static str,
    /// Pointer type of a page-map leaf.
    pub leaf_type: &'static str,
    /// Pointer type of a span.
    pub span_type: &'static str,
    /// Head of the linked list of every thread cache.
    pub thread_heaps: &'static str,
    /// Array of padded central free lists, one per size class.
    pub central_cache: &'static str,
    /// The unpadded base class of each `central_cache` element.
    pub central_free_list_type: &'static str,
}

impl Symbols {
    /// The names used by gperftools' tcmalloc on 64-bit targets.
    pub const GPERFTOOLS: Symbols = Symbols {
        page_shift: "kPageShift",
        sizemap: "tcmalloc::Static::sizemap_",
        pageheap: "tcmalloc::Static::pageheap_",
        leaf_type: "TCMalloc_PageMap3<35>::Leaf*",
        span_type: "tcmalloc::Span*",
        thread_heaps: "tcmalloc::ThreadCache::thread_heaps_",
        central_cache: "tcmalloc::Static::central_cache_",
        central_free_list_type: "tcmalloc::CentralFreeList",
    };
}

impl Default for Symbols {
    #[inline]
    fn default() -> Self {
        Symbols::GPERFTOOLS
    }
}

/// Get the bounds of the array `value`, which is called `name` for error
/// reporting.
pub(crate) fn array_bounds<I>(
    inspector: &I,
    value: &I::Value,
    name: &str,
) -> Result<ArrayBounds, Error>
where
    I: Inspector + ?Sized,
{
    if !inspector.is_array(value) {
        return Err(Error::NotAnArray(name.to_string()));
    }
    inspector
        .array_bounds(value)
        .ok_or_else(|| Error::UnknownBounds(name.to_string()))
}

/// Read the integer or pointer member `name` of `value`.
pub(crate) fn field_u64<I>(inspector: &I, value: &I::Value, name: &str) -> Result<u64, Error>
where
    I: Inspector + ?Sized,
{
    let field = inspector.field(value, name)?;
    inspector.as_u64(&field)
}
