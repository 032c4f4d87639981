use alloc::string::String;
use core::fmt;

use crate::Address;

/// An error reconstructing or querying the heap.
///
/// Everything but [`Error::NotInitialized`] is fatal to [`Heap::init`]: the
/// rebuilt state would be untrustworthy as a whole, so none of it is kept.
/// Mere signs of corruption in the inspected heap (count mismatches, stray
/// free-list nodes, duplicate cached blocks) are not errors; they are logged
/// and the build carries on.
///
/// [`Heap::init`]: crate::Heap::init
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A required global symbol could not be resolved.
    Symbol(String),

    /// A value has no field with the given name.
    Field(String),

    /// A value that should be an array is not one.
    NotAnArray(String),

    /// The bounds of an array could not be determined.
    UnknownBounds(String),

    /// An attempt to dereference a null pointer.
    NullPointer,

    /// A read of the inspected process's memory failed.
    Unreadable(Address),

    /// A value was not of the scalar or pointer shape required.
    NotScalar,

    /// A free-list chain was longer than its traversal limit
    /// ([`MAX_CHAIN_NODES`] for transfer slots, [`MAX_THREAD_LIST_NODES`] for
    /// thread-cache lists), which means the chain is corrupt or cyclic.
    ///
    /// [`MAX_CHAIN_NODES`]: crate::MAX_CHAIN_NODES
    /// [`MAX_THREAD_LIST_NODES`]: crate::MAX_THREAD_LIST_NODES
    ChainTooLong {
        /// Where the chain starts.
        head: Address,
        /// The traversal limit that was exceeded.
        limit: usize,
    },

    /// Two allocator arrays indexed by size class disagree on the number of
    /// size classes.
    InconsistentClasses {
        /// The array whose length disagrees.
        what: &'static str,
        /// The number of size classes in the size map.
        expected: usize,
        /// The length of the disagreeing array.
        found: usize,
    },

    /// Growing one of the engine's tables failed.
    OutOfMemory,

    /// The span table is not sorted, or two spans overlap.
    UnsortedSpans {
        /// Index of the first span of the offending pair.
        index: usize,
    },

    /// A span's own page could not be found by a span lookup.
    SpanLookup(Address),

    /// The cached-block index is not sorted.
    UnsortedCachedBlocks {
        /// Index of the first address of the offending pair.
        index: usize,
    },

    /// A membership query against the cached-block index returned the wrong
    /// answer.
    CachedLookup(Address),

    /// The heap has not been successfully initialized.
    NotInitialized,

    /// An error reported by an [`Inspector`] implementation that does not fit
    /// any of the other variants.
    ///
    /// [`Inspector`]: crate::Inspector
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Symbol(name) => write!(f, "failed to look up global \"{name}\""),
            Error::Field(name) => write!(f, "failed to find member \"{name}\""),
            Error::NotAnArray(name) => write!(f, "unexpected: \"{name}\" is not an array"),
            Error::UnknownBounds(name) => write!(f, "could not determine \"{name}\" bounds"),
            Error::NullPointer => write!(f, "attempt to dereference a null pointer"),
            Error::Unreadable(addr) => write!(f, "failed to read memory at {addr:#x}"),
            Error::NotScalar => write!(f, "value is not a scalar or a pointer"),
            Error::ChainTooLong { head, limit } => {
                write!(f, "free list at {head:#x} is too long (> {limit} nodes)")
            }
            Error::InconsistentClasses {
                what,
                expected,
                found,
            } => write!(
                f,
                "inconsistent number of size classes: \"{what}\" has {found}, expected {expected}"
            ),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::UnsortedSpans { index } => {
                write!(f, "spans are not sorted properly at {index}")
            }
            Error::SpanLookup(addr) => write!(f, "failed to query span with address {addr:#x}"),
            Error::UnsortedCachedBlocks { index } => {
                write!(f, "cached blocks are not sorted properly at {index}")
            }
            Error::CachedLookup(addr) => write!(f, "wrong answer querying cached block {addr:#x}"),
            Error::NotInitialized => write!(f, "tcmalloc heap was not initialized successfully"),
            Error::Other(msg) => f.write_str(msg),
        }
    }
}

impl core::error::Error for Error {}
