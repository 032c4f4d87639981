//! Allocator constants needed to interpret every other structure: the page
//! size and the size-class table.

use alloc::vec::Vec;

use crate::inspect::{self, Inspector, Symbols};
use crate::{Address, Error};

/// The size map member holding the block size of each size class.
const CLASS_TO_SIZE: &str = "class_to_size_";

/// The inspected allocator's configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    page_shift: u32,
    class_to_size: Vec<u64>,
}

impl Config {
    /// Create a configuration from a page shift and a size-class table.
    ///
    /// Index 0 of the table is the size class of undivided, large-object
    /// spans; its size is never consulted.
    pub fn new(page_shift: u32, class_to_size: impl IntoIterator<Item = u64>) -> Self {
        Config {
            page_shift,
            class_to_size: class_to_size.into_iter().collect(),
        }
    }

    /// Read the configuration out of the inspected process.
    pub(crate) fn parse<I>(inspector: &I, symbols: &Symbols) -> Result<Self, Error>
    where
        I: Inspector + ?Sized,
    {
        let page_shift = inspector.global(symbols.page_shift)?;
        let page_shift = inspector.as_u64(&page_shift)?;
        let page_shift = u32::try_from(page_shift)
            .ok()
            .filter(|shift| *shift < u64::BITS)
            .ok_or_else(|| {
                Error::Other(alloc::format!("implausible page shift {page_shift}"))
            })?;

        let sizemap = inspector.global(symbols.sizemap)?;
        let class_to_size = inspector.field(&sizemap, CLASS_TO_SIZE)?;
        let bounds = inspect::array_bounds(inspector, &class_to_size, CLASS_TO_SIZE)?;

        let mut sizes = Vec::new();
        sizes
            .try_reserve_exact(bounds.len())
            .map_err(|_| Error::OutOfMemory)?;
        for index in bounds.indices() {
            let size = inspector.element(&class_to_size, index)?;
            sizes.push(inspector.as_u64(&size)?);
        }

        log::debug!(
            "page shift {page_shift}, {} size classes",
            sizes.len()
        );
        Ok(Config {
            page_shift,
            class_to_size: sizes,
        })
    }

    /// Log2 of the allocator's page size.
    #[inline]
    pub fn page_shift(&self) -> u32 {
        self.page_shift
    }

    /// The allocator's page size in bytes.
    #[inline]
    pub fn page_size(&self) -> u64 {
        1 << self.page_shift
    }

    /// The number of size classes, including the reserved class 0.
    #[inline]
    pub fn num_classes(&self) -> usize {
        self.class_to_size.len()
    }

    /// The block size of `size_class`.
    ///
    /// Returns `None` for class 0, for classes beyond the table, and for
    /// classes whose recorded size is zero: none of those subdivide a span.
    #[inline]
    pub fn class_to_size(&self, size_class: u32) -> Option<u64> {
        if size_class == 0 {
            return None;
        }
        self.class_to_size
            .get(size_class as usize)
            .copied()
            .filter(|size| *size != 0)
    }

    /// The page id containing `addr`.
    #[inline]
    pub fn page_of(&self, addr: Address) -> u64 {
        addr >> self.page_shift
    }

    /// The first address of page `page`.
    #[inline]
    pub fn page_addr(&self, page: u64) -> Address {
        page << self.page_shift
    }

    /// The number of bytes in `pages` pages.
    #[inline]
    pub fn pages_to_bytes(&self, pages: u64) -> u64 {
        pages << self.page_shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{Snapshot, Value};

    #[test]
    fn parse_reads_page_shift_and_classes() {
        let snapshot = Snapshot::new()
            .with_global("kPageShift", Value::Int(13))
            .with_global(
                "tcmalloc::Static::sizemap_",
                Value::structure([(
                    "class_to_size_",
                    Value::array([0, 8, 16, 32].map(Value::Int)),
                )]),
            );

        let config = Config::parse(&snapshot, &Symbols::GPERFTOOLS).unwrap();
        assert_eq!(config.page_shift(), 13);
        assert_eq!(config.page_size(), 8192);
        assert_eq!(config.num_classes(), 4);
        assert_eq!(config.class_to_size(0), None);
        assert_eq!(config.class_to_size(3), Some(32));
        assert_eq!(config.class_to_size(4), None);
    }

    #[test]
    fn missing_page_shift_is_fatal() {
        let snapshot = Snapshot::new();
        assert_eq!(
            Config::parse(&snapshot, &Symbols::GPERFTOOLS),
            Err(Error::Symbol("kPageShift".into()))
        );
    }

    #[test]
    fn class_table_must_be_an_array() {
        let snapshot = Snapshot::new()
            .with_global("kPageShift", Value::Int(12))
            .with_global(
                "tcmalloc::Static::sizemap_",
                Value::structure([("class_to_size_", Value::Int(8))]),
            );
        assert_eq!(
            Config::parse(&snapshot, &Symbols::GPERFTOOLS),
            Err(Error::NotAnArray("class_to_size_".into()))
        );
    }

    #[test]
    fn page_conversions() {
        let config = Config::new(12, [0, 32]);
        assert_eq!(config.page_of(0xA400), 0xA);
        assert_eq!(config.page_addr(0xA), 0xA000);
        assert_eq!(config.pages_to_bytes(2), 0x2000);
    }
}
