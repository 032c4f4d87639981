//! The index of blocks that are free but parked in a cache: on a thread
//! cache's free list, or in a central free list's transfer slots.
//!
//! Such blocks are not on their span's own free-object list, so without this
//! index they would look allocated.

use alloc::vec::Vec;
use core::ops::Range;

use crate::chain::{Chain, Stop};
use crate::inspect::{self, Inspector, Symbols};
use crate::{Address, Config, Error, MAX_CHAIN_NODES};

// Member names of `ThreadCache`, and of its per-size-class `FreeList`.
const THREAD_LISTS: &str = "list_";
const THREAD_NEXT: &str = "next_";
const FREELIST_LENGTH: &str = "length_";
const FREELIST_HEAD: &str = "list_";

// Member names of `CentralFreeList`, and of its `TCEntry` transfer slots.
const USED_SLOTS: &str = "used_slots_";
const TC_SLOTS: &str = "tc_slots_";
const SLOT_HEAD: &str = "head";
const SLOT_TAIL: &str = "tail";

/// A sorted set of cached free-block addresses.
#[derive(Debug, Default)]
pub(crate) struct CachedBlocks {
    addrs: Vec<Address>,
}

impl CachedBlocks {
    /// Collect the blocks held by every thread cache and every central free
    /// list's transfer slots.
    pub(crate) fn parse<I>(inspector: &I, symbols: &Symbols, config: &Config) -> Result<Self, Error>
    where
        I: Inspector + ?Sized,
    {
        let mut builder = Builder {
            inspector,
            config,
            addrs: Vec::new(),
        };
        builder.thread_caches(symbols)?;
        builder.central_cache(symbols)?;

        let mut addrs = builder.addrs;
        addrs.sort_unstable();
        log::debug!("thread/central cached blocks {}", addrs.len());
        Ok(CachedBlocks { addrs })
    }

    /// Create the index from an arbitrary collection of addresses.
    #[cfg(test)]
    pub(crate) fn from_addrs(addrs: impl IntoIterator<Item = Address>) -> Self {
        let mut addrs: Vec<_> = addrs.into_iter().collect();
        addrs.sort_unstable();
        CachedBlocks { addrs }
    }

    /// The number of cached blocks, duplicates included.
    pub(crate) fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Is `addr` exactly the address of a cached block?
    pub(crate) fn contains(&self, addr: Address) -> bool {
        self.addrs.binary_search(&addr).is_ok()
    }

    /// Every cached block whose address falls within `range`, in ascending
    /// order.
    pub(crate) fn in_range(&self, range: Range<Address>) -> &[Address] {
        let start = self.addrs.partition_point(|addr| *addr < range.start);
        let len = self.addrs[start..].partition_point(|addr| *addr < range.end);
        &self.addrs[start..][..len]
    }

    /// Check that the index is sorted and that membership queries agree with
    /// its contents.
    ///
    /// Duplicates mean two caches claim the same block. That is corruption in
    /// the inspected heap, not in the index, so it is only logged.
    pub(crate) fn verify(&self) -> Result<(), Error> {
        for (index, pair) in self.addrs.windows(2).enumerate() {
            if pair[0] > pair[1] {
                return Err(Error::UnsortedCachedBlocks { index });
            }
            if pair[0] == pair[1] {
                log::warn!("found duplicate cached blocks at {index}: {:#x}", pair[0]);
            }
        }

        for &addr in &self.addrs {
            if !self.contains(addr) {
                return Err(Error::CachedLookup(addr));
            }
            let Some(neighbor) = addr.checked_add(1) else {
                continue;
            };
            let after = self.addrs.partition_point(|other| *other <= addr);
            let is_member = self.addrs.get(after) == Some(&neighbor);
            if self.contains(neighbor) != is_member {
                return Err(Error::CachedLookup(neighbor));
            }
        }
        Ok(())
    }
}

struct Builder<'a, I>
where
    I: Inspector + ?Sized,
{
    inspector: &'a I,
    config: &'a Config,
    addrs: Vec<Address>,
}

impl<I> Builder<'_, I>
where
    I: Inspector + ?Sized,
{
    fn push(&mut self, addr: Address) -> Result<(), Error> {
        if self.addrs.len() == self.addrs.capacity() {
            let goal = if self.addrs.capacity() == 0 {
                crate::INITIAL_TABLE_CAPACITY
            } else {
                self.addrs.capacity() * 2
            };
            self.addrs
                .try_reserve_exact(goal - self.addrs.len())
                .map_err(|_| Error::OutOfMemory)?;
        }
        self.addrs.push(addr);
        Ok(())
    }

    /// Make sure an array indexed by size class has one entry per class.
    fn check_classes(&self, what: &'static str, found: usize) -> Result<(), Error> {
        let expected = self.config.num_classes();
        if found != expected {
            return Err(Error::InconsistentClasses {
                what,
                expected,
                found,
            });
        }
        Ok(())
    }

    /// Walk the linked list of thread caches.
    fn thread_caches(&mut self, symbols: &Symbols) -> Result<(), Error> {
        let inspector = self.inspector;
        let mut cache = inspector.global(symbols.thread_heaps)?;
        let mut threads = 0usize;

        while inspector.as_u64(&cache)? != 0 {
            let thread = inspector.deref(&cache)?;
            let lists = inspector.field(&thread, THREAD_LISTS)?;
            let bounds = inspect::array_bounds(inspector, &lists, THREAD_LISTS)?;
            self.check_classes(symbols.thread_heaps, bounds.len())?;

            for index in bounds.indices() {
                let list = inspector.element(&lists, index)?;
                self.thread_free_list(&list)?;
            }

            threads += 1;
            cache = inspector.field(&thread, THREAD_NEXT)?;
        }

        log::debug!("{threads} thread caches are found");
        Ok(())
    }

    /// Collect the blocks of a thread cache's free list for one size class.
    ///
    /// The recorded length is only used to bound the walk. One node beyond it
    /// is followed so that a list longer than recorded is noticed. The walk
    /// never goes past [`MAX_THREAD_LIST_NODES`], whatever the recorded length
    /// says; reaching that cap is fatal.
    ///
    /// [`MAX_THREAD_LIST_NODES`]: crate::MAX_THREAD_LIST_NODES
    fn thread_free_list(&mut self, list: &I::Value) -> Result<(), Error> {
        let inspector = self.inspector;
        let recorded = inspect::field_u64(inspector, list, FREELIST_LENGTH)?;
        let head = inspect::field_u64(inspector, list, FREELIST_HEAD)?;
        let limit = usize::try_from(recorded)
            .unwrap_or(usize::MAX)
            .saturating_add(1)
            .min(crate::MAX_THREAD_LIST_NODES);

        let mut chain = Chain::new(inspector, head, limit);
        for node in chain.by_ref() {
            self.push(node)?;
        }
        match chain.stop() {
            Some(Stop::Limit) if limit == crate::MAX_THREAD_LIST_NODES => {
                return Err(Error::ChainTooLong { head, limit });
            }
            Some(Stop::Unreadable(node)) => {
                log::warn!("Heap corruption: cannot read the free list link of {node:#x}");
            }
            _ => {}
        }

        let count = chain.visited() as u64;
        if count != recorded {
            log::warn!(
                "Heap corruption: ThreadCache::FreeList::length_ {recorded} \
                 while ThreadCache::FreeList::list_ {count}"
            );
        }
        Ok(())
    }

    /// Walk every size class's central free list.
    fn central_cache(&mut self, symbols: &Symbols) -> Result<(), Error> {
        let inspector = self.inspector;
        let central = inspector.global(symbols.central_cache)?;
        let bounds = inspect::array_bounds(inspector, &central, symbols.central_cache)?;
        self.check_classes(symbols.central_cache, bounds.len())?;

        for index in bounds.indices() {
            let padded = inspector.element(&central, index)?;
            let list = inspector.cast(&padded, symbols.central_free_list_type)?;
            self.central_free_list(&list)?;
        }
        Ok(())
    }

    /// Collect the blocks in one central free list's transfer slots.
    fn central_free_list(&mut self, list: &I::Value) -> Result<(), Error> {
        let inspector = self.inspector;
        let used_slots = inspect::field_u64(inspector, list, USED_SLOTS)?;
        let slots = inspector.field(list, TC_SLOTS)?;
        let bounds = inspect::array_bounds(inspector, &slots, TC_SLOTS)?;

        let mut nonempty = 0u64;
        for index in bounds.indices() {
            let slot = inspector.element(&slots, index)?;
            if self.transfer_slot(&slot)? {
                nonempty += 1;
            }
        }

        // A mismatch makes no block's status less certain: slot contents are
        // taken from the chains themselves, whatever the count says.
        if nonempty != used_slots {
            log::warn!(
                "Heap corruption: CentralFreeList records {used_slots} slots are used \
                 while tc_slots_ shows {nonempty}"
            );
        }
        Ok(())
    }

    /// Collect the batch of blocks in a transfer slot, returning whether the
    /// slot was in use.
    fn transfer_slot(&mut self, slot: &I::Value) -> Result<bool, Error> {
        let inspector = self.inspector;
        let head = inspect::field_u64(inspector, slot, SLOT_HEAD)?;
        let tail = inspect::field_u64(inspector, slot, SLOT_TAIL)?;

        let mut chain = Chain::new(inspector, head, MAX_CHAIN_NODES).until(tail);
        for node in chain.by_ref() {
            self.push(node)?;
        }
        match chain.stop() {
            Some(Stop::Limit) => {
                return Err(Error::ChainTooLong {
                    head,
                    limit: MAX_CHAIN_NODES,
                })
            }
            Some(Stop::Unreadable(node)) => {
                log::warn!("Heap corruption: cannot read the transfer slot link of {node:#x}");
            }
            Some(Stop::End) if chain.visited() > 0 => {
                log::warn!(
                    "Heap corruption: transfer slot starting at {head:#x} ends before its tail {tail:#x}"
                );
            }
            _ => {}
        }
        Ok(chain.visited() > 0)
    }
}
