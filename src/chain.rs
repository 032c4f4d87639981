//! Bounded traversal of singly-linked free lists in the inspected process.
//!
//! Every tcmalloc free list threads its `next` link through the first word of
//! each free block. The inspected heap may be corrupt, so a traversal never
//! trusts recorded lengths, always has a step limit, and stops (rather than
//! failing) on an unreadable link.

use crate::{Address, Memory};

/// Why a [`Chain`] stopped yielding nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Stop {
    /// Reached a null link.
    End,
    /// Yielded the designated tail node.
    Tail,
    /// There were more nodes than the step limit allows.
    Limit,
    /// The link stored in this node could not be read.
    Unreadable(Address),
}

/// An iterator over the node addresses of a linked list.
pub(crate) struct Chain<'a, M>
where
    M: Memory + ?Sized,
{
    memory: &'a M,
    next: Address,
    tail: Option<Address>,
    limit: usize,
    visited: usize,
    stop: Option<Stop>,
}

impl<'a, M> Chain<'a, M>
where
    M: Memory + ?Sized,
{
    /// Walk the list starting at `head`, yielding at most `limit` nodes.
    pub(crate) fn new(memory: &'a M, head: Address, limit: usize) -> Self {
        Chain {
            memory,
            next: head,
            tail: None,
            limit,
            visited: 0,
            stop: None,
        }
    }

    /// Stop after yielding `tail`, without following its link.
    pub(crate) fn until(mut self, tail: Address) -> Self {
        self.tail = Some(tail);
        self
    }

    /// The number of nodes yielded so far.
    pub(crate) fn visited(&self) -> usize {
        self.visited
    }

    /// Why the traversal stopped, or `None` if it has not stopped yet.
    pub(crate) fn stop(&self) -> Option<Stop> {
        self.stop
    }
}

impl<M> Iterator for Chain<'_, M>
where
    M: Memory + ?Sized,
{
    type Item = Address;

    fn next(&mut self) -> Option<Address> {
        if self.stop.is_some() {
            return None;
        }
        if self.next == 0 {
            self.stop = Some(Stop::End);
            return None;
        }
        if self.visited == self.limit {
            self.stop = Some(Stop::Limit);
            return None;
        }

        let node = self.next;
        self.visited += 1;
        if self.tail == Some(node) {
            self.stop = Some(Stop::Tail);
        } else {
            match self.memory.read_pointer(node) {
                Ok(next) => self.next = next,
                Err(_) => self.stop = Some(Stop::Unreadable(node)),
            }
        }
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;
    use alloc::vec::Vec;

    fn linked(nodes: &[Address]) -> Snapshot {
        let mut snapshot = Snapshot::new();
        for pair in nodes.windows(2) {
            snapshot.write_pointer(pair[0], pair[1]);
        }
        if let Some(last) = nodes.last() {
            snapshot.write_pointer(*last, 0);
        }
        snapshot
    }

    #[test]
    fn walks_to_null() {
        let snapshot = linked(&[0x1000, 0x1020, 0x1040]);
        let mut chain = Chain::new(&snapshot, 0x1000, 16);
        let nodes: Vec<_> = chain.by_ref().collect();
        assert_eq!(nodes, [0x1000, 0x1020, 0x1040]);
        assert_eq!(chain.stop(), Some(Stop::End));
        assert_eq!(chain.visited(), 3);
    }

    #[test]
    fn stops_at_tail() {
        let snapshot = linked(&[0x1000, 0x1020, 0x1040]);
        let mut chain = Chain::new(&snapshot, 0x1000, 16).until(0x1020);
        let nodes: Vec<_> = chain.by_ref().collect();
        assert_eq!(nodes, [0x1000, 0x1020]);
        assert_eq!(chain.stop(), Some(Stop::Tail));
    }

    #[test]
    fn cycle_hits_the_limit() {
        let mut snapshot = linked(&[0x1000, 0x1020]);
        snapshot.write_pointer(0x1020, 0x1000);
        let mut chain = Chain::new(&snapshot, 0x1000, 5);
        assert_eq!(chain.by_ref().count(), 5);
        assert_eq!(chain.stop(), Some(Stop::Limit));
    }

    #[test]
    fn exactly_limit_nodes_is_not_too_many() {
        let snapshot = linked(&[0x1000, 0x1020]);
        let mut chain = Chain::new(&snapshot, 0x1000, 2);
        assert_eq!(chain.by_ref().count(), 2);
        assert_eq!(chain.stop(), Some(Stop::End));
    }

    #[test]
    fn unreadable_link_truncates() {
        let mut snapshot = Snapshot::new();
        snapshot.write_pointer(0x1000, 0x2000);
        let mut chain = Chain::new(&snapshot, 0x1000, 16);
        let nodes: Vec<_> = chain.by_ref().collect();
        assert_eq!(nodes, [0x1000, 0x2000]);
        assert_eq!(chain.stop(), Some(Stop::Unreadable(0x2000)));
    }
}
