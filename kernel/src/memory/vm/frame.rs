// Copyright 2025 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the frame table, the registry of assigned
//! physical frames.
//!
//! A frame has an entry here exactly while it backs a resident
//! user page. The table pairs an associative map, keyed by the
//! frame, with a queue recording insertion order; the queue is
//! what gives eviction its first-in, first-out victim policy.

use crate::ProcessId;
use alloc::collections::btree_map::{BTreeMap, Values};
use alloc::collections::VecDeque;
use memory::{PhysFrame, VirtPage};

/// Records the assignment of one physical frame to one user
/// page of one process.
///
#[derive(Clone, Copy, Debug)]
pub struct FrameTableEntry {
    frame: PhysFrame,
    page: VirtPage,
    owner: ProcessId,
}

impl FrameTableEntry {
    /// Returns an entry recording that `frame` backs `page`
    /// in the process `owner`.
    ///
    pub fn new(frame: PhysFrame, page: VirtPage, owner: ProcessId) -> Self {
        FrameTableEntry { frame, page, owner }
    }

    /// Returns the physical frame.
    ///
    pub fn frame(&self) -> PhysFrame {
        self.frame
    }

    /// Returns the user page the frame backs.
    ///
    pub fn page(&self) -> VirtPage {
        self.page
    }

    /// Returns the process that owns the page.
    ///
    pub fn owner(&self) -> ProcessId {
        self.owner
    }
}

/// The registry of assigned physical frames.
///
pub struct FrameTable {
    entries: BTreeMap<PhysFrame, FrameTableEntry>,

    // queue holds the assigned frames in insertion order,
    // oldest first. Entries removed from the table are
    // lazily skipped when the queue is popped.
    //
    queue: VecDeque<PhysFrame>,
}

impl FrameTable {
    /// Returns an empty frame table.
    ///
    pub fn new() -> Self {
        FrameTable {
            entries: BTreeMap::new(),
            queue: VecDeque::new(),
        }
    }

    /// Records a new frame assignment.
    ///
    /// # Panics
    ///
    /// `insert` will panic if the frame is already assigned:
    /// a double assignment means the frame table and the page
    /// allocator have lost agreement.
    ///
    pub fn insert(&mut self, entry: FrameTableEntry) {
        let frame = entry.frame();
        if self.entries.insert(frame, entry).is_some() {
            panic!(
                "frame at {:#x} is already assigned",
                frame.start_address().as_usize()
            );
        }

        self.queue.push_back(frame);
    }

    /// Returns the entry for the given frame, if it is
    /// assigned.
    ///
    pub fn find(&self, frame: PhysFrame) -> Option<&FrameTableEntry> {
        self.entries.get(&frame)
    }

    /// Removes and returns the entry for the given frame, if
    /// it is assigned.
    ///
    pub fn remove(&mut self, frame: PhysFrame) -> Option<FrameTableEntry> {
        let entry = self.entries.remove(&frame);
        if entry.is_some() {
            self.queue.retain(|&f| f != frame);
        }

        entry
    }

    /// Removes and returns the oldest assigned frame, for use
    /// as an eviction victim, or `None` if no frames are
    /// assigned.
    ///
    pub fn pop_victim(&mut self) -> Option<FrameTableEntry> {
        while let Some(frame) = self.queue.pop_front() {
            if let Some(entry) = self.entries.remove(&frame) {
                return Some(entry);
            }
        }

        None
    }

    /// Returns the number of assigned frames.
    ///
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether no frames are assigned.
    ///
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the assigned frames, in frame address
    /// order.
    ///
    pub fn iter(&self) -> Values<'_, PhysFrame, FrameTableEntry> {
        self.entries.values()
    }
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory::{PhysAddr, VirtAddr};

    fn entry_for(frame: usize, page: usize, owner: ProcessId) -> FrameTableEntry {
        FrameTableEntry::new(
            PhysFrame::containing_address(PhysAddr::new(frame)),
            VirtPage::containing_address(VirtAddr::new(page)),
            owner,
        )
    }

    #[test]
    fn test_insert_find_remove() {
        let owner = ProcessId::new();
        let mut table = FrameTable::new();
        assert!(table.is_empty());

        table.insert(entry_for(0x1000, 0x40_0000, owner));
        table.insert(entry_for(0x2000, 0x40_1000, owner));
        assert_eq!(table.len(), 2);

        let frame = PhysFrame::containing_address(PhysAddr::new(0x1000));
        let found = table.find(frame).unwrap();
        assert_eq!(found.page().start_address(), VirtAddr::new(0x40_0000));
        assert_eq!(found.owner(), owner);

        let removed = table.remove(frame).unwrap();
        assert_eq!(removed.frame(), frame);
        assert_eq!(table.len(), 1);
        assert!(table.find(frame).is_none());
        assert!(table.remove(frame).is_none());
    }

    #[test]
    fn test_victims_leave_in_insertion_order() {
        let owner = ProcessId::new();
        let mut table = FrameTable::new();
        for i in 0..4 {
            table.insert(entry_for(0x1000 * (i + 1), 0x40_0000 + 0x1000 * i, owner));
        }

        // Removing an entry must not disturb the order of
        // the others, even though it was next in line.
        let first = PhysFrame::containing_address(PhysAddr::new(0x1000));
        table.remove(first).unwrap();

        let victims: alloc::vec::Vec<usize> = core::iter::from_fn(|| {
            table
                .pop_victim()
                .map(|e| e.frame().start_address().as_usize())
        })
        .collect();
        assert_eq!(victims, [0x2000, 0x3000, 0x4000]);
        assert!(table.pop_victim().is_none());
    }
}
