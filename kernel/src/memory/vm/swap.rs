// Copyright 2025 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the swap table, the registry of page-sized slots
//! on the raw swap device.
//!
//! The swap device is divided into slots of
//! [`SECTORS_PER_SLOT`] contiguous sectors, each able to hold
//! one evicted page. A bitmap records which slots are
//! available; slot contents are only meaningful between the
//! swap-out that filled them and the swap-in (or page
//! teardown) that releases them.

use alloc::boxed::Box;
use bitmap_index::Bitmap;
use memory::constants::PAGE_SIZE;
use storage::block;
use storage::block::{Device, SECTOR_SIZE};

/// The number of device sectors in one swap slot.
///
pub const SECTORS_PER_SLOT: usize = PAGE_SIZE / SECTOR_SIZE;

/// Identifies one page-sized slot on the swap device.
///
/// Slot `i` occupies sectors `i * SECTORS_PER_SLOT` up to (but
/// not including) `(i + 1) * SECTORS_PER_SLOT`.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SwapSlot(usize);

impl SwapSlot {
    /// Returns the slot's index.
    ///
    pub fn index(self) -> usize {
        self.0
    }

    // first_sector returns the device sector at which the
    // slot's contents begin.
    //
    fn first_sector(self) -> usize {
        self.0 * SECTORS_PER_SLOT
    }
}

/// The registry of swap slots on the raw swap device.
///
pub struct SwapTable {
    disk: Box<dyn Device + Send>,

    // available records, for each slot, whether it is free
    // for use. All slots start available.
    //
    available: Bitmap,
}

impl SwapTable {
    /// Returns a swap table managing the given raw device.
    ///
    /// Any trailing sectors that do not make up a whole slot
    /// are unused.
    ///
    pub fn new(disk: Box<dyn Device + Send>) -> Self {
        let num_slots = disk.num_sectors() / SECTORS_PER_SLOT;
        SwapTable {
            disk,
            available: Bitmap::new_set(num_slots),
        }
    }

    /// Returns the number of slots on the swap device.
    ///
    pub fn num_slots(&self) -> usize {
        self.available.len()
    }

    /// Returns the number of slots currently holding an
    /// evicted page.
    ///
    pub fn slots_in_use(&self) -> usize {
        self.available.num_unset()
    }

    /// Claims the first available slot, or returns `None` if
    /// the swap device is full.
    ///
    pub fn allocate(&mut self) -> Option<SwapSlot> {
        let index = self.available.next_set()?;
        self.available.unset(index);
        Some(SwapSlot(index))
    }

    /// Releases a slot claimed by [`allocate`](SwapTable::allocate),
    /// making it available again.
    ///
    /// # Panics
    ///
    /// `release` will panic if the slot is already available,
    /// which means two pages believed they owned it.
    ///
    pub fn release(&mut self, slot: SwapSlot) {
        if self.available.get(slot.0) {
            panic!("swap slot {} released while available", slot.0);
        }

        self.available.set(slot.0);
    }

    /// Writes one page of memory into the given slot.
    ///
    /// # Panics
    ///
    /// `write_page` will panic if `bytes` is not exactly one
    /// page.
    ///
    pub fn write_page(&mut self, slot: SwapSlot, bytes: &[u8]) -> Result<(), block::Error> {
        assert_eq!(bytes.len(), PAGE_SIZE, "swap transfers whole pages");

        let first = slot.first_sector();
        for i in 0..SECTORS_PER_SLOT {
            let chunk = &bytes[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE];
            self.disk.write(first + i, chunk)?;
        }

        Ok(())
    }

    /// Reads one page of memory back out of the given slot.
    ///
    /// # Panics
    ///
    /// `read_page` will panic if `bytes` is not exactly one
    /// page.
    ///
    pub fn read_page(&mut self, slot: SwapSlot, bytes: &mut [u8]) -> Result<(), block::Error> {
        assert_eq!(bytes.len(), PAGE_SIZE, "swap transfers whole pages");

        let first = slot.first_sector();
        for i in 0..SECTORS_PER_SLOT {
            let chunk = &mut bytes[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE];
            self.disk.read(first + i, chunk)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::block::ram::RamDisk;

    #[test]
    fn test_slot_allocation() {
        // 20 sectors make two whole slots; the rest are
        // unused.
        let mut swap = SwapTable::new(Box::new(RamDisk::new(2 * SECTORS_PER_SLOT + 4)));
        assert_eq!(swap.num_slots(), 2);
        assert_eq!(swap.slots_in_use(), 0);

        let first = swap.allocate().unwrap();
        let second = swap.allocate().unwrap();
        assert_eq!(first.index(), 0);
        assert_eq!(second.index(), 1);
        assert_eq!(swap.allocate(), None);
        assert_eq!(swap.slots_in_use(), 2);

        // Released slots are handed out again, lowest
        // first.
        swap.release(first);
        assert_eq!(swap.slots_in_use(), 1);
        assert_eq!(swap.allocate(), Some(first));
    }

    #[test]
    fn test_page_round_trip() {
        let mut swap = SwapTable::new(Box::new(RamDisk::new(4 * SECTORS_PER_SLOT)));
        let slot = swap.allocate().unwrap();

        let mut page = [0u8; PAGE_SIZE];
        for (i, byte) in page.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }

        swap.write_page(slot, &page).unwrap();

        let mut back = [0u8; PAGE_SIZE];
        swap.read_page(slot, &mut back).unwrap();
        assert_eq!(&page[..], &back[..]);
    }

    #[test]
    #[should_panic]
    fn test_double_release() {
        let mut swap = SwapTable::new(Box::new(RamDisk::new(SECTORS_PER_SLOT)));
        let slot = swap.allocate().unwrap();
        swap.release(slot);
        swap.release(slot);
    }
}
