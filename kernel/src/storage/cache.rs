// Copyright 2025 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the write-back sector cache.
//!
//! A [`BlockCache`] sits between the file system and its block
//! device. Reads are served from the cache where possible and
//! writes are absorbed by it entirely: a write dirties a cache
//! entry and the sector only reaches the device when the entry
//! is evicted or the cache is [flushed](BlockCache::flush_all).
//!
//! The cache holds [`CACHE_SLOTS`] entries and is fully
//! serialised by a single lock, which is held across device
//! I/O. Eviction is second-chance: a persistent clock hand
//! sweeps the slots, giving each recently-used entry one
//! round of grace before it is reclaimed.

use crate::block::{Device, Error, SECTOR_SIZE};
use alloc::boxed::Box;
use spin::{lock, Mutex};

/// The number of sectors the cache can hold at once.
///
pub const CACHE_SLOTS: usize = 64;

// A single cache slot.
//
#[derive(Clone, Copy)]
struct CacheEntry {
    // occupied indicates whether this slot holds a
    // sector at all; the other fields are meaningless
    // when it is false.
    //
    occupied: bool,

    // sector is the device sector this slot holds.
    //
    sector: usize,

    // accessed is set on every hit and cleared by the
    // clock hand as it sweeps past.
    //
    accessed: bool,

    // dirty indicates that this slot is the authoritative
    // copy of its sector: it must be written back before
    // the slot is reused.
    //
    dirty: bool,

    // data is the cached sector contents.
    //
    data: [u8; SECTOR_SIZE],
}

const EMPTY_ENTRY: CacheEntry = CacheEntry {
    occupied: false,
    sector: 0,
    accessed: false,
    dirty: false,
    data: [0u8; SECTOR_SIZE],
};

// The cache state, all guarded by one lock.
//
struct CacheState {
    disk: Box<dyn Device + Send>,
    entries: [CacheEntry; CACHE_SLOTS],

    // hand is the persistent cursor of the second-chance
    // sweep. It survives between evictions so that each
    // sweep resumes where the last one stopped.
    //
    hand: usize,
}

/// A write-back cache of device sectors.
///
pub struct BlockCache {
    inner: Mutex<CacheState>,
}

impl BlockCache {
    /// Returns an empty cache in front of the given device.
    ///
    pub fn new(disk: Box<dyn Device + Send>) -> Self {
        BlockCache {
            inner: Mutex::new(CacheState {
                disk,
                entries: [EMPTY_ENTRY; CACHE_SLOTS],
                hand: 0,
            }),
        }
    }

    /// Populates `buf` with the contents of the given sector,
    /// reading it from the device only on a cache miss.
    ///
    /// `buf` must be exactly [`SECTOR_SIZE`] bytes long.
    ///
    pub fn read(&self, sector: usize, buf: &mut [u8]) -> Result<(), Error> {
        if buf.len() != SECTOR_SIZE {
            return Err(Error::InvalidBuffer);
        }

        let mut state = lock!(self.inner);
        if sector >= state.disk.num_sectors() {
            return Err(Error::OutOfRange);
        }

        let slot = match state.find(sector) {
            Some(slot) => slot,
            None => {
                // Cache miss: fetch the sector from the
                // device into a free slot. The slot is only
                // marked occupied once the read has succeeded.
                let slot = state.take_slot()?;
                let CacheState { disk, entries, .. } = &mut *state;
                disk.read(sector, &mut entries[slot].data)?;

                let entry = &mut entries[slot];
                entry.occupied = true;
                entry.sector = sector;
                entry.dirty = false;
                slot
            }
        };

        buf.copy_from_slice(&state.entries[slot].data);
        state.entries[slot].accessed = true;
        Ok(())
    }

    /// Writes `buf` to the given sector in the cache.
    ///
    /// No device I/O happens here, even on a cache miss: the
    /// sector is written out when its entry is next evicted
    /// or the cache is flushed. Until then the cache entry is
    /// the authoritative copy of the sector.
    ///
    /// `buf` must be exactly [`SECTOR_SIZE`] bytes long.
    ///
    pub fn write(&self, sector: usize, buf: &[u8]) -> Result<(), Error> {
        if buf.len() != SECTOR_SIZE {
            return Err(Error::InvalidBuffer);
        }

        let mut state = lock!(self.inner);
        if sector >= state.disk.num_sectors() {
            return Err(Error::OutOfRange);
        }

        let slot = match state.find(sector) {
            Some(slot) => slot,
            None => {
                // The whole sector is being replaced, so
                // there is no need to read the old contents
                // from the device.
                let slot = state.take_slot()?;
                let entry = &mut state.entries[slot];
                entry.occupied = true;
                entry.sector = sector;
                slot
            }
        };

        let entry = &mut state.entries[slot];
        entry.data.copy_from_slice(buf);
        entry.accessed = true;
        entry.dirty = true;
        Ok(())
    }

    /// Writes every dirty entry back to the device and empties
    /// the cache, such as during an orderly shutdown.
    ///
    pub fn flush_all(&self) -> Result<(), Error> {
        let mut state = lock!(self.inner);
        for slot in 0..CACHE_SLOTS {
            if state.entries[slot].occupied {
                state.evict(slot)?;
            }
        }

        Ok(())
    }

    /// Returns the number of occupied cache slots.
    ///
    pub fn num_cached(&self) -> usize {
        let state = lock!(self.inner);
        state.entries.iter().filter(|e| e.occupied).count()
    }
}

impl CacheState {
    // find returns the slot holding the given sector,
    // or None.
    //
    fn find(&self, sector: usize) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.occupied && e.sector == sector)
    }

    // take_slot returns a slot that is ready to receive a
    // new sector, evicting an old one if necessary.
    //
    fn take_slot(&mut self) -> Result<usize, Error> {
        if let Some(slot) = self.entries.iter().position(|e| !e.occupied) {
            return Ok(slot);
        }

        // Every slot is occupied, so run the clock hand:
        // entries that have been used since the last sweep
        // lose their accessed bit and are spared; the first
        // entry without it is the victim. Clearing as we go
        // guarantees the sweep terminates within two rounds.
        loop {
            let slot = self.hand;
            self.hand = (self.hand + 1) % CACHE_SLOTS;

            if self.entries[slot].accessed {
                self.entries[slot].accessed = false;
            } else {
                self.evict(slot)?;
                return Ok(slot);
            }
        }
    }

    // evict writes the slot back to the device if it is
    // dirty, then marks it unoccupied.
    //
    fn evict(&mut self, slot: usize) -> Result<(), Error> {
        if self.entries[slot].dirty {
            let CacheState { disk, entries, .. } = &mut *self;
            disk.write(entries[slot].sector, &entries[slot].data)?;
            self.entries[slot].dirty = false;
        }

        self.entries[slot].occupied = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ram::RamDisk;

    fn sector_of(byte: u8) -> [u8; SECTOR_SIZE] {
        [byte; SECTOR_SIZE]
    }

    #[test]
    fn test_read_and_write() {
        let disk = RamDisk::new(16);
        let raw = disk.clone();
        let cache = BlockCache::new(Box::new(disk));

        // A write is visible to a subsequent read.
        cache.write(3, &sector_of(0x11)).unwrap();
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(3, &mut buf).unwrap();
        assert_eq!(buf, sector_of(0x11));

        // The write has not reached the device yet.
        let mut on_disk = [0u8; SECTOR_SIZE];
        raw.snapshot(3, &mut on_disk);
        assert!(on_disk.iter().all(|&b| b == 0));

        // Flushing pushes it out.
        cache.flush_all().unwrap();
        raw.snapshot(3, &mut on_disk);
        assert_eq!(on_disk, sector_of(0x11));
        assert_eq!(cache.num_cached(), 0);
    }

    #[test]
    fn test_read_misses_fill_the_cache() {
        let mut disk = RamDisk::new(4);
        disk.write(1, &sector_of(0x22)).unwrap();
        let cache = BlockCache::new(Box::new(disk));

        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(1, &mut buf).unwrap();
        assert_eq!(buf, sector_of(0x22));
        assert_eq!(cache.num_cached(), 1);

        // A second read is served from the cache even if
        // the device contents change underneath it.
        cache.read(1, &mut buf).unwrap();
        assert_eq!(buf, sector_of(0x22));
    }

    #[test]
    fn test_eviction_writes_back() {
        // Write more sectors than the cache can hold, then
        // read them all back: every byte must survive the
        // evictions.
        let disk = RamDisk::new(2 * CACHE_SLOTS);
        let raw = disk.clone();
        let cache = BlockCache::new(Box::new(disk));

        for sector in 0..2 * CACHE_SLOTS {
            cache.write(sector, &sector_of(sector as u8)).unwrap();
        }
        assert_eq!(cache.num_cached(), CACHE_SLOTS);

        let mut buf = [0u8; SECTOR_SIZE];
        for sector in 0..2 * CACHE_SLOTS {
            cache.read(sector, &mut buf).unwrap();
            assert_eq!(buf, sector_of(sector as u8), "sector {}", sector);
        }

        // After a flush, the device holds every sector.
        cache.flush_all().unwrap();
        for sector in 0..2 * CACHE_SLOTS {
            raw.snapshot(sector, &mut buf);
            assert_eq!(buf, sector_of(sector as u8), "sector {}", sector);
        }
    }

    #[test]
    fn test_second_chance_prefers_cold_entries() {
        let disk = RamDisk::new(CACHE_SLOTS + 1);
        let cache = BlockCache::new(Box::new(disk));

        // Fill the cache with sectors 0..CACHE_SLOTS, then
        // clear their accessed bits by forcing one eviction.
        for sector in 0..CACHE_SLOTS {
            cache.write(sector, &sector_of(sector as u8)).unwrap();
        }

        // This miss sweeps the hand across every entry,
        // clearing accessed bits, and evicts slot 0.
        cache.write(CACHE_SLOTS, &sector_of(0xee)).unwrap();

        // Touch sector 1 so it is warm again, then force
        // another eviction: sector 1 must be spared and
        // sector 2 reclaimed instead.
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(1, &mut buf).unwrap();
        cache.write(0, &sector_of(0xdd)).unwrap();

        let state = lock!(cache.inner);
        assert!(state.find(1).is_some(), "warm sector was evicted");
        assert!(state.find(2).is_none(), "cold sector was spared");
    }

    #[test]
    fn test_bounds_are_checked_before_caching() {
        let cache = BlockCache::new(Box::new(RamDisk::new(4)));
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(cache.read(4, &mut buf), Err(Error::OutOfRange));
        assert_eq!(cache.write(9, &buf), Err(Error::OutOfRange));
        assert_eq!(cache.read(0, &mut buf[..10]), Err(Error::InvalidBuffer));
        assert_eq!(cache.num_cached(), 0);
    }
}
