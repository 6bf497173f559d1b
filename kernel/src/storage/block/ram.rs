// Copyright 2025 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements a block device backed by heap memory.
//!
//! A [`RamDisk`] is the storage device of the hosted kernel
//! configuration: the swap device and the file system volume
//! are both RAM disks. Clones of a `RamDisk` share the same
//! underlying sectors, so one handle can be wired into the
//! kernel while another is retained to inspect the "on-disk"
//! state, such as after a shutdown flush.

use crate::block::{Device, Error, Operations, SECTOR_SIZE};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::{lock, Mutex};

/// A block device backed by heap memory.
///
#[derive(Clone)]
pub struct RamDisk {
    sectors: Arc<Mutex<Vec<u8>>>,
    num_sectors: usize,
}

impl RamDisk {
    /// Returns a zero-filled RAM disk with the given number
    /// of sectors.
    ///
    pub fn new(num_sectors: usize) -> Self {
        RamDisk {
            sectors: Arc::new(Mutex::new(vec![0u8; num_sectors * SECTOR_SIZE])),
            num_sectors,
        }
    }

    /// Copies the given sector into `out` without going
    /// through the device interface, for inspection in
    /// diagnostics and tests.
    ///
    /// # Panics
    ///
    /// `snapshot` will panic if `sector` is beyond the end
    /// of the device.
    ///
    pub fn snapshot(&self, sector: usize, out: &mut [u8; SECTOR_SIZE]) {
        assert!(sector < self.num_sectors, "sector beyond end of device");

        let sectors = lock!(self.sectors);
        let start = sector * SECTOR_SIZE;
        out.copy_from_slice(&sectors[start..start + SECTOR_SIZE]);
    }
}

impl Device for RamDisk {
    fn num_sectors(&self) -> usize {
        self.num_sectors
    }

    fn operations(&self) -> Operations {
        Operations::READ | Operations::WRITE
    }

    fn read(&mut self, sector: usize, buf: &mut [u8]) -> Result<(), Error> {
        if buf.len() != SECTOR_SIZE {
            return Err(Error::InvalidBuffer);
        }
        if sector >= self.num_sectors {
            return Err(Error::OutOfRange);
        }

        let sectors = lock!(self.sectors);
        let start = sector * SECTOR_SIZE;
        buf.copy_from_slice(&sectors[start..start + SECTOR_SIZE]);
        Ok(())
    }

    fn write(&mut self, sector: usize, buf: &[u8]) -> Result<(), Error> {
        if buf.len() != SECTOR_SIZE {
            return Err(Error::InvalidBuffer);
        }
        if sector >= self.num_sectors {
            return Err(Error::OutOfRange);
        }

        let mut sectors = lock!(self.sectors);
        let start = sector * SECTOR_SIZE;
        sectors[start..start + SECTOR_SIZE].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ram_disk() {
        let mut disk = RamDisk::new(4);
        assert_eq!(disk.num_sectors(), 4);
        assert_eq!(disk.capacity(), 4 * SECTOR_SIZE);
        assert_eq!(disk.operations(), Operations::READ | Operations::WRITE);

        // Sectors start out zeroed.
        let mut buf = [0xffu8; SECTOR_SIZE];
        disk.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        // Writes are visible to subsequent reads.
        let data = [0x5au8; SECTOR_SIZE];
        disk.write(2, &data).unwrap();
        disk.read(2, &mut buf).unwrap();
        assert_eq!(buf, data);

        // Clones share the same sectors.
        let mut other = disk.clone();
        other.read(2, &mut buf).unwrap();
        assert_eq!(buf, data);
        other.write(2, &[0u8; SECTOR_SIZE]).unwrap();
        disk.read(2, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_bad_requests() {
        let mut disk = RamDisk::new(2);
        let mut buf = [0u8; SECTOR_SIZE];
        let mut short = [0u8; 10];

        assert_eq!(disk.read(2, &mut buf), Err(Error::OutOfRange));
        assert_eq!(disk.write(7, &buf), Err(Error::OutOfRange));
        assert_eq!(disk.read(0, &mut short), Err(Error::InvalidBuffer));
        assert_eq!(disk.write(0, &short), Err(Error::InvalidBuffer));
    }
}
