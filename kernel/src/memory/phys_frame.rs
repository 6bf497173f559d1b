// Copyright 2025 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use crate::constants::PAGE_SIZE;
use crate::phys_addr::PhysAddr;
use core::fmt;

/// A frame of physical memory.
///
/// All frames are 4 KiB and are aligned to their size. A
/// `PhysFrame` is identified by its start address.
///
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PhysFrame(PhysAddr);

impl PhysFrame {
    /// Returns the frame starting at the given physical address.
    ///
    /// If `addr` is not aligned to the frame size, `from_start_address`
    /// returns the address in an error.
    ///
    #[inline]
    pub fn from_start_address(addr: PhysAddr) -> Result<Self, PhysAddr> {
        if addr.is_aligned(PAGE_SIZE) {
            Ok(PhysFrame(addr))
        } else {
            Err(addr)
        }
    }

    /// Returns the frame that contains the given physical address.
    ///
    #[inline]
    pub fn containing_address(addr: PhysAddr) -> Self {
        PhysFrame(addr.align_down(PAGE_SIZE))
    }

    /// Returns the first address in the frame.
    ///
    #[inline]
    pub const fn start_address(self) -> PhysAddr {
        self.0
    }

    /// Returns the last address in the frame.
    ///
    #[inline]
    pub fn end_address(self) -> PhysAddr {
        self.0 + (PAGE_SIZE - 1)
    }

    /// Returns whether the frame contains the given address.
    ///
    #[inline]
    pub fn contains(self, addr: PhysAddr) -> bool {
        self.0 <= addr && addr <= self.end_address()
    }
}

impl fmt::Debug for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("PhysFrame")
            .field(&format_args!("{:#x}", self.0.as_usize()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_construction() {
        let base = PhysAddr::new(0x8000);
        assert_eq!(PhysFrame::from_start_address(base), Ok(PhysFrame(base)));
        assert!(PhysFrame::from_start_address(base + 1).is_err());

        let frame = PhysFrame::containing_address(base + 0x234);
        assert_eq!(frame.start_address(), base);
        assert_eq!(frame.end_address(), base + 0xfff);
        assert!(frame.contains(base + 0x234));
        assert!(!frame.contains(base + PAGE_SIZE));
    }
}
