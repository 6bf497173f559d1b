// Copyright 2025 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use crate::constants::PAGE_SIZE;
use crate::virt_addr::VirtAddr;
use core::fmt;

/// A page of virtual memory.
///
/// All pages are 4 KiB and are aligned to their size. A
/// `VirtPage` is identified by its start address.
///
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VirtPage(VirtAddr);

impl VirtPage {
    /// Returns the page starting at the given virtual address.
    ///
    /// If `addr` is not aligned to the page size, `from_start_address`
    /// returns the address in an error.
    ///
    #[inline]
    pub fn from_start_address(addr: VirtAddr) -> Result<Self, VirtAddr> {
        if addr.is_aligned(PAGE_SIZE) {
            Ok(VirtPage(addr))
        } else {
            Err(addr)
        }
    }

    /// Returns the page that contains the given virtual address.
    ///
    #[inline]
    pub fn containing_address(addr: VirtAddr) -> Self {
        VirtPage(addr.align_down(PAGE_SIZE))
    }

    /// Returns the first address in the page.
    ///
    #[inline]
    pub const fn start_address(self) -> VirtAddr {
        self.0
    }

    /// Returns the last address in the page.
    ///
    #[inline]
    pub fn end_address(self) -> VirtAddr {
        self.0 + (PAGE_SIZE - 1)
    }

    /// Returns whether the page contains the given address.
    ///
    #[inline]
    pub fn contains(self, addr: VirtAddr) -> bool {
        self.0 <= addr && addr <= self.end_address()
    }

    /// Returns the page that follows this one in the address
    /// space, or `None` at the end of the address space.
    ///
    #[inline]
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(PAGE_SIZE).map(VirtPage)
    }
}

impl fmt::Debug for VirtPage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("VirtPage")
            .field(&format_args!("{:p}", self.0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_construction() {
        let base = VirtAddr::new(0x40_0000);
        assert_eq!(VirtPage::from_start_address(base), Ok(VirtPage(base)));
        assert_eq!(
            VirtPage::from_start_address(base + 123),
            Err(base + 123)
        );

        let page = VirtPage::containing_address(base + 123);
        assert_eq!(page.start_address(), base);
        assert_eq!(page.end_address(), base + 0xfff);
        assert!(page.contains(base + 123));
        assert!(!page.contains(base + PAGE_SIZE));
    }

    #[test]
    fn test_page_stepping() {
        let page = VirtPage::containing_address(VirtAddr::new(0x40_0000));
        let next = page.next().unwrap();
        assert_eq!(next.start_address(), VirtAddr::new(0x40_1000));

        // The final page of the address space has no
        // successor.
        let last = VirtPage::containing_address(VirtAddr::new(0xffff_ffff_ffff_ffff));
        assert_eq!(last.next(), None);
    }
}
