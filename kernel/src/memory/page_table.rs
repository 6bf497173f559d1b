// Copyright 2025 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use crate::phys_frame::PhysFrame;
use crate::virt_page::VirtPage;
use alloc::collections::btree_map::{BTreeMap, Iter};
use bitflags::bitflags;

bitflags! {
    /// The behaviour of a single page translation.
    ///
    pub struct PageTableFlags: u8 {
        /// The translation is live and will be honoured
        /// by the memory management unit.
        const PRESENT = 1 << 0;

        /// The page can be written, as well as read.
        const WRITABLE = 1 << 1;

        /// The page can be accessed in user mode.
        const USER_ACCESSIBLE = 1 << 2;

        /// The page has been read or written through this
        /// translation since the bit was last cleared.
        const ACCESSED = 1 << 3;

        /// The page has been written through this
        /// translation since the bit was last cleared.
        const DIRTY = 1 << 4;
    }
}

/// Describes an error encountered while installing a page
/// translation.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageMappingError {
    /// The page already has a live translation. Replacing
    /// a translation implicitly could leak the frame it
    /// maps, so the existing translation must be cleared
    /// first.
    AlreadyMapped,
}

/// The per-process translation structure, mapping pages of
/// virtual memory to frames of physical memory.
///
/// Each process has exactly one `PageDirectory`. Translations
/// are installed when a page becomes resident and cleared when
/// its frame is reclaimed, so the directory always describes
/// exactly the set of pages the process can touch without
/// faulting. The directory also maintains the accessed and
/// dirty bits that the eviction and write-back paths consult.
///
pub struct PageDirectory {
    entries: BTreeMap<VirtPage, PageTableFlags>,
    frames: BTreeMap<VirtPage, PhysFrame>,
}

impl PageDirectory {
    /// Returns an empty page directory, with no live
    /// translations.
    ///
    pub fn new() -> Self {
        PageDirectory {
            entries: BTreeMap::new(),
            frames: BTreeMap::new(),
        }
    }

    /// Installs a translation from `page` to `frame`.
    ///
    /// The translation is created with its accessed and
    /// dirty bits clear.
    ///
    pub fn install(
        &mut self,
        page: VirtPage,
        frame: PhysFrame,
        writable: bool,
    ) -> Result<(), PageMappingError> {
        if self.entries.contains_key(&page) {
            return Err(PageMappingError::AlreadyMapped);
        }

        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }

        self.entries.insert(page, flags);
        self.frames.insert(page, frame);
        Ok(())
    }

    /// Returns the frame that `page` translates to, or `None`
    /// if the page has no live translation.
    ///
    pub fn lookup(&self, page: VirtPage) -> Option<PhysFrame> {
        self.frames.get(&page).copied()
    }

    /// Returns the frame and flags for `page`, or `None` if
    /// the page has no live translation.
    ///
    pub fn lookup_entry(&self, page: VirtPage) -> Option<(PhysFrame, PageTableFlags)> {
        let frame = self.frames.get(&page)?;
        let flags = self.entries.get(&page)?;
        Some((*frame, *flags))
    }

    /// Removes the translation for `page`, returning the frame
    /// it mapped, or `None` if there was no live translation.
    ///
    pub fn clear(&mut self, page: VirtPage) -> Option<PhysFrame> {
        self.entries.remove(&page);
        self.frames.remove(&page)
    }

    /// Returns the number of live translations.
    ///
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns whether the directory has no live translations.
    ///
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Iterates over the live translations.
    ///
    pub fn iter(&self) -> Iter<'_, VirtPage, PhysFrame> {
        self.frames.iter()
    }

    /// Records an access through the translation for `page`,
    /// setting its accessed bit and, for a write, its dirty
    /// bit.
    ///
    pub fn mark_accessed(&mut self, page: VirtPage, write: bool) {
        if let Some(flags) = self.entries.get_mut(&page) {
            *flags |= PageTableFlags::ACCESSED;
            if write {
                *flags |= PageTableFlags::DIRTY;
            }
        }
    }

    /// Returns whether the translation for `page` has been
    /// used since its accessed bit was last cleared. Returns
    /// `false` for a page with no live translation.
    ///
    pub fn is_accessed(&self, page: VirtPage) -> bool {
        self.entries
            .get(&page)
            .map_or(false, |flags| flags.contains(PageTableFlags::ACCESSED))
    }

    /// Clears the accessed bit on the translation for `page`.
    ///
    pub fn clear_accessed(&mut self, page: VirtPage) {
        if let Some(flags) = self.entries.get_mut(&page) {
            flags.remove(PageTableFlags::ACCESSED);
        }
    }

    /// Returns whether the translation for `page` has been
    /// written through since its dirty bit was last cleared.
    /// Returns `false` for a page with no live translation.
    ///
    pub fn is_dirty(&self, page: VirtPage) -> bool {
        self.entries
            .get(&page)
            .map_or(false, |flags| flags.contains(PageTableFlags::DIRTY))
    }

    /// Sets the dirty bit on the translation for `page`, as
    /// though the page had been written through it.
    ///
    pub fn mark_dirty(&mut self, page: VirtPage) {
        self.mark_accessed(page, true);
    }

    /// Clears the dirty bit on the translation for `page`.
    ///
    pub fn clear_dirty(&mut self, page: VirtPage) {
        if let Some(flags) = self.entries.get_mut(&page) {
            flags.remove(PageTableFlags::DIRTY);
        }
    }
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phys_addr::PhysAddr;
    use crate::virt_addr::VirtAddr;

    fn page_for(addr: usize) -> VirtPage {
        VirtPage::containing_address(VirtAddr::new(addr))
    }

    fn frame_for(addr: usize) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new(addr))
    }

    #[test]
    fn test_install_and_lookup() {
        let mut dir = PageDirectory::new();
        let page = page_for(0x40_0000);
        let frame = frame_for(0x8000);

        assert_eq!(dir.lookup(page), None);
        dir.install(page, frame, true).unwrap();
        assert_eq!(dir.lookup(page), Some(frame));
        assert_eq!(dir.len(), 1);

        let (got, flags) = dir.lookup_entry(page).unwrap();
        assert_eq!(got, frame);
        assert!(flags.contains(PageTableFlags::PRESENT));
        assert!(flags.contains(PageTableFlags::WRITABLE));
        assert!(flags.contains(PageTableFlags::USER_ACCESSIBLE));
        assert!(!flags.contains(PageTableFlags::ACCESSED));

        // A second installation at the same page must be
        // refused.
        assert_eq!(
            dir.install(page, frame_for(0x9000), true),
            Err(PageMappingError::AlreadyMapped)
        );

        // Clearing removes the translation.
        assert_eq!(dir.clear(page), Some(frame));
        assert_eq!(dir.lookup(page), None);
        assert_eq!(dir.clear(page), None);
        assert!(dir.is_empty());
    }

    #[test]
    fn test_read_only_translation() {
        let mut dir = PageDirectory::new();
        let page = page_for(0x40_0000);
        dir.install(page, frame_for(0x8000), false).unwrap();

        let (_, flags) = dir.lookup_entry(page).unwrap();
        assert!(!flags.contains(PageTableFlags::WRITABLE));
    }

    #[test]
    fn test_accessed_and_dirty_bits() {
        let mut dir = PageDirectory::new();
        let page = page_for(0x40_0000);
        dir.install(page, frame_for(0x8000), true).unwrap();

        assert!(!dir.is_accessed(page));
        assert!(!dir.is_dirty(page));

        // A read sets only the accessed bit.
        dir.mark_accessed(page, false);
        assert!(dir.is_accessed(page));
        assert!(!dir.is_dirty(page));

        // A write sets both.
        dir.mark_accessed(page, true);
        assert!(dir.is_dirty(page));

        // The bits clear independently.
        dir.clear_accessed(page);
        assert!(!dir.is_accessed(page));
        assert!(dir.is_dirty(page));
        dir.clear_dirty(page);
        assert!(!dir.is_dirty(page));

        // Bits on a missing translation read as false.
        assert!(!dir.is_accessed(page_for(0x50_0000)));
        assert!(!dir.is_dirty(page_for(0x50_0000)));
    }
}
