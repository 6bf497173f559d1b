// Copyright 2025 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Contains constants describing the virtual memory layout.
//!
//! The memory layout is summarised below:
//!
//! | Region         |      Start address |       Last address | Purpose |
//! | -------------- | -----------------: | -----------------: | ------- |
//! | [`NULL_PAGE`]  |              `0x0` |        `0x1f_ffff` | Reserved so null dereferences fault. |
//! | [`USERSPACE`]  |        `0x20_0000` | `0x7fff_ffff_ffff` | User code, data, mappings and stack. |
//! | [`USER_STACK`] | `0x7fff_ff7f_f000` | `0x7fff_ffff_efff` | The user stack, growing downwards. |
//!
//! Everything above the lower half belongs to the kernel. A fault on a
//! kernel address is never resolved on behalf of user code.

use crate::virt_addr::VirtAddr;
use crate::virt_range::VirtAddrRange;

/// The size in bytes of a page of virtual memory and of a frame
/// of physical memory.
///
pub const PAGE_SIZE: usize = 4096;

/// The first virtual pages, which are reserved to ensure null
/// pointer dereferences cause a page fault.
///
pub const NULL_PAGE: VirtAddrRange = VirtAddrRange::new(NULL_PAGE_START, NULL_PAGE_END);
const NULL_PAGE_START: VirtAddr = VirtAddr::zero();
const NULL_PAGE_END: VirtAddr = VirtAddr::new(0x1f_ffff_usize);

/// The region of virtual memory available to userspace processes.
///
pub const USERSPACE: VirtAddrRange = VirtAddrRange::new(USERSPACE_START, USERSPACE_END);
const USERSPACE_START: VirtAddr = VirtAddr::new(0x20_0000_usize);
const USERSPACE_END: VirtAddr = VirtAddr::new(0x7fff_ffff_ffff_usize);

/// The address just above the user stack.
///
/// The first stack page occupies the page immediately below this
/// address and the stack grows downwards from there, up to
/// [`STACK_LIMIT`] bytes in total.
///
pub const USER_STACK_TOP: VirtAddr = VirtAddr::new(0x7fff_ffff_f000_usize);

/// The maximum size of the user stack.
///
/// A fault below `USER_STACK_TOP - STACK_LIMIT` is never treated
/// as stack growth.
///
pub const STACK_LIMIT: usize = 8 * 1024 * 1024;

/// The region reserved for the user stack.
///
/// Memory mappings must not be placed in this region, even
/// before the stack has grown into it.
///
pub const USER_STACK: VirtAddrRange = VirtAddrRange::new(USER_STACK_BOTTOM, USER_STACK_LAST);
const USER_STACK_BOTTOM: VirtAddr = VirtAddr::new(USER_STACK_TOP.as_usize() - STACK_LIMIT);
const USER_STACK_LAST: VirtAddr = VirtAddr::new(USER_STACK_TOP.as_usize() - 1);

/// How far below the captured user stack pointer a fault may land
/// while still being treated as stack growth.
///
/// Instructions that push to the stack access memory slightly
/// below the stack pointer before it is adjusted; 32 bytes covers
/// the furthest such access.
///
pub const PUSH_SLACK: usize = 32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_memory_layout() {
        // The null page must start at address zero, or
        // it's pointless.
        assert_eq!(NULL_PAGE.start(), VirtAddr::zero());

        // The null page and userspace must tile the lower
        // half exactly, with no gap for unclaimed pages.
        assert_eq!(NULL_PAGE.end() + 1, USERSPACE.start());

        // Userspace must end at the top of the lower half
        // of the address space: the next address up must
        // not be canonical.
        assert!(VirtAddr::try_new(USERSPACE.end().as_usize() + 1).is_err());

        // The stack region must lie entirely within
        // userspace, aligned to page boundaries.
        assert!(USERSPACE.contains(&USER_STACK));
        assert!(USER_STACK.start().is_aligned(PAGE_SIZE));
        assert!(USER_STACK_TOP.is_aligned(PAGE_SIZE));
        assert_eq!(USER_STACK.size(), STACK_LIMIT);
    }
}
