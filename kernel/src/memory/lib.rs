// Copyright 2025 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Contains types and functionality to represent physical and virtual memory.
//!
//! This crate provides the core types for representing physical and virtual
//! memory, plus the page directory that maps the two together. From most
//! basic to most sophisticated, the physical memory types are:
//!
//! - [`PhysAddr`]: An address in the physical address space.
//! - [`PhysFrame`]: A page-sized frame of physical memory.
//!
//! The corresponding virtual memory types are:
//!
//! - [`VirtAddr`]: A canonical address in the 48-bit virtual address space.
//! - [`VirtAddrRange`]: A sequence of contiguous virtual addresses.
//! - [`VirtPage`]: A page of virtual memory.
//!
//! The [`PageDirectory`] is the per-process translation structure, mapping
//! pages of virtual memory to frames of physical memory, with
//! [`PageTableFlags`] governing the behaviour of each mapping. The kernel
//! runs with all physical memory mapped directly into its address space, so
//! the convenience function [`phys_to_virt_addr`] can be used to translate
//! any physical address into a virtual address through which the memory can
//! be accessed.
//!
//! The [`constants`] module contains the page size and the set of important
//! address ranges.

#![no_std]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

pub mod constants;
mod page_table;
mod phys_addr;
mod phys_frame;
mod virt_addr;
mod virt_page;
mod virt_range;

pub use crate::page_table::{PageDirectory, PageMappingError, PageTableFlags};
pub use crate::phys_addr::{InvalidPhysAddr, PhysAddr};
pub use crate::phys_frame::PhysFrame;
pub use crate::virt_addr::{InvalidVirtAddr, VirtAddr};
pub use crate::virt_page::VirtPage;
pub use crate::virt_range::VirtAddrRange;

use crate::constants::PAGE_SIZE;
use core::slice;

/// Returns a virtual address that is mapped to the given physical
/// address.
///
/// The kernel maps all physical memory into its own address space
/// at offset zero, so the translation is the identity.
///
pub fn phys_to_virt_addr(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(phys.as_usize())
}

/// Returns the frame's contents as a mutable byte slice, using the
/// kernel's mapping of all physical memory.
///
/// # Safety
///
/// The caller must ensure that it has exclusive access to the frame
/// for the lifetime of the slice. Within the virtual memory manager,
/// this is guaranteed by performing all frame accesses under the
/// paging lock.
///
pub unsafe fn frame_bytes_mut(frame: PhysFrame) -> &'static mut [u8] {
    let virt = phys_to_virt_addr(frame.start_address());
    slice::from_raw_parts_mut(virt.as_usize() as *mut u8, PAGE_SIZE)
}

/// Returns the frame's contents as a byte slice, using the kernel's
/// mapping of all physical memory.
///
/// # Safety
///
/// The caller must ensure that no mutable access to the frame exists
/// for the lifetime of the slice.
///
pub unsafe fn frame_bytes(frame: PhysFrame) -> &'static [u8] {
    let virt = phys_to_virt_addr(frame.start_address());
    slice::from_raw_parts(virt.as_usize() as *const u8, PAGE_SIZE)
}
