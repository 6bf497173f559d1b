// Copyright 2025 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Physical memory management and allocation.
//!
//! This crate implements the page allocator: a pair of
//! [bitmap-managed pools](BitmapPool) of physical memory frames,
//! wrapped in a [`PoolFrameAllocator`]. The user pool backs user
//! virtual pages and is the pool the frame table draws on; the
//! kernel pool backs the kernel's own page-sized allocations.
//!
//! The allocator is handed its memory at construction time. In the
//! hosted configuration the kernel obtains that memory with
//! [`allocate_arena`], which reserves a page-aligned arena from the
//! kernel heap for the lifetime of the system.
//!
//! Running out of frames is not an error at this layer:
//! [`get_page`](PoolFrameAllocator::get_page) simply returns `None`
//! and the caller decides whether to evict or to give up.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

mod bitmap;

pub use crate::bitmap::BitmapPool;

use alloc::alloc::{alloc_zeroed, Layout};
use log::debug;
use memory::constants::PAGE_SIZE;
use memory::{frame_bytes_mut, PhysAddr, PhysFrame};
use pretty::Bytes;

/// Controls the behaviour of [`PoolFrameAllocator::get_page`].
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AllocFlags {
    /// Allocate from the user pool, rather than the
    /// kernel pool.
    pub user: bool,

    /// Zero the frame's contents before returning it.
    pub zero: bool,
}

impl AllocFlags {
    /// Flags for a kernel-pool allocation with undefined
    /// contents.
    ///
    pub const KERNEL: AllocFlags = AllocFlags {
        user: false,
        zero: false,
    };

    /// Flags for a user-pool allocation with undefined
    /// contents.
    ///
    pub const USER: AllocFlags = AllocFlags {
        user: true,
        zero: false,
    };

    /// Flags for a user-pool allocation with zeroed
    /// contents.
    ///
    pub const USER_ZERO: AllocFlags = AllocFlags {
        user: true,
        zero: true,
    };
}

/// The page allocator: a user pool and a kernel pool of
/// physical memory frames.
///
pub struct PoolFrameAllocator {
    user: BitmapPool,
    kernel: BitmapPool,
}

impl PoolFrameAllocator {
    /// Returns an allocator managing the two given pools.
    ///
    pub fn new(user: BitmapPool, kernel: BitmapPool) -> Self {
        PoolFrameAllocator { user, kernel }
    }

    /// Returns the next available frame from the pool chosen
    /// by `flags`, or `None` if that pool is exhausted.
    ///
    pub fn get_page(&mut self, flags: AllocFlags) -> Option<PhysFrame> {
        let pool = if flags.user {
            &mut self.user
        } else {
            &mut self.kernel
        };

        let frame = pool.allocate_frame()?;
        if flags.zero {
            // The frame is not yet mapped anywhere, and we
            // hold the only reference to it, so writing
            // through the kernel's direct mapping is sound.
            let bytes = unsafe { frame_bytes_mut(frame) };
            bytes.fill(0);
        }

        Some(frame)
    }

    /// Marks the given frame as unused and returns it to its
    /// pool for later use.
    ///
    /// # Panics
    ///
    /// `free_page` will panic if `frame` is not part of either
    /// pool, or if it is already free. Both indicate a corrupted
    /// frame table.
    ///
    pub fn free_page(&mut self, frame: PhysFrame) {
        if self.user.contains_frame(frame) {
            self.user.deallocate_frame(frame);
        } else if self.kernel.contains_frame(frame) {
            self.kernel.deallocate_frame(frame);
        } else {
            panic!(
                "cannot free frame at {:#x}: frame not tracked",
                frame.start_address().as_usize()
            );
        }
    }

    /// Returns the number of free frames in the user pool.
    ///
    pub fn free_user_frames(&self) -> usize {
        self.user.free_frames()
    }

    /// Returns the total number of frames in the user pool.
    ///
    pub fn num_user_frames(&self) -> usize {
        self.user.num_frames()
    }

    /// Logs debug information about the allocator's state.
    ///
    pub fn debug(&self) {
        for (name, pool) in [("user", &self.user), ("kernel", &self.kernel)].iter() {
            debug!(
                "{} pool: {}/{} frames free ({} of {})",
                name,
                pool.free_frames(),
                pool.num_frames(),
                Bytes::from_usize(pool.free_frames() * PAGE_SIZE),
                Bytes::from_usize(pool.num_frames() * PAGE_SIZE),
            );
        }
    }
}

/// Reserves a page-aligned arena of `num_frames` frames from the
/// kernel heap, for use as an allocator pool.
///
/// The arena is zeroed and is never returned to the heap: pools
/// live for the lifetime of the system.
///
/// # Panics
///
/// `allocate_arena` will panic if `num_frames` is zero or the
/// heap cannot satisfy the reservation.
///
pub fn allocate_arena(num_frames: usize) -> PhysAddr {
    assert!(num_frames > 0, "an arena must hold at least one frame");

    let layout = Layout::from_size_align(num_frames * PAGE_SIZE, PAGE_SIZE)
        .expect("invalid arena layout");

    let ptr = unsafe { alloc_zeroed(layout) };
    if ptr.is_null() {
        panic!("failed to reserve a {}-frame arena", num_frames);
    }

    PhysAddr::new(ptr as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_frame_allocator() {
        let user_base = allocate_arena(2);
        let kernel_base = allocate_arena(1);
        let user = unsafe { BitmapPool::new(user_base, 2) };
        let kernel = unsafe { BitmapPool::new(kernel_base, 1) };
        let mut allocator = PoolFrameAllocator::new(user, kernel);

        assert_eq!(allocator.free_user_frames(), 2);
        assert_eq!(allocator.num_user_frames(), 2);

        // The user pool allocates its frames in order.
        let first = allocator.get_page(AllocFlags::USER).unwrap();
        let second = allocator.get_page(AllocFlags::USER).unwrap();
        assert_eq!(first.start_address(), user_base);
        assert_eq!(second.start_address(), user_base + PAGE_SIZE);
        assert_eq!(allocator.get_page(AllocFlags::USER), None);
        assert_eq!(allocator.free_user_frames(), 0);

        // The kernel pool is independent of the user pool.
        let kframe = allocator.get_page(AllocFlags::KERNEL).unwrap();
        assert_eq!(kframe.start_address(), kernel_base);
        assert_eq!(allocator.get_page(AllocFlags::KERNEL), None);

        // Freeing returns frames for reuse.
        allocator.free_page(first);
        assert_eq!(allocator.free_user_frames(), 1);
        assert_eq!(allocator.get_page(AllocFlags::USER), Some(first));
    }

    #[test]
    fn test_zeroed_allocation() {
        let base = allocate_arena(1);
        let user = unsafe { BitmapPool::new(base, 1) };
        let kernel_base = allocate_arena(1);
        let kernel = unsafe { BitmapPool::new(kernel_base, 1) };
        let mut allocator = PoolFrameAllocator::new(user, kernel);

        // Dirty the frame, free it, then ask for it back
        // zeroed.
        let frame = allocator.get_page(AllocFlags::USER).unwrap();
        unsafe { frame_bytes_mut(frame) }.fill(0xa5);
        allocator.free_page(frame);

        let frame = allocator.get_page(AllocFlags::USER_ZERO).unwrap();
        assert!(unsafe { frame_bytes_mut(frame) }.iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic]
    fn test_free_untracked_frame() {
        let user = unsafe { BitmapPool::new(allocate_arena(1), 1) };
        let kernel = unsafe { BitmapPool::new(allocate_arena(1), 1) };
        let mut allocator = PoolFrameAllocator::new(user, kernel);

        let outside = allocate_arena(1);
        allocator.free_page(PhysFrame::from_start_address(outside).unwrap());
    }
}
