// Copyright 2025 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Ties the kernel's subsystems together.
//!
//! A [`Kernel`] value owns the whole machine state: the virtual
//! memory system (page allocator, frame table, supplemental page
//! tables and swap), the storage stack (block device, sector
//! cache and file system) and the process table. It is built
//! once during boot, before the first user process, and handed
//! to the trap and syscall glue.
//!
//! The crate also implements the pieces that sit between user
//! code and those subsystems: the process lifecycle
//! ([`process`](self) module), the system call surface
//! ([`syscall`](self) module) and the emulated user memory
//! access path ([`Kernel::read_user`] / [`Kernel::write_user`]),
//! which drives the page fault handler the way the processor
//! would.

#![no_std]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

mod process;
mod syscall;
mod usermem;

pub use crate::process::Segment;
pub use crate::syscall::Terminated;

use crate::process::Process;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use filesystem::FileSystem;
use physmem::{allocate_arena, BitmapPool, PoolFrameAllocator};
use memory::constants::PAGE_SIZE;
use spin::Mutex;
use storage::block::ram::RamDisk;
use storage::block::{Device, SECTOR_SIZE};
use storage::cache::BlockCache;
use vm::{ProcessId, VmSystem};

/// Sizes for the machine the kernel runs on.
///
#[derive(Clone, Copy, Debug)]
pub struct KernelConfig {
    /// Frames in the user pool, backing all user pages.
    pub user_frames: usize,

    /// Frames in the kernel pool.
    pub kernel_frames: usize,

    /// Page-sized slots on the swap device.
    pub swap_slots: usize,

    /// Sectors on the file system device.
    pub disk_sectors: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            user_frames: 64,
            kernel_frames: 16,
            swap_slots: 256,
            disk_sectors: 1024,
        }
    }
}

/// The kernel.
///
/// Owns every global subsystem; see the crate documentation.
///
pub struct Kernel {
    vm: VmSystem,
    fs: FileSystem,
    pub(crate) processes: Mutex<BTreeMap<ProcessId, Process>>,
    pub(crate) exited: Mutex<BTreeMap<ProcessId, i32>>,
}

impl Kernel {
    /// Boots a kernel on fresh, zeroed devices sized by
    /// `config`, with a newly-formatted file system.
    ///
    /// # Panics
    ///
    /// `new` will panic if the file system cannot be formatted,
    /// which means `config.disk_sectors` is out of range.
    ///
    pub fn new(config: KernelConfig) -> Self {
        let swap_disk = RamDisk::new(config.swap_slots * (PAGE_SIZE / SECTOR_SIZE));
        let fs_disk = RamDisk::new(config.disk_sectors);
        Self::with_disks(config, swap_disk, fs_disk, true)
    }

    /// Boots a kernel on the given devices.
    ///
    /// If `format` is set the file system device is formatted;
    /// otherwise it must already hold a volume. Callers can keep
    /// clones of the devices to observe their contents from
    /// outside, such as after [`shutdown`](Kernel::shutdown).
    ///
    /// # Panics
    ///
    /// `with_disks` will panic if the file system volume cannot
    /// be formatted or opened.
    ///
    pub fn with_disks(
        config: KernelConfig,
        swap_disk: RamDisk,
        fs_disk: RamDisk,
        format: bool,
    ) -> Self {
        let user = unsafe {
            BitmapPool::new(allocate_arena(config.user_frames), config.user_frames)
        };
        let kernel = unsafe {
            BitmapPool::new(allocate_arena(config.kernel_frames), config.kernel_frames)
        };
        let allocator = PoolFrameAllocator::new(user, kernel);
        let vm = VmSystem::new(allocator, Box::new(swap_disk));

        let num_sectors = fs_disk.num_sectors();
        let cache = BlockCache::new(Box::new(fs_disk));
        let fs = if format {
            FileSystem::format(cache, num_sectors).expect("failed to format the volume")
        } else {
            FileSystem::open_volume(cache).expect("failed to open the volume")
        };

        Kernel {
            vm,
            fs,
            processes: Mutex::new(BTreeMap::new()),
            exited: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the virtual memory system.
    ///
    pub fn vm(&self) -> &VmSystem {
        &self.vm
    }

    /// Returns the file system.
    ///
    pub fn file_system(&self) -> &FileSystem {
        &self.fs
    }

    /// Flushes all cached storage state to the device, for an
    /// orderly shutdown.
    ///
    pub fn shutdown(&self) {
        if let Err(err) = self.fs.flush() {
            log::warn!("shutdown flush failed: {:?}", err);
        }
    }
}
