// Copyright 2025 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! End-to-end scenarios for the sector cache: write-back
//! behaviour under eviction pressure and on shutdown.

use kernel::{Kernel, KernelConfig};
use storage::block::ram::RamDisk;
use storage::block::SECTOR_SIZE;
use storage::cache::{BlockCache, CACHE_SLOTS};

#[test]
fn cache_survives_twice_its_capacity() {
    // Write twice as many sectors as the cache holds, each
    // with a distinct byte, then read them all back.
    let disk = RamDisk::new(2 * CACHE_SLOTS);
    let raw = disk.clone();
    let cache = BlockCache::new(Box::new(disk));

    for sector in 0..2 * CACHE_SLOTS {
        cache.write(sector, &[sector as u8; SECTOR_SIZE]).unwrap();
    }

    let mut buf = [0u8; SECTOR_SIZE];
    for sector in 0..2 * CACHE_SLOTS {
        cache.read(sector, &mut buf).unwrap();
        assert_eq!(buf, [sector as u8; SECTOR_SIZE], "sector {}", sector);
    }

    // After the shutdown flush, the device holds every
    // sector's final contents, including sectors never
    // referenced again after their write.
    cache.flush_all().unwrap();
    for sector in 0..2 * CACHE_SLOTS {
        raw.snapshot(sector, &mut buf);
        assert_eq!(buf, [sector as u8; SECTOR_SIZE], "sector {}", sector);
    }
}

#[test]
fn shutdown_flushes_file_writes_to_disk() {
    let config = KernelConfig {
        user_frames: 16,
        kernel_frames: 4,
        swap_slots: 16,
        disk_sectors: 64,
    };
    let swap_disk = RamDisk::new(16 * 8);
    let fs_disk = RamDisk::new(64);
    let raw = fs_disk.clone();
    let kernel = Kernel::with_disks(config, swap_disk, fs_disk, true);

    // The first created file claims the first data extent,
    // which starts in sector 4.
    kernel.sys_create("journal", SECTOR_SIZE);
    {
        let file = kernel.file_system().open("journal").unwrap();
        file.write_at(0, b"write-behind").unwrap();
    }

    // The write is still held by the cache.
    let mut on_disk = [0u8; SECTOR_SIZE];
    raw.snapshot(4, &mut on_disk);
    assert!(on_disk.iter().all(|&b| b == 0));

    // Shutdown pushes it out.
    kernel.shutdown();
    raw.snapshot(4, &mut on_disk);
    assert_eq!(&on_disk[..12], b"write-behind");

    // A fresh kernel booted from the flushed device sees
    // the same file system.
    let kernel = Kernel::with_disks(config, RamDisk::new(16 * 8), raw, false);
    let file = kernel.file_system().open("journal").unwrap();
    let mut buf = [0u8; 12];
    file.read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"write-behind");
}
