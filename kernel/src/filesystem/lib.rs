// Copyright 2025 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the kernel's file system.
//!
//! This is a deliberately simple volume format: a flat root
//! directory of files, each stored as one contiguous extent of
//! sectors, with sizes fixed at creation time. What the format
//! lacks in sophistication it makes up for in being easy to
//! reason about underneath the virtual memory manager, which
//! uses files both as the source of lazily-loaded pages and as
//! the write-back target for memory-mapped regions.
//!
//! All I/O goes through the [`storage::cache::BlockCache`]
//! handed to the volume, so repeated access to hot sectors does
//! not touch the device, and nothing reaches the device at all
//! until the cache evicts or the kernel flushes it.
//!
//! The volume layout is:
//!
//! | Sector | Contents |
//! | -----: | -------- |
//! | 0      | Header: magic number and volume size. |
//! | 1      | Free map: one bit per sector, set while free. |
//! | 2-3    | Root directory: 32 entries of 32 bytes. |
//! | 4..    | File extents. |

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]
#![forbid(unsafe_code)]

extern crate alloc;

use align::align_up_usize;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use bitmap_index::Bitmap;
use core::cmp::min;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::{lock, Mutex};
use storage::block;
use storage::block::SECTOR_SIZE;
use storage::cache::BlockCache;

/// The magic number identifying a formatted volume.
///
const MAGIC: &[u8; 8] = b"EMBER-FS";

/// The sector holding the volume header.
///
const HEADER_SECTOR: usize = 0;

/// The sector holding the free map.
///
const FREE_MAP_SECTOR: usize = 1;

/// The first sector of the root directory.
///
const DIRECTORY_SECTOR: usize = 2;

/// The number of sectors occupied by the root directory.
///
const DIRECTORY_SECTORS: usize = 2;

/// The first sector available for file extents.
///
const FIRST_DATA_SECTOR: usize = DIRECTORY_SECTOR + DIRECTORY_SECTORS;

/// The largest volume a single free map sector can describe.
///
const MAX_SECTORS: usize = SECTOR_SIZE * 8;

/// The size in bytes of an on-disk directory entry.
///
const DIR_ENTRY_SIZE: usize = 32;

/// The maximum number of files on the volume.
///
pub const MAX_FILES: usize = DIRECTORY_SECTORS * SECTOR_SIZE / DIR_ENTRY_SIZE;

/// The maximum length of a file name, in bytes.
///
pub const MAX_NAME: usize = 23;

/// Describes an error encountered while operating on the
/// file system.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// No file with the given name exists.
    NotFound,

    /// A file with the given name already exists.
    AlreadyExists,

    /// The file name is empty, too long, or contains
    /// a path separator.
    InvalidName,

    /// The volume has no contiguous run of free sectors
    /// large enough for the new file.
    VolumeFull,

    /// The root directory has no free entries.
    DirectoryFull,

    /// The file is open and cannot be removed.
    InUse,

    /// The volume is not formatted, or its metadata is
    /// corrupt.
    BadVolume,

    /// The underlying device failed.
    Io(block::Error),
}

// A file's metadata, shared by every open handle.
//
struct Inode {
    name: String,

    // start is the first sector of the file's extent.
    // Zero-length files have no extent and store zero
    // here.
    //
    start: usize,

    // length is the file's size in bytes, fixed at
    // creation.
    //
    length: usize,

    // deny_write counts the open handles that have asked
    // for writes to be refused, such as while the file is
    // being executed. Writes are refused while it is
    // non-zero.
    //
    deny_write: AtomicU32,
}

// The mutable volume state, guarded by the file system lock.
//
struct FsState {
    // free_map records, for every sector of the volume,
    // whether it is free. Metadata sectors are marked
    // used at format time.
    //
    free_map: Bitmap,

    // files maps each file name to its inode.
    //
    files: BTreeMap<String, Arc<Inode>>,
}

// Everything shared between the volume and its open files.
//
struct FsShared {
    cache: BlockCache,
    state: Mutex<FsState>,
}

/// A formatted volume.
///
/// Clones share the same underlying volume and cache.
///
#[derive(Clone)]
pub struct FileSystem {
    shared: Arc<FsShared>,
}

impl FileSystem {
    /// Formats the device behind `cache` and returns the
    /// resulting empty volume.
    ///
    pub fn format(cache: BlockCache, num_sectors: usize) -> Result<Self, Error> {
        if num_sectors <= FIRST_DATA_SECTOR || num_sectors > MAX_SECTORS {
            return Err(Error::BadVolume);
        }

        let mut free_map = Bitmap::new_set(num_sectors);
        for sector in 0..FIRST_DATA_SECTOR {
            free_map.unset(sector);
        }

        // Write the header.
        let mut header = [0u8; SECTOR_SIZE];
        header[..MAGIC.len()].copy_from_slice(MAGIC);
        header[8..12].copy_from_slice(&(num_sectors as u32).to_le_bytes());
        cache.write(HEADER_SECTOR, &header).map_err(Error::Io)?;

        let shared = Arc::new(FsShared {
            cache,
            state: Mutex::new(FsState {
                free_map,
                files: BTreeMap::new(),
            }),
        });

        let fs = FileSystem { shared };
        fs.sync_metadata()?;
        Ok(fs)
    }

    /// Opens an already-formatted volume through `cache`.
    ///
    pub fn open_volume(cache: BlockCache) -> Result<Self, Error> {
        // Read and check the header.
        let mut header = [0u8; SECTOR_SIZE];
        cache.read(HEADER_SECTOR, &mut header).map_err(Error::Io)?;
        if &header[..MAGIC.len()] != MAGIC {
            return Err(Error::BadVolume);
        }

        let mut size = [0u8; 4];
        size.copy_from_slice(&header[8..12]);
        let num_sectors = u32::from_le_bytes(size) as usize;
        if num_sectors <= FIRST_DATA_SECTOR || num_sectors > MAX_SECTORS {
            return Err(Error::BadVolume);
        }

        // Read the free map.
        let mut raw = [0u8; SECTOR_SIZE];
        cache.read(FREE_MAP_SECTOR, &mut raw).map_err(Error::Io)?;
        let mut free_map = Bitmap::new_unset(num_sectors);
        for sector in 0..num_sectors {
            if raw[sector / 8] & (1 << (sector % 8)) != 0 {
                free_map.set(sector);
            }
        }

        // Read the directory.
        let mut files = BTreeMap::new();
        for i in 0..DIRECTORY_SECTORS {
            cache
                .read(DIRECTORY_SECTOR + i, &mut raw)
                .map_err(Error::Io)?;
            for entry in raw.chunks_exact(DIR_ENTRY_SIZE) {
                let name_len = entry[..=MAX_NAME]
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(MAX_NAME + 1);
                if name_len == 0 || name_len > MAX_NAME {
                    continue;
                }

                let name = match core::str::from_utf8(&entry[..name_len]) {
                    Ok(name) => String::from(name),
                    Err(_) => return Err(Error::BadVolume),
                };

                let mut word = [0u8; 4];
                word.copy_from_slice(&entry[24..28]);
                let start = u32::from_le_bytes(word) as usize;
                word.copy_from_slice(&entry[28..32]);
                let length = u32::from_le_bytes(word) as usize;

                files.insert(
                    name.clone(),
                    Arc::new(Inode {
                        name,
                        start,
                        length,
                        deny_write: AtomicU32::new(0),
                    }),
                );
            }
        }

        Ok(FileSystem {
            shared: Arc::new(FsShared {
                cache,
                state: Mutex::new(FsState { free_map, files }),
            }),
        })
    }

    /// Creates a new file of the given size, filled with
    /// zeroes.
    ///
    /// The file's size is fixed for its lifetime: writes past
    /// the end are truncated rather than growing the file.
    ///
    pub fn create(&self, name: &str, size: usize) -> Result<(), Error> {
        if name.is_empty() || name.len() > MAX_NAME || name.contains('/') {
            return Err(Error::InvalidName);
        }

        let mut state = lock!(self.shared.state);
        if state.files.contains_key(name) {
            return Err(Error::AlreadyExists);
        }
        if state.files.len() == MAX_FILES {
            return Err(Error::DirectoryFull);
        }

        // Claim a contiguous extent for the file's contents.
        let sectors = align_up_usize(size, SECTOR_SIZE) / SECTOR_SIZE;
        let start = if sectors == 0 {
            0
        } else {
            let start = state.free_map.next_n_set(sectors).ok_or(Error::VolumeFull)?;
            for sector in start..start + sectors {
                state.free_map.unset(sector);
            }

            start
        };

        // Zero the extent so reads of unwritten bytes are
        // well-defined.
        let zeroes = [0u8; SECTOR_SIZE];
        for sector in start..start + sectors {
            self.shared.cache.write(sector, &zeroes).map_err(Error::Io)?;
        }

        state.files.insert(
            String::from(name),
            Arc::new(Inode {
                name: String::from(name),
                start,
                length: size,
                deny_write: AtomicU32::new(0),
            }),
        );

        self.sync_metadata_locked(&state)
    }

    /// Removes the named file, releasing its sectors.
    ///
    /// A file that is still open cannot be removed.
    ///
    pub fn remove(&self, name: &str) -> Result<(), Error> {
        let mut state = lock!(self.shared.state);
        let inode = state.files.get(name).ok_or(Error::NotFound)?;
        if Arc::strong_count(inode) > 1 {
            return Err(Error::InUse);
        }

        let inode = state.files.remove(name).ok_or(Error::NotFound)?;
        let sectors = align_up_usize(inode.length, SECTOR_SIZE) / SECTOR_SIZE;
        for sector in inode.start..inode.start + sectors {
            state.free_map.set(sector);
        }

        self.sync_metadata_locked(&state)
    }

    /// Opens the named file, with the cursor at the start.
    ///
    pub fn open(&self, name: &str) -> Result<File, Error> {
        let state = lock!(self.shared.state);
        let inode = state.files.get(name).ok_or(Error::NotFound)?;

        Ok(File {
            shared: self.shared.clone(),
            inode: inode.clone(),
            pos: 0,
            denying: false,
        })
    }

    /// Returns whether the named file exists.
    ///
    pub fn exists(&self, name: &str) -> bool {
        let state = lock!(self.shared.state);
        state.files.contains_key(name)
    }

    /// Writes every cached sector back to the device, such as
    /// during an orderly shutdown.
    ///
    pub fn flush(&self) -> Result<(), Error> {
        self.shared.cache.flush_all().map_err(Error::Io)
    }

    // sync_metadata persists the free map and directory.
    //
    fn sync_metadata(&self) -> Result<(), Error> {
        let state = lock!(self.shared.state);
        self.sync_metadata_locked(&state)
    }

    fn sync_metadata_locked(&self, state: &FsState) -> Result<(), Error> {
        // Serialise the free map.
        let mut raw = [0u8; SECTOR_SIZE];
        for sector in 0..state.free_map.len() {
            if state.free_map.get(sector) {
                raw[sector / 8] |= 1 << (sector % 8);
            }
        }
        self.shared
            .cache
            .write(FREE_MAP_SECTOR, &raw)
            .map_err(Error::Io)?;

        // Serialise the directory.
        let mut sectors = [[0u8; SECTOR_SIZE]; DIRECTORY_SECTORS];
        for (i, inode) in state.files.values().enumerate() {
            let sector = &mut sectors[i / (SECTOR_SIZE / DIR_ENTRY_SIZE)];
            let offset = (i % (SECTOR_SIZE / DIR_ENTRY_SIZE)) * DIR_ENTRY_SIZE;
            let entry = &mut sector[offset..offset + DIR_ENTRY_SIZE];
            entry[..inode.name.len()].copy_from_slice(inode.name.as_bytes());
            entry[24..28].copy_from_slice(&(inode.start as u32).to_le_bytes());
            entry[28..32].copy_from_slice(&(inode.length as u32).to_le_bytes());
        }

        for (i, sector) in sectors.iter().enumerate() {
            self.shared
                .cache
                .write(DIRECTORY_SECTOR + i, sector)
                .map_err(Error::Io)?;
        }

        Ok(())
    }
}

/// An open file.
///
/// A `File` can be cloned cheaply; clones share the underlying
/// file but carry their own cursor. The virtual memory manager
/// relies on this to keep a memory-mapped file alive for the
/// lifetime of the mapping, regardless of when the process
/// closes its own handle.
///
pub struct File {
    shared: Arc<FsShared>,
    inode: Arc<Inode>,
    pos: usize,
    denying: bool,
}

impl File {
    /// Returns the file's name.
    ///
    pub fn name(&self) -> &str {
        &self.inode.name
    }

    /// Returns the file's size in bytes.
    ///
    pub fn len(&self) -> usize {
        self.inode.length
    }

    /// Returns whether the file is empty.
    ///
    pub fn is_empty(&self) -> bool {
        self.inode.length == 0
    }

    /// Reads from the file at the given offset, without using
    /// or moving the cursor.
    ///
    /// Returns the number of bytes read, which is shorter than
    /// `buf` only at the end of the file.
    ///
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, Error> {
        if offset >= self.inode.length {
            return Ok(0);
        }

        let n = min(buf.len(), self.inode.length - offset);
        let mut done = 0;
        let mut sector_buf = [0u8; SECTOR_SIZE];
        while done < n {
            let pos = offset + done;
            let sector = self.inode.start + pos / SECTOR_SIZE;
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = min(n - done, SECTOR_SIZE - sector_ofs);

            self.shared
                .cache
                .read(sector, &mut sector_buf)
                .map_err(Error::Io)?;
            buf[done..done + chunk].copy_from_slice(&sector_buf[sector_ofs..sector_ofs + chunk]);
            done += chunk;
        }

        Ok(n)
    }

    /// Writes to the file at the given offset, without using
    /// or moving the cursor.
    ///
    /// Returns the number of bytes written. Writes past the end
    /// of the file are truncated, and writes are refused
    /// entirely (returning zero) while the file is marked
    /// deny-write.
    ///
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, Error> {
        if self.inode.deny_write.load(Ordering::Acquire) > 0 {
            return Ok(0);
        }
        if offset >= self.inode.length {
            return Ok(0);
        }

        let n = min(buf.len(), self.inode.length - offset);
        let mut done = 0;
        let mut sector_buf = [0u8; SECTOR_SIZE];
        while done < n {
            let pos = offset + done;
            let sector = self.inode.start + pos / SECTOR_SIZE;
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = min(n - done, SECTOR_SIZE - sector_ofs);

            if chunk == SECTOR_SIZE {
                // The whole sector is being replaced, so the
                // old contents don't need to be fetched.
                sector_buf.copy_from_slice(&buf[done..done + chunk]);
            } else {
                self.shared
                    .cache
                    .read(sector, &mut sector_buf)
                    .map_err(Error::Io)?;
                sector_buf[sector_ofs..sector_ofs + chunk]
                    .copy_from_slice(&buf[done..done + chunk]);
            }

            self.shared
                .cache
                .write(sector, &sector_buf)
                .map_err(Error::Io)?;
            done += chunk;
        }

        Ok(n)
    }

    /// Reads from the cursor, advancing it by the number of
    /// bytes read.
    ///
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let n = self.read_at(self.pos, buf)?;
        self.pos += n;
        Ok(n)
    }

    /// Writes at the cursor, advancing it by the number of
    /// bytes written.
    ///
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let n = self.write_at(self.pos, buf)?;
        self.pos += n;
        Ok(n)
    }

    /// Moves the cursor to the given offset.
    ///
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Returns the cursor's current offset.
    ///
    pub fn tell(&self) -> usize {
        self.pos
    }

    /// Refuses writes to the underlying file until this handle
    /// calls [`allow_write`](File::allow_write) or is dropped.
    ///
    /// This is used to protect a running executable from being
    /// modified underneath itself.
    ///
    pub fn deny_write(&mut self) {
        if !self.denying {
            self.denying = true;
            self.inode.deny_write.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Re-allows writes refused by an earlier call to
    /// [`deny_write`](File::deny_write) on this handle.
    ///
    pub fn allow_write(&mut self) {
        if self.denying {
            self.denying = false;
            self.inode.deny_write.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Returns whether writes to the underlying file are
    /// currently refused.
    ///
    pub fn is_write_denied(&self) -> bool {
        self.inode.deny_write.load(Ordering::Acquire) > 0
    }
}

impl Clone for File {
    /// Returns a new handle to the same file, with its own
    /// cursor at the same position and no deny-write claim of
    /// its own.
    ///
    fn clone(&self) -> Self {
        File {
            shared: self.shared.clone(),
            inode: self.inode.clone(),
            pos: self.pos,
            denying: false,
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.allow_write();
    }
}
