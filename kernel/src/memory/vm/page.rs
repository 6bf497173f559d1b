// Copyright 2025 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the supplemental page table: the per-process
//! record of every user page the process has a claim on,
//! resident or not.

use crate::swap::SwapSlot;
use crate::MapId;
use alloc::collections::BTreeMap;
use filesystem::File;
use memory::{PageDirectory, PhysFrame, VirtAddr, VirtPage};

// Where a page's contents currently live.
//
pub(crate) enum PageState {
    // The page is backed by a physical frame and has a
    // live translation.
    //
    Resident { frame: PhysFrame },

    // The page has no frame. Its contents are in the swap
    // slot if one is held; otherwise they can be recreated
    // from the page's file origin.
    //
    Evicted { slot: Option<SwapSlot> },
}

// The file a page's contents originate from.
//
// For a lazily-loaded segment page this describes the first
// load; for a memory-mapped page it also names the write-back
// target. read_bytes and zero_bytes always sum to the page
// size.
//
pub(crate) struct FileOrigin {
    pub file: File,
    pub offset: usize,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

// A supplemental page table entry.
//
pub(crate) struct PageRecord {
    pub state: PageState,

    // writable records the protection the page was mapped
    // with. Read-only pages are never written back anywhere.
    //
    pub writable: bool,

    // mapped is true for pages belonging to an explicit
    // memory-mapped file region. Such pages write back to
    // their file rather than to swap.
    //
    pub mapped: bool,

    // origin is set for pages whose contents come from a
    // file. It is cleared when a writable non-mapped page
    // is first evicted, committing the page to swap from
    // then on.
    //
    pub origin: Option<FileOrigin>,
}

// One memory-mapped file region.
//
// The record keeps its own handle to the file, so the mapping
// stays usable for its whole lifetime regardless of what the
// process does with its file descriptors.
//
pub(crate) struct MappingRecord {
    pub file: File,
    pub base: VirtPage,
    pub num_pages: usize,
}

// The per-process virtual memory state: the page directory,
// the supplemental page table and the mapping records.
//
pub(crate) struct ProcessVm {
    pub pagedir: PageDirectory,
    pub records: BTreeMap<VirtPage, PageRecord>,
    pub mappings: BTreeMap<MapId, MappingRecord>,
    pub next_mapid: u64,

    // stack_pointer is the user stack pointer most recently
    // captured on entry to the kernel. The page fault
    // handler consults it to distinguish stack growth from
    // stray accesses.
    //
    pub stack_pointer: Option<VirtAddr>,
}

impl ProcessVm {
    pub fn new() -> Self {
        ProcessVm {
            pagedir: PageDirectory::new(),
            records: BTreeMap::new(),
            mappings: BTreeMap::new(),
            next_mapid: 1,
            stack_pointer: None,
        }
    }
}
