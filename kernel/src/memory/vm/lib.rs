// Copyright 2025 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements demand-paged virtual memory for user processes.
//!
//! This crate is the core of the virtual memory system. It owns,
//! as a single [`VmSystem`] value:
//!
//! - the user-pool page allocator;
//! - the frame table, recording which process page each assigned
//!   frame backs ([`frame`](self) module);
//! - the swap table, recording which slots of the raw swap device
//!   hold evicted pages;
//! - every process's supplemental page table, page directory and
//!   memory-mapping records.
//!
//! All of that state lives behind one mutex, the paging lock.
//! Every public operation acquires it once and holds it for the
//! whole critical section, including any swap or write-back I/O,
//! so concurrent threads observe each page either entirely before
//! or entirely after a transition, never mid-flight.
//!
//! Pages reach the system lazily. The loader and `mmap` only
//! deposit records describing where a page's contents will come
//! from; the first access faults, and [`VmSystem::handle_fault`]
//! materialises the page. Under memory pressure the oldest
//! assigned frame is evicted: anonymous pages go to a swap slot,
//! clean file-backed pages are simply dropped, dirty mapped pages
//! are written back to their file, and writable segment pages are
//! promoted to swap-backed on their first eviction.

#![no_std]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

mod frame;
mod page;
mod swap;

use crate::frame::{FrameTable, FrameTableEntry};
use crate::page::{FileOrigin, MappingRecord, PageRecord, PageState, ProcessVm};
use crate::swap::SwapTable;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::cmp::min;
use core::sync::atomic::{AtomicU64, Ordering};
use filesystem::File;
use log::warn;
use memory::constants::{PAGE_SIZE, PUSH_SLACK, USERSPACE, USER_STACK};
use memory::{
    frame_bytes, frame_bytes_mut, PageTableFlags, PhysFrame, VirtAddr, VirtAddrRange, VirtPage,
};
use physmem::{AllocFlags, PoolFrameAllocator};
use spin::{lock, Mutex};
use storage::block::Device;

/// Uniquely identifies a process throughout the kernel.
///
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ProcessId(u64);

impl ProcessId {
    /// Allocates and returns the next available process id.
    ///
    pub fn new() -> Self {
        static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);
        ProcessId(NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns a numerical representation for the process
    /// id.
    ///
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Identifies one memory-mapped file region within a process.
///
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct MapId(u64);

impl MapId {
    /// Returns a numerical representation for the mapping
    /// id.
    ///
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

/// The kind of memory access that raised a fault.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultAccess {
    /// The faulting instruction was reading.
    Read,

    /// The faulting instruction was writing.
    Write,
}

/// What the fault handler decided about a fault.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultOutcome {
    /// The fault has been resolved; the faulting access
    /// can be retried and will now succeed.
    Resumed,

    /// The fault cannot be resolved; the process must be
    /// terminated with exit status -1.
    Terminated,
}

/// Describes why a user page could not be accessed through
/// its translation.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccessError {
    /// The page has no live translation. Raising a page
    /// fault may make it accessible.
    NotPresent,

    /// The page's translation is read-only and the access
    /// was a write.
    ReadOnly,
}

/// Describes why a memory mapping could not be created.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MapError {
    /// The requested address was null, unaligned, or the
    /// mapped span would leave userspace or collide with
    /// the stack region.
    InvalidAddress,

    /// The file to be mapped is empty.
    EmptyFile,

    /// The mapped span would collide with pages the
    /// process already has a claim on.
    Overlap,
}

/// A point-in-time summary of the system's memory state.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VmStats {
    /// The number of frames in the user pool.
    pub user_frames: usize,

    /// The number of user-pool frames not currently
    /// assigned.
    pub free_user_frames: usize,

    /// The number of frames recorded in the frame table.
    pub frames_assigned: usize,

    /// The number of slots on the swap device.
    pub swap_slots: usize,

    /// The number of swap slots holding evicted pages.
    pub swap_slots_in_use: usize,
}

/// A point-in-time summary of one process's memory state.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProcessVmStats {
    /// Pages currently backed by a frame.
    pub resident: usize,

    /// Pages evicted to a swap slot.
    pub evicted_to_swap: usize,

    /// Pages with no frame whose contents will be
    /// recreated from a file.
    pub evicted_to_file: usize,

    /// Live memory-mapped file regions.
    pub mappings: usize,
}

// The state guarded by the paging lock.
//
struct VmState {
    allocator: PoolFrameAllocator,
    frames: FrameTable,
    swap: SwapTable,
    processes: BTreeMap<ProcessId, ProcessVm>,
}

/// The virtual memory system.
///
/// One `VmSystem` serves the whole kernel. It is created during
/// kernel initialisation, before the first user process, and
/// all of its operations serialise on the paging lock within.
///
pub struct VmSystem {
    inner: Mutex<VmState>,
}

impl VmSystem {
    /// Returns a new virtual memory system drawing frames from
    /// `allocator` and swapping to `swap_disk`.
    ///
    pub fn new(allocator: PoolFrameAllocator, swap_disk: Box<dyn Device + Send>) -> Self {
        VmSystem {
            inner: Mutex::new(VmState {
                allocator,
                frames: FrameTable::new(),
                swap: SwapTable::new(swap_disk),
                processes: BTreeMap::new(),
            }),
        }
    }

    /// Registers a new process and returns its id.
    ///
    /// The process starts with no pages at all; the loader and
    /// [`setup_stack`](VmSystem::setup_stack) give it its first
    /// claims.
    ///
    pub fn create_process(&self) -> ProcessId {
        let pid = ProcessId::new();
        let mut state = lock!(self.inner);
        state.processes.insert(pid, ProcessVm::new());
        pid
    }

    /// Tears down all memory state belonging to the process.
    ///
    /// Resident frames are freed (after writing dirty mapped
    /// pages back to their files), swap slots are released, and
    /// every page record and mapping record is dropped.
    ///
    pub fn destroy_process(&self, pid: ProcessId) {
        let mut state = lock!(self.inner);
        let VmState {
            allocator,
            frames,
            swap,
            processes,
        } = &mut *state;

        let mut process = match processes.remove(&pid) {
            Some(process) => process,
            None => return,
        };

        let records = core::mem::take(&mut process.records);
        for (page, record) in records {
            match record.state {
                PageState::Resident { frame } => {
                    if record.mapped && record.writable && process.pagedir.is_dirty(page) {
                        if let Some(origin) = &record.origin {
                            let bytes = unsafe { frame_bytes(frame) };
                            origin
                                .file
                                .write_at(origin.offset, &bytes[..origin.read_bytes])
                                .expect("write-back to mapped file failed");
                        }
                    }

                    frame_free(allocator, frames, &mut process, frame);
                }
                PageState::Evicted { slot: Some(slot) } => swap.release(slot),
                PageState::Evicted { slot: None } => {}
            }
        }
    }

    /// Gives the process its first stack page and returns the
    /// initial user stack pointer.
    ///
    pub fn setup_stack(&self, pid: ProcessId) -> VirtAddr {
        let top = memory::constants::USER_STACK_TOP;
        let page = VirtPage::containing_address(top - PAGE_SIZE);

        let mut state = lock!(self.inner);
        frame_alloc(&mut state, pid, page, AllocFlags::USER_ZERO, true);
        if let Some(process) = state.processes.get_mut(&pid) {
            process.stack_pointer = Some(top);
        }

        top
    }

    /// Records the user stack pointer captured on entry to the
    /// kernel, for use by the fault handler's stack heuristic.
    ///
    pub fn set_stack_pointer(&self, pid: ProcessId, sp: VirtAddr) {
        let mut state = lock!(self.inner);
        if let Some(process) = state.processes.get_mut(&pid) {
            process.stack_pointer = Some(sp);
        }
    }

    /// Deposits lazily-loaded page records for one executable
    /// segment.
    ///
    /// The first `read_bytes` bytes of the span come from `file`
    /// at `offset`; the following `zero_bytes` bytes read as
    /// zero. No frames are allocated here: each page is faulted
    /// in on first access.
    ///
    /// # Panics
    ///
    /// `map_segment` will panic if `base` or `offset` is not
    /// page-aligned, or if `read_bytes + zero_bytes` is not an
    /// exact number of pages. These indicate a defective loader.
    ///
    pub fn map_segment(
        &self,
        pid: ProcessId,
        file: File,
        offset: usize,
        base: VirtAddr,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), MapError> {
        assert!(base.is_aligned(PAGE_SIZE), "segment base is unaligned");
        assert!(offset % PAGE_SIZE == 0, "segment offset is unaligned");
        assert!(
            (read_bytes + zero_bytes) % PAGE_SIZE == 0,
            "segment span is not an exact number of pages"
        );

        let num_pages = (read_bytes + zero_bytes) / PAGE_SIZE;
        if num_pages == 0 {
            return Ok(());
        }

        check_span(base, num_pages)?;

        let mut state = lock!(self.inner);
        let process = state
            .processes
            .get_mut(&pid)
            .expect("mapping a segment for an unknown process");

        for i in 0..num_pages {
            let page = VirtPage::containing_address(base + i * PAGE_SIZE);
            if process.records.contains_key(&page) {
                return Err(MapError::Overlap);
            }
        }

        let mut remaining = read_bytes;
        for i in 0..num_pages {
            let page = VirtPage::containing_address(base + i * PAGE_SIZE);
            let page_read = min(remaining, PAGE_SIZE);
            remaining -= page_read;

            process.records.insert(
                page,
                PageRecord {
                    state: PageState::Evicted { slot: None },
                    writable,
                    mapped: false,
                    origin: Some(FileOrigin {
                        file: file.clone(),
                        offset: offset + i * PAGE_SIZE,
                        read_bytes: page_read,
                        zero_bytes: PAGE_SIZE - page_read,
                    }),
                },
            );
        }

        Ok(())
    }

    /// Maps the given file into the process's address space at
    /// `addr`, returning the new mapping's id.
    ///
    /// Pages are faulted in lazily. The mapping's writability is
    /// inherited from the file: a file whose writes are denied
    /// maps read-only.
    ///
    pub fn mmap(&self, pid: ProcessId, file: File, addr: VirtAddr) -> Result<MapId, MapError> {
        if addr.is_zero() || !addr.is_aligned(PAGE_SIZE) {
            return Err(MapError::InvalidAddress);
        }

        let len = file.len();
        if len == 0 {
            return Err(MapError::EmptyFile);
        }

        let num_pages = (len + PAGE_SIZE - 1) / PAGE_SIZE;
        check_span(addr, num_pages)?;

        let mut state = lock!(self.inner);
        let process = state
            .processes
            .get_mut(&pid)
            .expect("mapping a file for an unknown process");

        for i in 0..num_pages {
            let page = VirtPage::containing_address(addr + i * PAGE_SIZE);
            if process.records.contains_key(&page) {
                return Err(MapError::Overlap);
            }
        }

        let writable = !file.is_write_denied();
        let mut remaining = len;
        for i in 0..num_pages {
            let page = VirtPage::containing_address(addr + i * PAGE_SIZE);
            let page_read = min(remaining, PAGE_SIZE);
            remaining -= page_read;

            process.records.insert(
                page,
                PageRecord {
                    state: PageState::Evicted { slot: None },
                    writable,
                    mapped: true,
                    origin: Some(FileOrigin {
                        file: file.clone(),
                        offset: i * PAGE_SIZE,
                        read_bytes: page_read,
                        zero_bytes: PAGE_SIZE - page_read,
                    }),
                },
            );
        }

        let mapid = MapId(process.next_mapid);
        process.next_mapid += 1;
        process.mappings.insert(
            mapid,
            MappingRecord {
                file,
                base: VirtPage::containing_address(addr),
                num_pages,
            },
        );

        Ok(mapid)
    }

    /// Removes the given mapping, writing dirty resident pages
    /// back to the file and releasing the covered frames and
    /// page records.
    ///
    /// Returns whether a mapping was removed; an unknown mapid
    /// is ignored.
    ///
    pub fn munmap(&self, pid: ProcessId, mapid: MapId) -> bool {
        let mut state = lock!(self.inner);
        let VmState {
            allocator,
            frames,
            swap,
            processes,
        } = &mut *state;

        let process = match processes.get_mut(&pid) {
            Some(process) => process,
            None => return false,
        };
        let mapping = match process.mappings.remove(&mapid) {
            Some(mapping) => mapping,
            None => return false,
        };

        for i in 0..mapping.num_pages {
            let page = VirtPage::containing_address(mapping.base.start_address() + i * PAGE_SIZE);
            let record = match process.records.remove(&page) {
                Some(record) => record,
                None => continue,
            };

            match record.state {
                PageState::Resident { frame } => {
                    if record.writable && process.pagedir.is_dirty(page) {
                        if let Some(origin) = &record.origin {
                            let bytes = unsafe { frame_bytes(frame) };
                            mapping
                                .file
                                .write_at(origin.offset, &bytes[..origin.read_bytes])
                                .expect("write-back to mapped file failed");
                        }
                    }

                    frame_free(allocator, frames, process, frame);
                }
                PageState::Evicted { slot: Some(slot) } => swap.release(slot),
                PageState::Evicted { slot: None } => {}
            }
        }

        true
    }

    /// Resolves a page fault at `addr`.
    ///
    /// Faults on kernel addresses, writes through read-only
    /// translations, spurious faults on resident pages and
    /// stray accesses all terminate the process. Faults on
    /// evicted pages swap or lazily load the page in, and
    /// faults just below the captured stack pointer grow the
    /// stack by one zeroed page.
    ///
    pub fn handle_fault(&self, pid: ProcessId, addr: VirtAddr, access: FaultAccess) -> FaultOutcome {
        if !USERSPACE.contains_addr(addr) {
            // A kernel (or null-page) address: never
            // resolvable on behalf of user code.
            return FaultOutcome::Terminated;
        }

        let page = VirtPage::containing_address(addr);
        let mut state = lock!(self.inner);

        // Decide what to do under the lock, without yet
        // mutating anything.
        enum Action {
            Terminate,
            SwapIn,
            GrowStack,
        }

        let action = {
            let process = match state.processes.get(&pid) {
                Some(process) => process,
                None => return FaultOutcome::Terminated,
            };

            match process.records.get(&page) {
                Some(record) => match record.state {
                    // A fault on a resident page is either a
                    // write through a read-only translation or
                    // a spurious fault. Both end the process.
                    PageState::Resident { .. } => Action::Terminate,
                    PageState::Evicted { .. } => {
                        if access == FaultAccess::Write && !record.writable {
                            Action::Terminate
                        } else {
                            Action::SwapIn
                        }
                    }
                },
                None => {
                    // No claim on this page: the only rescue is
                    // the stack heuristic. The access must be in
                    // the reserved stack region and no further
                    // below the captured stack pointer than a
                    // push-style instruction can reach.
                    let grows = match process.stack_pointer {
                        Some(sp) => {
                            let floor = sp.checked_sub(PUSH_SLACK).unwrap_or(VirtAddr::zero());
                            USER_STACK.contains_addr(addr) && addr >= floor
                        }
                        None => false,
                    };

                    if grows {
                        Action::GrowStack
                    } else {
                        Action::Terminate
                    }
                }
            }
        };

        match action {
            Action::Terminate => FaultOutcome::Terminated,
            Action::SwapIn => {
                swap_in(&mut state, pid, page);
                FaultOutcome::Resumed
            }
            Action::GrowStack => {
                frame_alloc(&mut state, pid, page, AllocFlags::USER_ZERO, true);
                FaultOutcome::Resumed
            }
        }
    }

    /// Runs `f` over the contents of the frame backing `page`,
    /// under the paging lock, updating the translation's
    /// accessed (and, for writes, dirty) bits.
    ///
    /// This is the memory management unit of the hosted kernel:
    /// every user-mode load and store goes through it. If the
    /// page has no live translation, or is read-only and `write`
    /// is requested, the access faults instead and `f` is not
    /// run.
    ///
    pub fn with_user_page<R>(
        &self,
        pid: ProcessId,
        page: VirtPage,
        write: bool,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, AccessError> {
        let mut state = lock!(self.inner);
        let process = state
            .processes
            .get_mut(&pid)
            .ok_or(AccessError::NotPresent)?;

        let (frame, flags) = process
            .pagedir
            .lookup_entry(page)
            .ok_or(AccessError::NotPresent)?;
        if write && !flags.contains(PageTableFlags::WRITABLE) {
            return Err(AccessError::ReadOnly);
        }

        process.pagedir.mark_accessed(page, write);

        // We hold the paging lock, so nothing else can access
        // or reclaim the frame while f runs.
        let bytes = unsafe { frame_bytes_mut(frame) };
        Ok(f(bytes))
    }

    /// Returns a summary of the system's memory state.
    ///
    pub fn stats(&self) -> VmStats {
        let state = lock!(self.inner);
        VmStats {
            user_frames: state.allocator.num_user_frames(),
            free_user_frames: state.allocator.free_user_frames(),
            frames_assigned: state.frames.len(),
            swap_slots: state.swap.num_slots(),
            swap_slots_in_use: state.swap.slots_in_use(),
        }
    }

    /// Returns a summary of one process's memory state, or
    /// `None` for an unknown process.
    ///
    pub fn process_stats(&self, pid: ProcessId) -> Option<ProcessVmStats> {
        let state = lock!(self.inner);
        let process = state.processes.get(&pid)?;

        let mut stats = ProcessVmStats {
            resident: 0,
            evicted_to_swap: 0,
            evicted_to_file: 0,
            mappings: process.mappings.len(),
        };
        for record in process.records.values() {
            match record.state {
                PageState::Resident { .. } => stats.resident += 1,
                PageState::Evicted { slot: Some(_) } => stats.evicted_to_swap += 1,
                PageState::Evicted { slot: None } => stats.evicted_to_file += 1,
            }
        }

        Some(stats)
    }

    /// Checks the structural agreement between the frame table,
    /// the page records, the page directories, the swap table
    /// and the allocator, returning a description of the first
    /// disagreement found.
    ///
    pub fn integrity_check(&self) -> Result<(), &'static str> {
        let state = lock!(self.inner);

        let mut resident_total = 0;
        let mut swap_backed_total = 0;
        for (pid, process) in state.processes.iter() {
            let mut resident = 0;
            for (page, record) in process.records.iter() {
                match record.state {
                    PageState::Resident { frame } => {
                        resident += 1;

                        let entry = state
                            .frames
                            .find(frame)
                            .ok_or("resident page has no frame table entry")?;
                        if entry.page() != *page || entry.owner() != *pid {
                            return Err("frame table entry does not match its page record");
                        }

                        match process.pagedir.lookup_entry(*page) {
                            None => return Err("resident page has no live translation"),
                            Some((mapped_frame, flags)) => {
                                if mapped_frame != frame {
                                    return Err("translation points at the wrong frame");
                                }
                                if flags.contains(PageTableFlags::WRITABLE) != record.writable {
                                    return Err("translation writability disagrees with record");
                                }
                            }
                        }
                    }
                    PageState::Evicted { slot } => {
                        if process.pagedir.lookup(*page).is_some() {
                            return Err("evicted page still has a live translation");
                        }
                        match slot {
                            Some(_) => {
                                if record.origin.is_some() {
                                    return Err("page holds both a swap slot and a file origin");
                                }
                                swap_backed_total += 1;
                            }
                            None => {
                                if record.origin.is_none() {
                                    return Err("evicted page has no backing store");
                                }
                            }
                        }
                    }
                }
            }

            if process.pagedir.len() != resident {
                return Err("page directory size disagrees with resident pages");
            }

            resident_total += resident;
        }

        if state.frames.len() != resident_total {
            return Err("frame table size disagrees with resident pages");
        }
        if state.swap.slots_in_use() != swap_backed_total {
            return Err("swap occupancy disagrees with swap-backed pages");
        }
        if state.allocator.free_user_frames() + state.frames.len()
            != state.allocator.num_user_frames()
        {
            return Err("allocator accounting disagrees with the frame table");
        }

        Ok(())
    }

    /// Logs debug information about the memory system's state.
    ///
    pub fn debug(&self) {
        let state = lock!(self.inner);
        state.allocator.debug();
        log::debug!(
            "{} frames assigned, {}/{} swap slots in use, {} processes",
            state.frames.len(),
            state.swap.slots_in_use(),
            state.swap.num_slots(),
            state.processes.len(),
        );
    }
}

// check_span validates that the num_pages pages starting at
// addr lie entirely within userspace and clear of the reserved
// stack region.
//
fn check_span(addr: VirtAddr, num_pages: usize) -> Result<(), MapError> {
    let last = addr
        .checked_add(num_pages * PAGE_SIZE - 1)
        .ok_or(MapError::InvalidAddress)?;
    let span = VirtAddrRange::new(addr, last);
    if !USERSPACE.contains(&span) || span.overlaps(&USER_STACK) {
        return Err(MapError::InvalidAddress);
    }

    Ok(())
}

// frame_alloc obtains a frame for the given user page, evicting
// once if the pool is dry, installs the translation, records the
// assignment in the frame table, and marks the page's record
// resident (creating a fresh anonymous record if the page had
// none, as in stack growth).
//
// A second allocation failure means memory and swap are both
// exhausted, and a translation conflict means the caller lost
// track of a resident page; both are fatal.
//
fn frame_alloc(
    state: &mut VmState,
    pid: ProcessId,
    page: VirtPage,
    flags: AllocFlags,
    writable: bool,
) -> PhysFrame {
    let frame = match state.allocator.get_page(flags) {
        Some(frame) => frame,
        None => {
            evict_one(state);
            state
                .allocator
                .get_page(flags)
                .expect("out of physical memory after eviction")
        }
    };

    let process = state
        .processes
        .get_mut(&pid)
        .expect("allocating a frame for an unknown process");
    if process.pagedir.install(page, frame, writable).is_err() {
        panic!(
            "page at {:p} already has a live translation",
            page.start_address()
        );
    }

    match process.records.get_mut(&page) {
        Some(record) => {
            // The page already has a record (swap-in or lazy
            // load): update it in place rather than replacing
            // it, so its origin and flags survive.
            debug_assert_eq!(record.writable, writable);
            record.state = PageState::Resident { frame };
        }
        None => {
            process.records.insert(
                page,
                PageRecord {
                    state: PageState::Resident { frame },
                    writable,
                    mapped: false,
                    origin: None,
                },
            );
        }
    }

    state.frames.insert(FrameTableEntry::new(frame, page, pid));
    frame
}

// evict_one reclaims the oldest assigned frame, displacing its
// contents according to the owning page's class.
//
fn evict_one(state: &mut VmState) {
    let victim = state
        .frames
        .pop_victim()
        .expect("no assigned frames to evict");
    swap_out(state, &victim);
}

// swap_out displaces the victim's page, leaving its record
// evicted and its frame back in the pool. The victim has
// already been removed from the frame table.
//
fn swap_out(state: &mut VmState, victim: &FrameTableEntry) {
    let VmState {
        allocator,
        swap,
        processes,
        ..
    } = state;

    let page = victim.page();
    let process = processes
        .get_mut(&victim.owner())
        .expect("victim frame owned by unknown process");
    let record = process
        .records
        .get_mut(&page)
        .expect("victim frame has no page record");
    let dirty = process.pagedir.is_dirty(page);

    // The page's class determines where its contents go.
    enum Disposition {
        ToSwap,
        Discard,
        WriteBack {
            file: File,
            offset: usize,
            read_bytes: usize,
        },
        Promote,
    }

    let disposition = match &record.origin {
        // Anonymous (or already promoted): round-trip
        // through swap.
        None => Disposition::ToSwap,

        // A read-only file page can always be re-read from
        // the file, so the frame is simply dropped.
        Some(_) if !record.writable => Disposition::Discard,

        // A mapped, writable page writes back to its file
        // if it has been written through its translation.
        Some(origin) if record.mapped => {
            if dirty {
                Disposition::WriteBack {
                    file: origin.file.clone(),
                    offset: origin.offset,
                    read_bytes: origin.read_bytes,
                }
            } else {
                Disposition::Discard
            }
        }

        // A writable segment page leaves its file behind on
        // first eviction: from now on it is swap-backed.
        Some(_) => Disposition::Promote,
    };

    let bytes = unsafe { frame_bytes(victim.frame()) };
    match disposition {
        Disposition::ToSwap => {
            let slot = match swap.allocate() {
                Some(slot) => slot,
                None => panic!("swap device full while evicting a swap-bound page"),
            };
            swap.write_page(slot, bytes).expect("swap device write failed");
            record.state = PageState::Evicted { slot: Some(slot) };
        }
        Disposition::Discard => {
            record.state = PageState::Evicted { slot: None };
        }
        Disposition::WriteBack {
            file,
            offset,
            read_bytes,
        } => {
            file.write_at(offset, &bytes[..read_bytes])
                .expect("write-back to mapped file failed");
            record.state = PageState::Evicted { slot: None };
        }
        Disposition::Promote => {
            record.origin = None;
            let slot = match swap.allocate() {
                Some(slot) => slot,
                None => panic!("swap device full while evicting a swap-bound page"),
            };
            swap.write_page(slot, bytes).expect("swap device write failed");
            record.state = PageState::Evicted { slot: Some(slot) };
        }
    }

    process.pagedir.clear(page);
    allocator.free_page(victim.frame());
}

// swap_in makes an evicted page resident again, refilling its
// contents from its swap slot or its file origin. The page's
// record is updated in place; no new record is created.
//
fn swap_in(state: &mut VmState, pid: ProcessId, page: VirtPage) {
    // Capture the refill source before the allocation below
    // reshapes the state.
    let (writable, slot, origin) = {
        let process = state
            .processes
            .get(&pid)
            .expect("swapping in a page for an unknown process");
        let record = process
            .records
            .get(&page)
            .expect("swapping in a page with no record");

        let slot = match record.state {
            PageState::Evicted { slot } => slot,
            PageState::Resident { .. } => panic!("swapping in a resident page"),
        };
        let origin = record
            .origin
            .as_ref()
            .map(|origin| (origin.file.clone(), origin.offset, origin.read_bytes, origin.zero_bytes));

        (record.writable, slot, origin)
    };

    let frame = frame_alloc(state, pid, page, AllocFlags::USER, writable);
    let bytes = unsafe { frame_bytes_mut(frame) };

    match (slot, origin) {
        (Some(slot), _) => {
            state
                .swap
                .read_page(slot, bytes)
                .expect("swap device read failed");
            state.swap.release(slot);
        }
        (None, Some((file, offset, read_bytes, zero_bytes))) => {
            let n = file
                .read_at(offset, &mut bytes[..read_bytes])
                .expect("file read failed during lazy load");
            assert_eq!(n, read_bytes, "file shrank underneath a lazy-loadable page");
            bytes[read_bytes..read_bytes + zero_bytes].fill(0);
        }
        (None, None) => panic!("evicted page has no backing store"),
    }
}

// frame_free releases an assigned frame: the translation is
// cleared, the page's record (if it still exists) is marked
// non-resident, and the frame returns to the pool. Freeing a
// frame that is not assigned is logged and ignored.
//
fn frame_free(
    allocator: &mut PoolFrameAllocator,
    frames: &mut FrameTable,
    process: &mut ProcessVm,
    frame: PhysFrame,
) {
    let entry = match frames.remove(frame) {
        Some(entry) => entry,
        None => {
            warn!(
                "freeing unassigned frame at {:#x}, ignored",
                frame.start_address().as_usize()
            );
            return;
        }
    };

    process.pagedir.clear(entry.page());
    if let Some(record) = process.records.get_mut(&entry.page()) {
        record.state = PageState::Evicted { slot: None };
    }

    allocator.free_page(frame);
}

#[cfg(test)]
mod tests {
    use super::*;
    use filesystem::FileSystem;
    use memory::constants::USER_STACK_TOP;
    use physmem::{allocate_arena, BitmapPool};
    use storage::block::ram::RamDisk;
    use storage::cache::BlockCache;

    // A small memory system plus a formatted volume to map
    // files from.
    //
    fn test_system(user_frames: usize, swap_slots: usize) -> (VmSystem, FileSystem) {
        let user = unsafe { BitmapPool::new(allocate_arena(user_frames), user_frames) };
        let kernel = unsafe { BitmapPool::new(allocate_arena(1), 1) };
        let allocator = PoolFrameAllocator::new(user, kernel);

        let swap_disk = RamDisk::new(swap_slots * crate::swap::SECTORS_PER_SLOT);
        let vm = VmSystem::new(allocator, Box::new(swap_disk));

        let fs_disk = RamDisk::new(256);
        let cache = BlockCache::new(Box::new(fs_disk));
        let fs = FileSystem::format(cache, 256).unwrap();

        (vm, fs)
    }

    // Emulate a user-mode store, faulting the page in as the
    // processor would.
    //
    fn user_write(vm: &VmSystem, pid: ProcessId, addr: VirtAddr, value: u8) -> FaultOutcome {
        let page = VirtPage::containing_address(addr);
        let offset = addr.as_usize() - page.start_address().as_usize();
        loop {
            match vm.with_user_page(pid, page, true, |bytes| bytes[offset] = value) {
                Ok(()) => return FaultOutcome::Resumed,
                Err(_) => {
                    if vm.handle_fault(pid, addr, FaultAccess::Write) == FaultOutcome::Terminated {
                        return FaultOutcome::Terminated;
                    }
                }
            }
        }
    }

    fn user_read(vm: &VmSystem, pid: ProcessId, addr: VirtAddr) -> Result<u8, ()> {
        let page = VirtPage::containing_address(addr);
        let offset = addr.as_usize() - page.start_address().as_usize();
        loop {
            match vm.with_user_page(pid, page, false, |bytes| bytes[offset]) {
                Ok(value) => return Ok(value),
                Err(_) => {
                    if vm.handle_fault(pid, addr, FaultAccess::Read) == FaultOutcome::Terminated {
                        return Err(());
                    }
                }
            }
        }
    }

    #[test]
    fn test_stack_setup_and_growth() {
        let (vm, _) = test_system(4, 8);
        let pid = vm.create_process();
        let sp = vm.setup_stack(pid);
        assert_eq!(sp, USER_STACK_TOP);

        // The first stack page is resident and zeroed.
        assert_eq!(user_read(&vm, pid, sp - 4), Ok(0));

        // An access just below the stack pointer grows the
        // stack by a page.
        let lower = sp - PAGE_SIZE - 4;
        vm.set_stack_pointer(pid, lower);
        assert_eq!(user_write(&vm, pid, lower, 0x7f), FaultOutcome::Resumed);
        assert_eq!(user_read(&vm, pid, lower), Ok(0x7f));
        assert_eq!(vm.process_stats(pid).unwrap().resident, 2);

        // An access far below the stack pointer does not.
        let stray = lower - 8192;
        assert_eq!(
            vm.handle_fault(pid, stray, FaultAccess::Write),
            FaultOutcome::Terminated
        );

        // Neither does one below the stack region entirely.
        assert_eq!(
            vm.handle_fault(pid, VirtAddr::new(0x40_0000), FaultAccess::Write),
            FaultOutcome::Terminated
        );

        vm.integrity_check().unwrap();
        vm.destroy_process(pid);
        assert_eq!(vm.stats().frames_assigned, 0);
    }

    #[test]
    fn test_eviction_round_trips_through_swap() {
        // Two user frames force constant eviction across
        // three stack pages.
        let (vm, _) = test_system(2, 8);
        let pid = vm.create_process();
        let top = vm.setup_stack(pid);

        let addrs = [top - 10, top - PAGE_SIZE - 10, top - 2 * PAGE_SIZE - 10];
        for (i, addr) in addrs.iter().enumerate() {
            vm.set_stack_pointer(pid, *addr);
            assert_eq!(user_write(&vm, pid, *addr, 0x40 + i as u8), FaultOutcome::Resumed);
        }

        // Only two pages can be resident; at least one is
        // in swap.
        let stats = vm.process_stats(pid).unwrap();
        assert_eq!(stats.resident, 2);
        assert_eq!(stats.evicted_to_swap, 1);
        assert_eq!(vm.stats().swap_slots_in_use, 1);
        vm.integrity_check().unwrap();

        // Every page still reads back what was written,
        // wherever it currently lives.
        for (i, addr) in addrs.iter().enumerate() {
            assert_eq!(user_read(&vm, pid, *addr), Ok(0x40 + i as u8));
        }

        // Teardown releases the frames and any swap slots.
        vm.destroy_process(pid);
        let stats = vm.stats();
        assert_eq!(stats.frames_assigned, 0);
        assert_eq!(stats.free_user_frames, stats.user_frames);
        assert_eq!(stats.swap_slots_in_use, 0);
    }

    #[test]
    fn test_lazy_segment_load() {
        let (vm, fs) = test_system(4, 8);
        fs.create("prog", 2 * PAGE_SIZE).unwrap();
        let file = fs.open("prog").unwrap();
        file.write_at(0, &[0x11u8; PAGE_SIZE]).unwrap();
        file.write_at(PAGE_SIZE, &[0x22u8; PAGE_SIZE]).unwrap();

        let pid = vm.create_process();
        vm.setup_stack(pid);

        let base = VirtAddr::new(0x40_0000);
        vm.map_segment(pid, file, 0, base, 2 * PAGE_SIZE, 0, false)
            .unwrap();

        // Nothing is resident until touched.
        assert_eq!(vm.process_stats(pid).unwrap().evicted_to_file, 2);

        assert_eq!(user_read(&vm, pid, base), Ok(0x11));
        assert_eq!(user_read(&vm, pid, base + PAGE_SIZE + 7), Ok(0x22));
        assert_eq!(vm.process_stats(pid).unwrap().resident, 3);

        // The segment is read-only: a write must terminate.
        assert_eq!(user_write(&vm, pid, base, 0xff), FaultOutcome::Terminated);

        vm.integrity_check().unwrap();
        vm.destroy_process(pid);
    }

    #[test]
    fn test_writable_segment_promotes_to_swap() {
        // One user frame: every touch evicts the previous
        // page.
        let (vm, fs) = test_system(1, 8);
        fs.create("data", PAGE_SIZE).unwrap();
        let file = fs.open("data").unwrap();

        let pid = vm.create_process();
        let base = VirtAddr::new(0x40_0000);
        vm.map_segment(pid, file.clone(), 0, base, PAGE_SIZE, 0, true)
            .unwrap();

        // Load the page and scribble on it.
        assert_eq!(user_write(&vm, pid, base, 0x5a), FaultOutcome::Resumed);

        // Touching another page evicts it; being a writable
        // segment page, it must go to swap, not back to the
        // file.
        vm.set_stack_pointer(pid, USER_STACK_TOP);
        assert_eq!(
            user_write(&vm, pid, USER_STACK_TOP - 4, 1),
            FaultOutcome::Resumed
        );
        let stats = vm.process_stats(pid).unwrap();
        assert_eq!(stats.evicted_to_swap, 1);

        let mut buf = [0u8; 1];
        file.read_at(0, &mut buf).unwrap();
        assert_eq!(buf[0], 0, "segment page leaked into its file");

        // The scribble survives the round trip.
        assert_eq!(user_read(&vm, pid, base), Ok(0x5a));

        vm.integrity_check().unwrap();
        vm.destroy_process(pid);
    }

    #[test]
    fn test_mmap_validation() {
        let (vm, fs) = test_system(4, 8);
        fs.create("mapped", 3 * PAGE_SIZE).unwrap();
        fs.create("empty", 0).unwrap();
        let file = fs.open("mapped").unwrap();

        let pid = vm.create_process();
        vm.setup_stack(pid);

        // A null or unaligned address is refused.
        assert_eq!(
            vm.mmap(pid, file.clone(), VirtAddr::zero()).err(),
            Some(MapError::InvalidAddress)
        );
        assert_eq!(
            vm.mmap(pid, file.clone(), VirtAddr::new(0x40_0010)).err(),
            Some(MapError::InvalidAddress)
        );

        // An empty file is refused.
        assert_eq!(
            vm.mmap(pid, fs.open("empty").unwrap(), VirtAddr::new(0x40_0000))
                .err(),
            Some(MapError::EmptyFile)
        );

        // The reserved stack region is refused.
        assert_eq!(
            vm.mmap(pid, file.clone(), USER_STACK.start()).err(),
            Some(MapError::InvalidAddress)
        );

        // Overlap with an existing mapping is refused, and
        // the failed call changes nothing.
        let base = VirtAddr::new(0x40_0000);
        let mapid = vm.mmap(pid, file.clone(), base).unwrap();
        assert_eq!(
            vm.mmap(pid, file.clone(), base + PAGE_SIZE).err(),
            Some(MapError::Overlap)
        );
        assert_eq!(vm.process_stats(pid).unwrap().mappings, 1);

        // Unknown mapids are ignored; known ones unmap.
        assert!(!vm.munmap(pid, MapId(999)));
        assert!(vm.munmap(pid, mapid));
        assert_eq!(vm.process_stats(pid).unwrap().mappings, 0);
        assert_eq!(vm.process_stats(pid).unwrap().resident, 1);

        vm.integrity_check().unwrap();
        vm.destroy_process(pid);
    }

    #[test]
    fn test_munmap_writes_back_dirty_pages() {
        let (vm, fs) = test_system(4, 8);
        fs.create("shared", 2 * PAGE_SIZE).unwrap();
        let file = fs.open("shared").unwrap();

        let pid = vm.create_process();
        vm.setup_stack(pid);

        let base = VirtAddr::new(0x40_0000);
        let mapid = vm.mmap(pid, file.clone(), base).unwrap();

        // Dirty the second page only.
        assert_eq!(
            user_write(&vm, pid, base + PAGE_SIZE + 3, 0xcd),
            FaultOutcome::Resumed
        );
        assert_eq!(user_read(&vm, pid, base), Ok(0));

        vm.munmap(pid, mapid);

        // The dirtied byte is now visible through the file;
        // the clean page was not written.
        let mut buf = [0u8; 1];
        file.read_at(PAGE_SIZE + 3, &mut buf).unwrap();
        assert_eq!(buf[0], 0xcd);

        // No pages remain over the unmapped range.
        let stats = vm.process_stats(pid).unwrap();
        assert_eq!(stats.resident, 1); // the stack page
        assert_eq!(stats.evicted_to_file, 0);

        vm.integrity_check().unwrap();
        vm.destroy_process(pid);
    }
}
