// Copyright 2025 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements user processes.
//!
//! A process here is the resource-ownership half of the story:
//! its name, its open file descriptors, its memory mappings and
//! its executable handle. Its memory itself (page directory,
//! page records, mappings) is owned by the virtual memory
//! system and keyed by the process id. Scheduling is out of
//! scope: callers drive processes one at a time.

use crate::Kernel;
use alloc::collections::BTreeMap;
use alloc::string::String;
use filesystem::File;
use log::info;
use memory::VirtAddr;
use spin::lock;
use vm::{MapId, ProcessId};

/// The lowest file descriptor handed to user code. Descriptors
/// 0 and 1 are reserved for the console.
///
pub(crate) const FIRST_FD: isize = 2;

/// Describes one loadable segment of an executable.
///
#[derive(Clone, Copy, Debug)]
pub struct Segment {
    /// The page-aligned file offset the segment is read
    /// from.
    pub offset: usize,

    /// The page-aligned user address the segment occupies.
    pub base: VirtAddr,

    /// The number of bytes read from the file.
    pub read_bytes: usize,

    /// The number of zero bytes following them. Together
    /// with `read_bytes`, always a whole number of pages.
    pub zero_bytes: usize,

    /// Whether the segment is writable.
    pub writable: bool,
}

// The kernel-side record of one user process.
//
pub(crate) struct Process {
    pub name: String,

    // files maps open descriptors to files.
    //
    pub files: BTreeMap<isize, File>,
    pub next_fd: isize,

    // mapped_fds records, for each live memory mapping,
    // the descriptor it was created from. Closing such a
    // descriptor is refused while the mapping lives.
    //
    pub mapped_fds: BTreeMap<MapId, isize>,

    // executable holds the running binary with writes
    // denied. Dropped (re-allowing writes) at exit.
    //
    pub executable: Option<File>,
}

impl Process {
    pub fn new(name: &str) -> Self {
        Process {
            name: String::from(name),
            files: BTreeMap::new(),
            next_fd: FIRST_FD,
            mapped_fds: BTreeMap::new(),
            executable: None,
        }
    }

    // fd_is_mapped returns whether any live mapping was
    // created from the given descriptor.
    //
    pub fn fd_is_mapped(&self, fd: isize) -> bool {
        self.mapped_fds.values().any(|&mapped| mapped == fd)
    }
}

impl Kernel {
    /// Creates a new process with a stack but no program, and
    /// returns its id.
    ///
    pub fn create_process(&self, name: &str) -> ProcessId {
        let pid = self.vm().create_process();
        self.vm().setup_stack(pid);

        let mut processes = lock!(self.processes);
        processes.insert(pid, Process::new(name));
        pid
    }

    /// Loads an executable into the process: opens the named
    /// file, denies writes to it for as long as the process
    /// runs, and deposits lazily-loaded page records for each
    /// segment.
    ///
    pub fn load_executable(
        &self,
        pid: ProcessId,
        file_name: &str,
        segments: &[Segment],
    ) -> Result<(), vm::MapError> {
        let mut exe = match self.file_system().open(file_name) {
            Ok(file) => file,
            Err(_) => return Err(vm::MapError::InvalidAddress),
        };
        exe.deny_write();

        for segment in segments {
            self.vm().map_segment(
                pid,
                exe.clone(),
                segment.offset,
                segment.base,
                segment.read_bytes,
                segment.zero_bytes,
                segment.writable,
            )?;
        }

        let mut processes = lock!(self.processes);
        if let Some(process) = processes.get_mut(&pid) {
            process.executable = Some(exe);
        }

        Ok(())
    }

    /// Terminates the process, releasing all of its memory and
    /// files and recording its exit status.
    ///
    pub fn exit(&self, pid: ProcessId, status: i32) {
        // Tear down the process's memory first: this walks
        // the supplemental page table under the paging lock,
        // writing dirty mapped pages back and releasing
        // frames and swap slots.
        self.vm().destroy_process(pid);

        let process = {
            let mut processes = lock!(self.processes);
            processes.remove(&pid)
        };

        if let Some(process) = process {
            info!("{}: exit({})", process.name, status);
        }

        let mut exited = lock!(self.exited);
        exited.insert(pid, status);
    }

    /// Returns the recorded exit status of a terminated
    /// process, or `None` if it has not exited.
    ///
    pub fn exit_status(&self, pid: ProcessId) -> Option<i32> {
        let exited = lock!(self.exited);
        exited.get(&pid).copied()
    }

    /// Returns whether the process is still live.
    ///
    pub fn is_alive(&self, pid: ProcessId) -> bool {
        let processes = lock!(self.processes);
        processes.contains_key(&pid)
    }
}
