// Copyright 2025 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the system call surface.
//!
//! Each syscall is a method on [`Kernel`], invoked by the trap
//! glue with the calling process's id after it has captured the
//! user stack pointer (see [`vm::VmSystem::set_stack_pointer`]).
//!
//! Calls that reference user memory copy through
//! [`Kernel::read_user`] / [`Kernel::write_user`] before any
//! file system lock is taken, so the paging lock and the file
//! system lock are never held together on the syscall path.
//! A call that misuses the interface, such as a bad descriptor
//! or an unreadable buffer, terminates the process with exit
//! status -1, reported here as [`Terminated`].

use crate::process::FIRST_FD;
use crate::Kernel;
use alloc::string::String;
use log::info;
use memory::VirtAddr;
use spin::lock;
use vm::ProcessId;

/// The process was terminated in the middle of the call, so
/// there is no return value to deliver.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Terminated;

impl Kernel {
    /// Opens the named file, returning a new descriptor, or -1
    /// if the file does not exist.
    ///
    /// A process that opens its own executable gets a handle
    /// with writes denied, so a running program cannot be
    /// modified through it.
    ///
    pub fn sys_open(&self, pid: ProcessId, name: &str) -> isize {
        let mut file = match self.file_system().open(name) {
            Ok(file) => file,
            Err(_) => return -1,
        };

        let mut processes = lock!(self.processes);
        let process = match processes.get_mut(&pid) {
            Some(process) => process,
            None => return -1,
        };

        if process.name == name {
            file.deny_write();
        }

        let fd = process.next_fd;
        process.next_fd += 1;
        process.files.insert(fd, file);
        fd
    }

    /// Closes a descriptor.
    ///
    /// Closing a descriptor that backs a live memory mapping is
    /// silently ignored: the mapping (and the descriptor) stay
    /// usable until `munmap`. Closing a descriptor the process
    /// does not hold terminates it.
    ///
    pub fn sys_close(&self, pid: ProcessId, fd: isize) -> Result<(), Terminated> {
        enum Outcome {
            Closed,
            Ignored,
            BadDescriptor,
        }

        let outcome = {
            let mut processes = lock!(self.processes);
            match processes.get_mut(&pid) {
                None => Outcome::BadDescriptor,
                Some(process) => {
                    if process.fd_is_mapped(fd) {
                        Outcome::Ignored
                    } else if process.files.remove(&fd).is_some() {
                        Outcome::Closed
                    } else {
                        Outcome::BadDescriptor
                    }
                }
            }
        };

        match outcome {
            Outcome::Closed => Ok(()),
            Outcome::Ignored => {
                info!("close of a mapped descriptor ignored");
                Ok(())
            }
            Outcome::BadDescriptor => self.bad_descriptor(pid),
        }
    }

    /// Returns the size in bytes of the file behind `fd`.
    ///
    pub fn sys_filesize(&self, pid: ProcessId, fd: isize) -> Result<isize, Terminated> {
        let size = {
            let processes = lock!(self.processes);
            processes
                .get(&pid)
                .and_then(|p| p.files.get(&fd))
                .map(|file| file.len() as isize)
        };

        match size {
            Some(size) => Ok(size),
            None => self.bad_descriptor(pid),
        }
    }

    /// Reads up to `len` bytes from `fd` into the process's
    /// memory at `addr`, returning the number of bytes read.
    ///
    /// Descriptor 0 is the console; with no input source
    /// attached it reads zero bytes.
    ///
    pub fn sys_read(
        &self,
        pid: ProcessId,
        fd: isize,
        addr: VirtAddr,
        len: usize,
    ) -> Result<isize, Terminated> {
        if fd == 0 {
            return Ok(0);
        }

        // Copy out of the file first, while no user page is
        // being touched.
        let data = {
            let mut processes = lock!(self.processes);
            processes
                .get_mut(&pid)
                .and_then(|p| p.files.get_mut(&fd))
                .map(|file| {
                    let mut data = alloc::vec![0u8; len];
                    let n = file.read(&mut data).unwrap_or(0);
                    data.truncate(n);
                    data
                })
        };

        let data = match data {
            Some(data) => data,
            None => return self.bad_descriptor(pid),
        };

        self.write_user(pid, addr, &data)?;
        Ok(data.len() as isize)
    }

    /// Writes `len` bytes from the process's memory at `addr`
    /// to `fd`, returning the number of bytes written.
    ///
    /// Descriptor 1 is the console.
    ///
    pub fn sys_write(
        &self,
        pid: ProcessId,
        fd: isize,
        addr: VirtAddr,
        len: usize,
    ) -> Result<isize, Terminated> {
        // Copy the user buffer first, while no file system
        // lock is held.
        let data = self.read_user(pid, addr, len)?;

        if fd == 1 {
            info!("{}", String::from_utf8_lossy(&data));
            return Ok(len as isize);
        }

        let written = {
            let mut processes = lock!(self.processes);
            processes
                .get_mut(&pid)
                .and_then(|p| p.files.get_mut(&fd))
                .map(|file| file.write(&data).unwrap_or(0))
        };

        match written {
            Some(n) => Ok(n as isize),
            None => self.bad_descriptor(pid),
        }
    }

    /// Moves the cursor of `fd` to `pos`.
    ///
    pub fn sys_seek(&self, pid: ProcessId, fd: isize, pos: usize) -> Result<(), Terminated> {
        let found = {
            let mut processes = lock!(self.processes);
            processes
                .get_mut(&pid)
                .and_then(|p| p.files.get_mut(&fd))
                .map(|file| file.seek(pos))
        };

        match found {
            Some(()) => Ok(()),
            None => self.bad_descriptor(pid),
        }
    }

    /// Returns the cursor position of `fd`.
    ///
    pub fn sys_tell(&self, pid: ProcessId, fd: isize) -> Result<isize, Terminated> {
        let pos = {
            let processes = lock!(self.processes);
            processes
                .get(&pid)
                .and_then(|p| p.files.get(&fd))
                .map(|file| file.tell() as isize)
        };

        match pos {
            Some(pos) => Ok(pos),
            None => self.bad_descriptor(pid),
        }
    }

    /// Creates a file of the given size, returning whether it
    /// succeeded.
    ///
    pub fn sys_create(&self, name: &str, size: usize) -> bool {
        self.file_system().create(name, size).is_ok()
    }

    /// Removes the named file, returning whether it succeeded.
    ///
    pub fn sys_remove(&self, name: &str) -> bool {
        self.file_system().remove(name).is_ok()
    }

    /// Maps the file behind `fd` into the process's memory at
    /// `addr`, returning the mapping id, or -1 if the
    /// descriptor is bad, the address is unsuitable, the file
    /// is empty, or the span would collide with existing pages.
    ///
    pub fn sys_mmap(&self, pid: ProcessId, fd: isize, addr: VirtAddr) -> isize {
        if fd < FIRST_FD {
            return -1;
        }

        let file = {
            let processes = lock!(self.processes);
            match processes.get(&pid).and_then(|p| p.files.get(&fd)) {
                Some(file) => file.clone(),
                None => return -1,
            }
        };

        match self.vm().mmap(pid, file, addr) {
            Ok(mapid) => {
                let mut processes = lock!(self.processes);
                if let Some(process) = processes.get_mut(&pid) {
                    process.mapped_fds.insert(mapid, fd);
                }
                mapid.as_u64() as isize
            }
            Err(_) => -1,
        }
    }

    /// Removes the given memory mapping, flushing dirty pages
    /// back to the file. An unknown mapping id is silently
    /// ignored.
    ///
    pub fn sys_munmap(&self, pid: ProcessId, mapid: isize) {
        let found = {
            let processes = lock!(self.processes);
            processes.get(&pid).and_then(|process| {
                process
                    .mapped_fds
                    .keys()
                    .find(|m| m.as_u64() as isize == mapid)
                    .copied()
            })
        };

        let mapid = match found {
            Some(mapid) => mapid,
            None => return,
        };

        if self.vm().munmap(pid, mapid) {
            let mut processes = lock!(self.processes);
            if let Some(process) = processes.get_mut(&pid) {
                process.mapped_fds.remove(&mapid);
            }
        }
    }

    /// Terminates the calling process with the given status.
    ///
    pub fn sys_exit(&self, pid: ProcessId, status: i32) {
        self.exit(pid, status);
    }

    // bad_descriptor ends the process that passed a descriptor
    // it does not hold, with the conventional fault status.
    //
    fn bad_descriptor<T>(&self, pid: ProcessId) -> Result<T, Terminated> {
        self.exit(pid, -1);
        Err(Terminated)
    }
}
