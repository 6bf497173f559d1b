// Copyright 2025 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements access to user memory from the kernel.
//!
//! In the hosted configuration there is no hardware translation,
//! so this module is also the machine's load/store path: every
//! access consults the process's page directory through
//! [`vm::VmSystem::with_user_page`], and a missing or
//! insufficient translation raises a page fault exactly where
//! the processor would. If the fault handler cannot resolve the
//! fault, the process is terminated with exit status -1, as the
//! trap glue would do.

use crate::syscall::Terminated;
use crate::Kernel;
use alloc::vec;
use alloc::vec::Vec;
use memory::constants::PAGE_SIZE;
use memory::{VirtAddr, VirtPage};
use vm::{FaultAccess, FaultOutcome, ProcessId};

impl Kernel {
    /// Copies `bytes` into the process's memory at `addr`,
    /// faulting pages in as needed.
    ///
    /// If any part of the destination is not writable by the
    /// process, the process is terminated.
    ///
    pub fn write_user(
        &self,
        pid: ProcessId,
        addr: VirtAddr,
        bytes: &[u8],
    ) -> Result<(), Terminated> {
        self.access_user(pid, addr, bytes.len(), FaultAccess::Write, |done, chunk| {
            chunk.copy_from_slice(&bytes[done..done + chunk.len()]);
        })
    }

    /// Copies `len` bytes out of the process's memory at
    /// `addr`, faulting pages in as needed.
    ///
    /// If any part of the source is not readable by the
    /// process, the process is terminated.
    ///
    pub fn read_user(
        &self,
        pid: ProcessId,
        addr: VirtAddr,
        len: usize,
    ) -> Result<Vec<u8>, Terminated> {
        let mut out = vec![0u8; len];
        {
            let out = &mut out;
            self.access_user(pid, addr, len, FaultAccess::Read, |done, chunk| {
                out[done..done + chunk.len()].copy_from_slice(chunk);
            })?;
        }

        Ok(out)
    }

    // access_user runs f over each page-sized (or smaller)
    // chunk of the user range, retrying through the fault
    // handler whenever a chunk's page lacks a usable
    // translation.
    //
    fn access_user(
        &self,
        pid: ProcessId,
        addr: VirtAddr,
        len: usize,
        access: FaultAccess,
        mut f: impl FnMut(usize, &mut [u8]),
    ) -> Result<(), Terminated> {
        let write = access == FaultAccess::Write;

        let mut done = 0;
        while done < len {
            let chunk_addr = match addr.checked_add(done) {
                Some(chunk_addr) => chunk_addr,
                None => return self.terminate(pid),
            };

            let page = VirtPage::containing_address(chunk_addr);
            let offset = chunk_addr.as_usize() - page.start_address().as_usize();
            let chunk_len = core::cmp::min(len - done, PAGE_SIZE - offset);

            loop {
                let result = self.vm().with_user_page(pid, page, write, |bytes| {
                    f(done, &mut bytes[offset..offset + chunk_len])
                });

                match result {
                    Ok(()) => break,
                    Err(_) => {
                        if self.vm().handle_fault(pid, chunk_addr, access)
                            == FaultOutcome::Terminated
                        {
                            return self.terminate(pid);
                        }
                    }
                }
            }

            done += chunk_len;
        }

        Ok(())
    }

    // terminate ends the process with the conventional fault
    // exit status.
    //
    fn terminate(&self, pid: ProcessId) -> Result<(), Terminated> {
        self.exit(pid, -1);
        Err(Terminated)
    }
}
