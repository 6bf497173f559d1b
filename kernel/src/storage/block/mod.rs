// Copyright 2025 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements block storage devices for the kernel.

pub mod ram;

use bitflags::bitflags;

/// The number of bytes in each device sector.
///
pub const SECTOR_SIZE: usize = 512;

bitflags! {
    /// The list of operations that can be supported by
    /// a device.
    ///
    pub struct Operations: usize {
        /// Read data from a device.
        const READ = 1 << 0;

        /// Write data to a device.
        const WRITE = 1 << 1;
    }
}

/// Describes an error encountered while operating
/// on the device.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The buffer passed to the driver was not exactly
    /// one sector in size.
    InvalidBuffer,

    /// The requested sector is beyond the end of the
    /// device.
    OutOfRange,

    /// The device encountered an error while performing
    /// the requested operation.
    DeviceError,

    /// The requested operation is not supported.
    NotSupported,
}

/// Represents a sector-addressed block storage device.
///
/// Transfers are synchronous and exactly one sector at a
/// time. Larger transfers are built from sector operations
/// by the caller, such as the buffer cache or the swap
/// manager.
///
pub trait Device {
    /// Returns the device capacity as a number of
    /// sectors.
    ///
    fn num_sectors(&self) -> usize;

    /// Returns the device capacity in bytes.
    ///
    fn capacity(&self) -> usize {
        self.num_sectors() * SECTOR_SIZE
    }

    /// Returns the set of operations supported by the
    /// device.
    ///
    /// If an unsupported operation is attempted, it
    /// will return [`Error::NotSupported`].
    ///
    fn operations(&self) -> Operations;

    /// Populates `buf` with the contents of the given
    /// sector.
    ///
    /// `buf` must be exactly [`SECTOR_SIZE`] bytes long.
    ///
    fn read(&mut self, sector: usize, buf: &mut [u8]) -> Result<(), Error>;

    /// Writes `buf` to the given sector.
    ///
    /// `buf` must be exactly [`SECTOR_SIZE`] bytes long.
    ///
    /// If the device is read-only, calls to `write` will
    /// return [`Error::NotSupported`].
    ///
    fn write(&mut self, sector: usize, buf: &[u8]) -> Result<(), Error>;
}
