// Copyright 2025 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use align::{align_down_usize, align_up_usize};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// A physical memory address.
///
/// A `PhysAddr` can only store an address within the 52-bit
/// physical address space.
///
#[repr(transparent)]
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PhysAddr(usize);

/// An invalid physical memory address.
///
/// If an attempt is made to create a [`PhysAddr`] from a value
/// larger than the physical address space, then `InvalidPhysAddr`
/// is returned, containing the attempted value.
///
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InvalidPhysAddr(pub usize);

impl PhysAddr {
    /// The largest valid physical address.
    ///
    pub const MAX: PhysAddr = PhysAddr(0xf_ffff_ffff_ffff);

    /// Creates a new physical memory address.
    ///
    /// # Panics
    ///
    /// `new` will panic if `addr` exceeds the 52-bit physical
    /// address space.
    ///
    #[inline]
    #[track_caller]
    pub const fn new(addr: usize) -> Self {
        match Self::try_new(addr) {
            Ok(addr) => addr,
            Err(_) => panic!("invalid address passed to PhysAddr::new"),
        }
    }

    /// Tries to create a new physical memory address.
    ///
    /// If the passed value exceeds the physical address space,
    /// then an error is returned.
    ///
    #[inline]
    pub const fn try_new(addr: usize) -> Result<Self, InvalidPhysAddr> {
        if addr <= PhysAddr::MAX.0 {
            Ok(PhysAddr(addr))
        } else {
            Err(InvalidPhysAddr(addr))
        }
    }

    /// Returns the address's numerical value.
    ///
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the zero physical memory address.
    ///
    #[inline]
    pub const fn zero() -> Self {
        PhysAddr(0)
    }

    /// Aligns the physical address downwards to the largest
    /// exact multiple of `align` that is no larger than the
    /// address.
    ///
    /// `align` must be an exact power of two.
    ///
    #[inline]
    #[must_use]
    pub const fn align_down(self, align: usize) -> Self {
        PhysAddr(align_down_usize(self.0, align))
    }

    /// Aligns the physical address upwards to the smallest
    /// exact multiple of `align` that is no smaller than
    /// the address.
    ///
    /// `align` must be an exact power of two.
    ///
    #[inline]
    #[must_use]
    pub const fn align_up(self, align: usize) -> Self {
        PhysAddr(align_up_usize(self.0, align))
    }

    /// Checks whether the physical address has the given
    /// alignment.
    ///
    /// `align` must be an exact power of two.
    ///
    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.align_down(align).0 == self.0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("PhysAddr")
            .field(&format_args!("{:#x}", self.0))
            .finish()
    }
}

impl fmt::LowerHex for PhysAddr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::Pointer for PhysAddr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Pointer::fmt(&(self.0 as *const ()), f)
    }
}

impl Add<usize> for PhysAddr {
    type Output = Self;

    #[inline]
    #[track_caller]
    fn add(self, rhs: usize) -> Self::Output {
        PhysAddr::new(self.0 + rhs)
    }
}

impl AddAssign<usize> for PhysAddr {
    #[inline]
    #[track_caller]
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = usize;

    #[inline]
    #[track_caller]
    fn sub(self, rhs: PhysAddr) -> Self::Output {
        self.0.checked_sub(rhs.0).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_space_bounds() {
        assert_eq!(PhysAddr::try_new(0), Ok(PhysAddr::zero()));
        assert_eq!(
            PhysAddr::try_new(PhysAddr::MAX.as_usize()),
            Ok(PhysAddr::MAX)
        );
        assert_eq!(
            PhysAddr::try_new(PhysAddr::MAX.as_usize() + 1),
            Err(InvalidPhysAddr(PhysAddr::MAX.as_usize() + 1))
        );
    }

    #[test]
    fn test_alignment() {
        let addr = PhysAddr::new(0x5432);
        assert_eq!(addr.align_down(0x1000), PhysAddr::new(0x5000));
        assert_eq!(addr.align_up(0x1000), PhysAddr::new(0x6000));
        assert!(PhysAddr::new(0x4000).is_aligned(0x1000));
        assert!(!addr.is_aligned(0x1000));
    }
}
