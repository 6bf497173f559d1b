// Copyright 2025 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides pretty printing of byte quantities, using
//! [powers of 2 for larger units](https://en.wikipedia.org/wiki/Byte#Units_based_on_powers_of_2).
//!
//! The memory manager logs pool statistics through [`Bytes`], so
//! "33554432" appears in diagnostics as "32 MiB".

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]
#![forbid(unsafe_code)]

#[cfg(test)]
extern crate alloc;

use core::fmt;

/// Contains a number of bytes.
///
pub struct Bytes(usize);

impl Bytes {
    /// Wraps a number of bytes.
    ///
    pub fn from_usize(n: usize) -> Self {
        Bytes(n)
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let units = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
        let mut b = self.0;
        for unit in units.iter() {
            if b >= 1024 {
                b >>= 10;
                continue;
            }

            return write!(f, "{} {}", b, unit);
        }

        write!(f, "{} ZiB", b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn test_bytes() {
        assert_eq!(format!("{}", Bytes::from_usize(0)), "0 B");
        assert_eq!(format!("{}", Bytes::from_usize(512)), "512 B");
        assert_eq!(format!("{}", Bytes::from_usize(1023)), "1023 B");
        assert_eq!(format!("{}", Bytes::from_usize(4096)), "4 KiB");
        assert_eq!(format!("{}", Bytes::from_usize(1023 * 1024)), "1023 KiB");
        assert_eq!(format!("{}", Bytes::from_usize(32 * 1024 * 1024)), "32 MiB");
    }
}
