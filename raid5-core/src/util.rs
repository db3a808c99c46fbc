// vim: tw=80
//! Common utility functions used throughout the RAID engine

use crate::types::*;
use std::ops::{Add, Div, Sub};

/// Size of a sector at the upstream block interface.  Member disks may have
/// larger physical sectors, but all addressing here uses 512-byte units.
pub const BYTES_PER_SECTOR: usize = 512;

/// Size of one stripe unit: the fixed granularity of the stripe cache.  One
/// page per member disk per stripe.
pub const STRIPE_SIZE: usize = 4096;

/// Sectors per stripe unit
pub const STRIPE_SECTORS: SectorT = (STRIPE_SIZE / BYTES_PER_SECTOR) as SectorT;

/// Divide two unsigned numbers (usually integers), rounding up.
pub fn div_roundup<T>(dividend: T, divisor: T) -> T
    where T: Add<Output=T> + Copy + Div<Output=T> + From<u8> + Sub<Output=T>
{
    (dividend + divisor - T::from(1u8)) / divisor
}

/// Round a sector address down to the start of its stripe unit
pub fn stripe_align(sector: SectorT) -> SectorT {
    sector - sector % STRIPE_SECTORS
}

// LCOV_EXCL_START
#[cfg(test)]
/// Helper to generate the runtime used by most unit tests
pub fn basic_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

// LCOV_EXCL_STOP
