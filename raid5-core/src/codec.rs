// vim: tw=80
//! Single-redundancy parity codec
//!
//! Captures the arithmetic of RAID-4/5 parity, divorced from any stripe or
//! disk bookkeeping.  With exactly one redundancy column the code is plain
//! XOR, so every operation reduces to [`xor::xor_buffers`] over whole stripe
//! units.

use crate::xor;

/// Single-parity encoder/decoder.
///
/// All methods operate on equally sized column buffers of `len` bytes.  The
/// caller is responsible for assembling the columns in disk order; the codec
/// neither knows nor cares which member disk holds parity for a given stripe.
pub struct Codec {
    /// Total number of disks (data plus parity) in each stripe
    m: u32,
}

impl Codec {
    /// Create a new `Codec`
    ///
    /// # Parameters
    ///
    /// - `num_disks`: Number of disks in each stripe, data plus parity.
    ///                Must be at least 2.
    pub fn new(num_disks: u32) -> Self {
        debug_assert!(num_disks >= 2);
        Codec { m: num_disks }
    }

    /// Compute the parity column from all `m - 1` data columns.
    ///
    /// # Parameters
    ///
    /// - `len`:    Size of each column, in bytes
    /// - `data`:   Input array, one column per data disk
    /// - `parity`: Output column
    pub fn encode(&self, len: usize, data: &[&[u8]], parity: &mut [u8]) {
        debug_assert_eq!(data.len() as u32, self.m - 1);
        parity[0..len].fill(0);
        for col in data {
            xor::xor_into(&mut parity[0..len], &col[0..len]);
        }
    }

    /// Update the parity column in place for a change to one data column.
    ///
    /// After this call the parity reflects `new` in place of `old`; no other
    /// column is consulted.  This is the read-modify-write delta.
    pub fn update(&self, len: usize, old: &[u8], new: &[u8],
                  parity: &mut [u8])
    {
        xor::xor_into(&mut parity[0..len], &old[0..len]);
        xor::xor_into(&mut parity[0..len], &new[0..len]);
    }

    /// Reconstruct one missing column from the `m - 1` surviving ones.
    ///
    /// The survivors may be any mix of data and parity columns; order is
    /// irrelevant.
    ///
    /// # Parameters
    ///
    /// - `len`:        Size of each column, in bytes
    /// - `surviving`:  All present columns
    /// - `missing`:    Output: the reconstructed column
    pub fn decode(&self, len: usize, surviving: &[&[u8]],
                  missing: &mut [u8])
    {
        debug_assert_eq!(surviving.len() as u32, self.m - 1);
        missing[0..len].fill(0);
        for col in surviving {
            xor::xor_into(&mut missing[0..len], &col[0..len]);
        }
    }

    /// Verify that `parity` matches the data columns.
    ///
    /// Recomputes into a scratch buffer and compares; never modifies any
    /// input.  Returns `true` if the stripe is consistent.
    pub fn check(&self, len: usize, data: &[&[u8]], parity: &[u8]) -> bool {
        let mut scratch = vec![0u8; len];
        for col in data {
            xor::xor_into(&mut scratch, &col[0..len]);
        }
        scratch[..] == parity[0..len]
    }

    /// Return the degree of redundancy
    pub fn protection(&self) -> u32 {
        1
    }

    /// Return the total number of disks in each stripe
    pub fn stripesize(&self) -> u32 {
        self.m
    }
}

// LCOV_EXCL_STOP
