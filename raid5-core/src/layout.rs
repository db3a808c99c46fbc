// vim: tw=80
//! Logical-to-physical mapping for rotating-parity layouts
//!
//! A [`Layout`] is a pure, stateless description of where every stripe unit
//! of an array lives: which member disk, at which per-disk sector, and which
//! disk holds the row's parity.  Four rotation algorithms are supported for
//! RAID-5, identified by the classic numbering that array managers persist;
//! RAID-4 fixes parity on the last member.

use crate::{types::*, util::*};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// Supported RAID personalities
#[derive(Clone, Copy, Debug, Deserialize, Eq, IntoPrimitive, PartialEq,
         Serialize, TryFromPrimitive)]
#[repr(u8)]
pub enum RaidLevel {
    Raid4 = 4,
    Raid5 = 5,
}

impl fmt::Display for RaidLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            RaidLevel::Raid4 => "RAID4".fmt(f),
            RaidLevel::Raid5 => "RAID5".fmt(f),
        }
    }
}

/// Parity rotation algorithm for RAID-5 layouts
///
/// The discriminants match the identifiers that array managers store, so an
/// id read from configuration converts with `Algorithm::try_from`.  An
/// unrecognized id fails the conversion; there is deliberately no fallback.
#[derive(Clone, Copy, Debug, Deserialize, Eq, IntoPrimitive, PartialEq,
         Serialize, TryFromPrimitive)]
#[repr(u8)]
pub enum Algorithm {
    /// Parity rotates from the last disk backwards; data is not rotated.
    LeftAsymmetric = 0,
    /// Parity rotates from the first disk forwards; data is not rotated.
    RightAsymmetric = 1,
    /// Parity rotates from the last disk backwards; data starts just after
    /// parity.  The common default.
    LeftSymmetric = 2,
    /// Parity rotates from the first disk forwards; data starts just after
    /// parity.
    RightSymmetric = 3,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Algorithm::LeftAsymmetric => "left-asymmetric".fmt(f),
            Algorithm::RightAsymmetric => "right-asymmetric".fmt(f),
            Algorithm::LeftSymmetric => "left-symmetric".fmt(f),
            Algorithm::RightSymmetric => "right-symmetric".fmt(f),
        }
    }
}

/// Location of one stripe unit
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Chunkloc {
    /// Per-disk sector of the unit: the address used on the member disk and
    /// the identity key of the covering stripe
    pub sector: SectorT,
    /// Member disk holding the data
    pub dd_idx: usize,
    /// Member disk holding the row's parity
    pub pd_idx: usize,
}

/// The array's geometry.  Pure and cheap; callable from any context.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Layout {
    level: RaidLevel,
    algorithm: Algorithm,
    raid_disks: usize,
    chunk_sectors: SectorT,
}

impl Layout {
    /// Validate and construct a layout.
    ///
    /// # Parameters
    ///
    /// - `level`:          RAID personality.
    /// - `algorithm`:      Parity rotation.  Ignored for RAID-4, which always
    ///                     keeps parity on the last member.
    /// - `raid_disks`:     Total members, data plus parity.  At least 2.
    /// - `chunk_sectors`:  Striping granularity in sectors.  Must be a
    ///                     nonzero multiple of the stripe unit.
    pub fn new(level: RaidLevel, algorithm: Algorithm, raid_disks: usize,
               chunk_sectors: SectorT) -> Result<Self>
    {
        if raid_disks < 2 {
            return Err(Error::EINVAL);
        }
        if chunk_sectors == 0 || chunk_sectors % STRIPE_SECTORS != 0 {
            return Err(Error::EINVAL);
        }
        Ok(Layout { level, algorithm, raid_disks, chunk_sectors })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn chunk_sectors(&self) -> SectorT {
        self.chunk_sectors
    }

    /// Number of data disks in each stripe
    pub fn data_disks(&self) -> usize {
        self.raid_disks - 1
    }

    pub fn level(&self) -> RaidLevel {
        self.level
    }

    /// Total number of member disks
    pub fn raid_disks(&self) -> usize {
        self.raid_disks
    }

    /// Which disk holds parity for the stripe at the given per-disk sector?
    pub fn parity_disk_of(&self, stripe_sector: SectorT) -> usize {
        self.parity_disk_of_row(stripe_sector / self.chunk_sectors)
    }

    fn parity_disk_of_row(&self, stripe: u64) -> usize {
        let n = self.raid_disks as u64;
        match (self.level, self.algorithm) {
            (RaidLevel::Raid4, _) => self.data_disks(),
            (_, Algorithm::LeftAsymmetric) |
            (_, Algorithm::LeftSymmetric) =>
                (self.data_disks() as u64 - stripe % n) as usize,
            (_, Algorithm::RightAsymmetric) |
            (_, Algorithm::RightSymmetric) =>
                (stripe % n) as usize,
        }
    }

    /// Map a logical sector to its home.
    ///
    /// Splits the address into `(chunk_number, chunk_offset)`, then spreads
    /// chunks across the data disks row by row, rotating parity per the
    /// algorithm.  The returned [`Chunkloc::sector`] is the per-disk address,
    /// identical on every member of the same stripe row.
    pub fn compute_sector(&self, logical: SectorT) -> Chunkloc {
        let data_disks = self.data_disks() as u64;
        let chunk_offset = logical % self.chunk_sectors;
        let chunk_number = logical / self.chunk_sectors;
        let stripe = chunk_number / data_disks;
        let dd = (chunk_number % data_disks) as usize;
        let pd_idx = self.parity_disk_of_row(stripe);
        let dd_idx = match (self.level, self.algorithm) {
            (RaidLevel::Raid4, _) => dd,
            (_, Algorithm::LeftAsymmetric) |
            (_, Algorithm::RightAsymmetric) =>
                if dd >= pd_idx { dd + 1 } else { dd },
            (_, Algorithm::LeftSymmetric) |
            (_, Algorithm::RightSymmetric) =>
                (pd_idx + 1 + dd) % self.raid_disks,
        };
        let sector = stripe * self.chunk_sectors + chunk_offset;
        Chunkloc { sector, dd_idx, pd_idx }
    }

    /// Map a member disk's sector back to the logical sector stored there.
    ///
    /// Exact inverse of [`compute_sector`](Self::compute_sector).  The result
    /// is re-mapped forward as a self-check; disagreement means the two
    /// functions have diverged and returns [`Error::EDOOFUS`].  Asking for
    /// the parity unit's block number is likewise a logic error, since parity
    /// holds no logical sector.
    pub fn compute_block_number(&self, stripe_sector: SectorT,
                                disk_idx: usize) -> Result<SectorT>
    {
        let chunk_offset = stripe_sector % self.chunk_sectors;
        let stripe = stripe_sector / self.chunk_sectors;
        let pd_idx = self.parity_disk_of_row(stripe);
        if disk_idx >= self.raid_disks || disk_idx == pd_idx {
            return Err(Error::EDOOFUS);
        }
        let dd = match (self.level, self.algorithm) {
            (RaidLevel::Raid4, _) => disk_idx,
            (_, Algorithm::LeftAsymmetric) |
            (_, Algorithm::RightAsymmetric) =>
                if disk_idx > pd_idx { disk_idx - 1 } else { disk_idx },
            (_, Algorithm::LeftSymmetric) |
            (_, Algorithm::RightSymmetric) =>
                (disk_idx + self.raid_disks - pd_idx - 1) % self.raid_disks,
        };
        let chunk_number = stripe * self.data_disks() as u64 + dd as u64;
        let logical = chunk_number * self.chunk_sectors + chunk_offset;

        let check = self.compute_sector(logical);
        if check.sector != stripe_sector || check.dd_idx != disk_idx ||
            check.pd_idx != pd_idx
        {
            tracing::error!(stripe_sector, disk_idx,
                "sector map round trip failed");
            return Err(Error::EDOOFUS);
        }
        Ok(logical)
    }
}

// LCOV_EXCL_STOP
