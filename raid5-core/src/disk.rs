// vim: tw=80
//! Member disks and their health
//!
//! The array talks to its members through [`BlockDev`], which issues
//! asynchronous reads and writes of whole stripe units at per-disk sector
//! addresses.  Two implementations are provided: a memory-backed disk for
//! tests and small volatile arrays, and a file-backed disk for everything
//! else.

#[cfg(test)] use mockall::automock;
use crate::{types::*, util::*};
use serde_derive::{Deserialize, Serialize};
use std::{
    fmt,
    fs,
    future::Future,
    num::NonZeroU8,
    os::unix::fs::FileExt,
    path::Path,
    pin::Pin,
    sync::{Arc, Mutex},
};
use uuid::Uuid;

/// Future representing an operation on a member disk
pub type DiskFut = dyn Future<Output = Result<()>> + Send + Sync;
pub type BoxDiskFut = Pin<Box<DiskFut>>;

/// The public interface of every member disk
///
/// All I/O is asynchronous.  Completions may run on any task; they carry
/// success or failure only, never partial transfer counts.
#[cfg_attr(test, automock)]
pub trait BlockDev: Send + Sync {
    /// Fill `buf` from the disk, starting at `sector`.
    fn read_at(&self, buf: IoVecMut, sector: SectorT) -> BoxDiskFut;

    /// Write `buf` to the disk, starting at `sector`.
    fn write_at(&self, buf: IoVec, sector: SectorT) -> BoxDiskFut;

    /// Flush the disk's volatile caches.
    fn sync_all(&self) -> BoxDiskFut;

    /// Usable size in sectors
    fn size(&self) -> SectorT;
}

/// The health of an array or member
///
/// Sicker variants compare greater.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd,
         Serialize)]
pub enum Health {
    /// Perfectly healthy
    Online,
    /// The given number of members are missing; all data is still readable
    Degraded(NonZeroU8),
    /// A replacement member is being reconstructed.  Redundancy is reduced
    /// until the rebuild completes.
    Rebuilding,
    /// Too many members are gone.  Some data is unreadable.
    Faulted,
}

impl Health {
    pub fn as_degraded(self) -> Option<NonZeroU8> {
        match self {
            Health::Degraded(n) => Some(n),
            _ => None,
        }
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self, Health::Faulted)
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Online => "Online".fmt(f),
            Health::Degraded(n) => write!(f, "Degraded({n})"),
            Health::Rebuilding => "Rebuilding".fmt(f),
            Health::Faulted => "Faulted".fmt(f),
        }
    }
}

/// Runtime state of one array member
pub struct Disk {
    pub dev: Arc<dyn BlockDev>,
    /// Position within the array
    pub number: usize,
    pub uuid: Uuid,
    /// Readable and writable.  Cleared, never set, while the array runs.
    pub operational: bool,
    /// Unused hot standby
    pub spare: bool,
    /// Being rebuilt: writable, but its contents cannot be trusted yet
    pub write_only: bool,
}

impl Disk {
    /// A member that can serve reads right now
    pub fn readable(&self) -> bool {
        self.operational && !self.write_only
    }

    pub fn health(&self) -> Health {
        if !self.operational {
            Health::Faulted
        } else if self.write_only {
            Health::Rebuilding
        } else {
            Health::Online
        }
    }

    pub fn status(&self) -> DiskStatus {
        DiskStatus {
            number: self.number,
            health: self.health(),
            uuid: self.uuid,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DiskStatus {
    pub number: usize,
    pub health: Health,
    pub uuid: Uuid,
}

/// A memory-backed disk
pub struct RamDisk {
    buf: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(sectors: SectorT) -> Self {
        RamDisk {
            buf: Mutex::new(vec![0u8; sectors as usize * BYTES_PER_SECTOR]),
        }
    }

    fn range(&self, len: usize, sector: SectorT) -> Result<usize> {
        let offset = sector as usize * BYTES_PER_SECTOR;
        if offset + len > self.buf.lock().unwrap().len() {
            Err(Error::EINVAL)
        } else {
            Ok(offset)
        }
    }
}

impl BlockDev for RamDisk {
    fn read_at(&self, mut buf: IoVecMut, sector: SectorT) -> BoxDiskFut {
        let len = buf.len();
        let r = self.range(len, sector).map(|offset| {
            let guard = self.buf.lock().unwrap();
            buf.copy_from_slice(&guard[offset..offset + len]);
        });
        Box::pin(futures::future::ready(r))
    }

    fn write_at(&self, buf: IoVec, sector: SectorT) -> BoxDiskFut {
        let r = self.range(buf.len(), sector).map(|offset| {
            let mut guard = self.buf.lock().unwrap();
            guard[offset..offset + buf.len()].copy_from_slice(&buf[..]);
        });
        Box::pin(futures::future::ready(r))
    }

    fn sync_all(&self) -> BoxDiskFut {
        Box::pin(futures::future::ok(()))
    }

    fn size(&self) -> SectorT {
        (self.buf.lock().unwrap().len() / BYTES_PER_SECTOR) as SectorT
    }
}

/// A disk backed by a file or block device node
///
/// I/O runs on the blocking thread pool; one stripe unit per operation is
/// small enough that queue depth, not latency, dominates.
pub struct FileDisk {
    file: Arc<fs::File>,
    sectors: SectorT,
}

impl FileDisk {
    /// Create a fresh backing file of the given size.
    pub fn create<P: AsRef<Path>>(path: P, sectors: SectorT) -> Result<Self>
    {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(sectors * BYTES_PER_SECTOR as u64)?;
        Ok(FileDisk {
            file: Arc::new(file),
            sectors,
        })
    }

    /// Open an existing backing file, deriving the size from its length.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        let sectors = file.metadata()?.len() / BYTES_PER_SECTOR as u64;
        Ok(FileDisk {
            file: Arc::new(file),
            sectors,
        })
    }
}

fn join_fail(_: tokio::task::JoinError) -> Error {
    // A panicked I/O task is a logic error, not a disk error
    Error::EDOOFUS
}

impl BlockDev for FileDisk {
    fn read_at(&self, mut buf: IoVecMut, sector: SectorT) -> BoxDiskFut {
        let file = self.file.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                file.read_exact_at(&mut buf[..],
                                   sector * BYTES_PER_SECTOR as u64)
                    .map_err(Error::from)
            }).await.map_err(join_fail)?
        })
    }

    fn write_at(&self, buf: IoVec, sector: SectorT) -> BoxDiskFut {
        let file = self.file.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                file.write_all_at(&buf[..], sector * BYTES_PER_SECTOR as u64)
                    .map_err(Error::from)
            }).await.map_err(join_fail)?
        })
    }

    fn sync_all(&self) -> BoxDiskFut {
        let file = self.file.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                file.sync_all().map_err(Error::from)
            }).await.map_err(join_fail)?
        })
    }

    fn size(&self) -> SectorT {
        self.sectors
    }
}

// LCOV_EXCL_STOP
