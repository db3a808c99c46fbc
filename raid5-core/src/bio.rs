// vim: tw=80
//! I/O segments and their completion bookkeeping
//!
//! A caller's read or write is split at stripe unit boundaries into [`Bio`]
//! segments, each small enough to attach to a single cached stripe page.
//! All segments of one request share a [`BioCtl`], which counts outstanding
//! segments and fires the caller's completion channel when the last one
//! retires.

use crate::{types::*, util::*};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
    Mutex,
};
use tokio::sync::oneshot;

/// The payload of one segment
pub enum BioCmd {
    /// Fill this buffer from the array
    Read(IoVecMut),
    /// Write this buffer to the array
    Write(IoVec),
}

/// One stripe-unit-sized piece of a caller's request
pub struct Bio {
    /// Logical sector where the segment begins
    pub sector: SectorT,
    pub cmd: BioCmd,
    pub ctl: Arc<BioCtl>,
}

impl Bio {
    pub fn len(&self) -> usize {
        match &self.cmd {
            BioCmd::Read(iovec) => iovec.len(),
            BioCmd::Write(iovec) => iovec.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_write(&self) -> bool {
        matches!(self.cmd, BioCmd::Write(_))
    }

    pub fn sectors(&self) -> SectorT {
        (self.len() / BYTES_PER_SECTOR) as SectorT
    }

    /// One past the last logical sector
    pub fn end_sector(&self) -> SectorT {
        self.sector + self.sectors()
    }
}

/// Shared completion state for all segments of one request
///
/// Holds one reference for the submitter plus one per attached segment.  The
/// submitter's reference is dropped once splitting is finished, so a request
/// whose segments all retire early cannot complete before it is fully
/// attached.  The first segment error is sticky and becomes the request's
/// result.
pub struct BioCtl {
    remaining: AtomicUsize,
    error: Mutex<Result<()>>,
    sender: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl BioCtl {
    /// Create the control block with the submitter's initial reference.
    pub fn new(sender: oneshot::Sender<Result<()>>) -> Arc<Self> {
        Arc::new(BioCtl {
            remaining: AtomicUsize::new(1),
            error: Mutex::new(Ok(())),
            sender: Mutex::new(Some(sender)),
        })
    }

    /// Account for one more attached segment.
    pub fn add_segment(&self) {
        self.remaining.fetch_add(1, Ordering::Relaxed);
    }

    /// Retire one segment, or the submitter's hold.
    ///
    /// When the last reference drops, the caller's channel receives the
    /// sticky result.  A vanished receiver is not an error here; the caller
    /// gave up waiting.
    pub fn complete(&self, result: Result<()>) {
        if let Err(e) = result {
            let mut guard = self.error.lock().unwrap();
            if guard.is_ok() {
                *guard = Err(e);
            }
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let result = *self.error.lock().unwrap();
            if let Some(tx) = self.sender.lock().unwrap().take() {
                tx.send(result).ok();
            }
        }
    }
}

// LCOV_EXCL_STOP
