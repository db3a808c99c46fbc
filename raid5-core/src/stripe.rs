// vim: tw=80
//! In-core stripes and the parity math that operates on them
//!
//! A [`StripeHead`] caches one stripe unit from every member disk and queues
//! the caller segments waiting on that stripe.  All mutation happens under
//! the owning slot's lock; the methods here never block and never touch the
//! cache-wide structures.

use crate::{
    bio::{Bio, BioCmd},
    codec::Codec,
    layout::Layout,
    types::*,
    util::*,
};
use divbuf::DivBufShared;
use tokio::sync::oneshot;

/// How [`StripeHead::compute_parity`] should produce the parity block
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParityMethod {
    /// XOR the delta of each overwritten block into the existing parity.
    /// Requires the old parity and the old contents of every write target.
    ReadModifyWrite,
    /// Rebuild parity from the full contents of every data block
    ReconstructWrite,
    /// Recompute into a scratch buffer and compare with the stored parity.
    /// Reports a mismatch without correcting anything.
    CheckOnly,
}

/// One member disk's slice of a cached stripe
pub struct StripeDev {
    /// Logical sector whose contents this page caches.  Meaningless for the
    /// parity member, which has no logical home.
    pub sector: SectorT,
    /// One stripe unit of backing storage, allocated once per slot
    pub page: DivBufShared,
    /// An I/O is outstanding on this disk for this stripe
    pub locked: bool,
    /// The page holds current contents
    pub uptodate: bool,
    /// Queued writes fully cover the page, so its old contents are not
    /// needed to compute parity
    pub overwrite: bool,
    pub toread: Vec<Bio>,
    pub towrite: Vec<Bio>,
    /// Writes whose payload has been applied to the page but not yet
    /// acknowledged to the caller
    pub written: Vec<Bio>,
}

impl StripeDev {
    fn new() -> Self {
        StripeDev {
            sector: 0,
            page: DivBufShared::from(vec![0u8; STRIPE_SIZE]),
            locked: false,
            uptodate: false,
            overwrite: false,
            toread: Vec::new(),
            towrite: Vec::new(),
            written: Vec::new(),
        }
    }

    fn idle(&self) -> bool {
        !self.locked &&
            self.toread.is_empty() &&
            self.towrite.is_empty() &&
            self.written.is_empty()
    }
}

/// One slot's worth of stripe state
///
/// Identity (`sector`, `pd_idx`) is fixed between
/// [`init`](StripeHead::init) calls; everything else changes as the stripe
/// is processed.
pub struct StripeHead {
    /// Stripe-aligned per-disk sector; the identity key
    pub sector: SectorT,
    /// Member holding this stripe's parity
    pub pd_idx: usize,
    /// Needs a state machine pass
    pub handle: bool,
    /// Wants preread, but the read gate was closed
    pub delayed: bool,
    pub syncing: bool,
    /// Parity verified or restored during the current sync
    pub insync: bool,
    /// The current sync pass issued a repair write
    pub repaired: bool,
    /// Fired when a sync pass finishes; carries `true` if parity was
    /// already consistent
    pub sync_done: Option<oneshot::Sender<Result<bool>>>,
    pub devs: Box<[StripeDev]>,
}

impl StripeHead {
    pub fn new(ndisks: usize) -> Self {
        let devs = (0..ndisks)
            .map(|_| StripeDev::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        StripeHead {
            sector: 0,
            pd_idx: 0,
            handle: false,
            delayed: false,
            syncing: false,
            insync: false,
            repaired: false,
            sync_done: None,
            devs,
        }
    }

    /// Recycle this slot for a new stripe.
    ///
    /// The slot must be quiescent.  Finding queued segments, an outstanding
    /// I/O, or an unfinished sync here means the bookkeeping is corrupt, so
    /// the stripe is refused rather than reused.
    pub fn init(&mut self, sector: SectorT, pd_idx: usize, layout: &Layout)
        -> Result<()>
    {
        if self.syncing || self.sync_done.is_some() ||
            self.devs.iter().any(|d| !d.idle())
        {
            tracing::error!(sector, "stale stripe activated");
            return Err(Error::EDOOFUS);
        }
        debug_assert_eq!(pd_idx, layout.parity_disk_of(sector));
        self.sector = sector;
        self.pd_idx = pd_idx;
        self.handle = false;
        self.delayed = false;
        self.insync = false;
        self.repaired = false;
        for (i, dev) in self.devs.iter_mut().enumerate() {
            dev.sector = if i == pd_idx {
                0
            } else {
                layout.compute_block_number(sector, i)?
            };
            dev.uptodate = false;
            dev.overwrite = false;
        }
        Ok(())
    }

    /// Queue a segment on one member disk, in ascending sector order.
    ///
    /// The segment must lie entirely within the disk's stripe unit.  After
    /// attaching a write, rescan the queue for full coverage of the unit
    /// and set [`StripeDev::overwrite`] accordingly.
    pub fn add_bio(&mut self, disk_idx: usize, bio: Bio) -> Result<()> {
        let dev = &mut self.devs[disk_idx];
        if bio.sector < dev.sector ||
            bio.end_sector() > dev.sector + STRIPE_SECTORS
        {
            tracing::error!(sector = self.sector, disk_idx,
                "segment outside its stripe unit");
            return Err(Error::EDOOFUS);
        }
        let forwrite = bio.is_write();
        let queue = if forwrite {
            &mut dev.towrite
        } else {
            &mut dev.toread
        };
        // Later arrivals with equal sectors go last, so their payload wins.
        let pos = queue.partition_point(|b| b.sector <= bio.sector);
        queue.insert(pos, bio);
        if forwrite {
            let mut covered = dev.sector;
            for b in dev.towrite.iter() {
                if b.sector > covered {
                    break;
                }
                if b.end_sector() > covered {
                    covered = b.end_sector();
                }
            }
            if covered >= dev.sector + STRIPE_SECTORS {
                dev.overwrite = true;
            }
        }
        self.handle = true;
        Ok(())
    }

    /// Fail every segment queued on one member disk back to its caller.
    pub fn fail_dev_bios(&mut self, disk_idx: usize, e: Error) {
        let dev = &mut self.devs[disk_idx];
        for bio in dev.toread.drain(..)
            .chain(dev.towrite.drain(..))
            .chain(dev.written.drain(..))
        {
            bio.ctl.complete(Err(e));
        }
        dev.overwrite = false;
    }

    /// Move one disk's pending writes to the written queue and copy their
    /// payloads onto the page, later arrivals last.
    fn apply_writes(&mut self, disk_idx: usize) -> Result<()> {
        let dev = &mut self.devs[disk_idx];
        if !dev.written.is_empty() {
            return Err(Error::EDOOFUS);
        }
        dev.written = std::mem::take(&mut dev.towrite);
        let mut page = dev.page.try_mut().map_err(|_| Error::EDOOFUS)?;
        for bio in dev.written.iter() {
            let offset = (bio.sector - dev.sector) as usize * BYTES_PER_SECTOR;
            if let BioCmd::Write(iovec) = &bio.cmd {
                page[offset..offset + iovec.len()].copy_from_slice(&iovec[..]);
            }
        }
        drop(page);
        dev.locked = true;
        dev.uptodate = true;
        Ok(())
    }

    /// Recompute this stripe's parity.
    ///
    /// For the two write-enabling methods this also applies pending write
    /// payloads and leaves every touched page `locked` and `uptodate`,
    /// ready for the issue pass.  Returns whether parity matched; always
    /// `true` for the write methods.
    pub fn compute_parity(&mut self, codec: &Codec, method: ParityMethod)
        -> Result<bool>
    {
        let pd_idx = self.pd_idx;
        let ndisks = self.devs.len();
        match method {
            ParityMethod::ReadModifyWrite => {
                if !self.devs[pd_idx].uptodate {
                    return Err(Error::EDOOFUS);
                }
                for i in 0..ndisks {
                    // A write target that was never read stays queued for a
                    // later pass.
                    if i == pd_idx || self.devs[i].towrite.is_empty() ||
                        !self.devs[i].uptodate
                    {
                        continue;
                    }
                    let old = {
                        let page = self.devs[i].page.try_const()
                            .map_err(|_| Error::EDOOFUS)?;
                        Vec::from(&page[..])
                    };
                    self.apply_writes(i)?;
                    let new = self.devs[i].page.try_const()
                        .map_err(|_| Error::EDOOFUS)?;
                    let mut parity = self.devs[pd_idx].page.try_mut()
                        .map_err(|_| Error::EDOOFUS)?;
                    codec.update(STRIPE_SIZE, &old, &new[..], &mut parity[..]);
                }
            }
            ParityMethod::ReconstructWrite => {
                for i in 0..ndisks {
                    let dev = &self.devs[i];
                    if i != pd_idx && !dev.uptodate && !dev.overwrite {
                        tracing::error!(sector = self.sector, disk = i,
                            "reconstruct-write input not uptodate");
                        return Err(Error::EDOOFUS);
                    }
                }
                for i in 0..ndisks {
                    if i != pd_idx && !self.devs[i].towrite.is_empty() {
                        self.apply_writes(i)?;
                    }
                }
                let data = (0..ndisks)
                    .filter(|i| *i != pd_idx)
                    .map(|i| {
                        self.devs[i].page.try_const()
                            .map_err(|_| Error::EDOOFUS)
                    }).collect::<Result<Vec<_>>>()?;
                let refs = data.iter().map(|b| &b[..]).collect::<Vec<_>>();
                let mut parity = self.devs[pd_idx].page.try_mut()
                    .map_err(|_| Error::EDOOFUS)?;
                codec.encode(STRIPE_SIZE, &refs, &mut parity[..]);
            }
            ParityMethod::CheckOnly => {
                if !self.devs[pd_idx].uptodate {
                    return Err(Error::EDOOFUS);
                }
                let data = (0..ndisks)
                    .filter(|i| *i != pd_idx)
                    .map(|i| {
                        let dev = &self.devs[i];
                        if !dev.uptodate {
                            return Err(Error::EDOOFUS);
                        }
                        dev.page.try_const().map_err(|_| Error::EDOOFUS)
                    }).collect::<Result<Vec<_>>>()?;
                let refs = data.iter().map(|b| &b[..]).collect::<Vec<_>>();
                let parity = self.devs[pd_idx].page.try_const()
                    .map_err(|_| Error::EDOOFUS)?;
                return Ok(codec.check(STRIPE_SIZE, &refs, &parity[..]));
            }
        }
        let pdev = &mut self.devs[pd_idx];
        pdev.uptodate = true;
        pdev.locked = true;
        Ok(true)
    }

    /// Rebuild one member's page from all the others.
    ///
    /// Reconstruction needs every other page current; a stale one is a
    /// logic error in the caller's bookkeeping, not a degraded-mode
    /// condition.
    pub fn compute_block(&mut self, codec: &Codec, disk_idx: usize)
        -> Result<()>
    {
        let surviving = (0..self.devs.len())
            .filter(|i| *i != disk_idx)
            .map(|i| {
                let dev = &self.devs[i];
                if !dev.uptodate {
                    tracing::error!(sector = self.sector, disk = i,
                        "reconstruction source not uptodate");
                    return Err(Error::EDOOFUS);
                }
                dev.page.try_const().map_err(|_| Error::EDOOFUS)
            }).collect::<Result<Vec<_>>>()?;
        let refs = surviving.iter().map(|b| &b[..]).collect::<Vec<_>>();
        let mut target = self.devs[disk_idx].page.try_mut()
            .map_err(|_| Error::EDOOFUS)?;
        codec.decode(STRIPE_SIZE, &refs, &mut target[..]);
        drop(target);
        self.devs[disk_idx].uptodate = true;
        Ok(())
    }
}

// LCOV_EXCL_STOP
