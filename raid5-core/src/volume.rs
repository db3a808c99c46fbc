// vim: tw=80
//! The RAID volume: request dispatch, the stripe state machine, and fault
//! handling
//!
//! A [`RaidVolume`] glues the other modules together.  Callers split their
//! requests into per-stripe segments and queue them on cached stripes; a
//! single worker task drains the cache's handle list, deciding for each
//! stripe what to read, compute, and write next.  Disk completions only
//! flip flags and requeue the stripe, so the worker is the one place where
//! stripe state changes shape.

use crate::{
    bio::{Bio, BioCmd, BioCtl},
    cache::{StripeCache, StripeRef, NR_STRIPES},
    codec::Codec,
    disk::{BlockDev, BoxDiskFut, Disk, DiskStatus, Health},
    layout::{Algorithm, Layout, RaidLevel},
    stripe::{ParityMethod, StripeHead},
    types::*,
    util::*,
};
use futures::{stream::FuturesUnordered, TryFutureExt, TryStreamExt};
use serde_derive::{Deserialize, Serialize};
use std::{
    num::NonZeroU8,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
        RwLock,
    },
};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::instrument;
use uuid::Uuid;

/// Static description of one member or spare slot, as persisted by whatever
/// manages the array
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DiskConfig {
    pub uuid: Uuid,
    pub operational: bool,
    pub spare: bool,
    /// An interrupted rebuild; the disk takes writes but must not be read
    pub write_only: bool,
}

/// Static description of an array
///
/// `level` and `algorithm` are the raw identifiers array managers store.
/// They are converted at activation; an unrecognized value refuses the
/// whole array rather than guessing a layout.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    pub uuid: Uuid,
    pub level: u8,
    pub algorithm: u8,
    /// Striping granularity in sectors; a multiple of the stripe unit
    pub chunk_sectors: SectorT,
    /// Number of in-array members.  `disks[..raid_disks]` are members, the
    /// rest are spares.
    pub raid_disks: usize,
    pub disks: Vec<DiskConfig>,
}

impl Config {
    /// A fresh configuration for a brand-new array, every member
    /// operational under a new uuid.
    pub fn create(level: RaidLevel, algorithm: Algorithm,
                  chunk_sectors: SectorT, raid_disks: usize) -> Self
    {
        let disks = (0..raid_disks).map(|_| DiskConfig {
            uuid: Uuid::new_v4(),
            operational: true,
            spare: false,
            write_only: false,
        }).collect();
        Config {
            uuid: Uuid::new_v4(),
            level: level.into(),
            algorithm: algorithm.into(),
            chunk_sectors,
            raid_disks,
            disks,
        }
    }
}

/// What a consistency pass found
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SyncStats {
    /// Stripe rows examined
    pub stripes: u64,
    /// Rows whose parity or rebuilt member had to be rewritten
    pub repaired: u64,
}

/// The overall state of the array, for reporting
#[derive(Clone, Debug)]
pub struct Status {
    pub health: Health,
    pub layout: String,
    pub disks: Vec<DiskStatus>,
    pub uuid: Uuid,
}

impl Status {
    pub fn healthy(&self) -> bool {
        self.health == Health::Online
    }
}

/// One disk I/O scheduled during a state machine pass.  The page view is
/// taken under the stripe's lock; the I/O is issued after it drops.
enum IoPacket {
    Read(IoVecMut),
    Write(IoVec),
}

struct IoAction {
    disk_idx: usize,
    packet: IoPacket,
}

/// Per-pass census of a stripe's devices
#[derive(Default)]
struct Tally {
    locked: usize,
    uptodate: usize,
    to_read: usize,
    to_write: usize,
    non_overwrite: usize,
    written: usize,
    /// Members that cannot be read: failed outright or still rebuilding
    failed: usize,
    failed_num: usize,
}

fn tally(sh: &StripeHead, readable: &[bool]) -> Tally {
    let mut t = Tally::default();
    for (i, dev) in sh.devs.iter().enumerate() {
        if dev.locked {
            t.locked += 1;
        }
        if dev.uptodate {
            t.uptodate += 1;
        }
        if !dev.toread.is_empty() {
            t.to_read += 1;
        }
        if !dev.towrite.is_empty() {
            t.to_write += 1;
            if !dev.overwrite {
                t.non_overwrite += 1;
            }
        }
        if !dev.written.is_empty() {
            t.written += 1;
        }
        if !readable[i] {
            if t.failed == 0 {
                t.failed_num = i;
            }
            t.failed += 1;
        }
    }
    t
}

/// Answer every queued read whose page is current and quiescent.
fn serve_reads(sh: &mut StripeHead) -> Result<()> {
    for dev in sh.devs.iter_mut() {
        if dev.toread.is_empty() || !dev.uptodate || dev.locked {
            continue;
        }
        let pending = std::mem::take(&mut dev.toread);
        let page = dev.page.try_const().map_err(|_| Error::EDOOFUS)?;
        for mut bio in pending {
            let offset =
                (bio.sector - dev.sector) as usize * BYTES_PER_SECTOR;
            if let BioCmd::Read(iovec) = &mut bio.cmd {
                let len = iovec.len();
                iovec[..].copy_from_slice(&page[offset..offset + len]);
            }
            bio.ctl.complete(Ok(()));
        }
    }
    Ok(())
}

/// A RAID-4 or RAID-5 array
///
/// Created by [`activate`](RaidVolume::activate), which also starts the
/// worker task; always handled through an `Arc`.  All addresses at the
/// public interface are logical sectors over the array's usable capacity.
pub struct RaidVolume {
    uuid: Uuid,
    layout: Layout,
    codec: Codec,
    cache: StripeCache,
    disks: RwLock<Box<[Disk]>>,
    spares: Mutex<Vec<Disk>>,
    /// Usable capacity in logical sectors
    size: SectorT,
    /// Usable sectors per member, chunk-aligned
    per_disk: SectorT,
    /// Cleared at the start of deactivation; no new requests after that
    accepting: AtomicBool,
    shutdown: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RaidVolume {
    /// Validate the configuration and build the volume, without starting
    /// the worker.
    fn assemble(config: Config, devs: Vec<Arc<dyn BlockDev>>)
        -> Result<RaidVolume>
    {
        let level = RaidLevel::try_from(config.level)
            .map_err(|_| Error::EINVAL)?;
        let algorithm = Algorithm::try_from(config.algorithm)
            .map_err(|_| Error::EINVAL)?;
        let layout = Layout::new(level, algorithm, config.raid_disks,
                                 config.chunk_sectors)?;
        if devs.len() != config.disks.len() ||
            config.disks.len() < config.raid_disks
        {
            return Err(Error::EINVAL);
        }
        let mut members = Vec::with_capacity(config.raid_disks);
        let mut spares = Vec::new();
        for (i, (dc, dev)) in
            config.disks.iter().zip(devs.into_iter()).enumerate()
        {
            let member_slot = i < config.raid_disks;
            if member_slot == dc.spare {
                return Err(Error::EINVAL);
            }
            let disk = Disk {
                dev,
                number: i,
                uuid: dc.uuid,
                operational: dc.operational,
                spare: dc.spare,
                write_only: dc.write_only,
            };
            if member_slot {
                members.push(disk);
            } else {
                spares.push(disk);
            }
        }
        let failed = members.iter().filter(|d| !d.operational).count();
        if failed > 1 {
            tracing::error!(failed, "too many failed members to activate");
            return Err(Error::EINVAL);
        }
        let smallest = members.iter()
            .map(|d| d.dev.size())
            .min()
            .ok_or(Error::EINVAL)?;
        let per_disk = smallest - smallest % config.chunk_sectors;
        if per_disk == 0 {
            return Err(Error::EINVAL);
        }
        if spares.iter().any(|s| s.dev.size() < per_disk) {
            return Err(Error::EINVAL);
        }
        let size = per_disk * layout.data_disks() as SectorT;
        let cache = StripeCache::new(layout);
        cache.grow(NR_STRIPES);
        Ok(RaidVolume {
            uuid: config.uuid,
            layout,
            codec: Codec::new(config.raid_disks as u32),
            cache,
            disks: RwLock::new(members.into_boxed_slice()),
            spares: Mutex::new(spares),
            size,
            per_disk,
            accepting: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            worker: Mutex::new(None),
        })
    }

    /// Activate the array and start its worker.  Must be called from
    /// within a tokio runtime.
    pub fn activate(config: Config, devs: Vec<Arc<dyn BlockDev>>)
        -> Result<Arc<Self>>
    {
        let vol = Arc::new(Self::assemble(config, devs)?);
        let task = tokio::spawn(RaidVolume::worker_loop(vol.clone()));
        *vol.worker.lock().unwrap() = Some(task);
        tracing::info!(uuid = %vol.uuid, size = vol.size,
            layout = %vol.layout_name(), "array activated");
        Ok(vol)
    }

    /// Drain all cached stripes, stop the worker, and flush every member.
    ///
    /// New requests are refused with `ENXIO` as soon as this starts.
    #[instrument(skip(self))]
    pub async fn deactivate(&self) -> Result<()> {
        self.accepting.store(false, Ordering::Relaxed);
        self.cache.shrink().await;
        self.shutdown.store(true, Ordering::Relaxed);
        self.cache.wake_worker();
        let task = self.worker.lock().unwrap().take();
        if let Some(task) = task {
            task.await.map_err(|_| Error::EDOOFUS)?;
        }
        let futs = {
            let disks = self.disks.read().unwrap();
            disks.iter()
                .map(|d| d.dev.sync_all())
                .collect::<FuturesUnordered<_>>()
        };
        futs.try_collect::<Vec<_>>().map_ok(drop).await
    }

    async fn worker_loop(vol: Arc<RaidVolume>) {
        loop {
            if vol.shutdown.load(Ordering::Relaxed) {
                break;
            }
            match vol.cache.next_handle() {
                Some((sref, preread_active)) =>
                    vol.handle_stripe(sref, preread_active),
                None => vol.cache.worker_wait().await,
            }
        }
    }

    /// Read from the array.  `buf` must be a whole number of sectors.
    pub fn read_at(self: Arc<Self>, buf: IoVecMut, sector: SectorT)
        -> BoxDiskFut
    {
        Box::pin(async move { self.submit_read(buf, sector).await })
    }

    /// Write to the array.  `buf` must be a whole number of sectors.
    pub fn write_at(self: Arc<Self>, buf: IoVec, sector: SectorT)
        -> BoxDiskFut
    {
        Box::pin(async move { self.submit_write(buf, sector).await })
    }

    #[instrument(skip(self, buf))]
    async fn submit_read(&self, buf: IoVecMut, sector: SectorT)
        -> Result<()>
    {
        self.check_request(buf.len(), sector)?;
        if buf.is_empty() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        let ctl = BioCtl::new(tx);
        let mut cursor = sector;
        let mut remainder = buf;
        while !remainder.is_empty() {
            let boundary = stripe_align(cursor) + STRIPE_SECTORS;
            let remaining = (remainder.len() / BYTES_PER_SECTOR) as SectorT;
            let take = (boundary - cursor).min(remaining);
            let seg = remainder.split_to(take as usize * BYTES_PER_SECTOR);
            let bio = Bio {
                sector: cursor,
                cmd: BioCmd::Read(seg),
                ctl: ctl.clone(),
            };
            ctl.add_segment();
            if let Err(e) = self.attach(bio).await {
                ctl.complete(Err(e));
                break;
            }
            cursor += take;
        }
        ctl.complete(Ok(()));
        rx.await.unwrap_or(Err(Error::EPIPE))
    }

    #[instrument(skip(self, buf))]
    async fn submit_write(&self, buf: IoVec, sector: SectorT)
        -> Result<()>
    {
        self.check_request(buf.len(), sector)?;
        if buf.is_empty() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        let ctl = BioCtl::new(tx);
        let mut cursor = sector;
        let mut remainder = buf;
        while !remainder.is_empty() {
            let boundary = stripe_align(cursor) + STRIPE_SECTORS;
            let remaining = (remainder.len() / BYTES_PER_SECTOR) as SectorT;
            let take = (boundary - cursor).min(remaining);
            let seg = remainder.split_to(take as usize * BYTES_PER_SECTOR);
            let bio = Bio {
                sector: cursor,
                cmd: BioCmd::Write(seg),
                ctl: ctl.clone(),
            };
            ctl.add_segment();
            if let Err(e) = self.attach(bio).await {
                ctl.complete(Err(e));
                break;
            }
            cursor += take;
        }
        ctl.complete(Ok(()));
        rx.await.unwrap_or(Err(Error::EPIPE))
    }

    fn check_request(&self, len: usize, sector: SectorT) -> Result<()> {
        if !self.accepting.load(Ordering::Relaxed) {
            return Err(Error::ENXIO);
        }
        if len % BYTES_PER_SECTOR != 0 {
            return Err(Error::EINVAL);
        }
        let sectors = (len / BYTES_PER_SECTOR) as SectorT;
        if sector.checked_add(sectors).map_or(true, |end| end > self.size) {
            return Err(Error::EINVAL);
        }
        Ok(())
    }

    /// Queue one segment on its stripe and hand the stripe to the worker.
    /// May wait for a free slot; the one designed suspension point on the
    /// I/O path.
    async fn attach(&self, bio: Bio) -> Result<()> {
        let loc = self.layout.compute_sector(bio.sector);
        let stripe_sector = stripe_align(loc.sector);
        let sref =
            match self.cache.acquire(stripe_sector, loc.pd_idx, false).await?
        {
            Some(sref) => sref,
            // Blocking acquires always produce a stripe
            None => return Err(Error::EDOOFUS),
        };
        let r = {
            let mut sh = sref.head.lock().unwrap();
            sh.add_bio(loc.dd_idx, bio)
        };
        self.cache.release(sref);
        r
    }

    /// One full pass over one stripe, plus issue of whatever I/O the pass
    /// scheduled.  Worker-only.
    fn handle_stripe(self: &Arc<Self>, sref: StripeRef,
                     preread_active: bool)
    {
        let (sector, actions) = {
            let mut sh = sref.head.lock().unwrap();
            sh.handle = false;
            sh.delayed = false;
            match self.run_state_machine(&mut sh, preread_active) {
                Ok(actions) => (sh.sector, actions),
                Err(e) => {
                    tracing::error!(sector = sh.sector, error = %e,
                        "stripe state machine fault");
                    for i in 0..sh.devs.len() {
                        sh.fail_dev_bios(i, Error::EDOOFUS);
                    }
                    if let Some(tx) = sh.sync_done.take() {
                        tx.send(Err(Error::EDOOFUS)).ok();
                    }
                    sh.syncing = false;
                    drop(sh);
                    self.cache.quarantine(sref);
                    return;
                }
            }
        };
        for action in actions {
            let dev = {
                let disks = self.disks.read().unwrap();
                disks[action.disk_idx].dev.clone()
            };
            let write = matches!(action.packet, IoPacket::Write(_));
            let fut = match action.packet {
                IoPacket::Read(buf) => dev.read_at(buf, sector),
                IoPacket::Write(buf) => dev.write_at(buf, sector),
            };
            let cref = self.cache.dup_ref(&sref);
            let vol = self.clone();
            let disk_idx = action.disk_idx;
            tokio::spawn(async move {
                let r = fut.await;
                vol.complete(cref, disk_idx, write, r);
            });
        }
        self.cache.release(sref);
    }

    /// Disk completion: flip the flags and requeue the stripe.  Never runs
    /// the state machine.
    fn complete(&self, sref: StripeRef, disk_idx: usize, write: bool,
                r: Result<()>)
    {
        {
            let mut sh = sref.head.lock().unwrap();
            let sector = sh.sector;
            let dev = &mut sh.devs[disk_idx];
            dev.locked = false;
            match r {
                Ok(()) => {
                    if !write {
                        dev.uptodate = true;
                    }
                }
                Err(e) => {
                    // A failed read leaves garbage; a failed write leaves
                    // the page contents still valid in core.
                    if !write {
                        dev.uptodate = false;
                    }
                    tracing::warn!(sector, disk = disk_idx, error = %e,
                        write, "member i/o failed");
                    self.mark_failed(disk_idx);
                }
            }
            sh.handle = true;
        }
        self.cache.release(sref);
    }

    /// Decide everything that can be decided about one stripe right now.
    ///
    /// Any error here means the stripe's bookkeeping is corrupt; the
    /// caller quarantines it.
    fn run_state_machine(&self, sh: &mut StripeHead, preread_active: bool)
        -> Result<Vec<IoAction>>
    {
        let ndisks = sh.devs.len();
        let pd_idx = sh.pd_idx;
        let (operational, readable): (Vec<bool>, Vec<bool>) = {
            let disks = self.disks.read().unwrap();
            (disks.iter().map(|d| d.operational).collect(),
             disks.iter().map(Disk::readable).collect())
        };
        let mut actions = Vec::new();

        serve_reads(sh)?;
        let mut t = tally(sh, &readable);
        tracing::debug!(sector = sh.sector, locked = t.locked,
            uptodate = t.uptodate, to_read = t.to_read,
            to_write = t.to_write, written = t.written, failed = t.failed,
            syncing = sh.syncing, "handling stripe");

        // With more than one member gone, anything not yet on disk is
        // lost.
        if t.failed > 1 &&
            (t.to_read + t.to_write + t.written > 0 || sh.syncing)
        {
            tracing::warn!(sector = sh.sector, failed = t.failed,
                "too many failed members; failing pending i/o");
            for i in 0..ndisks {
                let dev = &mut sh.devs[i];
                for bio in dev.towrite.drain(..).chain(dev.written.drain(..))
                {
                    bio.ctl.complete(Err(Error::EIO));
                }
                dev.overwrite = false;
                if !readable[i] {
                    for bio in dev.toread.drain(..) {
                        bio.ctl.complete(Err(Error::EIO));
                    }
                }
            }
            if sh.syncing {
                if let Some(tx) = sh.sync_done.take() {
                    tx.send(Err(Error::EIO)).ok();
                }
                sh.syncing = false;
            }
            t = tally(sh, &readable);
        }

        // Acknowledge writes that are safely on disk.  Data alone is not
        // enough; the row's parity must have landed too, unless the parity
        // member is itself the single failed disk.
        if t.written > 0 {
            let pdev = &sh.devs[pd_idx];
            let parity_safe =
                (operational[pd_idx] && !pdev.locked && pdev.uptodate) ||
                (t.failed == 1 && t.failed_num == pd_idx);
            if parity_safe {
                for i in 0..ndisks {
                    let failed_dev = t.failed == 1 && t.failed_num == i;
                    let dev = &mut sh.devs[i];
                    if !dev.written.is_empty() && !dev.locked &&
                        (dev.uptodate || failed_dev)
                    {
                        for bio in dev.written.drain(..) {
                            bio.ctl.complete(Ok(()));
                        }
                    }
                }
            }
        }

        // Bring in whatever blocks are needed: queued reads, preread-style
        // write inputs, a sync pass, or service of a failed disk's reads
        // through the other members.  With exactly one block missing,
        // arithmetic beats the disk.
        if t.to_read > 0 || t.non_overwrite > 0 ||
            (sh.syncing && t.uptodate < ndisks)
        {
            let mut computed = false;
            for i in 0..ndisks {
                let wants = {
                    let dev = &sh.devs[i];
                    let fdev = &sh.devs[t.failed_num];
                    // A failed member's queued work can only be served by
                    // bringing in every other column
                    let failed_service = t.failed > 0 &&
                        (!fdev.toread.is_empty() ||
                         (!fdev.towrite.is_empty() && !fdev.overwrite));
                    !dev.locked && !dev.uptodate &&
                        (!dev.toread.is_empty() ||
                         (!dev.towrite.is_empty() && !dev.overwrite) ||
                         sh.syncing ||
                         failed_service)
                };
                if !wants {
                    continue;
                }
                if t.uptodate == ndisks - 1 {
                    tracing::debug!(sector = sh.sector, disk = i,
                        "computing block");
                    sh.compute_block(&self.codec, i)?;
                    t.uptodate += 1;
                    computed = true;
                } else if readable[i] {
                    let dev = &mut sh.devs[i];
                    dev.locked = true;
                    let buf = dev.page.try_mut()
                        .map_err(|_| Error::EDOOFUS)?;
                    actions.push(IoAction {
                        disk_idx: i,
                        packet: IoPacket::Read(buf),
                    });
                    t.locked += 1;
                }
            }
            if computed {
                // The rebuilt block can serve queued work next pass
                sh.handle = true;
            }
        }

        // Pick a write strategy by counting the reads each would need.
        // Unreadable members weigh a whole stripe's worth so the math
        // routes around them.
        if t.to_write > 0 {
            let mut rmw = 0;
            let mut rcw = 0;
            for i in 0..ndisks {
                let dev = &sh.devs[i];
                if (!dev.towrite.is_empty() || i == pd_idx) && !dev.uptodate
                {
                    if readable[i] {
                        rmw += 1;
                    } else {
                        rmw += 2 * ndisks;
                    }
                }
                if !dev.overwrite && i != pd_idx && !dev.uptodate {
                    if readable[i] {
                        rcw += 1;
                    } else {
                        rcw += 2 * ndisks;
                    }
                }
            }
            tracing::debug!(sector = sh.sector, rmw, rcw,
                "write strategy");
            if rmw < rcw && rmw > 0 {
                // Read-modify-write: preread the old targets and parity
                for i in 0..ndisks {
                    let want = {
                        let dev = &sh.devs[i];
                        (!dev.towrite.is_empty() || i == pd_idx) &&
                            !dev.locked && !dev.uptodate && readable[i]
                    };
                    if want {
                        if preread_active {
                            let dev = &mut sh.devs[i];
                            dev.locked = true;
                            let buf = dev.page.try_mut()
                                .map_err(|_| Error::EDOOFUS)?;
                            actions.push(IoAction {
                                disk_idx: i,
                                packet: IoPacket::Read(buf),
                            });
                            t.locked += 1;
                        } else {
                            sh.delayed = true;
                            sh.handle = true;
                        }
                    }
                }
            }
            if rcw <= rmw && rcw > 0 {
                // Reconstruct-write: preread the columns writes won't
                // cover
                for i in 0..ndisks {
                    let want = {
                        let dev = &sh.devs[i];
                        !dev.overwrite && i != pd_idx &&
                            !dev.locked && !dev.uptodate && readable[i]
                    };
                    if want {
                        if preread_active {
                            let dev = &mut sh.devs[i];
                            dev.locked = true;
                            let buf = dev.page.try_mut()
                                .map_err(|_| Error::EDOOFUS)?;
                            actions.push(IoAction {
                                disk_idx: i,
                                packet: IoPacket::Read(buf),
                            });
                            t.locked += 1;
                        } else {
                            sh.delayed = true;
                            sh.handle = true;
                        }
                    }
                }
            }
            // Nothing in flight and one strategy fully fed: apply
            // payloads, compute parity, and send every locked page down.
            if t.locked == 0 && (rcw == 0 || rmw == 0) {
                let method = if rcw == 0 {
                    ParityMethod::ReconstructWrite
                } else {
                    ParityMethod::ReadModifyWrite
                };
                tracing::debug!(sector = sh.sector, ?method,
                    "starting write");
                sh.compute_parity(&self.codec, method)?;
                for i in 0..ndisks {
                    if !sh.devs[i].locked {
                        continue;
                    }
                    if operational[i] {
                        let buf = sh.devs[i].page.try_const()
                            .map_err(|_| Error::EDOOFUS)?;
                        actions.push(IoAction {
                            disk_idx: i,
                            packet: IoPacket::Write(buf),
                        });
                        t.locked += 1;
                    } else {
                        // No disk to take it; the retire gate treats the
                        // single failed member as already written
                        sh.devs[i].locked = false;
                        sh.handle = true;
                    }
                }
            }
        }

        // Sync: with every needed block in core and nothing in flight,
        // verify a healthy row or rebuild a degraded one.
        if sh.syncing && !sh.insync && t.locked == 0 && t.failed <= 1 {
            if t.failed == 0 {
                if t.uptodate != ndisks {
                    tracing::error!(sector = sh.sector,
                        uptodate = t.uptodate, "sync pass with stale pages");
                    return Err(Error::EDOOFUS);
                }
                if sh.compute_parity(&self.codec, ParityMethod::CheckOnly)? {
                    sh.insync = true;
                } else {
                    tracing::warn!(sector = sh.sector,
                        "parity mismatch; rewriting parity");
                    sh.compute_block(&self.codec, pd_idx)?;
                    let dev = &mut sh.devs[pd_idx];
                    dev.locked = true;
                    let buf = dev.page.try_const()
                        .map_err(|_| Error::EDOOFUS)?;
                    actions.push(IoAction {
                        disk_idx: pd_idx,
                        packet: IoPacket::Write(buf),
                    });
                    t.locked += 1;
                    sh.repaired = true;
                    sh.insync = true;
                }
            } else {
                let target = t.failed_num;
                if operational[target] {
                    if !sh.devs[target].uptodate {
                        sh.compute_block(&self.codec, target)?;
                    }
                    tracing::debug!(sector = sh.sector, disk = target,
                        "rebuilding member");
                    let dev = &mut sh.devs[target];
                    dev.locked = true;
                    let buf = dev.page.try_const()
                        .map_err(|_| Error::EDOOFUS)?;
                    actions.push(IoAction {
                        disk_idx: target,
                        packet: IoPacket::Write(buf),
                    });
                    t.locked += 1;
                    sh.repaired = true;
                }
                // A failed member with no replacement cannot be repaired;
                // the row is as consistent as it can be.
                sh.insync = true;
            }
        }
        if sh.syncing && sh.insync && t.locked == 0 {
            let clean = !sh.repaired;
            if let Some(tx) = sh.sync_done.take() {
                tx.send(Ok(clean)).ok();
            }
            sh.syncing = false;
        }

        Ok(actions)
    }

    fn mark_failed(&self, disk_idx: usize) {
        let mut disks = self.disks.write().unwrap();
        if let Some(d) = disks.get_mut(disk_idx) {
            if d.operational {
                d.operational = false;
                d.write_only = false;
                tracing::error!(disk = disk_idx, uuid = %d.uuid,
                    "disk failed");
            }
        }
        drop(disks);
        self.cache.wake_worker();
    }

    /// Administratively fail a member, as on an unrecoverable error
    /// report.  Idempotent.
    pub fn fault(&self, disk_idx: usize) -> Result<()> {
        if disk_idx >= self.layout.raid_disks() {
            return Err(Error::EINVAL);
        }
        self.mark_failed(disk_idx);
        Ok(())
    }

    /// Register a hot standby.  It takes no I/O until promoted.
    pub fn add_spare(&self, dev: Arc<dyn BlockDev>, uuid: Uuid)
        -> Result<()>
    {
        if dev.size() < self.per_disk {
            return Err(Error::EINVAL);
        }
        let mut spares = self.spares.lock().unwrap();
        let number = self.layout.raid_disks() + spares.len();
        spares.push(Disk {
            dev,
            number,
            uuid,
            operational: true,
            spare: true,
            write_only: false,
        });
        tracing::info!(%uuid, "spare registered");
        Ok(())
    }

    /// Swap a spare's device into a failed slot as a write-only rebuild
    /// target.  Issues no I/O itself; a subsequent full
    /// [`request_sync`](RaidVolume::request_sync) performs the rebuild.
    pub fn promote_spare(&self, disk_idx: usize, spare_uuid: Uuid)
        -> Result<()>
    {
        let mut spares = self.spares.lock().unwrap();
        let pos = spares.iter()
            .position(|s| s.uuid == spare_uuid)
            .ok_or(Error::ENODEV)?;
        let mut disks = self.disks.write().unwrap();
        let slot = disks.get_mut(disk_idx).ok_or(Error::EINVAL)?;
        if slot.operational {
            return Err(Error::EINVAL);
        }
        let spare = spares.remove(pos);
        tracing::info!(disk = disk_idx, uuid = %spare.uuid,
            "spare promoted; rebuild required");
        *slot = Disk {
            dev: spare.dev,
            number: disk_idx,
            uuid: spare.uuid,
            operational: true,
            spare: false,
            write_only: true,
        };
        drop(disks);
        drop(spares);
        self.cache.wake_worker();
        Ok(())
    }

    /// Verify or rebuild every stripe row in `[start, end)` of per-disk
    /// sectors.  A full pass over `[0, member_sectors())` also graduates
    /// any rebuilding member to full service.
    #[instrument(skip(self))]
    pub async fn request_sync(&self, start: SectorT, end: SectorT)
        -> Result<SyncStats>
    {
        let end = end.min(self.per_disk);
        let mut stats = SyncStats::default();
        let first = stripe_align(start);
        if first < end {
            tracing::debug!(rows = div_roundup(end - first, STRIPE_SECTORS),
                "sync pass");
        }
        let mut row = first;
        while row < end {
            if !self.accepting.load(Ordering::Relaxed) {
                return Err(Error::ENXIO);
            }
            let pd_idx = self.layout.parity_disk_of(row);
            let sref = match self.cache.acquire(row, pd_idx, false).await? {
                Some(sref) => sref,
                None => return Err(Error::EDOOFUS),
            };
            let (tx, rx) = oneshot::channel();
            {
                let mut sh = sref.head.lock().unwrap();
                if sh.syncing || sh.sync_done.is_some() {
                    drop(sh);
                    self.cache.release(sref);
                    return Err(Error::EBUSY);
                }
                sh.syncing = true;
                sh.insync = false;
                sh.repaired = false;
                sh.sync_done = Some(tx);
                sh.handle = true;
            }
            self.cache.release(sref);
            let clean = rx.await.unwrap_or(Err(Error::EPIPE))?;
            stats.stripes += 1;
            if !clean {
                stats.repaired += 1;
            }
            row += STRIPE_SECTORS;
        }
        if start == 0 && end == self.per_disk {
            self.spare_active();
        }
        Ok(stats)
    }

    /// Graduate every fully-rebuilt member to normal service.
    fn spare_active(&self) {
        let mut disks = self.disks.write().unwrap();
        for d in disks.iter_mut() {
            if d.operational && d.write_only {
                d.write_only = false;
                tracing::info!(disk = d.number, uuid = %d.uuid,
                    "rebuild complete");
            }
        }
    }

    fn layout_name(&self) -> String {
        format!("{}-{}-{}", self.layout.level(), self.layout.algorithm(),
                self.layout.raid_disks())
    }

    pub fn status(&self) -> Status {
        let disks = self.disks.read().unwrap();
        let dstats = disks.iter().map(Disk::status).collect::<Vec<_>>();
        let failed = disks.iter().filter(|d| !d.operational).count();
        let rebuilding =
            disks.iter().any(|d| d.operational && d.write_only);
        let health = if failed > 1 {
            Health::Faulted
        } else if rebuilding {
            Health::Rebuilding
        } else {
            NonZeroU8::new(failed as u8)
                .map(Health::Degraded)
                .unwrap_or(Health::Online)
        };
        Status {
            health,
            layout: self.layout_name(),
            disks: dstats,
            uuid: self.uuid,
        }
    }

    pub fn healthy(&self) -> bool {
        self.status().healthy()
    }

    pub fn fault_count(&self) -> usize {
        self.disks.read().unwrap().iter()
            .filter(|d| !d.operational)
            .count()
    }

    /// Usable capacity in logical sectors
    pub fn size(&self) -> SectorT {
        self.size
    }

    /// Usable sectors per member disk; the address space of
    /// [`request_sync`](RaidVolume::request_sync)
    pub fn member_sectors(&self) -> SectorT {
        self.per_disk
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

// LCOV_EXCL_STOP
