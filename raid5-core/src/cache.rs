// vim: tw=80
//! The stripe cache: a fixed pool of stripe slots, hashed by stripe sector
//!
//! Slots live in an arena and are addressed by stable indices.  A single
//! cache-wide lock guards the hash, the free/handle/delayed queues, and
//! every slot's reference count; the stripes themselves are guarded by
//! their own per-slot locks.  Code that needs both always takes the stripe
//! lock first and the cache lock second, and never sleeps under either.
//! The one exception is slot recycling, which locks a freshly delisted
//! slot under the cache lock; no other reference to it can exist then.

use crate::{layout::Layout, stripe::StripeHead, types::*};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};
use tokio::sync::{oneshot, Notify};

/// Stripe slots allocated at array activation
pub const NR_STRIPES: usize = 256;

/// Low-water mark for preread-active stripes.  Delayed stripes are promoted
/// only when the count falls below this, so partial writes batch their
/// prereads instead of fanning out at once.
pub const IO_THRESHOLD: usize = 1;

/// Which collection a slot currently belongs to
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ListKind {
    /// Held by at least one reference and findable through the hash only
    Hashed,
    Free,
    Handle,
    Delayed,
}

/// A checked-out reference to one stripe slot.  Must be returned with
/// [`StripeCache::release`]; the slot cannot be recycled while any
/// reference is outstanding.
pub struct StripeRef {
    pub idx: usize,
    pub head: Arc<Mutex<StripeHead>>,
}

struct Slot {
    head: Arc<Mutex<StripeHead>>,
    /// Sector under which this slot is hashed
    sector: Option<SectorT>,
    refcount: usize,
    list: ListKind,
    /// Counted against [`IO_THRESHOLD`]; set at promotion, cleared when the
    /// slot returns to the free list
    preread_active: bool,
    /// Quarantined after an internal fault; never listed or recycled again
    dead: bool,
}

#[derive(Default)]
struct Inner {
    slots: Vec<Slot>,
    map: HashMap<SectorT, usize>,
    free: VecDeque<usize>,
    handle: VecDeque<usize>,
    delayed: VecDeque<usize>,
    /// Slots not on the free list
    active: usize,
    preread_active: usize,
    dead: usize,
    /// An acquirer exhausted the pool; takers hold off until the pool
    /// drains below the blocking threshold
    inactive_blocked: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

impl Inner {
    /// May a free slot be taken right now?
    fn may_take_free(&self) -> bool {
        !self.free.is_empty() &&
            (!self.inactive_blocked ||
             4 * self.active < 3 * self.slots.len())
    }

    fn wake_acquirers(&mut self) {
        for tx in self.waiters.drain(..) {
            tx.send(()).ok();
        }
    }

    /// Promote every delayed stripe to the handle list, marking it
    /// preread-active.
    fn promote_delayed(&mut self) {
        if self.preread_active >= IO_THRESHOLD {
            return;
        }
        while let Some(idx) = self.delayed.pop_front() {
            let slot = &mut self.slots[idx];
            slot.list = ListKind::Handle;
            if !slot.preread_active {
                slot.preread_active = true;
                self.preread_active += 1;
            }
            self.handle.push_back(idx);
        }
    }
}

pub struct StripeCache {
    layout: Layout,
    inner: Mutex<Inner>,
    /// Signaled when the handle list gains work or the preread gate reopens
    worker: Notify,
}

impl StripeCache {
    pub fn new(layout: Layout) -> Self {
        StripeCache {
            layout,
            inner: Mutex::new(Inner::default()),
            worker: Notify::new(),
        }
    }

    /// Add `n` slots to the pool, each with one stripe unit of buffer per
    /// member disk.  Not a hot path; called at activation.
    pub fn grow(&self, n: usize) {
        let ndisks = self.layout.raid_disks();
        let mut inner = self.inner.lock().unwrap();
        for _ in 0..n {
            let idx = inner.slots.len();
            inner.slots.push(Slot {
                head: Arc::new(Mutex::new(StripeHead::new(ndisks))),
                sector: None,
                refcount: 0,
                list: ListKind::Free,
                preread_active: false,
                dead: false,
            });
            inner.free.push_back(idx);
        }
        inner.wake_acquirers();
    }

    /// Take a reference to the stripe covering `sector`.
    ///
    /// A hashed stripe is reused, whatever queue it sits on.  On a miss, a
    /// free slot is recycled under the new identity.  With the pool
    /// exhausted, blocking mode waits until the cache drains below 3/4
    /// occupancy; nonblocking mode returns `None` instead.
    pub async fn acquire(&self, sector: SectorT, pd_idx: usize,
                         nonblocking: bool) -> Result<Option<StripeRef>>
    {
        loop {
            let rx = {
                let mut inner = self.inner.lock().unwrap();
                if let Some(idx) = inner.map.get(&sector).copied() {
                    return Ok(Some(Self::ref_hashed(&mut inner, idx)?));
                }
                if inner.may_take_free() {
                    inner.inactive_blocked = false;
                    let idx = inner.free.pop_front().unwrap();
                    inner.active += 1;
                    let slot = &mut inner.slots[idx];
                    slot.list = ListKind::Hashed;
                    slot.refcount = 1;
                    let old = slot.sector.replace(sector);
                    let head = slot.head.clone();
                    if let Some(old) = old {
                        inner.map.remove(&old);
                    }
                    // Identity may only change before the new mapping is
                    // published, so init runs here, where the slot is
                    // unreachable by anyone else.  Its lock is necessarily
                    // uncontended: the old mapping is gone and the
                    // refcount was zero.
                    let r = head.lock().unwrap()
                        .init(sector, pd_idx, &self.layout);
                    if let Err(e) = r {
                        drop(inner);
                        self.quarantine(StripeRef { idx, head });
                        return Err(e);
                    }
                    inner.map.insert(sector, idx);
                    return Ok(Some(StripeRef { idx, head }));
                }
                if nonblocking {
                    return Ok(None);
                }
                inner.inactive_blocked = true;
                let (tx, rx) = oneshot::channel();
                inner.waiters.push(tx);
                rx
            };
            rx.await.ok();
        }
    }

    /// Reference a slot found through the hash, delisting it if idle.
    fn ref_hashed(inner: &mut Inner, idx: usize) -> Result<StripeRef> {
        let kind = inner.slots[idx].list;
        if inner.slots[idx].refcount == 0 {
            match kind {
                ListKind::Free => {
                    inner.free.retain(|i| *i != idx);
                    inner.active += 1;
                }
                ListKind::Handle => inner.handle.retain(|i| *i != idx),
                ListKind::Delayed => inner.delayed.retain(|i| *i != idx),
                ListKind::Hashed => {
                    // Unreferenced but on no list: bookkeeping is corrupt
                    tracing::error!(idx, "idle stripe slot on no list");
                    return Err(Error::EDOOFUS);
                }
            }
            inner.slots[idx].list = ListKind::Hashed;
        }
        let slot = &mut inner.slots[idx];
        slot.refcount += 1;
        Ok(StripeRef { idx, head: slot.head.clone() })
    }

    /// Take an additional reference for a completion callback.
    pub fn dup_ref(&self, sref: &StripeRef) -> StripeRef {
        let mut inner = self.inner.lock().unwrap();
        inner.slots[sref.idx].refcount += 1;
        StripeRef { idx: sref.idx, head: sref.head.clone() }
    }

    /// Return a reference.  The last one routes the slot: to the handle or
    /// delayed queue if the stripe wants another pass, otherwise back to
    /// the free list.
    ///
    /// The caller must not hold the stripe's lock; this takes it.
    pub fn release(&self, sref: StripeRef) {
        let StripeRef { idx, head } = sref;
        let mut sh = head.lock().unwrap();
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.slots[idx].refcount > 0);
        inner.slots[idx].refcount -= 1;
        if inner.slots[idx].refcount > 0 {
            return;
        }
        if inner.slots[idx].dead {
            // The slot leaves circulation, but its preread accounting
            // must not, or the promotion gate jams shut.
            if inner.slots[idx].preread_active {
                inner.slots[idx].preread_active = false;
                inner.preread_active -= 1;
                if inner.preread_active < IO_THRESHOLD {
                    self.worker.notify_one();
                }
            }
            // Strand no callers: anything still queued will never be
            // processed.
            for i in 0..sh.devs.len() {
                sh.fail_dev_bios(i, Error::EDOOFUS);
            }
            inner.wake_acquirers();
            return;
        }
        if sh.handle {
            if sh.delayed {
                inner.slots[idx].list = ListKind::Delayed;
                inner.delayed.push_back(idx);
            } else {
                inner.slots[idx].list = ListKind::Handle;
                inner.handle.push_back(idx);
            }
            self.worker.notify_one();
        } else {
            if inner.slots[idx].preread_active {
                inner.slots[idx].preread_active = false;
                inner.preread_active -= 1;
                if inner.preread_active < IO_THRESHOLD {
                    self.worker.notify_one();
                }
            }
            inner.slots[idx].list = ListKind::Free;
            inner.free.push_back(idx);
            inner.active -= 1;
            inner.wake_acquirers();
        }
    }

    /// Pop the next stripe needing a state machine pass, promoting delayed
    /// stripes first whenever the handle queue is dry and the preread gate
    /// is open.  Returns the reference and whether this stripe is
    /// preread-active.
    pub fn next_handle(&self) -> Option<(StripeRef, bool)> {
        let mut inner = self.inner.lock().unwrap();
        if inner.handle.is_empty() {
            inner.promote_delayed();
        }
        while let Some(idx) = inner.handle.pop_front() {
            let slot = &mut inner.slots[idx];
            if slot.refcount != 0 {
                // Listed slots are supposed to be idle.  Leave it to its
                // holder, which will route it again on release.
                tracing::error!(idx, "handle queue slot still referenced");
                slot.list = ListKind::Hashed;
                continue;
            }
            slot.refcount = 1;
            slot.list = ListKind::Hashed;
            return Some((
                StripeRef { idx, head: slot.head.clone() },
                slot.preread_active,
            ));
        }
        None
    }

    /// Park until the handle queue or the preread gate changes.
    pub async fn worker_wait(&self) {
        self.worker.notified().await;
    }

    pub fn wake_worker(&self) {
        self.worker.notify_one();
    }

    /// Permanently retire a slot whose bookkeeping can no longer be
    /// trusted.  The slot is unhashed so the sector can be cached afresh;
    /// the buffers are abandoned to whatever references remain.
    pub fn quarantine(&self, sref: StripeRef) {
        {
            let mut inner = self.inner.lock().unwrap();
            let slot = &mut inner.slots[sref.idx];
            if let Some(s) = slot.sector.take() {
                let idx = sref.idx;
                tracing::error!(idx, sector = s, "stripe slot quarantined");
                inner.map.remove(&s);
            }
            if !inner.slots[sref.idx].dead {
                inner.slots[sref.idx].dead = true;
                inner.dead += 1;
            }
        }
        self.release(sref);
    }

    /// Wait for every live slot to go idle and every reference, even to
    /// quarantined slots, to come home, then free the pool.  The barrier
    /// used at deactivation.
    pub async fn shrink(&self) {
        loop {
            let rx = {
                let mut inner = self.inner.lock().unwrap();
                if inner.active == inner.dead &&
                    inner.slots.iter().all(|s| s.refcount == 0)
                {
                    inner.map.clear();
                    inner.free.clear();
                    inner.handle.clear();
                    inner.delayed.clear();
                    inner.slots.clear();
                    inner.active = 0;
                    inner.dead = 0;
                    inner.preread_active = 0;
                    return;
                }
                let (tx, rx) = oneshot::channel();
                inner.waiters.push(tx);
                rx
            };
            rx.await.ok();
        }
    }
}

// LCOV_EXCL_STOP
