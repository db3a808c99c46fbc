// vim: tw=80

/// End-to-end tests against memory-backed members
mod volume {
    use divbuf::DivBufShared;
    use futures::{stream::FuturesUnordered, TryStreamExt};
    use pretty_assertions::assert_eq;
    use raid5_core::{
        *,
        disk::{BlockDev, Health, RamDisk},
        layout::{Algorithm, Layout, RaidLevel},
        volume::{Config, RaidVolume, SyncStats},
    };
    use rand::{thread_rng, Rng};
    use rstest::rstest;
    use rstest_reuse::{apply, template};
    use std::sync::Arc;
    use uuid::Uuid;

    /// Per-member size: 512 stripe rows, twice the stripe pool
    const DEV_SECTORS: SectorT = 512 * STRIPE_SECTORS;

    struct Harness {
        vol: Arc<RaidVolume>,
        disks: Vec<Arc<RamDisk>>,
        config: Config,
        chunk: SectorT,
    }

    async fn harness(n: usize, chunk: SectorT) -> Harness {
        let disks = (0..n).map(|_| Arc::new(RamDisk::new(DEV_SECTORS)))
            .collect::<Vec<_>>();
        let devs = disks.iter()
            .map(|d| d.clone() as Arc<dyn BlockDev>)
            .collect::<Vec<_>>();
        let config = Config::create(RaidLevel::Raid5,
                                    Algorithm::LeftSymmetric, chunk, n);
        let vol = RaidVolume::activate(config.clone(), devs).unwrap();
        Harness { vol, disks, config, chunk }
    }

    /// Bring the same members back up with a cold stripe pool, so
    /// subsequent reads really come from the disks.
    async fn reactivate(h: &mut Harness) {
        h.vol.deactivate().await.unwrap();
        let devs = h.disks.iter()
            .map(|d| d.clone() as Arc<dyn BlockDev>)
            .collect::<Vec<_>>();
        h.vol = RaidVolume::activate(h.config.clone(), devs).unwrap();
    }

    fn data_disks(h: &Harness) -> usize {
        (h.vol.size() / h.vol.member_sectors()) as usize
    }

    fn make_bufs(sectors: SectorT) -> (DivBufShared, DivBufShared) {
        let bytes = sectors as usize * BYTES_PER_SECTOR;
        let mut wvec = vec![0u8; bytes];
        let mut rng = thread_rng();
        for x in &mut wvec {
            *x = rng.gen();
        }
        (DivBufShared::from(wvec), DivBufShared::from(vec![0u8; bytes]))
    }

    async fn write_read(vol: Arc<RaidVolume>, wbufs: Vec<IoVec>,
                        rbufs: Vec<IoVecMut>, start: SectorT)
    {
        let mut write_sector = start;
        let mut read_sector = start;
        wbufs.into_iter()
            .map(|wb| {
                let sectors = (wb.len() / BYTES_PER_SECTOR) as SectorT;
                let fut = vol.clone().write_at(wb, write_sector);
                write_sector += sectors;
                fut
            }).collect::<FuturesUnordered<_>>()
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        rbufs.into_iter()
            .map(|rb| {
                let sectors = (rb.len() / BYTES_PER_SECTOR) as SectorT;
                let fut = vol.clone().read_at(rb, read_sector);
                read_sector += sectors;
                fut
            }).collect::<FuturesUnordered<_>>()
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
    }

    async fn write_read_n_rows(h: &Harness, rows: usize) {
        let sectors = h.chunk * data_disks(h) as SectorT * rows as SectorT;
        let (dbsw, dbsr) = make_bufs(sectors);
        let wbuf = dbsw.try_const().unwrap();
        write_read(h.vol.clone(), vec![dbsw.try_const().unwrap()],
                   vec![dbsr.try_mut().unwrap()], 0).await;
        assert_eq!(wbuf, dbsr.try_const().unwrap());
    }

    /// The whole front of one member, straight from the backing store
    async fn member_bytes(disk: &Arc<RamDisk>, sectors: SectorT) -> Vec<u8>
    {
        let dbs = DivBufShared::from(
            vec![0u8; sectors as usize * BYTES_PER_SECTOR]);
        disk.read_at(dbs.try_mut().unwrap(), 0).await.unwrap();
        Vec::from(&dbs.try_const().unwrap()[..])
    }

    /// Read `sectors` from the front of the array, `step` sectors per
    /// request.
    async fn read_all(vol: Arc<RaidVolume>, sectors: SectorT,
                      step: SectorT) -> Vec<u8>
    {
        let dbsr = DivBufShared::from(
            vec![0u8; sectors as usize * BYTES_PER_SECTOR]);
        {
            let mut whole = dbsr.try_mut().unwrap();
            (0..sectors).step_by(step as usize)
                .map(|s| {
                    let take = step.min(sectors - s) as usize *
                        BYTES_PER_SECTOR;
                    let seg = whole.split_to(take);
                    vol.clone().read_at(seg, s)
                })
                .collect::<FuturesUnordered<_>>()
                .try_collect::<Vec<_>>()
                .await
                .unwrap();
        }
        Vec::from(&dbsr.try_const().unwrap()[..])
    }

    #[template]
    #[rstest(h,
             // Degenerate two-member array; parity mirrors the data
             case(harness(2, STRIPE_SECTORS)),
             // Smallest real RAID5
             case(harness(3, STRIPE_SECTORS)),
             case(harness(4, STRIPE_SECTORS)),
             // Multi-unit chunks
             case(harness(4, 2 * STRIPE_SECTORS)),
             case(harness(5, 3 * STRIPE_SECTORS)),
             // Wide array
             case(harness(8, STRIPE_SECTORS)),
     )]
    fn raid_configs(h: Harness) {}

    #[apply(raid_configs)]
    #[tokio::test]
    #[awt]
    async fn write_read_one_row(#[future] h: Harness) {
        write_read_n_rows(&h, 1).await;
    }

    #[apply(raid_configs)]
    #[tokio::test]
    #[awt]
    async fn write_read_three_rows(#[future] h: Harness) {
        write_read_n_rows(&h, 3).await;
    }

    // A range written in two fragments reads back whole
    #[rstest(h, case(harness(3, STRIPE_SECTORS)))]
    #[tokio::test]
    #[awt]
    async fn write_in_pieces(#[future] h: Harness) {
        let sectors = h.chunk * 2 * 2;
        let (dbsw, dbsr) = make_bufs(sectors);
        let wbuf = dbsw.try_const().unwrap();
        let mut wbuf_l = wbuf.clone();
        let wbuf_r = wbuf_l.split_off(5 * BYTES_PER_SECTOR);
        write_read(h.vol.clone(), vec![wbuf_l, wbuf_r],
                   vec![dbsr.try_mut().unwrap()], 0).await;
        assert_eq!(wbuf, dbsr.try_const().unwrap());
    }

    // Read a few chunks back in odd-sized pieces that straddle unit and
    // chunk boundaries
    #[rstest(h, case(harness(4, 2 * STRIPE_SECTORS)))]
    #[tokio::test]
    #[awt]
    async fn read_in_pieces(#[future] h: Harness) {
        let sectors = h.chunk * 3;
        let (dbsw, dbsr) = make_bufs(sectors);
        let wbuf = dbsw.try_const().unwrap();
        h.vol.clone().write_at(dbsw.try_const().unwrap(), 0).await
            .unwrap();
        {
            let mut rbuf0 = dbsr.try_mut().unwrap();
            let mut rbuf1 = rbuf0.split_off(3 * BYTES_PER_SECTOR);
            let mut rbuf2 = rbuf1.split_off(BYTES_PER_SECTOR);
            let mut rbuf3 = rbuf2.split_off(7 * BYTES_PER_SECTOR);
            let rbuf4 = rbuf3.split_off(13 * BYTES_PER_SECTOR);
            let mut sector = 0;
            [rbuf0, rbuf1, rbuf2, rbuf3, rbuf4].into_iter()
                .map(|rb| {
                    let sectors =
                        (rb.len() / BYTES_PER_SECTOR) as SectorT;
                    let fut = h.vol.clone().read_at(rb, sector);
                    sector += sectors;
                    fut
                })
                .collect::<FuturesUnordered<_>>()
                .try_collect::<Vec<_>>()
                .await
                .unwrap();
        }
        assert_eq!(wbuf, dbsr.try_const().unwrap());
    }

    // A write smaller than a stripe unit leaves its neighbors alone
    #[rstest(h, case(harness(4, STRIPE_SECTORS)))]
    #[tokio::test]
    #[awt]
    async fn partial_unit_write(#[future] h: Harness) {
        let (dbsw, _) = make_bufs(4);
        let wbuf = dbsw.try_const().unwrap();
        h.vol.clone().write_at(dbsw.try_const().unwrap(), 2).await
            .unwrap();
        let mut h = h;
        reactivate(&mut h).await;
        let dbsr = DivBufShared::from(
            vec![0u8; STRIPE_SECTORS as usize * BYTES_PER_SECTOR]);
        h.vol.clone().read_at(dbsr.try_mut().unwrap(), 0).await.unwrap();
        let rview = dbsr.try_const().unwrap();
        assert!(rview[..2 * BYTES_PER_SECTOR].iter().all(|b| *b == 0));
        assert_eq!(&rview[2 * BYTES_PER_SECTOR..6 * BYTES_PER_SECTOR],
                   &wbuf[..]);
        assert!(rview[6 * BYTES_PER_SECTOR..].iter().all(|b| *b == 0));
    }

    // Later writes supersede earlier ones, on disk and not just in cache
    #[rstest(h, case(harness(4, STRIPE_SECTORS)))]
    #[tokio::test]
    #[awt]
    async fn overwrite_a_row(#[future] h: Harness) {
        let sectors = 3 * STRIPE_SECTORS;
        let (dbsw, dbsr) = make_bufs(sectors);
        let wbuf = dbsw.try_const().unwrap();
        h.vol.clone().write_at(dbsw.try_const().unwrap(), 0).await
            .unwrap();
        let dbs2 = DivBufShared::from(
            vec![0x6au8; STRIPE_SECTORS as usize * BYTES_PER_SECTOR]);
        h.vol.clone()
            .write_at(dbs2.try_const().unwrap(), STRIPE_SECTORS).await
            .unwrap();
        let mut h = h;
        reactivate(&mut h).await;
        h.vol.clone().read_at(dbsr.try_mut().unwrap(), 0).await.unwrap();
        let rview = dbsr.try_const().unwrap();
        let unit = STRIPE_SECTORS as usize * BYTES_PER_SECTOR;
        assert_eq!(&rview[0..unit], &wbuf[0..unit]);
        assert!(rview[unit..2 * unit].iter().all(|b| *b == 0x6a));
        assert_eq!(&rview[2 * unit..], &wbuf[2 * unit..]);
    }

    // Whatever the configuration, the columns of every row XOR to zero
    // on the backing stores afterwards.
    #[apply(raid_configs)]
    #[tokio::test]
    #[awt]
    async fn parity_covers_every_row(#[future] h: Harness) {
        write_read_n_rows(&h, 3).await;
        h.vol.deactivate().await.unwrap();
        let span = 3 * h.chunk;
        let mut xor = vec![0u8; span as usize * BYTES_PER_SECTOR];
        for disk in &h.disks {
            let bytes = member_bytes(disk, span).await;
            for (x, b) in xor.iter_mut().zip(bytes.iter()) {
                *x ^= *b;
            }
        }
        assert!(xor.iter().all(|x| *x == 0));
    }

    #[rstest(h, case(harness(4, STRIPE_SECTORS)))]
    #[tokio::test]
    #[awt]
    async fn status_reports_the_shape(#[future] h: Harness) {
        let status = h.vol.status();
        assert!(status.healthy());
        assert_eq!(status.layout, "RAID5-left-symmetric-4");
        assert_eq!(status.uuid, h.vol.uuid());
        assert_eq!(status.disks.len(), 4);
        assert_eq!(h.vol.size(), 3 * h.vol.member_sectors());
        assert_eq!(h.vol.fault_count(), 0);
        h.vol.deactivate().await.unwrap();
    }

    #[rstest(h, case(harness(4, STRIPE_SECTORS)))]
    #[tokio::test]
    #[awt]
    async fn rejects_bad_requests(#[future] h: Harness) {
        // Not a whole number of sectors
        let dbs = DivBufShared::from(vec![0u8; 100]);
        assert_eq!(h.vol.clone().write_at(dbs.try_const().unwrap(), 0)
                       .await,
                   Err(Error::EINVAL));
        assert_eq!(h.vol.clone().read_at(dbs.try_mut().unwrap(), 0).await,
                   Err(Error::EINVAL));
        // Past the end of the array
        let (dbsw, dbsr) = make_bufs(STRIPE_SECTORS);
        let end = h.vol.size();
        assert_eq!(h.vol.clone().write_at(dbsw.try_const().unwrap(), end)
                       .await,
                   Err(Error::EINVAL));
        assert_eq!(h.vol.clone()
                       .read_at(dbsr.try_mut().unwrap(), end - 4).await,
                   Err(Error::EINVAL));
        // An address so large the end wraps around
        let (dbsw, _) = make_bufs(STRIPE_SECTORS);
        assert_eq!(h.vol.clone()
                       .write_at(dbsw.try_const().unwrap(), SectorT::MAX)
                       .await,
                   Err(Error::EINVAL));
    }

    #[rstest(h, case(harness(4, STRIPE_SECTORS)))]
    #[tokio::test]
    #[awt]
    async fn no_io_after_deactivate(#[future] h: Harness) {
        h.vol.deactivate().await.unwrap();
        let (dbsw, dbsr) = make_bufs(STRIPE_SECTORS);
        assert_eq!(h.vol.clone().write_at(dbsw.try_const().unwrap(), 0)
                       .await,
                   Err(Error::ENXIO));
        assert_eq!(h.vol.clone().read_at(dbsr.try_mut().unwrap(), 0).await,
                   Err(Error::ENXIO));
    }

    // All data remains readable with one member gone
    #[apply(raid_configs)]
    #[tokio::test]
    #[awt]
    async fn degraded_read(#[future] h: Harness) {
        let sectors = h.chunk * data_disks(&h) as SectorT * 3;
        let (dbsw, dbsr) = make_bufs(sectors);
        let wbuf = dbsw.try_const().unwrap();
        h.vol.clone().write_at(dbsw.try_const().unwrap(), 0).await
            .unwrap();
        let mut h = h;
        reactivate(&mut h).await;
        h.vol.fault(1).unwrap();
        assert_eq!(h.vol.fault_count(), 1);
        h.vol.clone().read_at(dbsr.try_mut().unwrap(), 0).await.unwrap();
        assert_eq!(wbuf, dbsr.try_const().unwrap());
    }

    // Writes land correctly even with a member gone
    #[apply(raid_configs)]
    #[tokio::test]
    #[awt]
    async fn degraded_write(#[future] h: Harness) {
        h.vol.fault(0).unwrap();
        let sectors = h.chunk * data_disks(&h) as SectorT * 2;
        let (dbsw, dbsr) = make_bufs(sectors);
        let wbuf = dbsw.try_const().unwrap();
        h.vol.clone().write_at(dbsw.try_const().unwrap(), 0).await
            .unwrap();
        h.vol.clone().read_at(dbsr.try_mut().unwrap(), 0).await.unwrap();
        assert_eq!(wbuf, dbsr.try_const().unwrap());
    }

    // A sub-unit write whose target sits on the dead member works via
    // reconstruction
    #[rstest(h, case(harness(4, STRIPE_SECTORS)))]
    #[tokio::test]
    #[awt]
    async fn degraded_partial_write(#[future] h: Harness) {
        h.vol.fault(0).unwrap();
        // Logical sector 0 lives on the failed member
        let (dbsw, dbsr) = make_bufs(4);
        let wbuf = dbsw.try_const().unwrap();
        h.vol.clone().write_at(dbsw.try_const().unwrap(), 0).await
            .unwrap();
        let mut h = h;
        reactivate(&mut h).await;
        h.vol.fault(0).unwrap();
        h.vol.clone().read_at(dbsr.try_mut().unwrap(), 0).await.unwrap();
        assert_eq!(wbuf, dbsr.try_const().unwrap());
    }

    // With two members gone, affected requests fail but the rest of the
    // array soldiers on.
    #[rstest(h, case(harness(4, STRIPE_SECTORS)))]
    #[tokio::test]
    #[awt]
    async fn double_fault_loses_data(#[future] h: Harness) {
        h.vol.fault(0).unwrap();
        h.vol.fault(1).unwrap();
        assert!(h.vol.status().health.is_faulted());
        let (dbsw, dbsr) = make_bufs(3 * STRIPE_SECTORS);
        assert_eq!(h.vol.clone().write_at(dbsw.try_const().unwrap(), 0)
                       .await,
                   Err(Error::EIO));
        let mut rbuf = dbsr.try_mut().unwrap();
        let rbuf_dead = rbuf.split_to(
            STRIPE_SECTORS as usize * BYTES_PER_SECTOR);
        assert_eq!(h.vol.clone().read_at(rbuf_dead, 0).await,
                   Err(Error::EIO));
        // Units on the surviving members still serve
        assert_eq!(h.vol.clone().read_at(rbuf, 2 * STRIPE_SECTORS).await,
                   Ok(()));
    }

    #[rstest(h, case(harness(4, STRIPE_SECTORS)))]
    #[tokio::test]
    #[awt]
    async fn sync_reports_clean(#[future] h: Harness) {
        write_read_n_rows(&h, 4).await;
        let stats = h.vol.request_sync(0, SectorT::MAX).await.unwrap();
        assert_eq!(stats.stripes,
                   h.vol.member_sectors() / STRIPE_SECTORS);
        assert_eq!(stats.repaired, 0);
    }

    // Scribble on one row's parity behind the array's back; a sync pass
    // must find it, rewrite it, and leave parity good enough to carry a
    // subsequent member loss.
    #[rstest(h, case(harness(4, STRIPE_SECTORS)))]
    #[tokio::test]
    #[awt]
    async fn sync_repairs_corrupt_parity(#[future] h: Harness) {
        let mut h = h;
        let (dbsw, dbsr) = make_bufs(3 * STRIPE_SECTORS);
        let wbuf = dbsw.try_const().unwrap();
        write_read(h.vol.clone(), vec![dbsw.try_const().unwrap()],
                   vec![dbsr.try_mut().unwrap()], 0).await;
        reactivate(&mut h).await;

        let layout = Layout::new(RaidLevel::Raid5,
                                 Algorithm::LeftSymmetric, 4,
                                 STRIPE_SECTORS).unwrap();
        let pd_idx = layout.parity_disk_of(0);
        let junk = DivBufShared::from(
            vec![0xccu8; STRIPE_SECTORS as usize * BYTES_PER_SECTOR]);
        h.disks[pd_idx].write_at(junk.try_const().unwrap(), 0).await
            .unwrap();

        let stats = h.vol.request_sync(0, STRIPE_SECTORS).await.unwrap();
        assert_eq!(stats, SyncStats { stripes: 1, repaired: 1 });
        let stats = h.vol.request_sync(0, STRIPE_SECTORS).await.unwrap();
        assert_eq!(stats, SyncStats { stripes: 1, repaired: 0 });

        reactivate(&mut h).await;
        h.vol.fault(0).unwrap();
        let dbsr2 = DivBufShared::from(
            vec![0u8; 3 * STRIPE_SECTORS as usize * BYTES_PER_SECTOR]);
        h.vol.clone().read_at(dbsr2.try_mut().unwrap(), 0).await.unwrap();
        assert_eq!(wbuf, dbsr2.try_const().unwrap());
    }

    // Lose a member, bring in a spare, rebuild onto it, then prove the
    // rebuilt contents by losing a second member.
    #[rstest(h, case(harness(4, STRIPE_SECTORS)))]
    #[awt]
    #[test_log::test(tokio::test)]
    async fn rebuild_replaces_a_failed_member(#[future] h: Harness) {
        let mut h = h;
        let sectors = 3 * 16 * STRIPE_SECTORS;
        let bytes = sectors as usize * BYTES_PER_SECTOR;
        let (dbsw, dbsr) = make_bufs(sectors);
        let wbuf = dbsw.try_const().unwrap();
        write_read(h.vol.clone(), vec![dbsw.try_const().unwrap()],
                   vec![dbsr.try_mut().unwrap()], 0).await;
        reactivate(&mut h).await;

        h.vol.fault(2).unwrap();
        let spare_uuid = Uuid::new_v4();
        let spare = Arc::new(RamDisk::new(DEV_SECTORS));
        h.vol.add_spare(spare.clone() as Arc<dyn BlockDev>, spare_uuid)
            .unwrap();
        h.vol.promote_spare(2, spare_uuid).unwrap();
        assert_eq!(h.vol.status().health, Health::Rebuilding);

        // Reads work while the replacement is still write-only
        let dbsr2 = DivBufShared::from(vec![0u8; bytes]);
        h.vol.clone().read_at(dbsr2.try_mut().unwrap(), 0).await.unwrap();
        assert_eq!(wbuf, dbsr2.try_const().unwrap());

        let stats = h.vol.request_sync(0, h.vol.member_sectors()).await
            .unwrap();
        assert_eq!(stats.stripes,
                   h.vol.member_sectors() / STRIPE_SECTORS);
        assert_eq!(stats.repaired, stats.stripes);
        assert!(h.vol.healthy());

        // The rebuilt member carries real data: survive a second fault
        h.disks[2] = spare;
        h.config.disks[2].uuid = spare_uuid;
        reactivate(&mut h).await;
        h.vol.fault(0).unwrap();
        let dbsr3 = DivBufShared::from(vec![0u8; bytes]);
        h.vol.clone().read_at(dbsr3.try_mut().unwrap(), 0).await.unwrap();
        assert_eq!(wbuf, dbsr3.try_const().unwrap());
    }

    // Writing more rows at once than the stripe pool holds forces slot
    // recycling under load.
    #[rstest(h, case(harness(4, STRIPE_SECTORS)))]
    #[awt]
    #[test_log::test(tokio::test)]
    async fn concurrent_writes_cycle_the_stripe_pool(#[future] h: Harness)
    {
        let rows = 400u64;
        let row_sectors = 3 * STRIPE_SECTORS;
        let row_bytes = row_sectors as usize * BYTES_PER_SECTOR;
        let fill = |r: u64| (13 + 7 * r) as u8;
        let bufs = (0..rows).map(|r| {
            DivBufShared::from(vec![fill(r); row_bytes])
        }).collect::<Vec<_>>();
        bufs.iter().zip(0..rows)
            .map(|(dbs, r)| {
                h.vol.clone().write_at(dbs.try_const().unwrap(),
                                       r * row_sectors)
            })
            .collect::<FuturesUnordered<_>>()
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        for r in [0u64, 257, 399] {
            let dbsr = DivBufShared::from(vec![0u8; row_bytes]);
            h.vol.clone()
                .read_at(dbsr.try_mut().unwrap(), r * row_sectors)
                .await
                .unwrap();
            assert!(dbsr.try_const().unwrap().iter()
                .all(|b| *b == fill(r)));
        }
    }

    // Random non-overlapping extents, written all at once and verified
    // against an in-core model
    #[rstest(h, case(harness(4, STRIPE_SECTORS)))]
    #[awt]
    #[test_log::test(tokio::test)]
    async fn torture(#[future] h: Harness) {
        let region = 256 * 3 * STRIPE_SECTORS;
        let mut model = vec![0u8; region as usize * BYTES_PER_SECTOR];
        let mut rng = thread_rng();
        let mut extents = Vec::new();
        let mut cursor = 0;
        while cursor < region {
            let len = rng.gen_range(1..=32).min(region - cursor);
            if rng.gen_bool(0.75) {
                let bytes = len as usize * BYTES_PER_SECTOR;
                let mut v = vec![0u8; bytes];
                rng.fill(&mut v[..]);
                let off = cursor as usize * BYTES_PER_SECTOR;
                model[off..off + bytes].copy_from_slice(&v[..]);
                extents.push((cursor, DivBufShared::from(v)));
            }
            cursor += len;
        }
        extents.iter()
            .map(|(sector, dbs)| {
                h.vol.clone().write_at(dbs.try_const().unwrap(), *sector)
            })
            .collect::<FuturesUnordered<_>>()
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        let readback =
            read_all(h.vol.clone(), region, 3 * STRIPE_SECTORS).await;
        assert_eq!(readback, model);
    }
}

/// The same stack against real files, across a shutdown and reopen
mod persistence {
    use divbuf::DivBufShared;
    use pretty_assertions::assert_eq;
    use raid5_core::{
        *,
        disk::{BlockDev, FileDisk},
        layout::{Algorithm, RaidLevel},
        volume::{Config, RaidVolume},
    };
    use rand::{thread_rng, Rng};
    use std::{path::PathBuf, sync::Arc};
    use tempfile::Builder;

    const DEV_SECTORS: SectorT = 64 * STRIPE_SECTORS;

    #[tokio::test]
    async fn reopen_after_deactivate() {
        let tempdir = t!(Builder::new()
            .prefix("raid5_volume_persistence")
            .tempdir());
        let paths = (0..4).map(|i| {
            let mut fname = PathBuf::from(tempdir.path());
            fname.push(format!("member.{i}"));
            fname
        }).collect::<Vec<_>>();
        let devs = paths.iter().map(|p| {
            Arc::new(t!(FileDisk::create(p, DEV_SECTORS)))
                as Arc<dyn BlockDev>
        }).collect::<Vec<_>>();
        let config = Config::create(RaidLevel::Raid5,
                                    Algorithm::LeftSymmetric,
                                    STRIPE_SECTORS, 4);
        let vol = RaidVolume::activate(config.clone(), devs).unwrap();

        let bytes = 8 * 3 * STRIPE_SECTORS as usize * BYTES_PER_SECTOR;
        let mut wvec = vec![0u8; bytes];
        let mut rng = thread_rng();
        for x in &mut wvec {
            *x = rng.gen();
        }
        let dbsw = DivBufShared::from(wvec);
        let wbuf = dbsw.try_const().unwrap();
        vol.clone().write_at(dbsw.try_const().unwrap(), 0).await
            .unwrap();
        vol.deactivate().await.unwrap();
        drop(vol);

        let devs = paths.iter().map(|p| {
            Arc::new(t!(FileDisk::open(p))) as Arc<dyn BlockDev>
        }).collect::<Vec<_>>();
        let vol = RaidVolume::activate(config, devs).unwrap();
        let dbsr = DivBufShared::from(vec![0u8; bytes]);
        vol.clone().read_at(dbsr.try_mut().unwrap(), 0).await.unwrap();
        assert_eq!(wbuf, dbsr.try_const().unwrap());
        assert!(vol.healthy());
        vol.deactivate().await.unwrap();
    }
}
