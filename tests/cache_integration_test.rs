// Integration tests for the cache engine: admission, bypass reads,
// writeback, laundry, barriers, and the failed-cache behavior.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use bbcache::backing::{BackingDevice, BackingOp, BackingRequest};
use bbcache::region::header::read_header;
use bbcache::{
    CacheError, CacheHandle, CacheManager, Geometry, IoRequest, MemDisk, NvMemory, RamMemory,
    PAGE_SIZE, SECTOR_SIZE,
};

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    manager: CacheManager,
    mem: Arc<RamMemory>,
    disk: Arc<MemDisk>,
    handle: CacheHandle,
    uuid: Uuid,
}

fn setup(size_mb: u32, order: u32, geometry: Geometry) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();

    let data_pages = size_mb as usize * 256;
    let pages = 1 + data_pages + data_pages.div_ceil(512) + 1;
    let mem = Arc::new(RamMemory::new(pages));

    let manager = CacheManager::new();
    manager.attach_device(mem.clone());
    let uuid = manager
        .add_region(&format!("cache0:{size_mb}:{order}"))
        .expect("add region");

    let disk = Arc::new(MemDisk::new(1 << 16));
    let handle = manager
        .register(uuid, "vda", disk.clone(), geometry)
        .expect("register");

    Harness {
        manager,
        mem,
        disk,
        handle,
        uuid,
    }
}

fn wait_idle(handle: &CacheHandle) {
    let deadline = Instant::now() + WAIT;
    loop {
        let (active, _, writeback) = handle.counters();
        if active == 0 && writeback == 0 {
            return;
        }
        assert!(Instant::now() < deadline, "cache did not go idle");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn sector_data(value: u8, sectors: u64) -> Vec<u8> {
    vec![value; sectors as usize * SECTOR_SIZE]
}

#[test]
fn test_cold_init_counts() {
    let h = setup(16, 0, Geometry::default());

    assert_eq!(h.manager.attr_show("cache0", "state").unwrap(), "active");
    assert_eq!(h.manager.attr_show("cache0", "entry_count").unwrap(), "4096");
    assert_eq!(h.manager.attr_show("cache0", "dirty").unwrap(), "0");
    assert_eq!(h.manager.attr_show("cache0", "active").unwrap(), "0");
    assert_eq!(h.manager.attr_show("cache0", "size").unwrap(), "16");
    assert_eq!(h.manager.attr_show("cache0", "order").unwrap(), "0");

    // every descriptor starts unassociated
    let header = read_header(h.mem.as_ref(), 0);
    for slot in [0usize, 1, 2047, 4095] {
        let offset = header.start_pfn as usize * PAGE_SIZE + slot * 8;
        assert_eq!(h.mem.read_u64(offset), 0, "slot {slot}");
    }

    h.handle.debug_check().unwrap();
}

#[test]
fn test_single_write_read_back_flush() {
    let h = setup(1, 0, Geometry::default());
    let payload = sector_data(0xAA, 8);

    h.handle
        .submit(IoRequest::write(0, payload.clone()))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("write timed out")
        .unwrap();
    assert_eq!(h.handle.counters().1, 1, "dirty after write");

    let data = h
        .handle
        .submit(IoRequest::read(0, 8))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("read timed out")
        .unwrap();
    assert_eq!(data, payload);

    h.handle.flush();
    assert_eq!(h.handle.counters().1, 0, "dirty after flush");
    assert_eq!(h.disk.read_direct(0, 8), payload);

    // descriptor for slot 0 is sync with sector 0
    let header = read_header(h.mem.as_ref(), 0);
    let word = h.mem.read_u64(header.start_pfn as usize * PAGE_SIZE);
    assert_eq!(word, 1, "sync descriptor");

    wait_idle(&h.handle);
    h.handle.debug_check().unwrap();
}

#[test]
fn test_write_spanning_blocks_completes_once() {
    let h = setup(1, 0, Geometry::default());

    // three blocks in one request
    let payload: Vec<u8> = (0..24 * SECTOR_SIZE).map(|i| (i / 512) as u8).collect();
    let done = h
        .handle
        .submit(IoRequest::write(0, payload.clone()))
        .unwrap();
    done.wait_timeout(WAIT).expect("write timed out").unwrap();
    assert_eq!(h.handle.counters().1, 3, "one dirty entry per block");

    let data = h
        .handle
        .submit(IoRequest::read(0, 24))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("read timed out")
        .unwrap();
    assert_eq!(data, payload);

    wait_idle(&h.handle);
    h.handle.debug_check().unwrap();
}

#[test]
fn test_rewrite_returns_second_value() {
    let h = setup(1, 0, Geometry::default());

    h.handle
        .submit(IoRequest::write(8, sector_data(0x11, 8)))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("first write timed out")
        .unwrap();
    h.handle
        .submit(IoRequest::write(8, sector_data(0x22, 8)))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("second write timed out")
        .unwrap();

    let data = h
        .handle
        .submit(IoRequest::read(8, 8))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("read timed out")
        .unwrap();
    assert_eq!(data, sector_data(0x22, 8));
}

#[test]
fn test_concurrent_same_sector_writes_serialize() {
    let h = setup(1, 0, Geometry::default());
    let handle_a = h.handle.clone();
    let handle_b = h.handle.clone();

    let writer_a = std::thread::spawn(move || {
        handle_a
            .submit(IoRequest::write(0, sector_data(0xAA, 8)))
            .unwrap()
            .wait_timeout(WAIT)
            .expect("writer a timed out")
            .unwrap();
    });
    let writer_b = std::thread::spawn(move || {
        handle_b
            .submit(IoRequest::write(0, sector_data(0xBB, 8)))
            .unwrap()
            .wait_timeout(WAIT)
            .expect("writer b timed out")
            .unwrap();
    });
    writer_a.join().unwrap();
    writer_b.join().unwrap();

    let data = h
        .handle
        .submit(IoRequest::read(0, 8))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("read timed out")
        .unwrap();
    // exactly one write appears to have happened last; no interleaving
    assert!(
        data == sector_data(0xAA, 8) || data == sector_data(0xBB, 8),
        "torn write: {:x} vs {:x}",
        data[0],
        data[data.len() - 1]
    );

    wait_idle(&h.handle);
    h.handle.debug_check().unwrap();
}

#[test]
fn test_read_miss_bypasses_to_disk() {
    let h = setup(1, 0, Geometry::default());
    h.disk.write_direct(40, &sector_data(0xDD, 8));

    let data = h
        .handle
        .submit(IoRequest::read(40, 8))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("read timed out")
        .unwrap();
    assert_eq!(data, sector_data(0xDD, 8));

    // a bypass read does not populate the cache
    wait_idle(&h.handle);
    assert_eq!(h.handle.counters(), (0, 0, 0));
    h.handle.debug_check().unwrap();
}

#[test]
fn test_bypass_merges_cached_dirty_data() {
    let h = setup(1, 0, Geometry::default());
    h.disk.write_direct(0, &sector_data(0xDD, 16));

    // sectors 0..8 dirty in cache, 8..16 only on disk
    h.handle
        .submit(IoRequest::write(0, sector_data(0xAA, 8)))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("write timed out")
        .unwrap();

    let data = h
        .handle
        .submit(IoRequest::read(0, 16))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("read timed out")
        .unwrap();
    assert_eq!(&data[..8 * SECTOR_SIZE], &sector_data(0xAA, 8)[..]);
    assert_eq!(&data[8 * SECTOR_SIZE..], &sector_data(0xDD, 8)[..]);

    wait_idle(&h.handle);
    h.handle.debug_check().unwrap();
}

/// Holds bypass reads until the test opens the gate.
struct GatedDisk {
    inner: Arc<MemDisk>,
    open: Mutex<bool>,
    cond: Condvar,
}

impl GatedDisk {
    fn new(inner: Arc<MemDisk>) -> Self {
        Self {
            inner,
            open: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn open_gate(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }
}

impl BackingDevice for GatedDisk {
    fn submit(&self, request: BackingRequest) {
        if matches!(request.op, BackingOp::Read { .. }) {
            let mut open = self.open.lock();
            while !*open {
                self.cond.wait(&mut open);
            }
        }
        self.inner.submit(request);
    }
}

#[test]
fn test_bypass_dirty_merge_snapshots_at_admit() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mem = Arc::new(RamMemory::new(1 + 256 + 1 + 1));
    let manager = CacheManager::new();
    manager.attach_device(mem.clone());
    let uuid = manager.add_region("cache0:1:0").unwrap();

    let disk = Arc::new(MemDisk::new(1 << 16));
    disk.write_direct(0, &sector_data(0xDD, 16));
    let gated = Arc::new(GatedDisk::new(disk.clone()));
    let handle = manager
        .register(uuid, "vda", gated.clone(), Geometry::default())
        .unwrap();

    // sector 0..8 dirty with the OLD value
    handle
        .submit(IoRequest::write(0, sector_data(0x01, 8)))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("seed write timed out")
        .unwrap();

    // the read covers a dirty block and a miss, so it bypasses; the
    // gate parks it at the backing device with the block pinned
    let reader_handle = handle.clone();
    let reader = std::thread::spawn(move || {
        reader_handle
            .submit(IoRequest::read(0, 16))
            .unwrap()
            .wait_timeout(WAIT)
            .expect("read timed out")
            .unwrap()
    });
    std::thread::sleep(Duration::from_millis(100));

    // a new write to the same sectors while the bypass is in flight
    let late_write = handle
        .submit(IoRequest::write(0, sector_data(0x02, 8)))
        .unwrap();
    std::thread::sleep(Duration::from_millis(50));

    gated.open_gate();
    let data = reader.join().unwrap();

    // the concurrent read sees the admit-time snapshot
    assert_eq!(&data[..8 * SECTOR_SIZE], &sector_data(0x01, 8)[..]);
    assert_eq!(&data[8 * SECTOR_SIZE..], &sector_data(0xDD, 8)[..]);

    late_write
        .wait_timeout(WAIT)
        .expect("late write timed out")
        .unwrap();

    // a read issued after both returns the new write
    let data = handle
        .submit(IoRequest::read(0, 8))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("second read timed out")
        .unwrap();
    assert_eq!(data, sector_data(0x02, 8));

    wait_idle(&handle);
    handle.debug_check().unwrap();
}

#[test]
fn test_laundry_unblocks_full_pool() {
    // 64 entries of 16 KiB blocks
    let h = setup(1, 2, Geometry::default());
    let blk_sectors = 32u64;

    for i in 0..64u64 {
        h.handle
            .submit(IoRequest::write(i * blk_sectors, sector_data(i as u8, blk_sectors)))
            .unwrap()
            .wait_timeout(WAIT)
            .expect("fill write timed out")
            .unwrap();
    }
    wait_idle(&h.handle);
    assert_eq!(h.handle.counters().1, 64, "whole pool dirty");

    // the next requester blocks on the pool and is released by laundry
    h.handle
        .submit(IoRequest::write(64 * blk_sectors, sector_data(0xEE, blk_sectors)))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("watermark write timed out")
        .unwrap();

    wait_idle(&h.handle);
    let (_, dirty, _) = h.handle.counters();
    assert!(dirty < 64, "laundry made progress, dirty={dirty}");
    // the first written entry was laundered to the backing device
    assert_eq!(h.disk.read_direct(0, blk_sectors), sector_data(0, blk_sectors));
    h.handle.debug_check().unwrap();
}

#[test]
fn test_barrier_and_flush() {
    let h = setup(1, 0, Geometry::default());

    h.handle
        .submit(IoRequest::write(0, sector_data(0x31, 8)))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("write timed out")
        .unwrap();

    // a barrier admits only at quiescence and then proceeds normally
    h.handle
        .submit(IoRequest::write(8, sector_data(0x32, 8)).barrier())
        .unwrap()
        .wait_timeout(WAIT)
        .expect("barrier write timed out")
        .unwrap();

    let data = h
        .handle
        .submit(IoRequest::read(0, 16))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("read timed out")
        .unwrap();
    assert_eq!(&data[..8 * SECTOR_SIZE], &sector_data(0x31, 8)[..]);
    assert_eq!(&data[8 * SECTOR_SIZE..], &sector_data(0x32, 8)[..]);

    h.manager.attr_store("cache0", "flush", "1").unwrap();
    assert_eq!(h.handle.counters().1, 0);
    assert_eq!(h.disk.read_direct(0, 8), sector_data(0x31, 8));
    assert_eq!(h.disk.read_direct(8, 8), sector_data(0x32, 8));
}

#[test]
fn test_failed_cache_serves_hits_and_fails_misses() {
    let h = setup(1, 0, Geometry::default());

    h.handle
        .submit(IoRequest::write(0, sector_data(0x77, 8)))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("write timed out")
        .unwrap();

    // force a backing write error
    h.disk.set_fail_writes(true);
    h.handle.flush();
    assert_eq!(h.manager.attr_show("cache0", "state").unwrap(), "failed");
    assert_eq!(h.handle.counters().1, 1, "dirty data survives the failure");

    // cache-hit reads still succeed
    let data = h
        .handle
        .submit(IoRequest::read(0, 8))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("hit read timed out")
        .unwrap();
    assert_eq!(data, sector_data(0x77, 8));

    // misses fail
    let err = h
        .handle
        .submit(IoRequest::read(100 * 8, 8))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("miss read timed out");
    assert!(matches!(err, Err(CacheError::Io(_))));

    // unregister refuses while dirty remains
    assert!(matches!(
        h.manager.unregister(h.uuid, "vda"),
        Err(CacheError::Busy)
    ));

    // once the device recovers, flush drains and unregister succeeds
    h.disk.set_fail_writes(false);
    h.handle.flush();
    wait_idle(&h.handle);
    assert_eq!(h.handle.counters().1, 0);
    h.manager.unregister(h.uuid, "vda").unwrap();
    assert_eq!(h.manager.attr_show("cache0", "state").unwrap(), "inactive");
}

#[test]
fn test_register_and_unregister_errors() {
    let h = setup(1, 0, Geometry::default());

    // double registration
    assert!(matches!(
        h.manager
            .register(h.uuid, "vdb", Arc::new(MemDisk::new(64)), Geometry::default()),
        Err(CacheError::Busy)
    ));

    // unknown uuid
    assert!(matches!(
        h.manager.unregister(Uuid::new_v4(), "vda"),
        Err(CacheError::NoSuchCache)
    ));

    // wrong disk
    assert!(matches!(
        h.manager.unregister(h.uuid, "vdz"),
        Err(CacheError::WrongDisk)
    ));

    h.manager.unregister(h.uuid, "vda").unwrap();
    assert!(matches!(
        h.manager.unregister(h.uuid, "vda"),
        Err(CacheError::NotActive)
    ));

    // bad stripe geometries
    let bad = Geometry {
        stripe_members: 2,
        stripe_sectors: 12,
    };
    assert!(matches!(
        h.manager
            .register(h.uuid, "vda", Arc::new(MemDisk::new(64)), bad),
        Err(CacheError::BadGeometry(_))
    ));
}

#[test]
fn test_striped_geometry_round_trip() {
    let geometry = Geometry {
        stripe_members: 2,
        stripe_sectors: 16,
    };
    let h = setup(1, 0, geometry);
    assert_eq!(h.manager.attr_show("cache0", "entry_count").unwrap(), "128");

    // one stripe-spanning write: chunks land in one entry's two blocks
    let payload: Vec<u8> = (0..32 * SECTOR_SIZE).map(|i| (i % 251) as u8).collect();
    h.handle
        .submit(IoRequest::write(0, payload.clone()))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("stripe write timed out")
        .unwrap();

    let data = h
        .handle
        .submit(IoRequest::read(0, 32))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("stripe read timed out")
        .unwrap();
    assert_eq!(data, payload);

    h.handle.flush();
    assert_eq!(h.disk.read_direct(0, 32), payload);

    wait_idle(&h.handle);
    h.handle.debug_check().unwrap();
}
