// Integration tests for crash recovery: transient-state repair, restart
// durability, activation failure on bad descriptor tables, and the
// persistence ordering of descriptor stores.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use uuid::Uuid;

use bbcache::region::header::read_header;
use bbcache::region::TraceEvent;
use bbcache::{
    CacheError, CacheHandle, CacheManager, Geometry, IoRequest, MemDisk, NvMemory, RamMemory,
    PAGE_SIZE, SECTOR_SIZE,
};

const WAIT: Duration = Duration::from_secs(10);

// descriptor state encodings
const SYNC: u64 = 1;
const DIRTY: u64 = 2;
const REPLACE_LOCK: u64 = 3;
const READ_LOCK: u64 = 4;
const UPDATE_LOCK: u64 = 5;
const WRITEBACK_LOCK: u64 = 6;

struct Region {
    manager: CacheManager,
    uuid: Uuid,
}

/// A 1 MB, order-0 region: 256 slots, descriptor table at page 1,
/// data area from page 2.
fn build_region(mem: Arc<RamMemory>) -> Region {
    let _ = env_logger::builder().is_test(true).try_init();
    let manager = CacheManager::new();
    manager.attach_device(mem.clone());
    let uuid = manager.add_region("cache0:1:0").expect("add region");
    Region { manager, uuid }
}

/// Attach a device that already carries a region, as a restart would
fn reattach(mem: Arc<RamMemory>) -> Region {
    let manager = CacheManager::new();
    let adopted = manager.attach_device(mem.clone());
    assert_eq!(adopted, 1, "directory scan finds the region");
    let uuid = read_header(mem.as_ref(), 0).uuid();
    Region { manager, uuid }
}

fn desc_offset(slot: usize) -> usize {
    PAGE_SIZE + slot * 8
}

fn data_offset(mem: &RamMemory, slot: usize) -> usize {
    let header = read_header(mem, 0);
    (header.data_pfn() as usize + slot) * PAGE_SIZE
}

fn register(region: &Region, disk: &Arc<MemDisk>) -> CacheHandle {
    region
        .manager
        .register(region.uuid, "vda", disk.clone(), Geometry::default())
        .expect("register")
}

fn read_sectors(handle: &CacheHandle, sector: u64, sectors: u64) -> Vec<u8> {
    handle
        .submit(IoRequest::read(sector, sectors))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("read timed out")
        .unwrap()
}

#[test]
fn test_update_lock_recovers_to_dirty() {
    let mem = Arc::new(RamMemory::new(1 + 257 + 1));
    let region = build_region(mem.clone());

    // crash between persisting the update lock and drain completion
    mem.write_u64(desc_offset(0), UPDATE_LOCK);
    mem.write(data_offset(&mem, 0), &[0xAB; PAGE_SIZE]);

    let handle = register(&region, &Arc::new(MemDisk::new(1 << 12)));
    assert_eq!(handle.counters().1, 1, "recovered entry is dirty");
    assert_eq!(mem.read_u64(desc_offset(0)), DIRTY);

    // the read returns the data page content at that slot
    let data = read_sectors(&handle, 0, 8);
    assert_eq!(data, vec![0xAB; 8 * SECTOR_SIZE]);
    handle.debug_check().unwrap();
}

#[test]
fn test_writeback_lock_recovers_and_reissues() {
    let mem = Arc::new(RamMemory::new(1 + 257 + 1));
    let region = build_region(mem.clone());

    // crash between persisting the writeback lock and the backing ack
    mem.write_u64(desc_offset(0), WRITEBACK_LOCK);
    mem.write(data_offset(&mem, 0), &[0xCD; PAGE_SIZE]);

    let disk = Arc::new(MemDisk::new(1 << 12));
    let handle = register(&region, &disk);
    assert_eq!(handle.counters().1, 1);
    assert_eq!(mem.read_u64(desc_offset(0)), DIRTY);

    // a flush re-issues the interrupted writeback
    handle.flush();
    assert_eq!(handle.counters().1, 0);
    assert_eq!(disk.read_direct(0, 8), vec![0xCD; 8 * SECTOR_SIZE]);
    assert_eq!(mem.read_u64(desc_offset(0)), SYNC);
    handle.debug_check().unwrap();
}

#[test]
fn test_interrupted_overwrite_and_read_are_discarded() {
    let mem = Arc::new(RamMemory::new(1 + 257 + 1));
    let region = build_region(mem.clone());

    mem.write_u64(desc_offset(0), 64 | REPLACE_LOCK);
    mem.write_u64(desc_offset(1), 128 | READ_LOCK);

    let disk = Arc::new(MemDisk::new(1 << 12));
    disk.write_direct(64, &[0x5A; 8 * SECTOR_SIZE]);

    let handle = register(&region, &disk);
    assert_eq!(handle.counters().1, 0, "nothing dirty after discard");
    assert_eq!(mem.read_u64(desc_offset(0)), 0);
    assert_eq!(mem.read_u64(desc_offset(1)), 0);

    // the discarded sector reads from the backing device again
    let data = read_sectors(&handle, 64, 8);
    assert_eq!(data, vec![0x5A; 8 * SECTOR_SIZE]);
    handle.debug_check().unwrap();
}

#[test]
fn test_acknowledged_write_survives_restart() {
    let mem = Arc::new(RamMemory::new(1 + 257 + 1));
    let region = build_region(mem.clone());
    let disk = Arc::new(MemDisk::new(1 << 12));
    let handle = register(&region, &disk);

    handle
        .submit(IoRequest::write(16, vec![0xEE; 8 * SECTOR_SIZE]))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("write timed out")
        .unwrap();

    // power cut: clone the protected memory, abandon the old instance
    let mut image = vec![0u8; mem.len()];
    mem.read(0, &mut image);
    let mem2 = Arc::new(RamMemory::new(image.len() / PAGE_SIZE));
    mem2.write(0, &image);

    let region2 = reattach(mem2);
    let handle2 = register(&region2, &Arc::new(MemDisk::new(1 << 12)));
    assert_eq!(handle2.counters().1, 1, "dirty data rode out the restart");
    assert_eq!(read_sectors(&handle2, 16, 8), vec![0xEE; 8 * SECTOR_SIZE]);
    handle2.debug_check().unwrap();
}

#[test]
fn test_flushed_write_survives_restart() {
    let mem = Arc::new(RamMemory::new(1 + 257 + 1));
    let region = build_region(mem.clone());
    let disk = Arc::new(MemDisk::new(1 << 12));
    let handle = register(&region, &disk);

    handle
        .submit(IoRequest::write(0, vec![0x42; 8 * SECTOR_SIZE]))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("write timed out")
        .unwrap();
    handle.flush();
    region.manager.unregister(region.uuid, "vda").unwrap();

    // restart on the same memory and the same disk
    let manager = CacheManager::new();
    manager.attach_device(mem.clone());
    let handle = manager
        .register(region.uuid, "vda", disk.clone(), Geometry::default())
        .unwrap();
    assert_eq!(read_sectors(&handle, 0, 8), vec![0x42; 8 * SECTOR_SIZE]);
}

#[test]
fn test_descriptor_errors_fail_activation() {
    let mem = Arc::new(RamMemory::new(1 + 257 + 1));
    let region = build_region(mem.clone());
    let disk = Arc::new(MemDisk::new(1 << 12));

    // an undefined state value
    mem.write_u64(desc_offset(0), 7);
    assert!(matches!(
        region
            .manager
            .register(region.uuid, "vda", disk.clone(), Geometry::default()),
        Err(CacheError::Descriptor(_))
    ));

    // two slots claiming the same block position
    mem.write_u64(desc_offset(0), 8 | DIRTY);
    mem.write_u64(desc_offset(1), 8 | DIRTY);
    assert!(matches!(
        region
            .manager
            .register(region.uuid, "vda", disk.clone(), Geometry::default()),
        Err(CacheError::Descriptor(_))
    ));

    // the region stays loadable once repaired
    mem.write_u64(desc_offset(1), 0);
    let handle = register(&region, &disk);
    assert_eq!(handle.counters().1, 1);
    handle.debug_check().unwrap();
}

#[test]
fn test_recovery_idempotent_on_quiesced_region() {
    let mem = Arc::new(RamMemory::new(1 + 257 + 1));
    let region = build_region(mem.clone());

    mem.write_u64(desc_offset(0), DIRTY); // sector 0
    mem.write_u64(desc_offset(1), 8 | SYNC);
    mem.write_u64(desc_offset(2), 16 | READ_LOCK); // repaired on pass 1

    let _handle = register(&region, &Arc::new(MemDisk::new(1 << 12)));
    let mut first = vec![0u8; 256 * 8];
    mem.read(PAGE_SIZE, &mut first);

    // run recovery again over the quiesced table
    let region2 = reattach(mem.clone());
    let _handle2 = register(&region2, &Arc::new(MemDisk::new(1 << 12)));
    let mut second = vec![0u8; 256 * 8];
    mem.read(PAGE_SIZE, &mut second);

    assert_eq!(first, second, "recovery changed a quiesced table");
    assert_eq!(mem.read_u64(desc_offset(0)), DIRTY);
    assert_eq!(mem.read_u64(desc_offset(1)), 8 | SYNC);
    assert_eq!(mem.read_u64(desc_offset(2)), 0);
}

#[test]
fn test_descriptor_persistence_ordering() {
    let mem = Arc::new(RamMemory::with_trace(1 + 257 + 1));
    let region = build_region(mem.clone());
    let handle = register(&region, &Arc::new(MemDisk::new(1 << 12)));
    mem.clear_trace();

    handle
        .submit(IoRequest::write(0, vec![0x10; 8 * SECTOR_SIZE]))
        .unwrap()
        .wait_timeout(WAIT)
        .expect("write timed out")
        .unwrap();

    let trace = mem.trace();
    let offset = desc_offset(0);
    let lock_pos = trace
        .iter()
        .position(|ev| *ev == TraceEvent::Store { offset, value: REPLACE_LOCK })
        .expect("replace lock was persisted");
    let dirty_pos = trace
        .iter()
        .position(|ev| *ev == TraceEvent::Store { offset, value: DIRTY })
        .expect("dirty state was persisted");

    assert!(lock_pos < dirty_pos, "lock state precedes the dirty state");
    assert!(
        trace[lock_pos..dirty_pos].contains(&TraceEvent::Fence),
        "a fence separates the lock persist from the data transfer"
    );
    assert!(
        trace[dirty_pos..].contains(&TraceEvent::Fence),
        "the dirty persist is fenced before the acknowledgement"
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    // recovery over any terminal-state table reproduces it exactly
    #[test]
    fn recovery_is_idempotent(states in proptest::collection::vec(0u8..3, 64)) {
        // 1 MB, order 2: 64 block slots, descriptor stride 4 words
        let mem = Arc::new(RamMemory::new(1 + 257 + 1));
        let manager = CacheManager::new();
        manager.attach_device(mem.clone());
        let uuid = manager.add_region("p0:1:2").unwrap();

        for (i, &state) in states.iter().enumerate() {
            let offset = PAGE_SIZE + i * 4 * 8;
            let word = match state {
                0 => 0,
                s => (i as u64 * 32) | s as u64,
            };
            mem.write_u64(offset, word);
        }

        manager
            .register(uuid, "vda", Arc::new(MemDisk::new(1 << 12)), Geometry::default())
            .unwrap();
        let mut first = vec![0u8; 64 * 4 * 8];
        mem.read(PAGE_SIZE, &mut first);

        let manager2 = CacheManager::new();
        manager2.attach_device(mem.clone());
        manager2
            .register(uuid, "vda", Arc::new(MemDisk::new(1 << 12)), Geometry::default())
            .unwrap();
        let mut second = vec![0u8; 64 * 4 * 8];
        mem.read(PAGE_SIZE, &mut second);

        prop_assert_eq!(first, second);
    }
}
