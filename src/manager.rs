//! # Cache Manager
//!
//! This module provides:
//! - Device attachment and region adoption (probe)
//! - Region creation and deletion via the control string
//! - The registration API consumed by block-device drivers
//! - The per-cache string-valued configuration surface
//!
//! The manager owns every device and cache instance behind a single
//! lock, the explicit stand-in for the driver-wide registration lock.

use std::sync::Arc;
use std::thread::JoinHandle;

use log::{info, warn};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::backing::BackingDevice;
use crate::cache::{
    CacheCore, CacheError, CacheResult, CacheState, Geometry, IoRequest, RequestCompletion,
    Tunables,
};
use crate::copy::{CopyEngine, InlineCopyEngine};
use crate::region::{
    delete_region, header, insert_region, NvMemory, RegionHeader, RegionSpec,
};

/// Client surface of one registered cache.
///
/// Returned by [`CacheManager::register`]; the submit function of the
/// registration contract.
#[derive(Clone)]
pub struct CacheHandle {
    core: Arc<CacheCore>,
}

impl CacheHandle {
    /// Submit one request; see the admission contract
    pub fn submit(&self, io: IoRequest) -> CacheResult<RequestCompletion> {
        self.core.submit(io)
    }

    /// Write back every dirty entry behind a barrier
    pub fn flush(&self) {
        self.core.flush();
    }

    /// Cache lifecycle state
    pub fn state(&self) -> CacheState {
        self.core.state()
    }

    /// `(active, dirty, writeback)` entry counts
    pub fn counters(&self) -> (usize, usize, usize) {
        self.core.counters()
    }

    /// Entries in the pool
    pub fn entry_count(&self) -> usize {
        self.core.entry_count()
    }

    /// Structural invariant check; a test and debugging aid
    pub fn debug_check(&self) -> Result<(), String> {
        self.core.debug_check()
    }
}

struct ActiveCache {
    core: Arc<CacheCore>,
    worker: Option<JoinHandle<()>>,
    disk: String,
}

struct CacheSlot {
    dir_slot: usize,
    header: RegionHeader,
    active: Option<ActiveCache>,
}

struct DeviceEntry {
    memory: Arc<dyn NvMemory>,
    caches: Vec<CacheSlot>,
}

#[derive(Default)]
struct ManagerInner {
    devices: Vec<DeviceEntry>,
}

/// Owner of every device and cache instance.
pub struct CacheManager {
    inner: Mutex<ManagerInner>,
    tunables: Tunables,
    copy: Arc<dyn CopyEngine>,
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheManager {
    /// A manager with default policy and the inline copy engine
    pub fn new() -> Self {
        Self::with_engine(Arc::new(InlineCopyEngine), Tunables::default())
    }

    /// A manager with a custom copy engine and policy knobs
    pub fn with_engine(copy: Arc<dyn CopyEngine>, tunables: Tunables) -> Self {
        Self {
            inner: Mutex::new(ManagerInner::default()),
            tunables,
            copy,
        }
    }

    /// Attach a protected memory device: adopt every valid region in
    /// its directory. Returns the number of regions adopted.
    pub fn attach_device(&self, memory: Arc<dyn NvMemory>) -> usize {
        let mut inner = self.inner.lock();
        let caches: Vec<CacheSlot> = header::valid_headers(memory.as_ref())
            .into_iter()
            .map(|(dir_slot, header)| {
                info!(
                    "bbcache/{}: {}MB order {} at pfn {:#x}",
                    header.name_str(),
                    header.size_mb,
                    header.blk_order,
                    header.start_pfn
                );
                CacheSlot {
                    dir_slot,
                    header,
                    active: None,
                }
            })
            .collect();
        let adopted = caches.len();
        inner.devices.push(DeviceEntry { memory, caches });
        adopted
    }

    /// Create a region from `"name[:sizeMB[:order]]"`, first-fit over
    /// the attached devices.
    pub fn add_region(&self, input: &str) -> CacheResult<Uuid> {
        let spec = RegionSpec::parse(input)?;
        let mut inner = self.inner.lock();
        if inner.devices.is_empty() {
            return Err(CacheError::AllocFailed("no devices attached".into()));
        }

        for device in inner.devices.iter() {
            for slot in device.caches.iter() {
                if slot.header.name_str() == spec.name {
                    return Err(CacheError::InvalidInput(format!(
                        "region name already in use: {}",
                        spec.name
                    )));
                }
            }
        }

        let mut last_err = CacheError::AllocFailed("no space on any device".into());
        for device in inner.devices.iter_mut() {
            match insert_region(device.memory.as_ref(), &spec) {
                Ok((dir_slot, header)) => {
                    let uuid = header.uuid();
                    device.caches.push(CacheSlot {
                        dir_slot,
                        header,
                        active: None,
                    });
                    return Ok(uuid);
                }
                Err(err) => last_err = err.into(),
            }
        }
        Err(last_err)
    }

    /// Associate a block device with its cache.
    ///
    /// `disk` identifies the backing disk for the unregister check;
    /// `backing` is the captured submission function. On success the
    /// cache is recovered, activated, and the submit handle returned.
    pub fn register(
        &self,
        uuid: Uuid,
        disk: &str,
        backing: Arc<dyn BackingDevice>,
        geometry: Geometry,
    ) -> CacheResult<CacheHandle> {
        let mut inner = self.inner.lock();
        let copy = self.copy.clone();
        let tunables = self.tunables;

        let (memory, slot) = find_by_uuid(&mut inner, uuid)?;
        if let Some(active) = slot.active.as_ref() {
            warn!("bbcache/{}: already active", slot.header.name_str());
            return Err(if active.core.state() == CacheState::Failed {
                CacheError::Failed
            } else {
                CacheError::Busy
            });
        }

        let core = CacheCore::new(memory, &slot.header, geometry, backing, copy, tunables)?;
        let worker = core.activate()?;

        slot.active = Some(ActiveCache {
            core: core.clone(),
            worker: Some(worker),
            disk: disk.to_string(),
        });

        Ok(CacheHandle { core })
    }

    /// Deactivate a cache.
    ///
    /// The caller ensures the cache is clean and idle; a cache with
    /// dirty or active entries, or requests in flight, stays
    /// registered and `Busy` is returned.
    pub fn unregister(&self, uuid: Uuid, disk: &str) -> CacheResult<()> {
        let mut inner = self.inner.lock();
        let (_, slot) = find_by_uuid(&mut inner, uuid)?;

        let Some(active) = slot.active.as_mut() else {
            return Err(CacheError::NotActive);
        };
        if active.disk != disk {
            return Err(CacheError::WrongDisk);
        }

        active.core.wait_backing_open();
        {
            let mut shared = active.core.shared.lock();
            if shared.dirty > 0 || shared.active > 0 || shared.requesters > 0 {
                return Err(CacheError::Busy);
            }
            shared.state = CacheState::Inactive;
        }

        let worker = active.worker.take();
        let core = active.core.clone();
        slot.active = None;
        if let Some(worker) = worker {
            core.stop_worker(worker);
        }

        info!("bbcache/{}: unregistered", slot.header.name_str());
        Ok(())
    }

    /// Read one configuration attribute of the named region
    pub fn attr_show(&self, region: &str, attr: &str) -> CacheResult<String> {
        let mut inner = self.inner.lock();
        let (_, slot) = find_by_name(&mut inner, region)?;
        let header = &slot.header;
        let core = slot.active.as_ref().map(|a| &a.core);

        let value = match attr {
            "state" => match core {
                Some(core) => core.state().to_string(),
                None => CacheState::Inactive.to_string(),
            },
            "size" => header.size_mb.to_string(),
            "meta_pfn" => format!("{:#x}", header.start_pfn),
            "uuid" => header.uuid().simple().to_string(),
            "order" => header.blk_order.to_string(),
            "active" => core.map(|c| c.counters().0).unwrap_or(0).to_string(),
            "pfn" => format!("{:#x}", header.data_pfn()),
            "dirty" => core.map(|c| c.counters().1).unwrap_or(0).to_string(),
            "writeback" => core.map(|c| c.counters().2).unwrap_or(0).to_string(),
            "entry_count" => match core {
                Some(core) => core.entry_count().to_string(),
                None => header.total_blocks().to_string(),
            },
            other => {
                return Err(CacheError::InvalidInput(format!(
                    "unknown attribute: {other}"
                )))
            }
        };
        Ok(value)
    }

    /// Write one configuration attribute of the named region
    pub fn attr_store(&self, region: &str, attr: &str, value: &str) -> CacheResult<()> {
        let mut inner = self.inner.lock();

        match attr {
            // deleting a region requires it inactive; the pages stay
            "state" => {
                if value.trim_end() != "delete" {
                    return Err(CacheError::InvalidInput(format!(
                        "state only accepts \"delete\", got {value:?}"
                    )));
                }
                for device in inner.devices.iter_mut() {
                    if let Some(pos) = device
                        .caches
                        .iter()
                        .position(|slot| slot.header.name_str() == region)
                    {
                        if device.caches[pos].active.is_some() {
                            return Err(CacheError::Busy);
                        }
                        delete_region(device.memory.as_ref(), device.caches[pos].dir_slot);
                        device.caches.remove(pos);
                        info!("bbcache/{}: removed", region);
                        return Ok(());
                    }
                }
                Err(CacheError::NoSuchCache)
            }
            "uuid" => {
                let uuid = Uuid::try_parse(value.trim_end())
                    .map_err(|e| CacheError::InvalidInput(format!("bad uuid: {e}")))?;
                let (memory, slot) = find_by_name(&mut inner, region)?;
                if slot.active.is_some() {
                    return Err(CacheError::Busy);
                }
                slot.header.uuid = *uuid.as_bytes();
                slot.header.seal();
                header::write_header(memory.as_ref(), slot.dir_slot, &slot.header);
                Ok(())
            }
            "flush" => {
                if value.trim_end() != "1" {
                    return Err(CacheError::InvalidInput(
                        "flush only accepts \"1\"".into(),
                    ));
                }
                let (_, slot) = find_by_name(&mut inner, region)?;
                match slot.active.as_ref() {
                    Some(active) => {
                        active.core.flush();
                        Ok(())
                    }
                    None => Err(CacheError::NotActive),
                }
            }
            other => Err(CacheError::InvalidInput(format!(
                "attribute {other} is not writable"
            ))),
        }
    }

    /// Names of every region, in directory order per device
    pub fn region_names(&self) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .devices
            .iter()
            .flat_map(|device| {
                device
                    .caches
                    .iter()
                    .map(|slot| slot.header.name_str().to_string())
            })
            .collect()
    }
}

fn find_slot<F>(
    inner: &mut ManagerInner,
    matches: F,
) -> CacheResult<(Arc<dyn NvMemory>, &mut CacheSlot)>
where
    F: Fn(&CacheSlot) -> bool,
{
    let mut found = None;
    for (d, device) in inner.devices.iter().enumerate() {
        if let Some(c) = device.caches.iter().position(&matches) {
            found = Some((d, c));
            break;
        }
    }
    let (d, c) = found.ok_or(CacheError::NoSuchCache)?;
    let device = &mut inner.devices[d];
    Ok((device.memory.clone(), &mut device.caches[c]))
}

fn find_by_uuid(
    inner: &mut ManagerInner,
    uuid: Uuid,
) -> CacheResult<(Arc<dyn NvMemory>, &mut CacheSlot)> {
    find_slot(inner, |slot| slot.header.uuid() == uuid)
}

fn find_by_name<'a>(
    inner: &'a mut ManagerInner,
    name: &str,
) -> CacheResult<(Arc<dyn NvMemory>, &'a mut CacheSlot)> {
    find_slot(inner, |slot| slot.header.name_str() == name)
}
