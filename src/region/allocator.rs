//! Region creation and deletion
//!
//! New regions are described by a colon-delimited control string
//! `"name[:sizeMB[:order]]"` and placed by a first-fit search over the
//! free page runs of a device. A zero size means "largest free fit",
//! found by binary search; the descriptor table is zeroed and fenced
//! before the header is published so a torn insert never yields a
//! half-initialized region.

use log::info;

use super::header::{
    clear_header, read_header, valid_headers, write_header, RegionHeader, MAX_REGIONS,
    REGION_NAME_LEN,
};
use super::memory::{NvMemory, PAGE_SIZE};
use super::{RegionError, RegionResult};

/// Parsed form of the region add control string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionSpec {
    /// Region name, ≤ 16 alphanumeric characters
    pub name: String,
    /// Data area size in megabytes; 0 selects the largest free fit
    pub size_mb: u32,
    /// Block order k, at most 8 (1 MB blocks)
    pub blk_order: u32,
}

impl RegionSpec {
    /// Parse `"name[:sizeMB[:order]]"`; a trailing newline is tolerated.
    pub fn parse(input: &str) -> RegionResult<Self> {
        let input = input.strip_suffix('\n').unwrap_or(input);
        if input.is_empty() {
            return Err(RegionError::InvalidSpec("empty input".into()));
        }

        let mut fields = input.splitn(3, ':');
        let name = fields.next().unwrap_or("");
        if name.is_empty() || name.len() > REGION_NAME_LEN {
            return Err(RegionError::InvalidSpec(format!(
                "name must be 1-{} characters",
                REGION_NAME_LEN
            )));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(RegionError::InvalidSpec(
                "name must be alphanumeric".into(),
            ));
        }

        let mut spec = Self {
            name: name.to_string(),
            size_mb: 0,
            blk_order: 0,
        };

        if let Some(size) = fields.next() {
            if size.len() > 5 {
                return Err(RegionError::InvalidSpec("size field too long".into()));
            }
            if !size.is_empty() {
                spec.size_mb = size
                    .parse()
                    .map_err(|_| RegionError::InvalidSpec(format!("bad size: {size}")))?;
            }
        }

        if let Some(order) = fields.next() {
            if order.is_empty() {
                return Ok(spec);
            }
            if order.len() > 1 {
                return Err(RegionError::InvalidSpec("order field too long".into()));
            }
            let val: u32 = order
                .parse()
                .map_err(|_| RegionError::InvalidSpec(format!("bad order: {order}")))?;
            // order is limited to a 1MB block size
            if val + 12 > 20 {
                return Err(RegionError::InvalidSpec(format!("order {val} too large")));
            }
            spec.blk_order = val;
        }

        Ok(spec)
    }
}

/// Largest free page run on the device, `(start, pages)`.
///
/// Page 0 is the directory and never allocatable.
fn largest_free_run(mem: &dyn NvMemory, active: &[(usize, RegionHeader)]) -> (u64, u64) {
    let num_pages = (mem.len() / PAGE_SIZE) as u64;
    let mut regions: Vec<&RegionHeader> = active.iter().map(|(_, h)| h).collect();
    regions.sort_by_key(|h| h.start_pfn);

    let mut best_start = 1;
    let mut best_size = 0;
    let mut pos = 1;
    for header in regions {
        let gap = header.start_pfn.saturating_sub(pos);
        if gap >= best_size {
            best_size = gap;
            best_start = pos;
        }
        pos = header.start_pfn + header.region_pages();
    }
    let tail = num_pages.saturating_sub(pos);
    if tail >= best_size {
        best_size = tail;
        best_start = pos;
    }

    (best_start, best_size)
}

/// Insert a new region on `mem` per `spec`.
///
/// Returns the directory slot and the published header. The caller
/// holds whatever lock serializes configuration of this device.
pub fn insert_region(mem: &dyn NvMemory, spec: &RegionSpec) -> RegionResult<(usize, RegionHeader)> {
    let active = valid_headers(mem);

    if active.iter().any(|(_, h)| h.name_str() == spec.name) {
        return Err(RegionError::DuplicateName(spec.name.clone()));
    }

    let slot = (0..MAX_REGIONS)
        .find(|&i| !read_header(mem, i).is_valid())
        .ok_or_else(|| RegionError::NoSpace("no free directory slot".into()))?;

    let (start, max_pages) = largest_free_run(mem, &active);

    let mut header = RegionHeader::new(&spec.name, spec.size_mb, spec.blk_order);
    header.start_pfn = start;

    if header.size_mb == 0 {
        // search for the largest size describable with the free run
        let mut lo = 0u32;
        let mut hi = (max_pages >> (20 - 12)) as u32 + 1;
        while hi - lo > 1 {
            let mid = (lo + hi) / 2;
            header.size_mb = mid;
            if header.region_pages() <= max_pages {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        header.size_mb = lo;
    }

    if header.size_mb == 0 || header.region_pages() > max_pages {
        return Err(RegionError::NoSpace(format!(
            "{} pages free, {} required",
            max_pages,
            header.region_pages()
        )));
    }

    // zero the descriptor table so every slot starts unassociated
    let zero_page = vec![0u8; PAGE_SIZE];
    for page in 0..header.desc_pages() {
        mem.write(((header.start_pfn + page) as usize) * PAGE_SIZE, &zero_page);
    }
    // descriptors must be durable before the header goes live
    mem.store_fence();

    header.seal();
    write_header(mem, slot, &header);

    info!(
        "region {}: {}MB order {} at pfn {:#x}",
        spec.name, header.size_mb, header.blk_order, header.start_pfn
    );

    Ok((slot, header))
}

/// Delete the region in directory slot `slot`; its pages are left as-is.
pub fn delete_region(mem: &dyn NvMemory, slot: usize) {
    clear_header(mem, slot);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::memory::RamMemory;

    #[test]
    fn test_parse_forms() {
        assert_eq!(
            RegionSpec::parse("cache0\n").unwrap(),
            RegionSpec {
                name: "cache0".into(),
                size_mb: 0,
                blk_order: 0
            }
        );
        assert_eq!(RegionSpec::parse("c:64").unwrap().size_mb, 64);
        let full = RegionSpec::parse("c:64:3").unwrap();
        assert_eq!((full.size_mb, full.blk_order), (64, 3));
        assert_eq!(RegionSpec::parse("c::2").unwrap().blk_order, 2);
    }

    #[test]
    fn test_parse_rejects() {
        assert!(RegionSpec::parse("").is_err());
        assert!(RegionSpec::parse("has space").is_err());
        assert!(RegionSpec::parse("seventeencharacter").is_err());
        assert!(RegionSpec::parse("c:123456").is_err());
        assert!(RegionSpec::parse("c:1:9").is_err());
        assert!(RegionSpec::parse("c:1:22").is_err());
    }

    #[test]
    fn test_insert_first_fit_and_duplicate() {
        // 1 directory page + room for two small regions
        let mem = RamMemory::new(1 + 2 * (1 + 256) + 8);

        let (slot_a, a) = insert_region(&mem, &RegionSpec::parse("a:1").unwrap()).unwrap();
        assert_eq!(slot_a, 0);
        assert_eq!(a.start_pfn, 1);
        assert_eq!(a.region_pages(), 257);

        let (slot_b, b) = insert_region(&mem, &RegionSpec::parse("b:1").unwrap()).unwrap();
        assert_eq!(slot_b, 1);
        assert_eq!(b.start_pfn, 258);

        assert!(matches!(
            insert_region(&mem, &RegionSpec::parse("a:1").unwrap()),
            Err(RegionError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_insert_default_size_fills_device() {
        let mem = RamMemory::new(1 + 513 + 2);
        let (_, header) = insert_region(&mem, &RegionSpec::parse("big").unwrap()).unwrap();
        // 2MB data + 2 descriptor pages is the largest fit
        assert_eq!(header.size_mb, 2);
        assert!(header.region_pages() <= 515);
    }

    #[test]
    fn test_insert_no_space() {
        let mem = RamMemory::new(4);
        assert!(matches!(
            insert_region(&mem, &RegionSpec::parse("a:1").unwrap()),
            Err(RegionError::NoSpace(_))
        ));
    }

    #[test]
    fn test_delete_then_reuse_gap() {
        let mem = RamMemory::new(1 + 2 * 257);
        let (slot_a, _) = insert_region(&mem, &RegionSpec::parse("a:1").unwrap()).unwrap();
        insert_region(&mem, &RegionSpec::parse("b:1").unwrap()).unwrap();

        delete_region(&mem, slot_a);
        let (_, c) = insert_region(&mem, &RegionSpec::parse("c:1").unwrap()).unwrap();
        assert_eq!(c.start_pfn, 1);
    }
}
