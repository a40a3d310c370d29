//! Region headers and the device directory
//!
//! Every region on a device has one 64-byte header slot in the
//! directory page at device offset 0. A header is live when its magic
//! and checksum validate; clearing the magic deletes the region while
//! leaving its pages untouched.

use uuid::Uuid;

use super::memory::{NvMemory, PAGE_SIZE, SECTORS_PER_PAGE};

/// Marks a directory slot as holding a live region
pub const REGION_MAGIC: u32 = 0x4242_5543;

/// Maximum regions per device; the directory occupies one page
pub const MAX_REGIONS: usize = 16;

/// Maximum region name length, bytes
pub const REGION_NAME_LEN: usize = 16;

/// On-media size of one header slot
pub const HEADER_BYTES: usize = 64;

/// Descriptor words held by one descriptor-table page
pub const DESCS_PER_PAGE: u64 = (PAGE_SIZE / 8) as u64;

/// One region's persistent configuration record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionHeader {
    /// Magic marker; zero in a free slot
    pub magic: u32,
    /// Wrapping 32-bit sum of the header words, checksum field excluded
    pub checksum: u32,
    /// Human name, NUL padded
    pub name: [u8; REGION_NAME_LEN],
    /// Region identity used by the registration API
    pub uuid: [u8; 16],
    /// First page of the descriptor table
    pub start_pfn: u64,
    /// Data area size in megabytes
    pub size_mb: u32,
    /// Block order k; a block is 2^k pages
    pub blk_order: u32,
}

impl RegionHeader {
    /// Create a header for a fresh region; `start_pfn` is assigned by
    /// the allocator, the checksum by [`RegionHeader::seal`].
    pub fn new(name: &str, size_mb: u32, blk_order: u32) -> Self {
        let mut bytes = [0u8; REGION_NAME_LEN];
        let src = name.as_bytes();
        bytes[..src.len()].copy_from_slice(src);
        Self {
            magic: REGION_MAGIC,
            checksum: 0,
            name: bytes,
            uuid: *Uuid::new_v4().as_bytes(),
            start_pfn: 0,
            size_mb,
            blk_order,
        }
    }

    /// The region name as a string slice
    pub fn name_str(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(REGION_NAME_LEN);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    /// The region UUID
    pub fn uuid(&self) -> Uuid {
        Uuid::from_bytes(self.uuid)
    }

    /// Pages in the data area
    pub fn data_pages(&self) -> u64 {
        (self.size_mb as u64) << (20 - 12)
    }

    /// Blocks in the data area
    pub fn total_blocks(&self) -> u64 {
        self.data_pages() >> self.blk_order
    }

    /// Whole pages holding the descriptor table, one word per data page
    pub fn desc_pages(&self) -> u64 {
        self.data_pages().div_ceil(DESCS_PER_PAGE)
    }

    /// Total pages the region occupies
    pub fn region_pages(&self) -> u64 {
        self.desc_pages() + self.data_pages()
    }

    /// First page of the data area
    pub fn data_pfn(&self) -> u64 {
        self.start_pfn + self.desc_pages()
    }

    /// Sectors covered by one block
    pub fn blk_sectors(&self) -> u64 {
        SECTORS_PER_PAGE << self.blk_order
    }

    /// Serialize to the on-media slot format
    pub fn to_bytes(&self) -> [u8; HEADER_BYTES] {
        let mut out = [0u8; HEADER_BYTES];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        out[8..24].copy_from_slice(&self.name);
        out[24..40].copy_from_slice(&self.uuid);
        out[40..48].copy_from_slice(&self.start_pfn.to_le_bytes());
        out[48..52].copy_from_slice(&self.size_mb.to_le_bytes());
        out[52..56].copy_from_slice(&self.blk_order.to_le_bytes());
        out
    }

    /// Deserialize from the on-media slot format
    pub fn from_bytes(raw: &[u8; HEADER_BYTES]) -> Self {
        let mut name = [0u8; REGION_NAME_LEN];
        name.copy_from_slice(&raw[8..24]);
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&raw[24..40]);
        Self {
            magic: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            checksum: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
            name,
            uuid,
            start_pfn: u64::from_le_bytes(raw[40..48].try_into().unwrap()),
            size_mb: u32::from_le_bytes(raw[48..52].try_into().unwrap()),
            blk_order: u32::from_le_bytes(raw[52..56].try_into().unwrap()),
        }
    }

    /// Sum the header words with the checksum field treated as zero
    pub fn calc_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        let mut sum = 0u32;
        for (i, chunk) in bytes.chunks_exact(4).enumerate() {
            if i == 1 {
                continue;
            }
            sum = sum.wrapping_add(u32::from_le_bytes(chunk.try_into().unwrap()));
        }
        sum
    }

    /// Stamp the checksum prior to publishing the header
    pub fn seal(&mut self) {
        self.checksum = self.calc_checksum();
    }

    /// Whether the slot holds a live, uncorrupted region
    pub fn is_valid(&self) -> bool {
        self.magic == REGION_MAGIC && self.checksum == self.calc_checksum()
    }
}

/// Read the directory slot at `slot`
pub fn read_header(mem: &dyn NvMemory, slot: usize) -> RegionHeader {
    let mut raw = [0u8; HEADER_BYTES];
    mem.read(slot * HEADER_BYTES, &mut raw);
    RegionHeader::from_bytes(&raw)
}

/// Publish `header` into the directory slot at `slot`
pub fn write_header(mem: &dyn NvMemory, slot: usize, header: &RegionHeader) {
    mem.write(slot * HEADER_BYTES, &header.to_bytes());
    mem.store_fence();
}

/// Invalidate the directory slot at `slot`, deleting its region
pub fn clear_header(mem: &dyn NvMemory, slot: usize) {
    mem.write(slot * HEADER_BYTES, &0u32.to_le_bytes());
    mem.store_fence();
}

/// All live regions on the device, with their directory slots
pub fn valid_headers(mem: &dyn NvMemory) -> Vec<(usize, RegionHeader)> {
    (0..MAX_REGIONS)
        .map(|slot| (slot, read_header(mem, slot)))
        .filter(|(_, h)| h.is_valid())
        .collect()
}
