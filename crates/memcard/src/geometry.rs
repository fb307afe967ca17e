//! Decoding of the device id a memory card reports on the bus.

use crate::layout::NUM_SYSTEM_BLOCK;

const SECTOR_SIZE_TABLE: [u32; 8] = [
    8 * 1024,
    16 * 1024,
    32 * 1024,
    64 * 1024,
    128 * 1024,
    256 * 1024,
    0,
    0,
];

const LATENCY_TABLE: [u32; 8] = [4, 8, 16, 32, 64, 128, 256, 512];

/// Id reported by cards that also carry a vendor id.
pub const VENDOR_CARD_ID: u32 = 0x8000_0004;

/// Size, sector size and latency of a mounted card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Capacity in megabits.
    pub size_mbit: u16,
    pub sector_size: u32,
    pub latency: u32,
    /// Total number of blocks, system blocks included.
    pub cblock: u16,
}

impl Geometry {
    /// Classifies a device id, or `None` when it is not a usable memory card.
    pub fn from_device_id(id: u32, has_vendor_id: bool) -> Option<Self> {
        if id & 0xFFFF_0000 != 0 && (id != VENDOR_CARD_ID || !has_vendor_id) {
            return None;
        }
        if id & 3 != 0 {
            return None;
        }

        let size = id & 0xFC;
        if !matches!(size, 4 | 8 | 16 | 32 | 64 | 128) {
            return None;
        }

        let sector_size = SECTOR_SIZE_TABLE[((id & 0x3800) >> 11) as usize];
        if sector_size == 0 {
            return None;
        }

        let cblock = size * 1024 * 1024 / 8 / sector_size;
        if cblock < 8 {
            return None;
        }

        Some(Self {
            size_mbit: size as u16,
            sector_size,
            latency: LATENCY_TABLE[((id & 0x700) >> 8) as usize],
            cblock: cblock as u16,
        })
    }

    /// Device id a card of this shape reports.
    pub fn device_id(size_mbit: u16, sector_size: u32) -> Option<u32> {
        let code = SECTOR_SIZE_TABLE
            .iter()
            .position(|&size| size != 0 && size == sector_size)? as u32;
        let id = (code << 11) | u32::from(size_mbit);
        Self::from_device_id(id, false).map(|_| id)
    }

    pub fn capacity(&self) -> u32 {
        u32::from(self.cblock) * self.sector_size
    }

    pub fn data_blocks(&self) -> u16 {
        self.cblock - NUM_SYSTEM_BLOCK
    }

    pub fn is_valid_block(&self, block: u16) -> bool {
        crate::fat::is_valid_block(self.cblock, block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_standard_cards() {
        let geo = Geometry::from_device_id(0x0004, false).expect("4 Mbit card");
        assert_eq!(geo.sector_size, 8192);
        assert_eq!(geo.cblock, 64);
        assert_eq!(geo.latency, 4);

        let geo = Geometry::from_device_id(0x0080, false).expect("128 Mbit card");
        assert_eq!(geo.cblock, 2048);

        let geo = Geometry::from_device_id(0x0810 | 0x0100, false).expect("16 Mbit, 16K sectors");
        assert_eq!(geo.sector_size, 16 * 1024);
        assert_eq!(geo.cblock, 128);
        assert_eq!(geo.latency, 8);
    }

    #[test]
    fn rejects_other_devices() {
        assert_eq!(Geometry::from_device_id(0x0006, false), None);
        assert_eq!(Geometry::from_device_id(0x000C, false), None);
        assert_eq!(Geometry::from_device_id(0x3004, false), None);
        assert_eq!(Geometry::from_device_id(0x0104_0000, false), None);
        assert_eq!(Geometry::from_device_id(VENDOR_CARD_ID, false), None);
        // 4 Mbit with 128K sectors leaves fewer than 8 blocks.
        assert_eq!(Geometry::from_device_id(0x2004, false), None);
    }

    #[test]
    fn device_id_round_trips_through_the_tables() {
        assert_eq!(Geometry::device_id(4, 8192), Some(0x0004));
        assert_eq!(Geometry::device_id(64, 32 * 1024), Some(0x1040));
        assert_eq!(Geometry::device_id(4, 12_000), None);
    }
}
